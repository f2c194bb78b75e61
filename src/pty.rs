//! PTY process handles.
//!
//! A [`PtyProcess`] owns the master side of a pseudo-terminal together with
//! the child attached to its slave side. The two are created together by the
//! launcher and destroyed together by session teardown.

use crate::errors::{ShellError, ShellResult};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller, ExitStatus, MasterPty};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long to wait for SIGKILLed processes to disappear.
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// Shared handle to the shell process.
///
/// Cloned into the read loop for liveness checks; all clones refer to the
/// same child.
#[derive(Clone)]
pub struct ChildHandle {
    inner: Arc<Mutex<Box<dyn Child + Send>>>,
    pid: Option<u32>,
}

impl ChildHandle {
    fn new(child: Box<dyn Child + Send>) -> Self {
        let pid = child.process_id();
        Self {
            inner: Arc::new(Mutex::new(child)),
            pid,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness poll. Returns the exit status once the child
    /// has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.inner.lock();
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                debug!(
                    pid = ?self.pid,
                    error = %e,
                    "try_wait failed, treating child as exited"
                );
                Some(ExitStatus::with_exit_code(1))
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Send `signal` to the child's process group.
    ///
    /// The child leads its own session, so the group id equals its pid.
    pub fn signal_group(&self, signal: Signal) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "child has no pid"))?;
        killpg(Pid::from_raw(pid as i32), signal).map_err(io::Error::from)
    }

    /// Send `signal` to every live process in the child's session.
    ///
    /// The child leads its own session, so the session id equals its pid.
    /// Returns the number of processes signalled.
    pub fn signal_session(&self, signal: Signal) -> usize {
        let Some(sid) = self.pid else {
            return 0;
        };
        let mut signalled = 0;
        for pid in session_members(sid) {
            match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) => signalled += 1,
                Err(e) => debug!(pid, signal = ?signal, error = %e, "kill failed"),
            }
        }
        signalled
    }

    /// Poll until the child has exited and no other live process remains
    /// in its session. Returns `false` if `timeout` elapses first.
    pub fn wait_for_session_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // is_alive reaps the leader so it stops showing up in /proc.
            let leader_alive = self.is_alive();
            let members = self.pid.map(session_members).unwrap_or_default();
            if !leader_alive && members.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Forcefully kill the child and reap it.
    pub fn kill(&self) {
        if let Err(e) = self.signal_group(Signal::SIGKILL) {
            debug!(pid = ?self.pid, error = %e, "killpg(SIGKILL) failed");
        }
        let mut child = self.inner.lock();
        if let Err(e) = child.kill() {
            debug!(pid = ?self.pid, error = %e, "Child kill failed");
        }
        if let Err(e) = child.wait() {
            debug!(pid = ?self.pid, error = %e, "Child wait failed");
        }
    }
}

/// Master side of a PTY plus the child bound to its slave side.
pub struct PtyProcess {
    master: Option<Box<dyn MasterPty + Send>>,
    child: ChildHandle,
}

impl PtyProcess {
    /// Wrap a freshly spawned child and its master, switching the master to
    /// non-blocking mode.
    pub fn new(
        master: Box<dyn MasterPty + Send>,
        child: Box<dyn Child + Send>,
    ) -> ShellResult<Self> {
        // Construct first so an error below still drops (and kills) the child.
        let process = Self {
            master: Some(master),
            child: ChildHandle::new(child),
        };
        set_nonblocking(process.master_fd()?)?;
        Ok(process)
    }

    pub fn child(&self) -> &ChildHandle {
        &self.child
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.pid()
    }

    fn master_fd(&self) -> ShellResult<RawFd> {
        self.master
            .as_ref()
            .and_then(|m| m.as_raw_fd())
            .ok_or_else(master_closed)
    }

    /// Duplicate the master descriptor for the read loop.
    ///
    /// The duplicate shares the open file description, so it is
    /// non-blocking as well and stays valid independently of `self`.
    pub fn clone_reader(&self) -> ShellResult<File> {
        let fd = self.master_fd()?;
        // SAFETY: `fd` belongs to the master held by `self`, which outlives
        // this borrow; it is only used to dup the descriptor.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        Ok(File::from(borrowed.try_clone_to_owned()?))
    }

    pub fn take_writer(&self) -> ShellResult<Box<dyn Write + Send>> {
        let master = self.master.as_ref().ok_or_else(master_closed)?;
        master
            .take_writer()
            .map_err(|e| ShellError::Io(io::Error::other(e.to_string())))
    }

    /// Drain whatever output the child already produced, without blocking.
    pub fn drain_output(&self, limit: usize) -> String {
        let Ok(mut reader) = self.clone_reader() else {
            return String::new();
        };
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        while collected.len() < limit {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
            }
        }
        collected.truncate(limit);
        String::from_utf8_lossy(&collected).trim().to_string()
    }

    /// Close the master descriptor. Idempotent.
    pub fn close_master(&mut self) {
        if self.master.take().is_some() {
            debug!(pid = ?self.pid(), "PTY master closed");
        }
    }

    /// Graceful termination of the shell and everything it started:
    /// SIGHUP and SIGTERM to every process in the shell's session, bounded
    /// wait, then SIGKILL. Always reaps the child.
    ///
    /// Runs even when the shell itself is already gone, since background
    /// jobs keep its session id after it exits.
    pub fn terminate(&self, grace: Duration) {
        let leader_alive = self.child.is_alive();
        if leader_alive {
            if let Err(e) = self.child.signal_group(Signal::SIGTERM) {
                debug!(pid = ?self.pid(), error = %e, "killpg(SIGTERM) failed");
            }
        }
        let members = self.child.signal_session(Signal::SIGHUP);
        self.child.signal_session(Signal::SIGTERM);
        if !leader_alive && members == 0 {
            return;
        }

        if self.child.wait_for_session_exit(grace) {
            return;
        }
        warn!(pid = ?self.pid(), "Session ignored SIGTERM, sending SIGKILL");
        self.child.signal_session(Signal::SIGKILL);
        if self.child.is_alive() {
            self.child.kill();
        }
        if !self.child.wait_for_session_exit(KILL_SETTLE) {
            warn!(pid = ?self.pid(), "Session processes survived SIGKILL");
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.close_master();
        if self.child.is_alive() {
            self.child.kill();
        }
    }
}

fn master_closed() -> ShellError {
    ShellError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        "PTY master is closed",
    ))
}

/// Pids of every live (non-zombie) process whose session id is `sid`.
pub fn session_members(sid: u32) -> Vec<u32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| {
            fs::read_to_string(format!("/proc/{}/stat", pid))
                .ok()
                .and_then(|stat| parse_stat(&stat))
                .is_some_and(|(state, session)| session == sid && state != 'Z')
        })
        .collect()
}

/// Extract `(state, session id)` from a `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    // ppid, pgrp, session
    let session = fields.nth(2)?.parse().ok()?;
    Some((state, session))
}

/// Set `O_NONBLOCK` on a descriptor.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL take no pointer arguments.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait up to `timeout` for `fd` to become readable (or hung up).
///
/// Returns `Ok(false)` on timeout.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    match rc {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Whether a read error on a PTY master means the slave side is gone.
///
/// Linux reports `EIO` once every slave descriptor has been closed.
pub fn is_eof_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EIO))
        || matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe
        )
}

/// Convenience for callers holding a `File`.
pub fn wait_file_readable(file: &File, timeout: Duration) -> io::Result<bool> {
    wait_readable(file.as_fd(), timeout)
}
