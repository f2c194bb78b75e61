//! Duplex bridge between a PTY and the session's connection task.
//!
//! Output is read on a dedicated OS thread that waits for readiness with a
//! bounded `poll(2)` timeout, sanitizes what it reads, and forwards text over
//! an unbounded channel. Input goes the other way through
//! [`PtyBridge::write_line`], one `write(2)` per command.

use crate::errors::{ShellError, ShellResult};
use crate::pty::{is_eof_error, wait_file_readable, ChildHandle, PtyProcess};
use crate::sanitize::{sanitize, sanitize_final};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Bytes requested per read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Why the read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The terminal side was closed
    Eof,
    /// The shell process exited
    ChildExited,
    /// Unrecoverable read error
    ReadError(String),
    /// `stop` was called or nobody is listening anymore
    Stopped,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Eof => f.write_str("eof"),
            EndReason::ChildExited => f.write_str("child exited"),
            EndReason::ReadError(e) => write!(f, "read error: {}", e),
            EndReason::Stopped => f.write_str("stopped"),
        }
    }
}

/// What the read loop reports to the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Sanitized, non-empty output
    Output(String),
    /// Sent exactly once, after the last `Output`
    Ended(EndReason),
}

/// Read loop and write path of one session.
pub struct PtyBridge {
    session_id: String,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl PtyBridge {
    /// Start the read loop on `process`.
    pub fn start(
        session_id: &str,
        process: &PtyProcess,
        poll_interval: Duration,
        events: UnboundedSender<BridgeEvent>,
    ) -> ShellResult<Self> {
        let reader = process.clone_reader()?;
        let writer = process.take_writer()?;
        let running = Arc::new(AtomicBool::new(true));

        let ctx = ReadLoop {
            session_id: session_id.to_string(),
            reader,
            child: process.child().clone(),
            running: running.clone(),
            poll_interval,
            events,
        };

        let handle = std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || ctx.run())?;

        Ok(Self {
            session_id: session_id.to_string(),
            running,
            reader: Mutex::new(Some(handle)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the read loop and wait for its thread. Idempotent.
    ///
    /// Returns within roughly one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[reader:{}] Reader thread panicked", self.session_id);
            }
        }
    }

    /// Write `command` plus a newline to the shell in a single write.
    pub fn write_line(&self, command: &str) -> ShellResult<usize> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(ShellError::NotRunning)?;
        let written = write_command(writer, command)?;
        debug!("[writer:{}] Wrote {} bytes", self.session_id, written);
        Ok(written)
    }

    /// Drop the write half. Later writes fail with `NotRunning`.
    pub fn close_writer(&self) {
        if self.writer.lock().take().is_some() {
            debug!("[writer:{}] Writer closed", self.session_id);
        }
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Append a newline to `command` and issue exactly one `write` call.
///
/// A short write is reported as an error; the remainder is not retried.
pub fn write_command<W: Write + ?Sized>(writer: &mut W, command: &str) -> ShellResult<usize> {
    let mut line = Vec::with_capacity(command.len() + 1);
    line.extend_from_slice(command.as_bytes());
    line.push(b'\n');

    let written = writer.write(&line).map_err(ShellError::Write)?;
    if written < line.len() {
        return Err(ShellError::Write(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {} of {} bytes", written, line.len()),
        )));
    }
    Ok(written)
}

struct ReadLoop {
    session_id: String,
    reader: File,
    child: ChildHandle,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    events: UnboundedSender<BridgeEvent>,
}

impl ReadLoop {
    fn run(mut self) {
        info!("[reader:{}] Reader thread started", self.session_id);

        let mut read_buffer: Vec<u8> = Vec::new();
        let mut total_bytes: usize = 0;
        let reason = self.pump(&mut read_buffer, &mut total_bytes);

        if !read_buffer.is_empty() {
            let tail = sanitize_final(&read_buffer);
            if !tail.is_empty() {
                let _ = self.events.send(BridgeEvent::Output(tail));
            }
        }

        info!(
            "[reader:{}] Reader thread finished ({}). Total: {} bytes",
            self.session_id, reason, total_bytes
        );
        self.running.store(false, Ordering::Release);
        // The receiver may already be gone during teardown.
        let _ = self.events.send(BridgeEvent::Ended(reason));
    }

    fn pump(&mut self, read_buffer: &mut Vec<u8>, total_bytes: &mut usize) -> EndReason {
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            if !self.running.load(Ordering::Acquire) {
                return EndReason::Stopped;
            }

            match wait_file_readable(&self.reader, self.poll_interval) {
                Ok(true) => {}
                Ok(false) => {
                    if !self.child.is_alive() {
                        return EndReason::ChildExited;
                    }
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("[reader:{}] poll failed: {}", self.session_id, e);
                    return EndReason::ReadError(e.to_string());
                }
            }

            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    debug!("[reader:{}] EOF", self.session_id);
                    return EndReason::Eof;
                }
                Ok(n) => {
                    *total_bytes += n;
                    read_buffer.extend_from_slice(&chunk[..n]);
                    let sanitized = sanitize(read_buffer);
                    read_buffer.drain(..sanitized.consumed);

                    if !sanitized.text.is_empty()
                        && self.events.send(BridgeEvent::Output(sanitized.text)).is_err()
                    {
                        warn!("[reader:{}] Event receiver dropped", self.session_id);
                        return EndReason::Stopped;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) if is_eof_error(&e) => {
                    debug!("[reader:{}] Terminal closed: {}", self.session_id, e);
                    return EndReason::Eof;
                }
                Err(e) => {
                    error!(
                        "[reader:{}] Read error: {} (errno: {:?})",
                        self.session_id,
                        e,
                        e.raw_os_error()
                    );
                    return EndReason::ReadError(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use crate::isolation::IsolationTool;
    use crate::launcher::launch;
    use std::time::Instant;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    #[derive(Default)]
    struct CountingWriter {
        calls: usize,
        data: Vec<u8>,
    }

    impl Write for CountingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ShortWriter;

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len() / 2)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> ShellConfig {
        ShellConfig::default()
            .with_isolation(IsolationTool::Disabled)
            .with_shell_candidates(["/bin/sh"])
    }

    /// Collect events until `done` returns true or the deadline passes.
    fn collect_until(
        rx: &mut UnboundedReceiver<BridgeEvent>,
        timeout: Duration,
        mut done: impl FnMut(&[BridgeEvent]) -> bool,
    ) -> Vec<BridgeEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(event) => {
                    events.push(event);
                    if done(&events) {
                        break;
                    }
                }
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        events
    }

    fn output_text(events: &[BridgeEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Output(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_write_command_is_one_write_with_newline() {
        let mut writer = CountingWriter::default();
        let n = write_command(&mut writer, "ls -la").unwrap();
        assert_eq!(writer.calls, 1);
        assert_eq!(writer.data, b"ls -la\n");
        assert_eq!(n, 7);
    }

    #[test]
    fn test_short_write_is_write_error() {
        let err = write_command(&mut ShortWriter, "echo hello").unwrap_err();
        assert!(matches!(err, ShellError::Write(_)));
    }

    #[test]
    fn test_output_reaches_channel() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let launched = launch(&config, dir.path()).unwrap();
        let (tx, mut rx) = unbounded_channel();
        let bridge = PtyBridge::start("t-out", &launched.process, config.poll_interval, tx).unwrap();

        bridge.write_line("echo bridge-$((20 + 22))").unwrap();
        let events = collect_until(&mut rx, Duration::from_secs(5), |events| {
            output_text(events).contains("bridge-42")
        });
        assert!(output_text(&events).contains("bridge-42"), "{:?}", events);

        bridge.stop();
        launched.process.terminate(Duration::from_secs(1));
    }

    #[test]
    fn test_child_exit_ends_loop_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let launched = launch(&config, dir.path()).unwrap();
        let (tx, mut rx) = unbounded_channel();
        let bridge = PtyBridge::start("t-exit", &launched.process, config.poll_interval, tx).unwrap();

        launched.process.child().kill();
        let events = collect_until(&mut rx, Duration::from_secs(5), |events| {
            matches!(events.last(), Some(BridgeEvent::Ended(_)))
        });
        let ended: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::Ended(_)))
            .collect();
        assert_eq!(ended.len(), 1, "{:?}", events);
        assert!(matches!(
            ended[0],
            BridgeEvent::Ended(EndReason::Eof | EndReason::ChildExited)
        ));

        bridge.stop();
        assert!(!bridge.is_running());
        // Nothing else arrives after the terminal event.
        std::thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let launched = launch(&config, dir.path()).unwrap();
        let (tx, mut rx) = unbounded_channel();
        let bridge = PtyBridge::start("t-stop", &launched.process, config.poll_interval, tx).unwrap();

        bridge.stop();
        bridge.stop();
        assert!(!bridge.is_running());

        let mut ended = 0;
        while let Ok(event) = rx.try_recv() {
            if let BridgeEvent::Ended(reason) = event {
                assert_eq!(reason, EndReason::Stopped);
                ended += 1;
            }
        }
        assert_eq!(ended, 1);

        launched.process.terminate(Duration::from_secs(1));
    }

    #[test]
    fn test_write_after_close_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let launched = launch(&config, dir.path()).unwrap();
        let (tx, _rx) = unbounded_channel();
        let bridge = PtyBridge::start("t-close", &launched.process, config.poll_interval, tx).unwrap();

        bridge.close_writer();
        let err = bridge.write_line("true").unwrap_err();
        assert!(matches!(err, ShellError::NotRunning));

        bridge.stop();
        launched.process.terminate(Duration::from_secs(1));
    }
}
