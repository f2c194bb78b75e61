//! Session lifecycle: provision, launch, bridge, teardown.

use crate::bridge::{BridgeEvent, PtyBridge};
use crate::config::ShellConfig;
use crate::errors::{ShellError, ShellResult};
use crate::launcher::{launch, SandboxMode};
use crate::protocol::parse_client_message;
use crate::pty::{ChildHandle, PtyProcess};
use crate::workspace::Workspace;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Lifecycle state. Transitions only move forward:
/// `Connecting -> Active -> Closing -> Closed`, or `Connecting -> Closed`
/// when establishment fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Resources released by teardown, in the order they are released.
#[derive(Default)]
struct Resources {
    process: Option<PtyProcess>,
    workspace: Option<Workspace>,
}

/// One shell session bound to one peer connection.
pub struct Session {
    id: String,
    config: Arc<ShellConfig>,
    state: RwLock<SessionState>,
    mode: OnceLock<SandboxMode>,
    workspace_path: OnceLock<PathBuf>,
    child: OnceLock<ChildHandle>,
    bridge: OnceLock<PtyBridge>,
    resources: Mutex<Resources>,
    torn_down: AtomicBool,
}

impl Session {
    /// Create a session in `Connecting`. The id must be non-empty.
    pub fn new(id: impl Into<String>, config: Arc<ShellConfig>) -> ShellResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ShellError::Protocol(
                "missing session identifier".to_string(),
            ));
        }
        Ok(Self {
            id,
            config,
            state: RwLock::new(SessionState::Connecting),
            mode: OnceLock::new(),
            workspace_path: OnceLock::new(),
            child: OnceLock::new(),
            bridge: OnceLock::new(),
            resources: Mutex::new(Resources::default()),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Set once the shell is launched.
    pub fn sandbox_mode(&self) -> Option<SandboxMode> {
        self.mode.get().copied()
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace_path.get().map(PathBuf::as_path)
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.get().and_then(ChildHandle::pid)
    }

    /// Provision the workspace, launch the shell and start the bridge.
    ///
    /// Blocks for the launcher's startup grace. On failure the session is
    /// `Closed` and everything acquired so far has been released.
    pub fn start(&self, events: UnboundedSender<BridgeEvent>) -> ShellResult<()> {
        if self.state() != SessionState::Connecting {
            return Err(ShellError::SessionBusy(self.id.clone()));
        }

        match self.establish(events) {
            Ok(()) => {
                self.transition(SessionState::Active);
                info!(
                    "[session:{}] Active (mode: {}, pid: {:?})",
                    self.id,
                    self.sandbox_mode().map(|m| m.to_string()).unwrap_or_default(),
                    self.child_pid()
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[session:{}] Establishment failed ({}): {}",
                    self.id,
                    e.code(),
                    e
                );
                self.teardown();
                Err(e)
            }
        }
    }

    fn establish(&self, events: UnboundedSender<BridgeEvent>) -> ShellResult<()> {
        let workspace = Workspace::provision(
            &self.config.workspace_root,
            &self.id,
            self.config.seed_workspace,
        )?;
        let _ = self.workspace_path.set(workspace.path().to_path_buf());
        self.resources.lock().workspace = Some(workspace);

        let Some(path) = self.workspace_path.get() else {
            return Err(ShellError::Resource("workspace path missing".to_string()));
        };
        let launched = launch(&self.config, path)?;
        let _ = self.mode.set(launched.mode);
        let _ = self.child.set(launched.process.child().clone());

        // The process goes to `resources` even if the bridge fails to start,
        // so teardown still owns it.
        let bridge_result = PtyBridge::start(
            &self.id,
            &launched.process,
            self.config.poll_interval,
            events,
        );
        self.resources.lock().process = Some(launched.process);
        let _ = self.bridge.set(bridge_result?);
        Ok(())
    }

    /// Write one command line to the shell.
    pub fn write_input(&self, command: &str) -> ShellResult<usize> {
        if self.state() != SessionState::Active {
            return Err(ShellError::NotRunning);
        }
        let child = self.child.get().ok_or(ShellError::NotRunning)?;
        if !child.is_alive() {
            return Err(ShellError::ChildExited);
        }
        let bridge = self.bridge.get().ok_or(ShellError::NotRunning)?;
        bridge.write_line(command)
    }

    /// Parse an inbound frame and forward its command.
    pub fn handle_message(&self, raw: &str) -> ShellResult<usize> {
        let command = parse_client_message(raw)?;
        self.write_input(&command)
    }

    /// Release everything the session owns. Safe to call any number of
    /// times from any path; only the first call does work.
    ///
    /// Returns `true` if this call performed the teardown.
    pub fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            debug!("[session:{}] Teardown already done", self.id);
            return false;
        }

        let was_active = self.state() == SessionState::Active;
        if was_active {
            self.transition(SessionState::Closing);
        }
        info!("[session:{}] Tearing down", self.id);

        if let Some(bridge) = self.bridge.get() {
            bridge.stop();
            bridge.close_writer();
        }

        let Resources { process, workspace } = std::mem::take(&mut *self.resources.lock());

        if let Some(mut process) = process {
            process.close_master();
            process.terminate(self.config.terminate_grace);
            // Drop reaps the child if terminate could not.
            drop(process);
        }

        if let Some(workspace) = workspace {
            workspace.remove();
        }

        self.transition(SessionState::Closed);
        info!("[session:{}] Closed", self.id);
        true
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.write();
        let allowed = matches!(
            (*state, next),
            (SessionState::Connecting, SessionState::Active)
                | (SessionState::Connecting, SessionState::Closed)
                | (SessionState::Active, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
        );
        if allowed {
            debug!("[session:{}] {} -> {}", self.id, *state, next);
            *state = next;
        } else if *state != next {
            warn!(
                "[session:{}] Ignoring transition {} -> {}",
                self.id, *state, next
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
