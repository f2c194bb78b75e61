//! Engine configuration.

use crate::isolation::IsolationTool;
use std::path::PathBuf;
use std::time::Duration;

/// Shells tried in order when no override is configured.
pub const DEFAULT_SHELL_CANDIDATES: &[&str] =
    &["/bin/bash", "/usr/bin/bash", "/bin/sh", "/usr/bin/sh"];

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Settings shared by every session the server creates.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Directory under which per-session workspaces are created
    pub workspace_root: PathBuf,
    /// Create starter directories and a readme in new workspaces
    pub seed_workspace: bool,
    /// Wrapper used for isolated launches
    pub isolation: IsolationTool,
    /// Shell binaries tried in order; the first existing one is used
    pub shell_candidates: Vec<PathBuf>,
    /// Arguments passed to the shell; empty means "pick per shell"
    pub shell_args: Vec<String>,
    /// Terminal columns
    pub cols: u16,
    /// Terminal rows
    pub rows: u16,
    /// Readiness-wait timeout of the read loop
    pub poll_interval: Duration,
    /// How long a freshly spawned shell must survive to count as launched
    pub startup_grace: Duration,
    /// How long teardown waits after SIGTERM before SIGKILL
    pub terminate_grace: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir(),
            seed_workspace: true,
            isolation: IsolationTool::default(),
            shell_candidates: DEFAULT_SHELL_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .collect(),
            shell_args: Vec::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            poll_interval: Duration::from_millis(50),
            startup_grace: Duration::from_millis(150),
            terminate_grace: Duration::from_secs(2),
        }
    }
}

impl ShellConfig {
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationTool) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_shell_candidates<I, P>(mut self, shells: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.shell_candidates = shells.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shell_args(mut self, args: Vec<String>) -> Self {
        self.shell_args = args;
        self
    }
}
