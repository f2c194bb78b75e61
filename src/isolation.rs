//! Isolation wrappers for the session shell.
//!
//! The isolating tool is an external program invoked in front of the shell.
//! Only its exit status and liveness matter to the launcher; its flags come
//! from fixed policy tables and are not user-configurable.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

const DEFAULT_FIREJAIL_PATH: &str = "/usr/bin/firejail";
const DEFAULT_BWRAP_PATH: &str = "/usr/bin/bwrap";

/// Firejail flags applied after `--private=<workspace>`.
const FIREJAIL_POLICY: &[&str] = &[
    "--seccomp",
    "--net=none",
    "--noroot",
    "--nonewprivs",
    "--caps.drop=all",
    "--nosound",
    "--novideo",
    "--nogroups",
    "--quiet",
];

/// Read-only system mounts for bubblewrap. `-try` variants tolerate
/// distributions where the path is a symlink or missing.
const BWRAP_SYSTEM_MOUNTS: &[(&str, &str)] = &[
    ("--ro-bind", "/usr"),
    ("--ro-bind-try", "/bin"),
    ("--ro-bind-try", "/sbin"),
    ("--ro-bind-try", "/lib"),
    ("--ro-bind-try", "/lib64"),
    ("--ro-bind-try", "/etc/alternatives"),
];

/// Isolation tool used to wrap the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationTool {
    /// `firejail --private=<workspace> ...`
    Firejail { path: PathBuf },
    /// `bwrap --unshare-all ...`
    Bubblewrap { path: PathBuf },
    /// Never wrap; sessions always run in direct mode.
    Disabled,
}

impl Default for IsolationTool {
    fn default() -> Self {
        IsolationTool::Firejail {
            path: PathBuf::from(DEFAULT_FIREJAIL_PATH),
        }
    }
}

impl IsolationTool {
    /// Parse from a configuration name, optionally overriding the binary path.
    pub fn from_name(name: &str, path: Option<PathBuf>) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "firejail" => Some(IsolationTool::Firejail {
                path: path.unwrap_or_else(|| PathBuf::from(DEFAULT_FIREJAIL_PATH)),
            }),
            "bwrap" | "bubblewrap" => Some(IsolationTool::Bubblewrap {
                path: path.unwrap_or_else(|| PathBuf::from(DEFAULT_BWRAP_PATH)),
            }),
            "none" | "disabled" | "direct" => Some(IsolationTool::Disabled),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IsolationTool::Firejail { .. } => "firejail",
            IsolationTool::Bubblewrap { .. } => "bwrap",
            IsolationTool::Disabled => "none",
        }
    }

    /// Build the full wrapped argv (program first) for running `shell` with
    /// `shell_args` inside `workspace`. Returns `None` when isolation is
    /// disabled.
    pub fn wrap(&self, workspace: &Path, shell: &Path, shell_args: &[String]) -> Option<Vec<OsString>> {
        let mut argv: Vec<OsString> = match self {
            IsolationTool::Firejail { path } => {
                let mut argv = vec![path.clone().into_os_string()];
                let mut private = OsString::from("--private=");
                private.push(workspace.as_os_str());
                argv.push(private);
                argv.extend(FIREJAIL_POLICY.iter().map(OsString::from));
                argv
            }
            IsolationTool::Bubblewrap { path } => {
                let mut argv = vec![path.clone().into_os_string()];
                argv.extend(
                    ["--unshare-all", "--die-with-parent"]
                        .iter()
                        .map(OsString::from),
                );
                for (flag, mount) in BWRAP_SYSTEM_MOUNTS {
                    argv.push(OsString::from(flag));
                    argv.push(OsString::from(mount));
                    argv.push(OsString::from(mount));
                }
                argv.extend(
                    ["--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp", "--bind"]
                        .iter()
                        .map(OsString::from),
                );
                argv.push(workspace.as_os_str().to_owned());
                argv.push(workspace.as_os_str().to_owned());
                argv.push(OsString::from("--chdir"));
                argv.push(workspace.as_os_str().to_owned());
                argv
            }
            IsolationTool::Disabled => return None,
        };

        argv.push(OsString::from("--"));
        argv.push(shell.as_os_str().to_owned());
        argv.extend(shell_args.iter().map(OsString::from));
        Some(argv)
    }
}

impl fmt::Display for IsolationTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
