//! Shell launcher with isolation and direct fallback.
//!
//! The launcher first tries to start the shell through the configured
//! isolation tool. If the wrapper is missing, fails to spawn, or dies during
//! the startup grace period, it retries exactly once with the bare shell
//! (direct mode). Every descriptor opened along the way is owned by a value
//! that closes it on drop, so no failure path leaks a PTY or a process.

use crate::config::ShellConfig;
use crate::errors::{ShellError, ShellResult};
use crate::pty::PtyProcess;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SANDBOX_USER: &str = "sandbox";
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const SANDBOX_LOCALE: &str = "C.UTF-8";
const SANDBOX_TERM: &str = "xterm-256color";
const SANDBOX_PROMPT: &str = "$ ";
/// Bytes of early output attached to a launch error.
const LAUNCH_OUTPUT_LIMIT: usize = 2048;

/// How the shell of a session was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Wrapped by the isolation tool
    Isolated,
    /// Bare shell in the workspace directory
    Direct,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxMode::Isolated => f.write_str("isolated"),
            SandboxMode::Direct => f.write_str("direct"),
        }
    }
}

/// A running shell attached to a PTY.
pub struct LaunchedShell {
    pub process: PtyProcess,
    pub mode: SandboxMode,
}

/// Start the session shell in `workspace`.
pub fn launch(config: &ShellConfig, workspace: &Path) -> ShellResult<LaunchedShell> {
    let shell = resolve_shell(&config.shell_candidates)?;
    let args = shell_args(&shell, &config.shell_args);

    if let Some(argv) = config.isolation.wrap(workspace, &shell, &args) {
        match spawn_verified(config, workspace, &shell, &argv) {
            Ok(process) => {
                info!(
                    pid = ?process.pid(),
                    tool = %config.isolation,
                    shell = %shell.display(),
                    "Shell launched in isolated mode"
                );
                return Ok(LaunchedShell {
                    process,
                    mode: SandboxMode::Isolated,
                });
            }
            Err(e) => {
                warn!(
                    tool = %config.isolation,
                    error = %e,
                    "Isolated launch failed, falling back to direct shell"
                );
            }
        }
    }

    let mut argv = vec![shell.clone().into_os_string()];
    argv.extend(args.iter().map(OsString::from));

    let process = spawn_verified(config, workspace, &shell, &argv).map_err(|e| match e {
        ShellError::SandboxLaunch(_) => e,
        other => ShellError::SandboxLaunch(other.to_string()),
    })?;

    info!(
        pid = ?process.pid(),
        shell = %shell.display(),
        "Shell launched in direct mode"
    );
    Ok(LaunchedShell {
        process,
        mode: SandboxMode::Direct,
    })
}

/// Pick the first candidate shell that exists.
pub fn resolve_shell(candidates: &[PathBuf]) -> ShellResult<PathBuf> {
    candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .cloned()
        .ok_or_else(|| {
            ShellError::Configuration(format!(
                "none of the candidate shells exist: {}",
                candidates
                    .iter()
                    .map(|c| c.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}

/// Arguments for `shell`. Configured arguments win; otherwise init files
/// are disabled for shells that would read them.
pub fn shell_args(shell: &Path, configured: &[String]) -> Vec<String> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    let name = shell.file_name().and_then(|n| n.to_str()).unwrap_or("");
    match name {
        "bash" => vec!["--noprofile".to_string(), "--norc".to_string()],
        "zsh" => vec!["--no-rcs".to_string()],
        _ => Vec::new(),
    }
}

/// The complete environment of the child. Nothing is inherited.
pub fn shell_env(workspace: &Path, shell: &Path) -> Vec<(&'static str, OsString)> {
    vec![
        ("HOME", workspace.as_os_str().to_owned()),
        ("USER", SANDBOX_USER.into()),
        ("LOGNAME", SANDBOX_USER.into()),
        ("SHELL", shell.as_os_str().to_owned()),
        ("TERM", SANDBOX_TERM.into()),
        ("LANG", SANDBOX_LOCALE.into()),
        ("LC_ALL", SANDBOX_LOCALE.into()),
        ("PATH", SANDBOX_PATH.into()),
        ("HISTFILE", "/dev/null".into()),
        ("HISTSIZE", "0".into()),
        ("HISTFILESIZE", "0".into()),
        ("PS1", SANDBOX_PROMPT.into()),
    ]
}

/// Spawn `argv` on a new PTY and make sure it survives the startup grace.
fn spawn_verified(
    config: &ShellConfig,
    workspace: &Path,
    shell: &Path,
    argv: &[OsString],
) -> ShellResult<PtyProcess> {
    let process = spawn_on_pty(config, workspace, shell, argv)?;

    std::thread::sleep(config.startup_grace);

    if let Some(status) = process.child().exit_status() {
        let output = process.drain_output(LAUNCH_OUTPUT_LIMIT);
        let program = argv
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        // `process` drops here, closing the master.
        return Err(ShellError::SandboxLaunch(if output.is_empty() {
            format!("{} exited immediately ({:?})", program, status)
        } else {
            format!("{} exited immediately ({:?}): {}", program, status, output)
        }));
    }

    Ok(process)
}

fn spawn_on_pty(
    config: &ShellConfig,
    workspace: &Path,
    shell: &Path,
    argv: &[OsString],
) -> ShellResult<PtyProcess> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ShellError::SandboxLaunch("empty command line".to_string()))?;

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ShellError::SandboxLaunch(format!("failed to open PTY: {}", e)))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.cwd(workspace);
    cmd.env_clear();
    for (key, value) in shell_env(workspace, shell) {
        cmd.env(key, value);
    }

    debug!(argv = ?argv, cwd = %workspace.display(), "Spawning on PTY");

    let child = pair.slave.spawn_command(cmd).map_err(|e| {
        ShellError::SandboxLaunch(format!(
            "failed to spawn {}: {}",
            program.to_string_lossy(),
            e
        ))
    })?;

    // The child holds its own copy of the slave; ours must not keep the
    // terminal open after the child exits.
    drop(pair.slave);

    PtyProcess::new(pair.master, child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::IsolationTool;
    use std::time::Duration;

    fn test_config() -> ShellConfig {
        ShellConfig::default()
            .with_isolation(IsolationTool::Disabled)
            .with_shell_candidates(["/bin/sh"])
    }

    #[test]
    fn test_resolve_shell_picks_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-shell");
        std::fs::write(&fake, "").unwrap();

        let candidates = vec![dir.path().join("missing"), fake.clone()];
        assert_eq!(resolve_shell(&candidates).unwrap(), fake);
    }

    #[test]
    fn test_resolve_shell_without_candidates_is_configuration_error() {
        let err = resolve_shell(&[PathBuf::from("/nonexistent/shell")]).unwrap_err();
        assert!(matches!(err, ShellError::Configuration(_)));
    }

    #[test]
    fn test_shell_args_disable_init_files() {
        assert_eq!(
            shell_args(Path::new("/bin/bash"), &[]),
            vec!["--noprofile", "--norc"]
        );
        assert!(shell_args(Path::new("/bin/sh"), &[]).is_empty());
        assert_eq!(
            shell_args(Path::new("/bin/bash"), &["-i".to_string()]),
            vec!["-i"]
        );
    }

    #[test]
    fn test_shell_env_is_explicit() {
        let env = shell_env(Path::new("/tmp/ws"), Path::new("/bin/sh"));
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string_lossy().into_owned())
        };

        assert_eq!(get("HOME").as_deref(), Some("/tmp/ws"));
        assert_eq!(get("SHELL").as_deref(), Some("/bin/sh"));
        assert_eq!(get("HISTFILE").as_deref(), Some("/dev/null"));
        assert_eq!(get("TERM").as_deref(), Some("xterm-256color"));
        assert!(get("SSH_AUTH_SOCK").is_none());
    }

    #[test]
    fn test_direct_launch() {
        let dir = tempfile::tempdir().unwrap();
        let launched = launch(&test_config(), dir.path()).unwrap();

        assert_eq!(launched.mode, SandboxMode::Direct);
        assert!(launched.process.child().is_alive());
        launched.process.terminate(Duration::from_secs(1));
        assert!(!launched.process.child().is_alive());
    }

    #[test]
    fn test_missing_isolation_tool_falls_back_to_direct() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config().with_isolation(IsolationTool::Firejail {
            path: PathBuf::from("/nonexistent/firejail"),
        });

        let launched = launch(&config, dir.path()).unwrap();
        assert_eq!(launched.mode, SandboxMode::Direct);
    }

    #[test]
    fn test_wrapper_that_exits_immediately_falls_back_to_direct() {
        let dir = tempfile::tempdir().unwrap();
        // `sh --private=... -- /bin/sh` fails on the unknown option and exits.
        let config = test_config().with_isolation(IsolationTool::Firejail {
            path: PathBuf::from("/bin/sh"),
        });

        let launched = launch(&config, dir.path()).unwrap();
        assert_eq!(launched.mode, SandboxMode::Direct);
        assert!(launched.process.child().is_alive());
    }

    #[test]
    fn test_shell_that_exits_immediately_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config()
            .with_shell_args(vec!["-c".to_string(), "echo bye; exit 3".to_string()]);

        match launch(&config, dir.path()) {
            Err(ShellError::SandboxLaunch(message)) => {
                assert!(message.contains("exited immediately"), "{}", message);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("launch should fail"),
        }
    }
}
