//! Ephemeral per-session workspace directories.

use crate::errors::{ShellError, ShellResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DIR_PREFIX: &str = "cmux-shell";
const MAX_ID_COMPONENT_LEN: usize = 32;
const SEED_DIRS: &[&str] = &["projects", "scratch"];
const README_NAME: &str = "README.txt";
const README_CONTENTS: &str = "\
This is a temporary sandbox workspace.

Everything in this directory is deleted when the session ends.
Network access is disabled and the rest of the filesystem is hidden.
";

/// A uniquely-named directory owned by exactly one session.
///
/// The directory is removed by [`Workspace::remove`], or on drop if the
/// owner never got that far (e.g. launch failed).
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Create a new workspace for `session_id` under `root`.
    ///
    /// The directory name combines a filesystem-safe rendering of the session
    /// id with a random suffix, so concurrent sessions that picked the same id
    /// never collide.
    pub fn provision(root: &Path, session_id: &str, seed: bool) -> ShellResult<Self> {
        fs::create_dir_all(root).map_err(|e| {
            ShellError::Resource(format!(
                "failed to create workspace root {}: {}",
                root.display(),
                e
            ))
        })?;

        let name = format!(
            "{}-{}-{}",
            DIR_PREFIX,
            safe_component(session_id),
            Uuid::new_v4().simple()
        );
        let path = root.join(name);

        // create_dir (not create_dir_all) so an existing path is an error.
        fs::create_dir(&path).map_err(|e| {
            ShellError::Resource(format!(
                "failed to create workspace {}: {}",
                path.display(),
                e
            ))
        })?;

        let workspace = Self {
            path,
            removed: false,
        };

        if seed {
            if let Err(e) = seed_workspace(&workspace.path) {
                warn!(
                    path = %workspace.path.display(),
                    error = %e,
                    "Failed to seed workspace, continuing unseeded"
                );
            }
        }

        info!(
            session_id = %session_id,
            path = %workspace.path.display(),
            "Workspace provisioned"
        );
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the workspace tree. Never fails; errors are logged.
    ///
    /// Returns `true` if the directory is gone afterwards.
    pub fn remove(mut self) -> bool {
        self.removed = true;
        remove_tree(&self.path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            self.removed = true;
            remove_tree(&self.path);
        }
    }
}

fn remove_tree(path: &Path) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            info!(path = %path.display(), "Workspace removed");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Workspace already gone");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove workspace");
            false
        }
    }
}

fn seed_workspace(path: &Path) -> io::Result<()> {
    for dir in SEED_DIRS {
        fs::create_dir(path.join(dir))?;
    }
    fs::write(path.join(README_NAME), README_CONTENTS)
}

/// Render a client-chosen id as a single safe path component.
fn safe_component(session_id: &str) -> String {
    let rendered: String = session_id
        .chars()
        .take(MAX_ID_COMPONENT_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if rendered.is_empty() {
        "session".to_string()
    } else {
        rendered
    }
}
