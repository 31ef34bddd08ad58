//! Ports-tree version control
//!
//! The upgrade and depclean drivers may emit one commit per run summarizing
//! what changed. Best-effort: a ports tree that is not a git checkout, or a
//! git failure, only logs a warning.

use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Stage and commit the ports tree with the given message. Returns whether
/// a commit was made.
pub fn commit_ports_tree(ports_dir: &Path, message: &str) -> bool {
    if !ports_dir.join(".git").exists() {
        debug!("Ports tree {} is not version controlled", ports_dir.display());
        return false;
    }

    let add = Command::new("git")
        .arg("-C")
        .arg(ports_dir)
        .args(["add", "-A"])
        .output();
    if !matches!(add, Ok(ref o) if o.status.success()) {
        warn!("git add failed in {}", ports_dir.display());
        return false;
    }

    let commit = Command::new("git")
        .arg("-C")
        .arg(ports_dir)
        .args(["commit", "-m", message])
        .output();
    match commit {
        Ok(o) if o.status.success() => {
            debug!("Committed ports tree: {message}");
            true
        }
        Ok(o) => {
            // "nothing to commit" lands here too; only worth a debug line
            debug!(
                "git commit skipped: {}",
                String::from_utf8_lossy(&o.stdout).trim()
            );
            false
        }
        Err(e) => {
            warn!("git commit failed: {e}");
            false
        }
    }
}
