//! Process-wide driver lock
//!
//! Only one mutating driver may touch the manifest store at a time. The
//! lock is an exclusive `flock` on a file under the state directory; it
//! releases on drop, including on abnormal exit.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another ferrite driver holds the lock at {0}")]
    Held(String),

    #[error("Lock error: {0}")]
    Errno(Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Held for the lifetime of a mutating command.
#[derive(Debug)]
pub struct DriverLock {
    _flock: Flock<File>,
}

impl DriverLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(LockError::Held(path.display().to_string()));
            }
            Err((_, errno)) => return Err(LockError::Errno(errno)),
        };

        let _ = writeln!(&*flock, "{}", std::process::id());
        tracing::debug!("Acquired driver lock {}", path.display());
        Ok(Self { _flock: flock })
    }
}
