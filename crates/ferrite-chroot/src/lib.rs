//! Bind-mount lifecycle for a bootstrap root
//!
//! Bootstrap (`pass1`/`pass2`) builds deploy into a staging root that needs
//! the usual virtual filesystems bound from the host: `/dev`, `/dev/pts`,
//! `/proc`, `/sys`, `/run`, plus a copy of the host resolver config so that
//! in-chroot downloads work. [`ChrootEnv`] owns that set of mounts for the
//! lifetime of one driver run.
//!
//! Mounting is idempotent (an already-mounted target is a no-op), and
//! teardown happens at most once, in reverse mount order, with lazy
//! unmounts that tolerate children that are already gone. Dropping an
//! active environment unmounts it, so no exit path leaks mounts.

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ChrootError {
    #[error("Failed to mount {target}: {reason}")]
    MountFailed { target: PathBuf, reason: String },

    #[error("Failed to unmount {target}: {reason}")]
    UnmountFailed { target: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host paths bound into the root, in mount order. Teardown runs the list
/// in reverse so `dev/pts` goes before `dev`.
const BIND_MOUNTS: &[&str] = &["dev", "dev/pts", "proc", "sys", "run"];

/// One staging root and the bind mounts established onto it.
pub struct ChrootEnv {
    root: PathBuf,
    mounted: Vec<PathBuf>,
}

impl ChrootEnv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether this environment currently holds any mounts.
    pub fn is_active(&self) -> bool {
        !self.mounted.is_empty()
    }

    /// Establish the bind mounts and copy the host resolver config.
    ///
    /// Idempotent: targets that are already mount points are skipped, and
    /// calling `mount` twice on the same environment is a no-op.
    pub fn mount(&mut self) -> Result<(), ChrootError> {
        for rel in BIND_MOUNTS {
            let source = Path::new("/").join(rel);
            let target = self.root.join(rel);

            fs::create_dir_all(&target)?;
            if is_mount_point(&target) {
                debug!("{} already mounted, skipping", target.display());
                continue;
            }

            mount(
                Some(source.as_path()),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| ChrootError::MountFailed {
                target: target.clone(),
                reason: e.to_string(),
            })?;

            info!("Mounted {} -> {}", source.display(), target.display());
            self.mounted.push(target);
        }

        self.copy_resolver()?;
        Ok(())
    }

    /// Copy `/etc/resolv.conf` into the root so name resolution works for
    /// chrooted commands. Best-effort: a host without one is not an error.
    fn copy_resolver(&self) -> Result<(), ChrootError> {
        let host = Path::new("/etc/resolv.conf");
        if !host.exists() {
            return Ok(());
        }
        let etc = self.root.join("etc");
        fs::create_dir_all(&etc)?;
        let dest = etc.join("resolv.conf");
        // an existing symlink would make fs::copy write through it
        let _ = fs::remove_file(&dest);
        fs::copy(host, &dest)?;
        debug!("Copied resolver config into {}", self.root.display());
        Ok(())
    }

    /// Empty the scratch directories inside the root. Safe to call between
    /// packages within one mount lifetime.
    pub fn clean_between(&self) -> Result<(), ChrootError> {
        for rel in ["tmp", "var/tmp", "build"] {
            let dir = self.root.join(rel);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(e) = result {
                    warn!("Could not clean {}: {}", path.display(), e);
                }
            }
            debug!("Cleaned {}", dir.display());
        }
        Ok(())
    }

    /// Tear down the bind mounts in reverse order.
    ///
    /// Lazy (`MNT_DETACH`) unmounts tolerate busy trees; targets that are
    /// already unmounted are skipped. After this returns the environment is
    /// inactive, and calling it again is a no-op.
    pub fn unmount(&mut self) -> Result<(), ChrootError> {
        let mut first_error = None;

        while let Some(target) = self.mounted.pop() {
            if !is_mount_point(&target) {
                debug!("{} already unmounted", target.display());
                continue;
            }
            match umount2(&target, MntFlags::MNT_DETACH) {
                Ok(()) => info!("Unmounted {}", target.display()),
                Err(e) => {
                    warn!("Failed to unmount {}: {}", target.display(), e);
                    if first_error.is_none() {
                        first_error = Some(ChrootError::UnmountFailed {
                            target: target.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ChrootEnv {
    fn drop(&mut self) {
        if self.is_active() {
            warn!("Chroot environment dropped while active, unmounting");
            let _ = self.unmount();
        }
    }
}

/// Whether a path is currently a mount point, per `/proc/mounts`.
pub fn is_mount_point(path: &Path) -> bool {
    let canonical = match path.canonicalize() {
        Ok(p) => p,
        Err(_) => return false,
    };
    fs::read_to_string("/proc/mounts")
        .map(|mounts| {
            mounts.lines().any(|line| {
                line.split_whitespace().nth(1) == Some(canonical.to_string_lossy().as_ref())
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_env_is_inactive() {
        let env = ChrootEnv::new("/mnt/lfs");
        assert!(!env.is_active());
        assert_eq!(env.root(), Path::new("/mnt/lfs"));
    }

    #[test]
    fn test_unmount_without_mounts_is_noop() {
        let mut env = ChrootEnv::new("/mnt/lfs");
        env.unmount().unwrap();
        assert!(!env.is_active());
    }

    #[test]
    fn test_clean_between_empties_scratch_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        fs::create_dir_all(tmp.join("leftover-dir")).unwrap();
        fs::write(tmp.join("leftover-file"), "x").unwrap();
        fs::create_dir_all(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build/object.o"), "x").unwrap();

        let env = ChrootEnv::new(dir.path());
        env.clean_between().unwrap();

        assert!(tmp.exists());
        assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);
        assert_eq!(fs::read_dir(dir.path().join("build")).unwrap().count(), 0);
    }

    #[test]
    fn test_clean_between_tolerates_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let env = ChrootEnv::new(dir.path());
        env.clean_between().unwrap();
    }

    #[test]
    fn test_random_path_is_not_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(&dir.path().join("nope")));
        assert!(!is_mount_point(dir.path()));
    }

    #[test]
    fn test_drop_inactive_env_does_not_panic() {
        let env = ChrootEnv::new("/mnt/lfs");
        drop(env);
    }
}
