//! Stage hooks
//!
//! At each stage boundary every executable in the matching subdirectory of
//! the hooks directory runs with `(package-id, metafile-path)` arguments.
//! Hooks are advisory: a non-zero exit is logged and never aborts the
//! pipeline.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Hook points, named after their directory under the hooks dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    PreInit,
    PostDownload,
    PostExtract,
    PostPatch,
    PostBuild,
    PostInstall,
    PostPackage,
    PostDeploy,
    PostRegister,
    PreCleanup,
    PostCleanup,
    PreUpgrade,
    PostUpgrade,
    PreRemove,
    PostRemove,
}

impl HookPoint {
    pub fn dir_name(&self) -> &'static str {
        match self {
            HookPoint::PreInit => "pre-init",
            HookPoint::PostDownload => "post-download",
            HookPoint::PostExtract => "post-extract",
            HookPoint::PostPatch => "post-patch",
            HookPoint::PostBuild => "post-build",
            HookPoint::PostInstall => "post-install",
            HookPoint::PostPackage => "post-package",
            HookPoint::PostDeploy => "post-deploy",
            HookPoint::PostRegister => "post-register",
            HookPoint::PreCleanup => "pre-cleanup",
            HookPoint::PostCleanup => "post-cleanup",
            HookPoint::PreUpgrade => "pre-upgrade",
            HookPoint::PostUpgrade => "post-upgrade",
            HookPoint::PreRemove => "pre-remove",
            HookPoint::PostRemove => "post-remove",
        }
    }
}

/// Runs the executables found in per-hook directories.
pub struct HookRunner {
    hooks_dir: PathBuf,
}

impl HookRunner {
    pub fn new(hooks_dir: impl Into<PathBuf>) -> Self {
        Self {
            hooks_dir: hooks_dir.into(),
        }
    }

    /// Run every executable for a hook point, in name order.
    ///
    /// Returns how many hooks ran. Failures (spawn errors, non-zero exits)
    /// are logged at `warn` and swallowed.
    pub fn run(&self, point: HookPoint, package: &str, metafile: &Path) -> usize {
        let dir = self.hooks_dir.join(point.dir_name());
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return 0;
        };

        let mut hooks: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_executable(p))
            .collect();
        hooks.sort();

        let mut ran = 0;
        for hook in hooks {
            debug!("Running {} hook {}", point.dir_name(), hook.display());
            match Command::new(&hook).arg(package).arg(metafile).output() {
                Ok(output) if output.status.success() => ran += 1,
                Ok(output) => {
                    ran += 1;
                    warn!(
                        "Hook {} exited {} (advisory, continuing)",
                        hook.display(),
                        output.status.code().unwrap_or(-1)
                    );
                }
                Err(e) => {
                    warn!("Hook {} failed to run: {}", hook.display(), e);
                }
            }
        }
        ran
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|md| md.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn install_hook(dir: &Path, point: HookPoint, name: &str, body: &str) {
        let hook_dir = dir.join(point.dir_name());
        std::fs::create_dir_all(&hook_dir).unwrap();
        let path = hook_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn test_hooks_receive_package_and_metafile() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        install_hook(
            dir.path(),
            HookPoint::PostBuild,
            "10-record",
            &format!("echo \"$1 $2\" > {}", marker.display()),
        );

        let runner = HookRunner::new(dir.path());
        let ran = runner.run(
            HookPoint::PostBuild,
            "alpha-1.0",
            Path::new("/ports/alpha/metafile.yml"),
        );

        assert_eq!(ran, 1);
        let recorded = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(recorded.trim(), "alpha-1.0 /ports/alpha/metafile.yml");
    }

    #[test]
    fn test_failing_hook_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        install_hook(dir.path(), HookPoint::PostDeploy, "99-fail", "exit 1");

        let runner = HookRunner::new(dir.path());
        let ran = runner.run(HookPoint::PostDeploy, "alpha-1.0", Path::new("/dev/null"));
        assert_eq!(ran, 1);
    }

    #[test]
    fn test_non_executables_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let hook_dir = dir.path().join("post-build");
        std::fs::create_dir_all(&hook_dir).unwrap();
        std::fs::write(hook_dir.join("README"), "not a hook").unwrap();

        let runner = HookRunner::new(dir.path());
        assert_eq!(
            runner.run(HookPoint::PostBuild, "alpha-1.0", Path::new("/dev/null")),
            0
        );
    }

    #[test]
    fn test_missing_hook_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let runner = HookRunner::new(dir.path());
        assert_eq!(
            runner.run(HookPoint::PreInit, "alpha-1.0", Path::new("/dev/null")),
            0
        );
    }

    #[test]
    fn test_hooks_run_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("order");
        install_hook(
            dir.path(),
            HookPoint::PostRegister,
            "20-second",
            &format!("echo two >> {}", marker.display()),
        );
        install_hook(
            dir.path(),
            HookPoint::PostRegister,
            "10-first",
            &format!("echo one >> {}", marker.display()),
        );

        let runner = HookRunner::new(dir.path());
        runner.run(HookPoint::PostRegister, "alpha-1.0", Path::new("/dev/null"));

        let recorded = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(recorded, "one\ntwo\n");
    }
}
