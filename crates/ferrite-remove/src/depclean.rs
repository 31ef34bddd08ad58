//! Orphan detection and cleanup

use crate::remove::{RemoveDriver, RemoveOptions};
use crate::{commit_ports_tree, RemoveError};
use ferrite_build::RunSummary;
use ferrite_config::{Config, ProtectedSet};
use ferrite_db::{ManifestStore, PackageId};
use ferrite_graph::{DepGraph, GraphCache};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// What depclean is allowed to do. The default never removes anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepcleanMode {
    #[default]
    DryRun,
    Interactive,
    Auto,
}

#[derive(Debug, Clone, Default)]
pub struct DepcleanOptions {
    pub mode: DepcleanMode,
    /// Remove candidates even when the double-check still sees dependents
    pub force: bool,
    /// Verify candidate files on disk before removal
    pub verify: bool,
    /// Drop the persistent graph cache first
    pub purge_cache: bool,
    /// Commit the ports tree after removals
    pub auto_commit: bool,
}

/// Finds orphans and feeds them through the removal driver.
pub struct DepcleanDriver<'a> {
    config: &'a Config,
    store: &'a ManifestStore,
    protected: ProtectedSet,
    cancel: Arc<AtomicBool>,
}

impl<'a> DepcleanDriver<'a> {
    pub fn new(config: &'a Config, store: &'a ManifestStore) -> Self {
        Self {
            config,
            store,
            protected: config.protected_set(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_protected(mut self, protected: ProtectedSet) -> Self {
        self.protected = protected;
        self
    }

    /// Orphan candidates, graph-based with a store-only fallback.
    pub fn candidates(&self) -> Result<Vec<PackageId>, RemoveError> {
        match self.store.index() {
            Ok(entries) => {
                let graph = DepGraph::from_index(&entries);
                let mut out = Vec::new();
                for name in graph.orphans(None) {
                    let versions = self.store.installed_versions(&name)?;
                    if let Some(version) = versions.first() {
                        out.push(PackageId::new(name, version.clone()));
                    }
                }
                Ok(out)
            }
            Err(e) => {
                warn!("Graph unavailable ({e}), falling back to store orphan scan");
                Ok(self.store.orphans()?)
            }
        }
    }

    pub fn run(&self, opts: &DepcleanOptions) -> Result<RunSummary, RemoveError> {
        if opts.purge_cache {
            GraphCache::purge(&self.config.paths.state_dir)?;
            info!("Graph cache purged");
        }

        let candidates = self.candidates()?;
        info!("Depclean candidates: {}", candidates.len());

        let mut summary = RunSummary::default();
        let remover = RemoveDriver::new(self.config, self.store)
            .with_protected(self.protected.clone())
            .with_cancel(self.cancel.clone());

        for candidate in candidates {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Interrupted, stopping depclean");
                break;
            }

            let name = candidate.name.clone();
            if self.protected.contains(&name) {
                info!("Skipping protected {name}");
                summary.skipped.push(candidate.to_string());
                continue;
            }

            // Double-check against the live store before destroying data.
            let still_needed = !self.store.revdeps(&name)?.is_empty();
            if still_needed && !opts.force {
                info!("Skipping {name}: gained dependents since the scan");
                summary.skipped.push(candidate.to_string());
                continue;
            }

            if opts.verify {
                for report in self.store.verify(&candidate.to_string())? {
                    if !report.is_clean() {
                        warn!(
                            "{}: {} missing, {} mismatched files",
                            report.id,
                            report.missing.len(),
                            report.mismatched.len()
                        );
                    }
                }
            }

            match opts.mode {
                DepcleanMode::DryRun => {
                    info!("dry-run: would remove orphan {candidate}");
                    summary.skipped.push(candidate.to_string());
                }
                DepcleanMode::Interactive => {
                    if confirm(&format!("Remove orphan {candidate}?")) {
                        self.remove_candidate(&remover, &candidate, opts, &mut summary);
                    } else {
                        summary.skipped.push(candidate.to_string());
                    }
                }
                DepcleanMode::Auto => {
                    self.remove_candidate(&remover, &candidate, opts, &mut summary);
                }
            }
        }

        if !summary.completed.is_empty() {
            if let Err(e) = ferrite_graph::sync(self.store, &self.config.paths.state_dir) {
                warn!("Graph sync failed: {e}");
            }
            if opts.auto_commit || self.config.maintenance.auto_commit {
                commit_ports_tree(
                    &self.config.paths.ports_dir,
                    &format!("depclean: removed {}", summary.completed.join(", ")),
                );
            }
        }

        summary.log("depclean");
        Ok(summary)
    }

    fn remove_candidate(
        &self,
        remover: &RemoveDriver,
        candidate: &PackageId,
        opts: &DepcleanOptions,
        summary: &mut RunSummary,
    ) {
        let remove_opts = RemoveOptions {
            force: opts.force,
            no_depclean: true,
            no_sync: true,
            ..Default::default()
        };
        match remover.remove_one(&candidate.to_string(), &remove_opts) {
            Ok(removed) => summary
                .completed
                .extend(removed.iter().map(|id| id.to_string())),
            Err(e) => {
                warn!("Could not remove orphan {candidate}: {e}");
                summary.failed.push(candidate.to_string());
            }
        }
    }
}

/// Ask on the controlling terminal. Anything but `y`/`yes` declines.
fn confirm(prompt: &str) -> bool {
    print!("{prompt} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_db::{Depends, FileEntry, Manifest, Stage};
    use std::fs;
    use std::path::Path;

    fn test_config(base: &Path) -> Config {
        let mut config = Config::default();
        config.paths.db_dir = base.join("db");
        config.paths.db_backup_dir = base.join("db-backup");
        config.paths.log_dir = base.join("log");
        config.paths.hooks_dir = base.join("hooks");
        config.paths.snapshot_dir = base.join("snapshots");
        config.paths.state_dir = base.join("state");
        config.paths.cache_sources_dir = base.join("sources");
        config.paths.cache_packages_dir = base.join("packages");
        config.paths.ports_dir = base.join("ports");
        config.paths.lfs_root = base.join("root");
        config.paths.protected_set_path = base.join("protected");
        config
    }

    fn install(config: &Config, store: &ManifestStore, name: &str, deps: &[&str]) {
        let rel = format!("usr/bin/{name}");
        let on_disk = config.paths.lfs_root.join(&rel);
        fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        fs::write(&on_disk, name).unwrap();

        store
            .add(
                &Manifest {
                    name: name.into(),
                    version: "1.0".into(),
                    stage: Stage::Pass1,
                    origin: None,
                    description: None,
                    install_prefix: None,
                    files: vec![FileEntry::Path(format!("/{rel}"))],
                    depends: Depends {
                        build: Vec::new(),
                        run: deps.iter().map(|s| s.to_string()).collect(),
                    },
                    provides: Vec::new(),
                    replaces: Vec::new(),
                    build_date: None,
                },
                false,
            )
            .unwrap();
    }

    #[test]
    fn test_auto_mode_removes_only_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "alpha", &[]);
        install(&config, &store, "leaf", &["alpha"]);
        install(&config, &store, "gamma", &[]);

        let driver = DepcleanDriver::new(&config, &store).with_protected(ProtectedSet::empty());

        // alpha has a dependent; gamma and leaf are orphans
        let summary = driver
            .run(&DepcleanOptions {
                mode: DepcleanMode::Auto,
                ..Default::default()
            })
            .unwrap();

        assert!(summary.completed.contains(&"gamma-1.0".to_string()));
        assert!(summary.completed.contains(&"leaf-1.0".to_string()));
        assert!(!config.paths.lfs_root.join("usr/bin/gamma").exists());
        // the candidate scan is a snapshot; alpha only becomes an orphan
        // once leaf is gone and is picked up by the next pass
        assert_eq!(store.query("alpha").unwrap().len(), 1);
    }

    #[test]
    fn test_dry_run_default_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "gamma", &[]);

        let driver = DepcleanDriver::new(&config, &store).with_protected(ProtectedSet::empty());
        let summary = driver.run(&DepcleanOptions::default()).unwrap();

        assert!(summary.completed.is_empty());
        assert_eq!(summary.skipped, vec!["gamma-1.0"]);
        assert_eq!(store.query("gamma").unwrap().len(), 1);
    }

    #[test]
    fn test_protected_orphans_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::write(&config.paths.protected_set_path, "gamma\n").unwrap();
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "gamma", &[]);

        let driver = DepcleanDriver::new(&config, &store);
        let summary = driver
            .run(&DepcleanOptions {
                mode: DepcleanMode::Auto,
                ..Default::default()
            })
            .unwrap();

        assert!(summary.completed.is_empty());
        assert_eq!(store.query("gamma").unwrap().len(), 1);
    }

    #[test]
    fn test_orphans_empty_after_auto_pass() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "gamma", &[]);

        let driver = DepcleanDriver::new(&config, &store).with_protected(ProtectedSet::empty());
        driver
            .run(&DepcleanOptions {
                mode: DepcleanMode::Auto,
                ..Default::default()
            })
            .unwrap();

        assert!(driver.candidates().unwrap().is_empty());
        assert!(store.orphans().unwrap().is_empty());
    }

    #[test]
    fn test_purge_cache_flag() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        fs::create_dir_all(&config.paths.state_dir).unwrap();
        fs::write(GraphCache::path(&config.paths.state_dir), "{}").unwrap();

        let driver = DepcleanDriver::new(&config, &store).with_protected(ProtectedSet::empty());
        driver
            .run(&DepcleanOptions {
                purge_cache: true,
                ..Default::default()
            })
            .unwrap();

        assert!(!GraphCache::path(&config.paths.state_dir).exists());
    }
}
