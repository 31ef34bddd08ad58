//! Upgrade driver: snapshot, then commit or roll back
//!
//! For each target the driver snapshots the installed version, stages and
//! deploys the new one through the build pipeline, and on any failure
//! restores the snapshot so the package's files and manifest match the
//! pre-upgrade state exactly. Batch progress persists to a state file so a
//! failed run resumes with the failed package first.
//!
//! After a fully successful batch the driver prunes files the old version
//! owned but the new one does not, syncs the dependency graph, gives
//! depclean a pass, and (when configured) commits the ports tree once.

mod state;

pub use state::UpgradeState;

use ferrite_build::{
    BatchOptions, HookPoint, HookRunner, InstallDriver, Metafile, RunSummary,
};
use ferrite_config::Config;
use ferrite_db::{Manifest, ManifestStore, Stage};
use ferrite_remove::{commit_ports_tree, DepcleanDriver, DepcleanMode, DepcleanOptions};
use ferrite_snapshot::SnapshotStore;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("Upgrade of {0} failed, snapshot restored")]
    PackageFailed(String),

    #[error("Build error: {0}")]
    Build(#[from] ferrite_build::BuildError),

    #[error("Database error: {0}")]
    Db(#[from] ferrite_db::DbError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] ferrite_snapshot::SnapshotError),

    #[error("Removal error: {0}")]
    Remove(#[from] ferrite_remove::RemoveError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Pick up from the persisted state, failed package first
    pub resume: bool,
    /// Report planned version moves without acting
    pub dry_run: bool,
    /// Upgrade even when versions match
    pub force: bool,
    /// Prune orphaned files and depclean without confirmation
    pub auto: bool,
    /// Suppress the end-of-run ports commit
    pub no_commit: bool,
    /// Override recipe stages
    pub stage_override: Option<Stage>,
}

/// Moves packages from their installed version to the ports version.
pub struct UpgradeDriver<'a> {
    config: &'a Config,
    store: &'a ManifestStore,
    snapshots: SnapshotStore,
    hooks: HookRunner,
    cancel: Arc<AtomicBool>,
}

impl<'a> UpgradeDriver<'a> {
    pub fn new(config: &'a Config, store: &'a ManifestStore) -> Self {
        Self {
            config,
            store,
            snapshots: SnapshotStore::new(&config.paths.snapshot_dir),
            hooks: HookRunner::new(&config.paths.hooks_dir),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Every installed name with a recipe in the ports tree (`--all`).
    pub fn all_targets(&self) -> Result<Vec<String>, UpgradeError> {
        let mut names: Vec<String> = self
            .store
            .index()?
            .into_iter()
            .map(|e| e.name)
            .filter(|name| Metafile::find(&self.config.paths.ports_dir, name).is_ok())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn run(
        &self,
        targets: &[String],
        opts: &UpgradeOptions,
    ) -> Result<RunSummary, UpgradeError> {
        let state_dir = &self.config.paths.state_dir;

        let mut state = if opts.resume {
            let loaded = UpgradeState::load(state_dir);
            info!(
                "Resuming upgrade: {} done, {} remaining",
                loaded.completed.len(),
                loaded.remaining.len()
            );
            loaded
        } else {
            UpgradeState::fresh(targets)
        };

        let queue = state.queue();
        let mut summary = RunSummary::default();
        // (old, new) pairs whose orphaned files get pruned after the batch
        let mut upgraded: Vec<(Manifest, Manifest)> = Vec::new();

        for name in &queue {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Interrupted, not upgrading {name}");
                summary.skipped.push(name.clone());
                continue;
            }

            let (metafile, _path) =
                match Metafile::load_from_ports(&self.config.paths.ports_dir, name) {
                    Ok(found) => found,
                    Err(e) => {
                        warn!("No usable recipe for {name}: {e}");
                        summary.failed.push(name.clone());
                        state.mark_failed(name);
                        if !opts.dry_run {
                            state.save(state_dir)?;
                        }
                        if !self.config.build.continue_on_error {
                            break;
                        }
                        continue;
                    }
                };

            let v_new = metafile.version.clone();
            let v_old = self.store.installed_versions(name)?.into_iter().next();

            if v_old.as_deref() == Some(v_new.as_str()) && !opts.force {
                debug!("{name} already at {v_new}, skipping");
                summary.skipped.push(name.clone());
                state.mark_completed(name);
                continue;
            }

            if opts.dry_run {
                match &v_old {
                    Some(old) => info!("dry-run: would upgrade {name} {old} -> {v_new}"),
                    None => info!("dry-run: would install {name} {v_new}"),
                }
                summary.skipped.push(name.clone());
                continue;
            }

            match self.upgrade_one(name, &metafile, v_old.as_deref(), opts) {
                Ok(pair) => {
                    info!("Upgraded {name} to {v_new}");
                    summary.completed.push(format!("{name}-{v_new}"));
                    state.mark_completed(name);
                    state.save(state_dir)?;
                    if let Some(pair) = pair {
                        upgraded.push(pair);
                    }
                }
                Err(e) => {
                    warn!("upgrade-failed {name}: {e}");
                    summary.failed.push(name.clone());
                    state.mark_failed(name);
                    state.save(state_dir)?;
                    if !self.config.build.continue_on_error {
                        break;
                    }
                }
            }
        }

        if !opts.dry_run && summary.failed.is_empty() {
            self.finish_batch(&summary, &upgraded, opts)?;
            UpgradeState::clear(state_dir)?;
        }

        summary.log("upgrade");
        Ok(summary)
    }

    /// Snapshot, build, deploy, compare. Returns the (old, new) manifests
    /// when an older version was replaced.
    fn upgrade_one(
        &self,
        name: &str,
        metafile: &Metafile,
        v_old: Option<&str>,
        opts: &UpgradeOptions,
    ) -> Result<Option<(Manifest, Manifest)>, UpgradeError> {
        let metafile_path = Metafile::find(&self.config.paths.ports_dir, name)?;
        self.hooks.run(HookPoint::PreUpgrade, name, &metafile_path);

        let old_manifest = match v_old {
            Some(version) => Some(self.store.query_one(&format!("{name}-{version}"))?),
            None => None,
        };

        // A snapshot is mandatory before any destructive action when an
        // install is present.
        let snapdir = match &old_manifest {
            Some(old) => {
                let archive = self
                    .config
                    .paths
                    .cache_packages_dir
                    .join(ferrite_build::package_file_name(&old.id()));
                Some(
                    self.snapshots
                        .create(old, Some(&archive), &self.root_for(old.stage))?,
                )
            }
            None => None,
        };

        let driver = InstallDriver::new(self.config, self.store).with_cancel(self.cancel.clone());
        let batch_opts = BatchOptions {
            resume: opts.resume,
            dry_run: false,
            force: opts.force,
            stage_override: opts.stage_override,
        };

        let failed = match driver.run(&[name.to_string()], &batch_opts) {
            Ok(batch) => !batch.failed.is_empty(),
            Err(e) => {
                warn!("Pipeline error for {name}: {e}");
                true
            }
        };

        if failed {
            if let (Some(snapdir), Some(old)) = (&snapdir, &old_manifest) {
                warn!("Rolling back {name} to {}", old.version);
                self.snapshots
                    .restore(snapdir, self.store, &self.root_for(old.stage))?;
                self.drop_other_versions(name, &old.version);
            }
            return Err(UpgradeError::PackageFailed(name.to_string()));
        }

        let new_manifest = self
            .store
            .query_one(&format!("{name}-{}", metafile.version))?;

        // The replaced version's manifest moves to the backup area; one
        // (name, version) stays live per name after an upgrade.
        if let Some(old) = &old_manifest {
            if old.version != new_manifest.version {
                self.store.remove(&old.id().to_string(), true)?;
            }
        }

        // Advisory integrity comparison between the replaced and the new
        // file sets.
        if let Some(old) = &old_manifest {
            let before = fingerprint(old);
            let after = fingerprint(&new_manifest);
            if before != after {
                warn!(
                    "{name}: content fingerprint changed across upgrade ({} -> {})",
                    &before[..12],
                    &after[..12]
                );
            }
        }

        self.hooks.run(HookPoint::PostUpgrade, name, &metafile_path);
        Ok(old_manifest.map(|old| (old, new_manifest)))
    }

    /// Post-batch housekeeping: orphaned files, snapshot pruning, graph
    /// sync, depclean, ports commit.
    fn finish_batch(
        &self,
        summary: &RunSummary,
        upgraded: &[(Manifest, Manifest)],
        opts: &UpgradeOptions,
    ) -> Result<(), UpgradeError> {
        for (old, new) in upgraded {
            self.prune_orphan_files(old, new, opts.auto);
        }

        if let Err(e) = self.snapshots.prune(self.config.maintenance.keep_snapshots_days) {
            warn!("Snapshot pruning failed: {e}");
        }

        if !summary.completed.is_empty() {
            if let Err(e) = ferrite_graph::sync(self.store, &self.config.paths.state_dir) {
                warn!("Graph sync failed: {e}");
            }

            // Report-only: freshly upgraded leaves have no dependents and
            // would match the orphan scan. Actual cleanup stays with the
            // explicit depclean command.
            let depclean = DepcleanDriver::new(self.config, self.store)
                .with_cancel(self.cancel.clone());
            if let Err(e) = depclean.run(&DepcleanOptions {
                mode: DepcleanMode::DryRun,
                ..Default::default()
            }) {
                warn!("Post-upgrade depclean failed: {e}");
            }

            if !opts.no_commit && self.config.maintenance.auto_commit {
                commit_ports_tree(
                    &self.config.paths.ports_dir,
                    &format!("upgrade: {}", summary.completed.join(", ")),
                );
            }
        }
        Ok(())
    }

    /// Delete files the old version owned that the new one no longer does.
    /// With `auto` unset this only reports.
    fn prune_orphan_files(&self, old: &Manifest, new: &Manifest, auto: bool) {
        let kept: HashSet<&str> = new.file_paths().collect();
        let root = self.root_for(old.stage);

        for path in old.file_paths().filter(|p| !kept.contains(p)) {
            let on_disk = root.join(path.trim_start_matches('/'));
            if !auto {
                info!("Orphaned by upgrade (kept, use --auto to remove): {path}");
                continue;
            }
            match std::fs::remove_file(&on_disk) {
                Ok(()) => info!("Removed orphaned file {}", on_disk.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", on_disk.display(), e),
            }
        }
    }

    /// Restore each target from its most recent snapshot (`--rollback`).
    pub fn rollback(&self, targets: &[String]) -> Result<RunSummary, UpgradeError> {
        let mut summary = RunSummary::default();

        for name in targets {
            let Some(snapdir) = self.snapshots.latest_for(name)? else {
                warn!("No snapshot for {name}");
                summary.failed.push(name.clone());
                continue;
            };

            let manifest = Manifest::load(&snapdir.join(ferrite_snapshot::MANIFEST_NAME))?;
            match self
                .snapshots
                .restore(&snapdir, self.store, &self.root_for(manifest.stage))
            {
                Ok(restored) => {
                    info!("Rolled {name} back to {}", restored.version);
                    self.drop_other_versions(name, &restored.version);
                    summary.completed.push(restored.id().to_string());
                }
                Err(e) => {
                    warn!("Rollback of {name} failed: {e}");
                    summary.failed.push(name.clone());
                }
            }
        }

        if !summary.completed.is_empty() {
            if let Err(e) = ferrite_graph::sync(self.store, &self.config.paths.state_dir) {
                warn!("Graph sync failed: {e}");
            }
        }
        summary.log("rollback");
        Ok(summary)
    }

    /// Push every other installed version of `name` into the backup area,
    /// leaving `keep_version` as the single live manifest.
    fn drop_other_versions(&self, name: &str, keep_version: &str) {
        let versions = match self.store.installed_versions(name) {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not list versions of {name}: {e}");
                return;
            }
        };
        for version in versions {
            if version != keep_version {
                if let Err(e) = self.store.remove(&format!("{name}-{version}"), true) {
                    warn!("Could not retire {name}-{version}: {e}");
                }
            }
        }
    }

    fn root_for(&self, stage: Stage) -> PathBuf {
        if stage.is_bootstrap() {
            self.config.paths.lfs_root.clone()
        } else {
            PathBuf::from("/")
        }
    }
}

/// Sorted hash of the per-file hashes a manifest records.
fn fingerprint(manifest: &Manifest) -> String {
    let mut hashes: Vec<&str> = manifest.files.iter().filter_map(|f| f.sha256()).collect();
    hashes.sort_unstable();

    let mut hasher = Sha256::new();
    for h in hashes {
        hasher.update(h.as_bytes());
    }
    hex::encode(hasher.finalize())
}
