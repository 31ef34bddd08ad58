//! Package removal driver

use crate::{DepcleanDriver, DepcleanMode, DepcleanOptions, RemoveError};
use ferrite_build::{HookPoint, HookRunner, RunSummary};
use ferrite_config::{Config, ProtectedSet};
use ferrite_db::{Manifest, ManifestStore, PackageId};
use ferrite_graph::DepGraph;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Removal knobs, one per CLI flag.
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Pick up from the persisted batch state, failed package first
    pub resume: bool,
    /// Run depclean afterwards in auto mode instead of dry-run
    pub auto: bool,
    /// Override protected/revdep/ambiguity guards
    pub force: bool,
    /// Also remove conventional config/state paths for the package name
    pub purge: bool,
    /// Report what would happen without touching anything
    pub dry_run: bool,
    /// Skip the post-removal depclean pass
    pub no_depclean: bool,
    /// Skip the post-removal graph sync
    pub no_sync: bool,
}

/// Uninstalls packages while keeping the store and filesystem consistent.
pub struct RemoveDriver<'a> {
    config: &'a Config,
    store: &'a ManifestStore,
    protected: ProtectedSet,
    hooks: HookRunner,
    cancel: Arc<AtomicBool>,
}

impl<'a> RemoveDriver<'a> {
    pub fn new(config: &'a Config, store: &'a ManifestStore) -> Self {
        Self {
            config,
            store,
            protected: config.protected_set(),
            hooks: HookRunner::new(&config.paths.hooks_dir),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the protected set (tests, `--force` policies).
    pub fn with_protected(mut self, protected: ProtectedSet) -> Self {
        self.protected = protected;
        self
    }

    /// Remove every queried package. Exit code is 2 iff any removal failed.
    pub fn run(&self, queries: &[String], opts: &RemoveOptions) -> Result<RunSummary, RemoveError> {
        let state_dir = &self.config.paths.state_dir;
        let mut state = if opts.resume {
            crate::RemoveState::load(state_dir)
        } else {
            crate::RemoveState::fresh(queries)
        };

        let mut summary = RunSummary::default();

        for query in &state.queue() {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Interrupted, not removing {query}");
                summary.skipped.push(query.clone());
                continue;
            }
            match self.remove_one(query, opts) {
                Ok(removed) => {
                    if opts.dry_run {
                        summary.skipped.extend(removed.iter().map(|id| id.to_string()));
                    } else {
                        summary.completed.extend(removed.iter().map(|id| id.to_string()));
                        state.mark_completed(query);
                        state.save(state_dir)?;
                    }
                }
                Err(e) => {
                    warn!("Remove of {query} failed: {e}");
                    summary.failed.push(query.clone());
                    if !opts.dry_run {
                        state.mark_failed(query);
                        state.save(state_dir)?;
                    }
                }
            }
        }

        if !opts.dry_run && summary.failed.is_empty() {
            crate::RemoveState::clear(state_dir)?;
        }

        if !opts.dry_run && !summary.completed.is_empty() {
            if !opts.no_sync {
                if let Err(e) = ferrite_graph::sync(self.store, &self.config.paths.state_dir) {
                    warn!("Graph sync failed: {e}");
                }
            }
            if !opts.no_depclean {
                let depclean = DepcleanDriver::new(self.config, self.store)
                    .with_protected(self.protected.clone());
                let mode = if opts.auto {
                    DepcleanMode::Auto
                } else {
                    DepcleanMode::DryRun
                };
                if let Err(e) = depclean.run(&DepcleanOptions {
                    mode,
                    force: false,
                    verify: false,
                    purge_cache: false,
                    auto_commit: false,
                }) {
                    warn!("Post-removal depclean failed: {e}");
                }
            }
        }

        summary.log("remove");
        Ok(summary)
    }

    /// Remove one query's worth of manifests. Returns the identities
    /// removed (or, for dry runs, the ones that would be).
    pub fn remove_one(
        &self,
        query: &str,
        opts: &RemoveOptions,
    ) -> Result<Vec<PackageId>, RemoveError> {
        // Multiple versions behind a bare name require --force or an exact
        // name-version query; store resolution enforces this on removal,
        // but the guards below need the manifests up front.
        let manifests = self.store.query(query)?;
        if manifests.len() > 1 && !opts.force {
            return Err(ferrite_db::DbError::Ambiguous {
                query: query.to_string(),
                matches: manifests.iter().map(|m| m.id().to_string()).collect(),
            }
            .into());
        }

        let name = manifests[0].name.clone();

        if self.protected.contains(&name) && !opts.force {
            return Err(RemoveError::Protected(name));
        }

        let graph = DepGraph::from_index(&self.store.index()?);
        let dependents = graph.revdeps(&name);
        if !dependents.is_empty() && !opts.force {
            return Err(RemoveError::RequiredBy {
                package: name,
                dependents,
            });
        }

        if opts.dry_run {
            for m in &manifests {
                info!("dry-run: would remove {} ({} files)", m.id(), m.files.len());
            }
            return Ok(manifests.iter().map(Manifest::id).collect());
        }

        self.hooks
            .run(HookPoint::PreRemove, query, Path::new(""));

        // Manifest goes to the backup area first, so the removal is
        // reversible until the files are gone.
        let removed = self.store.remove(query, true)?;

        let mut file_failures = 0;
        for manifest in &manifests {
            file_failures += self.delete_files(manifest);
            if opts.purge {
                self.purge_state_paths(manifest);
            }
        }

        self.hooks
            .run(HookPoint::PostRemove, query, Path::new(""));

        if file_failures > 0 {
            warn!("{file_failures} files could not be removed for {query}");
            return Err(std::io::Error::other(format!(
                "{file_failures} owned files could not be removed"
            ))
            .into());
        }

        Ok(removed)
    }

    /// Delete the files a manifest owns. Missing files are fine. Returns
    /// the number of failures.
    fn delete_files(&self, manifest: &Manifest) -> usize {
        let root = self.root_for(manifest);
        let mut failures = 0;

        for path in manifest.file_paths() {
            let on_disk = root.join(path.trim_start_matches('/'));
            match fs::remove_file(&on_disk) {
                Ok(()) => debug!("Removed {}", on_disk.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Already gone: {}", on_disk.display());
                }
                Err(e) => {
                    warn!("Could not remove {}: {}", on_disk.display(), e);
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Conventional per-package configuration and state directories.
    fn purge_state_paths(&self, manifest: &Manifest) {
        let root = self.root_for(manifest);
        for rel in ["etc", "var/lib", "var/cache", "var/log"] {
            let dir = root.join(rel).join(&manifest.name);
            if dir.is_dir() {
                match fs::remove_dir_all(&dir) {
                    Ok(()) => info!("Purged {}", dir.display()),
                    Err(e) => warn!("Could not purge {}: {}", dir.display(), e),
                }
            }
        }
    }

    fn root_for(&self, manifest: &Manifest) -> PathBuf {
        if manifest.stage.is_bootstrap() {
            self.config.paths.lfs_root.clone()
        } else {
            PathBuf::from("/")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_db::{Depends, FileEntry, Stage};

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

    /// Installed manifest whose files live under the bootstrap root.
    fn install(config: &Config, store: &ManifestStore, name: &str, version: &str, deps: &[&str]) {
        let rel = format!("usr/bin/{name}");
        let on_disk = config.paths.lfs_root.join(&rel);
        fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        fs::write(&on_disk, name).unwrap();

        let manifest = Manifest {
            name: name.into(),
            version: version.into(),
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
        };
        store.add(&manifest, false).unwrap();
    }

    fn driver<'a>(config: &'a Config, store: &'a ManifestStore) -> RemoveDriver<'a> {
        RemoveDriver::new(config, store).with_protected(ProtectedSet::empty())
    }

    #[test]
    fn test_remove_deletes_files_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "gamma", "1.0", &[]);

        let summary = driver(&config, &store)
            .run(&["gamma".to_string()], &RemoveOptions::default())
            .unwrap();

        assert_eq!(summary.completed, vec!["gamma-1.0"]);
        assert_eq!(summary.exit_code(), 0);
        assert!(!config.paths.lfs_root.join("usr/bin/gamma").exists());
        assert!(matches!(
            store.query("gamma"),
            Err(ferrite_db::DbError::NotFound(_))
        ));

        // the manifest went to backup before deletion
        let backups = fs::read_dir(&config.paths.db_backup_dir).unwrap().count();
        assert!(backups >= 1);
    }

    #[test]
    fn test_protected_package_refuses_removal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::write(&config.paths.protected_set_path, "gamma\n").unwrap();
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "gamma", "1.0", &[]);

        let d = RemoveDriver::new(&config, &store);
        let err = d
            .remove_one("gamma", &RemoveOptions::default())
            .unwrap_err();
        assert!(matches!(err, RemoveError::Protected(_)));

        // store unchanged
        assert_eq!(store.query("gamma").unwrap().len(), 1);
        assert!(config.paths.lfs_root.join("usr/bin/gamma").exists());

        // force overrides
        let removed = d
            .remove_one(
                "gamma",
                &RemoveOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(removed[0].to_string(), "gamma-1.0");
    }

    #[test]
    fn test_revdep_guard() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "zlib", "1.3", &[]);
        install(&config, &store, "libpng", "1.6", &["zlib"]);

        let err = driver(&config, &store)
            .remove_one("zlib", &RemoveOptions::default())
            .unwrap_err();
        match err {
            RemoveError::RequiredBy { dependents, .. } => {
                assert_eq!(dependents, vec!["libpng"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ambiguous_name_needs_force_or_exact_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "alpha", "1.0", &[]);
        // second version shares no files to keep ownership unique
        let manifest = Manifest {
            name: "alpha".into(),
            version: "1.1".into(),
            stage: Stage::Pass1,
            origin: None,
            description: None,
            install_prefix: None,
            files: vec![FileEntry::Path("/usr/bin/alpha-1.1".into())],
            depends: Depends::default(),
            provides: Vec::new(),
            replaces: Vec::new(),
            build_date: None,
        };
        store.add(&manifest, false).unwrap();

        let d = driver(&config, &store);
        let err = d.remove_one("alpha", &RemoveOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            RemoveError::Db(ferrite_db::DbError::Ambiguous { .. })
        ));
        assert_eq!(store.query("alpha").unwrap().len(), 2);

        // exact id removes just that version
        d.remove_one("alpha-1.0", &RemoveOptions::default()).unwrap();
        let left = store.list(None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].version, "1.1");
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "gamma", "1.0", &[]);

        let summary = driver(&config, &store)
            .run(
                &["gamma".to_string()],
                &RemoveOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(summary.skipped, vec!["gamma-1.0"]);
        assert!(summary.completed.is_empty());
        assert_eq!(store.query("gamma").unwrap().len(), 1);
        assert!(config.paths.lfs_root.join("usr/bin/gamma").exists());
    }

    #[test]
    fn test_purge_removes_state_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);
        install(&config, &store, "gamma", "1.0", &[]);

        let conf_dir = config.paths.lfs_root.join("etc/gamma");
        fs::create_dir_all(&conf_dir).unwrap();
        fs::write(conf_dir.join("gamma.conf"), "setting=1").unwrap();

        driver(&config, &store)
            .run(
                &["gamma".to_string()],
                &RemoveOptions {
                    purge: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(!conf_dir.exists());
    }

    #[test]
    fn test_missing_package_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(&config.paths.db_dir, &config.paths.db_backup_dir, 5);

        let summary = driver(&config, &store)
            .run(&["ghost".to_string()], &RemoveOptions::default())
            .unwrap();
        assert_eq!(summary.failed, vec!["ghost"]);
        assert_eq!(summary.exit_code(), 2);
    }
}
