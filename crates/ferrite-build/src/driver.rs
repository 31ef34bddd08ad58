//! Batch install driver
//!
//! Resolves the dependency closure of the requested targets against the
//! ports tree and the installed set, asks the graph engine for a build
//! order, then runs the pipeline per package, serially. Chroot mounts are
//! established once per run when any package in the order is a bootstrap
//! stage, and torn down on every exit path.

use crate::metafile::Metafile;
use crate::runner::{InstallOptions, StageRunner};
use crate::BuildError;
use ferrite_chroot::ChrootEnv;
use ferrite_config::Config;
use ferrite_db::{dep_name, ManifestStore, Stage};
use ferrite_graph::DepGraph;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// End-of-run accounting. Exit code is non-zero iff `failed` is non-empty.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl RunSummary {
    /// 0 on full success, 2 when any package failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() { 0 } else { 2 }
    }

    pub fn log(&self, action: &str) {
        info!(
            "{action} summary: {} completed, {} skipped, {} failed",
            self.completed.len(),
            self.skipped.len(),
            self.failed.len()
        );
        for name in &self.failed {
            warn!("{action} failed: {name}");
        }
    }
}

/// Batch-level install knobs (the per-package ones live in
/// [`InstallOptions`]).
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub resume: bool,
    pub dry_run: bool,
    pub force: bool,
    pub stage_override: Option<Stage>,
}

/// Drives `order -> build` for a set of targets.
pub struct InstallDriver<'a> {
    config: &'a Config,
    store: &'a ManifestStore,
    cancel: Arc<AtomicBool>,
}

impl<'a> InstallDriver<'a> {
    pub fn new(config: &'a Config, store: &'a ManifestStore) -> Self {
        Self {
            config,
            store,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Install `targets` and whatever they pull in.
    pub fn run(&self, targets: &[String], opts: &BatchOptions) -> Result<RunSummary, BuildError> {
        let index = self.store.index()?;

        // Names satisfied by the installed set, directly or via provides.
        let mut installed: HashSet<String> = HashSet::new();
        for entry in &index {
            installed.insert(entry.name.clone());
            for p in &entry.provides {
                installed.insert(dep_name(p).to_string());
            }
        }

        let mut graph = DepGraph::from_index(&index);
        let recipes = self.resolve_closure(targets, &installed, &mut graph)?;

        let order = graph.order(targets, Some(&installed))?;
        info!("Install order: {}", order.join(", "));

        let mut summary = RunSummary::default();

        if opts.dry_run {
            for name in &order {
                info!("dry-run: would install {name}");
                summary.skipped.push(name.clone());
            }
            return Ok(summary);
        }

        // Bootstrap packages want the virtual filesystems bound into the
        // staging root for the whole run.
        let needs_chroot = order.iter().any(|name| {
            recipes.get(name).is_some_and(|(m, _)| {
                opts.stage_override.unwrap_or(m.stage).is_bootstrap()
            })
        });
        let mut chroot = ChrootEnv::new(&self.config.paths.lfs_root);
        if needs_chroot {
            if let Err(e) = chroot.mount() {
                warn!("Chroot mounts unavailable ({e}), continuing without");
            }
        }

        let runner = StageRunner::new(self.config, self.store).with_cancel(self.cancel.clone());

        for name in &order {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Interrupted, not scheduling {name}");
                summary.skipped.push(name.clone());
                continue;
            }

            let Some((metafile, path)) = recipes.get(name) else {
                // satisfied by an installed package, nothing to do
                summary.skipped.push(name.clone());
                continue;
            };

            let same_version_installed = self
                .store
                .installed_versions(&metafile.name)?
                .iter()
                .any(|v| v == &metafile.version);
            if same_version_installed && !opts.force {
                info!("{name} {} already installed, skipping", metafile.version);
                summary.skipped.push(name.clone());
                continue;
            }

            let install_opts = InstallOptions {
                resume: opts.resume,
                force: opts.force,
                stage_override: opts.stage_override,
            };
            match runner.install(metafile, path, &install_opts) {
                Ok(manifest) => {
                    summary.completed.push(manifest.id().to_string());
                    if chroot.is_active() {
                        let _ = chroot.clean_between();
                    }
                }
                Err(e) => {
                    warn!("Install of {name} failed: {e}");
                    summary.failed.push(name.clone());
                    if !self.config.build.continue_on_error {
                        break;
                    }
                }
            }
        }

        if chroot.is_active() {
            let _ = chroot.unmount();
        }

        if !summary.completed.is_empty() {
            if let Err(e) = ferrite_graph::sync(self.store, &self.config.paths.state_dir) {
                warn!("Graph sync failed: {e}");
            }
        }

        summary.log("install");
        Ok(summary)
    }

    /// Load recipes for the targets and every uninstalled dependency,
    /// extending the graph as nodes are discovered.
    fn resolve_closure(
        &self,
        targets: &[String],
        installed: &HashSet<String>,
        graph: &mut DepGraph,
    ) -> Result<BTreeMap<String, (Metafile, PathBuf)>, BuildError> {
        let ports_dir = &self.config.paths.ports_dir;
        let mut recipes: BTreeMap<String, (Metafile, PathBuf)> = BTreeMap::new();
        let mut queue: VecDeque<String> = targets.iter().cloned().collect();

        while let Some(name) = queue.pop_front() {
            if recipes.contains_key(&name) {
                continue;
            }
            // dependencies satisfied by the installed set need no recipe;
            // explicit targets always get one
            if !targets.contains(&name) && installed.contains(&name) {
                continue;
            }

            let (metafile, path) = Metafile::load_from_ports(ports_dir, &name)?;

            graph.add_package(&metafile.name, &metafile.depends, &metafile.provides);
            for token in metafile.depends.all() {
                let dep = dep_name(token).to_string();
                if !installed.contains(&dep) && !recipes.contains_key(&dep) {
                    queue.push_back(dep);
                }
            }
            recipes.insert(name, (metafile, path));
        }
        Ok(recipes)
    }
}
