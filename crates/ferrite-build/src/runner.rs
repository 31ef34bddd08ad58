//! Checkpointed stage machine for one package
//!
//! Runs the pipeline stages in order, marking each in the package's
//! checkpoint as it completes. A failure leaves the checkpoint at the last
//! successful stage; re-running with `resume` starts from the first
//! incomplete one. Work directories are preserved on failure for forensics
//! and removed on success unless configured otherwise.

use crate::checkpoint::{BuildStep, Checkpoint};
use crate::commands::{run_commands, CommandContext};
use crate::extract::extract_all;
use crate::hooks::{HookPoint, HookRunner};
use crate::metafile::Metafile;
use crate::package::{create_package, deploy_package, package_file_name};
use crate::BuildError;
use chrono::Utc;
use ferrite_config::Config;
use ferrite_db::{sha256_file, FileEntry, Manifest, ManifestStore, Stage};
use ferrite_fetch::Fetcher;
use ferrite_snapshot::SnapshotStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Per-invocation knobs for one package install.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Start from the first incomplete checkpointed stage instead of fresh
    pub resume: bool,
    /// Re-download cached sources and rebuild over an installed version
    pub force: bool,
    /// Override the recipe's bootstrap stage
    pub stage_override: Option<Stage>,
}

/// Executes the build pipeline for single packages.
pub struct StageRunner<'a> {
    config: &'a Config,
    store: &'a ManifestStore,
    fetcher: Fetcher,
    hooks: HookRunner,
    snapshots: SnapshotStore,
    cancel: Arc<AtomicBool>,
}

impl<'a> StageRunner<'a> {
    pub fn new(config: &'a Config, store: &'a ManifestStore) -> Self {
        Self {
            config,
            store,
            fetcher: Fetcher::new(
                &config.paths.cache_sources_dir,
                config.build.retry,
                config.build.parallel,
            ),
            hooks: HookRunner::new(&config.paths.hooks_dir),
            snapshots: SnapshotStore::new(&config.paths.snapshot_dir),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag (set from the signal handler).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn hooks(&self) -> &HookRunner {
        &self.hooks
    }

    /// Root a stage deploys into.
    pub fn deploy_root(&self, stage: Stage) -> PathBuf {
        if stage.is_bootstrap() {
            self.config.paths.lfs_root.clone()
        } else {
            PathBuf::from("/")
        }
    }

    /// Run the full pipeline for one recipe. Returns the registered
    /// manifest on success.
    pub fn install(
        &self,
        metafile: &Metafile,
        metafile_path: &Path,
        opts: &InstallOptions,
    ) -> Result<Manifest, BuildError> {
        let id = metafile.id();
        let pkg = id.to_string();
        let stage = opts.stage_override.unwrap_or(metafile.stage);
        let state_dir = &self.config.paths.state_dir;

        let work = state_dir.join("work").join(&pkg);
        let src_dir = work.join("src");
        let destdir = work.join("destdir");
        let log_file = self
            .config
            .paths
            .log_dir
            .join("build")
            .join(format!("{pkg}.log"));

        let mut checkpoint = if opts.resume {
            let cp = Checkpoint::load(state_dir, &id);
            if let Some(next) = cp.first_incomplete() {
                info!("{pkg}: resuming at stage {next}");
            }
            cp
        } else {
            Checkpoint::clear(state_dir, &id)?;
            Checkpoint::new(&id)
        };

        self.hooks.run(HookPoint::PreInit, &pkg, metafile_path);

        // Synthesized once the staged tree exists, reused by later stages.
        let mut staged: Option<Manifest> = None;

        for step in BuildStep::ALL {
            if checkpoint.is_done(step) {
                debug!("{pkg}: stage {step} already complete");
                continue;
            }
            if self.cancel.load(Ordering::SeqCst) {
                warn!("{pkg}: interrupted before stage {step}");
                return Err(BuildError::Interrupted);
            }

            info!("{pkg}: stage {step}");
            match step {
                BuildStep::Downloaded => {
                    if !metafile.sources.is_empty() {
                        self.fetcher
                            .fetch_blocking(&pkg, &metafile.sources, opts.force)?;
                    }
                    self.hooks.run(HookPoint::PostDownload, &pkg, metafile_path);
                }
                BuildStep::Extracted => {
                    fs::create_dir_all(&src_dir)?;
                    let archives = metafile
                        .sources
                        .iter()
                        .map(|url| self.fetcher.cached_path(url))
                        .collect::<Result<Vec<_>, _>>()?;
                    extract_all(&archives, &src_dir)?;
                    self.hooks.run(HookPoint::PostExtract, &pkg, metafile_path);
                }
                BuildStep::Patched => {
                    let tree = build_tree(&src_dir, metafile);
                    self.apply_patches(metafile, metafile_path, &tree)?;
                    self.hooks.run(HookPoint::PostPatch, &pkg, metafile_path);
                }
                BuildStep::Built => {
                    let tree = build_tree(&src_dir, metafile);
                    run_commands(
                        &metafile.build_commands(),
                        &CommandContext {
                            cwd: &tree,
                            destdir: &destdir,
                            makejobs: self.config.build.parallel,
                            env: &metafile.environment,
                            log_file: &log_file,
                            fakeroot: false,
                            chroot: None,
                            retry: self.config.build.retry,
                        },
                    )?;
                    self.hooks.run(HookPoint::PostBuild, &pkg, metafile_path);
                }
                BuildStep::InstalledDestdir => {
                    fs::create_dir_all(&destdir)?;
                    let tree = build_tree(&src_dir, metafile);
                    run_commands(
                        &metafile.install_commands(),
                        &CommandContext {
                            cwd: &tree,
                            destdir: &destdir,
                            makejobs: self.config.build.parallel,
                            env: &metafile.environment,
                            log_file: &log_file,
                            fakeroot: true,
                            chroot: None,
                            retry: self.config.build.retry,
                        },
                    )?;
                    self.hooks.run(HookPoint::PostInstall, &pkg, metafile_path);
                }
                BuildStep::Packaged => {
                    create_package(&destdir, &self.config.paths.cache_packages_dir, &id)?;
                    self.hooks.run(HookPoint::PostPackage, &pkg, metafile_path);
                }
                BuildStep::Deployed => {
                    let manifest = self.synthesize(metafile, stage, &destdir)?;
                    self.store.check_file_conflicts(&manifest)?;
                    staged = Some(manifest);

                    let archive = self
                        .config
                        .paths
                        .cache_packages_dir
                        .join(package_file_name(&id));
                    deploy_package(&archive, &self.deploy_root(stage))?;
                    self.hooks.run(HookPoint::PostDeploy, &pkg, metafile_path);
                }
                BuildStep::Registered => {
                    let manifest = match staged.take() {
                        Some(m) => m,
                        None => self.synthesize(metafile, stage, &destdir)?,
                    };
                    self.store.add(&manifest, true)?;

                    let archive = self
                        .config
                        .paths
                        .cache_packages_dir
                        .join(package_file_name(&id));
                    self.snapshots.create(
                        &manifest,
                        Some(&archive),
                        &self.deploy_root(stage),
                    )?;

                    self.hooks.run(HookPoint::PostRegister, &pkg, metafile_path);
                    staged = Some(manifest);
                }
            }
            checkpoint.mark(step);
            checkpoint.save(state_dir, &id)?;
        }

        // Successful run: drop the checkpoint and clean the work area.
        Checkpoint::clear(state_dir, &id)?;
        self.hooks.run(HookPoint::PreCleanup, &pkg, metafile_path);
        if self.config.build.clean_after_build && work.exists() {
            fs::remove_dir_all(&work)?;
            debug!("{pkg}: work directory removed");
        }
        self.hooks.run(HookPoint::PostCleanup, &pkg, metafile_path);

        match staged {
            Some(manifest) => Ok(manifest),
            // Fully-checkpointed re-run: everything was already registered.
            None => Ok(self.store.query_one(&pkg)?),
        }
    }

    fn apply_patches(
        &self,
        metafile: &Metafile,
        metafile_path: &Path,
        tree: &Path,
    ) -> Result<(), BuildError> {
        let recipe_dir = metafile_path.parent().unwrap_or(Path::new("."));
        for patch in &metafile.patches {
            let patch_path = recipe_dir.join(patch);
            info!("Applying patch {}", patch_path.display());

            let output = Command::new("patch")
                .arg("-p1")
                .arg("-i")
                .arg(&patch_path)
                .current_dir(tree)
                .output()
                .map_err(|e| BuildError::PatchFailed(format!("{patch}: {e}")))?;

            if !output.status.success() {
                return Err(BuildError::PatchFailed(format!(
                    "{patch}: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }
        Ok(())
    }

    /// Build the manifest for the staged tree: every file under the
    /// destdir, hashed and sized, with install-absolute paths.
    fn synthesize(
        &self,
        metafile: &Metafile,
        stage: Stage,
        destdir: &Path,
    ) -> Result<Manifest, BuildError> {
        let mut files = Vec::new();

        for entry in WalkDir::new(destdir).into_iter().filter_map(Result::ok) {
            let file_type = entry.file_type();
            if !file_type.is_file() && !file_type.is_symlink() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(destdir) else {
                continue;
            };
            let install_path = format!("/{}", rel.display());

            let md = fs::symlink_metadata(entry.path())?;
            let sha256 = if file_type.is_file() {
                Some(sha256_file(entry.path())?)
            } else {
                None
            };
            files.push(FileEntry::Detailed {
                path: install_path,
                sha256,
                size: Some(md.len()),
                mode: Some(file_mode(&md)),
            });
        }
        files.sort_by(|a, b| a.path().cmp(b.path()));

        Ok(Manifest {
            name: metafile.name.clone(),
            version: metafile.version.clone(),
            stage,
            origin: metafile.origin.clone(),
            description: metafile.description.clone(),
            install_prefix: Some(metafile.prefix().to_string()),
            files,
            depends: metafile.depends.clone(),
            provides: metafile.provides.clone(),
            replaces: metafile.replaces.clone(),
            build_date: Some(Utc::now().to_rfc3339()),
        })
    }
}

/// The directory recipe commands run in: an explicit `build_dir` when the
/// recipe names one, else the single extracted top-level directory, else
/// the work source directory itself.
fn build_tree(src_dir: &Path, metafile: &Metafile) -> PathBuf {
    if let Some(sub) = &metafile.build_dir {
        return src_dir.join(sub);
    }

    let entries: Vec<PathBuf> = fs::read_dir(src_dir)
        .map(|rd| rd.filter_map(Result::ok).map(|e| e.path()).collect())
        .unwrap_or_default();

    match entries.as_slice() {
        [single] if single.is_dir() => single.clone(),
        _ => src_dir.to_path_buf(),
    }
}

#[cfg(unix)]
fn file_mode(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_md: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_db::PackageId;
    use std::io::Write;

    /// Config with every path under one temp dir; packages deploy into
    /// `lfs_root` by using the pass1 stage.
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
        config.build.retry = 1;
        config
    }

    fn write_source_tarball(dir: &Path) -> String {
        let payload = dir.join("tar-payload");
        fs::create_dir_all(payload.join("alpha-1.0")).unwrap();
        let mut f = fs::File::create(payload.join("alpha-1.0/hello.sh")).unwrap();
        writeln!(f, "#!/bin/sh\necho hello").unwrap();

        let archive = dir.join("alpha-1.0.tar.gz");
        let file = fs::File::create(&archive).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all("alpha-1.0", payload.join("alpha-1.0"))
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        format!("file://{}", archive.display())
    }

    fn recipe(source_url: &str) -> Metafile {
        Metafile {
            name: "alpha".into(),
            version: "1.0".into(),
            stage: Stage::Pass1,
            sources: vec![source_url.to_string()],
            patches: Vec::new(),
            commands: crate::Commands {
                configure: Some(vec!["true".into()]),
                build: Some(vec!["test -f hello.sh".into()]),
                install: Some(vec![
                    "mkdir -p @DESTDIR@/usr/bin".into(),
                    "cp hello.sh @DESTDIR@/usr/bin/alpha".into(),
                ]),
            },
            depends: Default::default(),
            provides: Vec::new(),
            install_prefix: None,
            build_dir: None,
            environment: Default::default(),
            origin: Some("ports/alpha".into()),
            description: Some("test package".into()),
            replaces: Vec::new(),
        }
    }

    #[test]
    fn test_full_pipeline_installs_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(
            &config.paths.db_dir,
            &config.paths.db_backup_dir,
            5,
        );

        let url = write_source_tarball(dir.path());
        let metafile = recipe(&url);
        let metafile_path = dir.path().join("metafile.yml");
        fs::write(&metafile_path, "name: alpha\nversion: \"1.0\"\n").unwrap();

        let runner = StageRunner::new(&config, &store);
        let manifest = runner
            .install(&metafile, &metafile_path, &InstallOptions::default())
            .unwrap();

        // deployed into the bootstrap root
        assert!(config.paths.lfs_root.join("usr/bin/alpha").exists());

        // registered with hashed file entries
        assert_eq!(manifest.id().to_string(), "alpha-1.0");
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path(), "/usr/bin/alpha");
        assert!(manifest.files[0].sha256().is_some());
        assert!(manifest.build_date.is_some());
        assert_eq!(store.query("alpha").unwrap().len(), 1);

        // package archive and rollback snapshot exist
        let archive = config
            .paths
            .cache_packages_dir
            .join(package_file_name(&PackageId::new("alpha", "1.0")));
        assert!(archive.exists());
        assert!(fs::read_dir(&config.paths.snapshot_dir).unwrap().count() >= 1);

        // checkpoint cleared, work dir cleaned
        assert!(!Checkpoint::path(&config.paths.state_dir, &metafile.id()).exists());
        assert!(!config.paths.state_dir.join("work/alpha-1.0").exists());
    }

    #[test]
    fn test_failure_checkpoints_then_resume_skips_done_stages() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(
            &config.paths.db_dir,
            &config.paths.db_backup_dir,
            5,
        );

        let url = write_source_tarball(dir.path());
        let mut broken = recipe(&url);
        broken.commands.build = Some(vec!["exit 1".into()]);
        let metafile_path = dir.path().join("metafile.yml");
        fs::write(&metafile_path, "name: alpha\nversion: \"1.0\"\n").unwrap();

        let runner = StageRunner::new(&config, &store);
        let err = runner
            .install(&broken, &metafile_path, &InstallOptions::default())
            .unwrap_err();
        assert!(matches!(err, BuildError::CommandFailed { .. }));

        // checkpoint sits at the last successful stage
        let cp = Checkpoint::load(&config.paths.state_dir, &broken.id());
        assert!(cp.is_done(BuildStep::Downloaded));
        assert!(cp.is_done(BuildStep::Extracted));
        assert!(cp.is_done(BuildStep::Patched));
        assert_eq!(cp.first_incomplete(), Some(BuildStep::Built));

        // work dir preserved for forensics
        assert!(config.paths.state_dir.join("work/alpha-1.0").exists());

        // delete the source so a re-download would fail loudly, then
        // resume with a fixed recipe: earlier stages must not repeat
        fs::remove_file(dir.path().join("alpha-1.0.tar.gz")).unwrap();
        let fixed = recipe(&url);
        let manifest = runner
            .install(
                &fixed,
                &metafile_path,
                &InstallOptions {
                    resume: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(manifest.version, "1.0");
        assert!(config.paths.lfs_root.join("usr/bin/alpha").exists());
    }

    #[test]
    fn test_cancel_flag_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(
            &config.paths.db_dir,
            &config.paths.db_backup_dir,
            5,
        );

        let cancel = Arc::new(AtomicBool::new(true));
        let runner = StageRunner::new(&config, &store).with_cancel(cancel);

        let url = write_source_tarball(dir.path());
        let metafile = recipe(&url);
        let metafile_path = dir.path().join("metafile.yml");
        fs::write(&metafile_path, "name: alpha\nversion: \"1.0\"\n").unwrap();

        let err = runner
            .install(&metafile, &metafile_path, &InstallOptions::default())
            .unwrap_err();
        assert!(matches!(err, BuildError::Interrupted));
    }

    #[test]
    fn test_file_conflict_detected_before_deploy() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ManifestStore::new(
            &config.paths.db_dir,
            &config.paths.db_backup_dir,
            5,
        );

        // another package already owns /usr/bin/alpha
        let owner = Manifest {
            name: "other".into(),
            version: "9".into(),
            stage: Stage::Normal,
            origin: None,
            description: None,
            install_prefix: None,
            files: vec![FileEntry::Path("/usr/bin/alpha".into())],
            depends: Default::default(),
            provides: Vec::new(),
            replaces: Vec::new(),
            build_date: None,
        };
        store.add(&owner, false).unwrap();

        let url = write_source_tarball(dir.path());
        let metafile = recipe(&url);
        let metafile_path = dir.path().join("metafile.yml");
        fs::write(&metafile_path, "name: alpha\nversion: \"1.0\"\n").unwrap();

        let runner = StageRunner::new(&config, &store);
        let err = runner
            .install(&metafile, &metafile_path, &InstallOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Db(ferrite_db::DbError::FileConflict { .. })
        ));
        // nothing deployed
        assert!(!config.paths.lfs_root.join("usr/bin/alpha").exists());
    }

    #[test]
    fn test_build_tree_single_dir_convention() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("pkg-1.0")).unwrap();

        let metafile = recipe("file:///unused");
        assert_eq!(build_tree(&src, &metafile), src.join("pkg-1.0"));

        // two entries: stay at the top
        fs::create_dir_all(src.join("second")).unwrap();
        assert_eq!(build_tree(&src, &metafile), src);

        // explicit build_dir wins
        let mut with_dir = recipe("file:///unused");
        with_dir.build_dir = Some("pkg-1.0/sub".into());
        assert_eq!(build_tree(&src, &with_dir), src.join("pkg-1.0/sub"));
    }
}
