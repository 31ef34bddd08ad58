//! ferrite - source-based package manager
//!
//! Builds packages from metafiles in the ports tree, installs them into
//! the host or an LFS staging root, and keeps the manifest database, the
//! dependency graph, and the installed files consistent.
//!
//! Exit codes: 0 success, 1 usage or operational error, 2 one or more
//! packages failed, 3 lock held or privileges missing, 4 corrupt data.

mod lock;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ferrite_build::{BatchOptions, InstallDriver, RunSummary};
use ferrite_config::Config;
use ferrite_db::{Manifest, ManifestStore, Stage};
use ferrite_remove::{
    DepcleanDriver, DepcleanMode, DepcleanOptions, RemoveDriver, RemoveOptions,
};
use ferrite_upgrade::{UpgradeDriver, UpgradeOptions};
use lock::{DriverLock, LockError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{error, info, warn};

/// Set by the signal handler; drivers drain the in-flight stage and stop
/// scheduling new packages.
static CANCEL: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(
    name = "ferrite",
    version,
    about = "Source-based package manager for LFS-style systems"
)]
struct Cli {
    /// Configuration file (default: $FERRITE_CONFIG, then /etc/ferrite/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build and install packages with their dependencies
    Install {
        packages: Vec<String>,
        /// Resume from per-package checkpoints
        #[arg(long)]
        resume: bool,
        /// Show the resolved order without building
        #[arg(long)]
        dry_run: bool,
        /// Concurrent downloads and make jobs
        #[arg(long)]
        parallel: Option<usize>,
        /// Retry budget for downloads and commands
        #[arg(long)]
        retry: Option<u32>,
        /// Rebuild over an installed version
        #[arg(long)]
        force: bool,
        /// Override the recipe stage (pass1, pass2, normal)
        #[arg(long)]
        stage: Option<String>,
    },

    /// Uninstall packages
    Remove {
        packages: Vec<String>,
        /// Run the post-removal depclean in auto mode
        #[arg(long)]
        auto: bool,
        /// Override protected/revdep/ambiguity guards
        #[arg(long)]
        force: bool,
        /// Also remove conventional config/state paths
        #[arg(long)]
        purge: bool,
        #[arg(long)]
        dry_run: bool,
        /// Resume an interrupted removal batch
        #[arg(long)]
        resume: bool,
        /// Skip the post-removal depclean pass
        #[arg(long)]
        no_depclean: bool,
        /// Skip the post-removal graph sync
        #[arg(long)]
        no_sync: bool,
    },

    /// Move packages to the versions in the ports tree
    Upgrade {
        packages: Vec<String>,
        /// Upgrade every installed package that has a recipe
        #[arg(long)]
        all: bool,
        /// Resume a failed batch, failed package first
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        dry_run: bool,
        /// Upgrade even when versions match
        #[arg(long)]
        force: bool,
        /// Prune orphaned files without confirmation
        #[arg(long)]
        auto: bool,
        /// Restore each target from its latest snapshot instead
        #[arg(long)]
        rollback: bool,
        /// Suppress the end-of-run ports commit
        #[arg(long)]
        no_commit: bool,
        #[arg(long)]
        stage: Option<String>,
    },

    /// Find and remove orphaned packages
    Depclean {
        /// Remove orphans without confirmation
        #[arg(long)]
        auto: bool,
        /// Confirm each orphan on the terminal
        #[arg(long)]
        interactive: bool,
        /// Report only (the default)
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        /// Verify candidate files on disk first
        #[arg(long)]
        verify: bool,
        /// Drop the persistent graph cache first
        #[arg(long)]
        purge_cache: bool,
        /// Commit the ports tree after removals
        #[arg(long)]
        auto_commit: bool,
    },

    /// Manifest database operations
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Subcommand)]
enum DbCommand {
    /// Create the database directories and an empty index
    Init,
    /// Register a manifest from a JSON file
    Add {
        file: PathBuf,
        #[arg(long)]
        replace: bool,
    },
    /// Move matching manifests to the backup area
    Remove {
        query: String,
        #[arg(long)]
        force: bool,
    },
    /// Show manifests matching a name or name-version
    Query {
        query: String,
        /// List owned files only
        #[arg(long)]
        files: bool,
        /// Print raw manifest JSON
        #[arg(long)]
        raw: bool,
    },
    /// List installed packages
    List {
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        json: bool,
        /// Print the number of entries only
        #[arg(long)]
        count: bool,
    },
    /// Packages depending on (or providing) a name
    Revdeps { name: String },
    /// Packages owning a file path
    Provides { path: String },
    /// Archive the database directory
    Backup,
    /// Swap in a previously created archive
    Restore { file: PathBuf },
    /// Rebuild the index from the manifest files
    Reindex,
    /// Check listed files against the filesystem
    Verify { query: String },
    /// Installed packages nothing depends on
    Orphans,
    /// Substring search over name, description, origin
    Search { term: String },
    /// On-disk size of a package's files
    Size { query: String },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap prints its own message; usage problems exit 1
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            classify_error(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load_default()?,
    };

    if let Err(e) = config.ensure_dirs() {
        warn!("Could not create state directories: {e}");
    }

    setup_logging(&config, log_name(&cli.command));
    setup_signal_handlers()?;

    let store = ManifestStore::new(
        &config.paths.db_dir,
        &config.paths.db_backup_dir,
        config.maintenance.db_backup_keep,
    );

    match cli.command {
        Command::Install {
            packages,
            resume,
            dry_run,
            parallel,
            retry,
            force,
            stage,
        } => {
            if packages.is_empty() {
                anyhow::bail!("install requires at least one package");
            }
            let mut config = config;
            if let Some(parallel) = parallel {
                config.build.parallel = parallel.max(1);
            }
            if let Some(retry) = retry {
                config.build.retry = retry;
            }
            let stage_override = parse_stage(stage.as_deref())?;

            let _lock = DriverLock::acquire(&config.lock_path())?;
            let driver = InstallDriver::new(&config, &store).with_cancel(CANCEL.clone());
            let summary = driver.run(
                &packages,
                &BatchOptions {
                    resume,
                    dry_run,
                    force,
                    stage_override,
                },
            )?;
            print_summary("install", &summary);
            Ok(summary.exit_code())
        }

        Command::Remove {
            packages,
            auto,
            force,
            purge,
            dry_run,
            resume,
            no_depclean,
            no_sync,
        } => {
            if packages.is_empty() && !resume {
                anyhow::bail!("remove requires at least one package");
            }
            let _lock = DriverLock::acquire(&config.lock_path())?;
            let driver = RemoveDriver::new(&config, &store).with_cancel(CANCEL.clone());
            let summary = driver.run(
                &packages,
                &RemoveOptions {
                    resume,
                    auto,
                    force,
                    purge,
                    dry_run,
                    no_depclean,
                    no_sync,
                },
            )?;
            print_summary("remove", &summary);
            Ok(summary.exit_code())
        }

        Command::Upgrade {
            packages,
            all,
            resume,
            dry_run,
            force,
            auto,
            rollback,
            no_commit,
            stage,
        } => {
            let stage_override = parse_stage(stage.as_deref())?;
            let _lock = DriverLock::acquire(&config.lock_path())?;
            let driver = UpgradeDriver::new(&config, &store).with_cancel(CANCEL.clone());

            let targets = if all {
                driver.all_targets()?
            } else if packages.is_empty() && !resume {
                anyhow::bail!("upgrade requires package names, --all, or --resume");
            } else {
                packages
            };

            let summary = if rollback {
                driver.rollback(&targets)?
            } else {
                driver.run(
                    &targets,
                    &UpgradeOptions {
                        resume,
                        dry_run,
                        force,
                        auto,
                        no_commit,
                        stage_override,
                    },
                )?
            };
            print_summary(if rollback { "rollback" } else { "upgrade" }, &summary);
            Ok(summary.exit_code())
        }

        Command::Depclean {
            auto,
            interactive,
            // --dry-run is the default mode; the flag exists to spell it out
            dry_run: _,
            force,
            verify,
            purge_cache,
            auto_commit,
        } => {
            if auto && interactive {
                anyhow::bail!("--auto and --interactive are mutually exclusive");
            }
            let mode = if auto {
                DepcleanMode::Auto
            } else if interactive {
                DepcleanMode::Interactive
            } else {
                DepcleanMode::DryRun
            };

            let _lock = DriverLock::acquire(&config.lock_path())?;
            let driver = DepcleanDriver::new(&config, &store).with_cancel(CANCEL.clone());
            let summary = driver.run(&DepcleanOptions {
                mode,
                force,
                verify,
                purge_cache,
                auto_commit,
            })?;
            print_summary("depclean", &summary);
            Ok(summary.exit_code())
        }

        Command::Db(db) => run_db(&config, &store, db),
    }
}

fn run_db(config: &Config, store: &ManifestStore, command: DbCommand) -> anyhow::Result<i32> {
    match command {
        DbCommand::Init => {
            store.init()?;
            info!("Database initialized at {}", store.db_dir().display());
        }
        DbCommand::Add { file, replace } => {
            let _lock = DriverLock::acquire(&config.lock_path())?;
            let manifest = Manifest::load(&file)?;
            store.add(&manifest, replace)?;
            println!("added {}", manifest.id());
        }
        DbCommand::Remove { query, force } => {
            let _lock = DriverLock::acquire(&config.lock_path())?;
            for id in store.remove(&query, force)? {
                println!("removed {id}");
            }
        }
        DbCommand::Query { query, files, raw } => {
            for manifest in store.query(&query)? {
                if raw {
                    println!("{}", serde_json::to_string_pretty(&manifest)?);
                } else if files {
                    for path in manifest.file_paths() {
                        println!("{path}");
                    }
                } else {
                    println!(
                        "{} {} stage={} files={} origin={}",
                        manifest.name,
                        manifest.version,
                        manifest.stage,
                        manifest.files.len(),
                        manifest.origin.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        DbCommand::List { stage, json, count } => {
            let stage = parse_stage(stage.as_deref())?;
            let entries = store.list(stage)?;
            if count {
                println!("{}", entries.len());
            } else if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!("{} {} [{}]", entry.name, entry.version, entry.stage);
                }
            }
        }
        DbCommand::Revdeps { name } => {
            for id in store.revdeps(&name)? {
                println!("{id}");
            }
        }
        DbCommand::Provides { path } => {
            for id in store.provides(&path)? {
                println!("{id}");
            }
        }
        DbCommand::Backup => {
            let _lock = DriverLock::acquire(&config.lock_path())?;
            let archive = store.backup()?;
            println!("{}", archive.display());
        }
        DbCommand::Restore { file } => {
            let _lock = DriverLock::acquire(&config.lock_path())?;
            store.restore(&file)?;
            println!("restored from {}", file.display());
        }
        DbCommand::Reindex => {
            let _lock = DriverLock::acquire(&config.lock_path())?;
            let entries = store.reindex()?;
            println!("indexed {} manifests", entries.len());
        }
        DbCommand::Verify { query } => {
            let mut dirty = false;
            for report in store.verify(&query)? {
                if report.is_clean() {
                    println!("{}: ok ({} files)", report.id, report.checked);
                } else {
                    dirty = true;
                    for path in &report.missing {
                        println!("{}: missing {path}", report.id);
                    }
                    for path in &report.mismatched {
                        println!("{}: checksum mismatch {path}", report.id);
                    }
                }
            }
            if dirty {
                return Ok(2);
            }
        }
        DbCommand::Orphans => {
            for id in store.orphans()? {
                println!("{id}");
            }
        }
        DbCommand::Search { term } => {
            for entry in store.search(&term)? {
                println!("{} {}", entry.name, entry.version);
            }
        }
        DbCommand::Size { query } => {
            println!("{}", store.size(&query)?);
        }
    }
    Ok(0)
}

fn parse_stage(stage: Option<&str>) -> anyhow::Result<Option<Stage>> {
    match stage {
        None => Ok(None),
        Some(s) => s
            .parse::<Stage>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!(e)),
    }
}

fn print_summary(action: &str, summary: &RunSummary) {
    println!(
        "{action}: {} completed, {} skipped, {} failed",
        summary.completed.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    for name in &summary.failed {
        println!("  failed: {name}");
    }
}

fn log_name(command: &Command) -> &'static str {
    match command {
        Command::Upgrade { .. } => "upgrade",
        Command::Remove { .. } => "remove",
        Command::Depclean { .. } => "depclean",
        _ => "core",
    }
}

/// Log to stderr and to the per-command file under the log directory.
fn setup_logging(config: &Config, name: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.paths.log_dir.join(format!("{name}.log")))
        .ok();

    match file {
        Some(file) => {
            let file_layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
    }
}

/// Forward INT/TERM into the shared cancellation flag; drivers stop
/// scheduling, tear down chroot mounts, and persist their checkpoints.
fn setup_signal_handlers() -> anyhow::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    // touch the flag so the LazyLock initializes before any signal
    CANCEL.store(false, Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

extern "C" fn handle_signal(_sig: i32) {
    CANCEL.store(true, Ordering::SeqCst);
}

/// Map error kinds onto the documented exit codes.
fn classify_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(lock) = cause.downcast_ref::<LockError>() {
            if matches!(lock, LockError::Held(_)) {
                return 3;
            }
        }
        if let Some(db) = cause.downcast_ref::<ferrite_db::DbError>() {
            if matches!(
                db,
                ferrite_db::DbError::Malformed { .. } | ferrite_db::DbError::Json(_)
            ) {
                return 4;
            }
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::PermissionDenied {
                return 3;
            }
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_declaration_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stage() {
        assert_eq!(parse_stage(None).unwrap(), None);
        assert_eq!(parse_stage(Some("pass1")).unwrap(), Some(Stage::Pass1));
        assert!(parse_stage(Some("bogus")).is_err());
    }

    #[test]
    fn test_install_flags_parse() {
        let cli = Cli::try_parse_from([
            "ferrite", "install", "zlib", "openssl", "--resume", "--parallel", "8", "--stage",
            "pass1",
        ])
        .unwrap();
        match cli.command {
            Command::Install {
                packages,
                resume,
                parallel,
                stage,
                ..
            } => {
                assert_eq!(packages, vec!["zlib", "openssl"]);
                assert!(resume);
                assert_eq!(parallel, Some(8));
                assert_eq!(stage.as_deref(), Some("pass1"));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_db_subcommands_parse() {
        let cli = Cli::try_parse_from(["ferrite", "db", "query", "zlib", "--files"]).unwrap();
        match cli.command {
            Command::Db(DbCommand::Query { query, files, raw }) => {
                assert_eq!(query, "zlib");
                assert!(files);
                assert!(!raw);
            }
            _ => panic!("wrong command"),
        }

        let cli = Cli::try_parse_from(["ferrite", "db", "list", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Db(DbCommand::List { json: true, .. })
        ));
    }

    #[test]
    fn test_upgrade_all_and_rollback_parse() {
        let cli =
            Cli::try_parse_from(["ferrite", "upgrade", "--all", "--auto", "--no-commit"]).unwrap();
        match cli.command {
            Command::Upgrade {
                all,
                auto,
                no_commit,
                rollback,
                ..
            } => {
                assert!(all && auto && no_commit);
                assert!(!rollback);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_classify_lock_held_is_3() {
        let err = anyhow::Error::new(LockError::Held("/run/lock".into()));
        assert_eq!(classify_error(&err), 3);
    }

    #[test]
    fn test_classify_malformed_is_4() {
        let err = anyhow::Error::new(ferrite_db::DbError::Malformed {
            path: "index.json".into(),
            reason: "bad".into(),
        });
        assert_eq!(classify_error(&err), 4);
    }

    #[test]
    fn test_classify_default_is_1() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(classify_error(&err), 1);
    }
}
