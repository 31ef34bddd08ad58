//! Configuration management for ferrite
//!
//! A single [`Config`] value carries every tunable the drivers consume:
//! directory layout, fetch parallelism and retries, snapshot retention,
//! protected packages. It is loaded once at startup and passed explicitly;
//! there is no process-wide mutable state.

mod protected;

pub use protected::ProtectedSet;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Standard configuration locations
pub const CONFIG_DIR: &str = "/etc/ferrite";
pub const CONFIG_ENV: &str = "FERRITE_CONFIG";

/// Directory layout for every piece of persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Manifest database (one JSON file per installed package plus the index)
    pub db_dir: PathBuf,
    /// Timestamped copies of replaced/removed manifests
    pub db_backup_dir: PathBuf,
    /// Run and per-package build logs
    pub log_dir: PathBuf,
    /// Stage hook executables, one subdirectory per hook point
    pub hooks_dir: PathBuf,
    /// Pre-upgrade snapshots
    pub snapshot_dir: PathBuf,
    /// Checkpoints, driver state files, graph cache, lock file
    pub state_dir: PathBuf,
    /// Downloaded source archives, keyed by URL basename
    pub cache_sources_dir: PathBuf,
    /// Built package archives
    pub cache_packages_dir: PathBuf,
    /// Ports tree holding one recipe directory per package
    pub ports_dir: PathBuf,
    /// Staging root deployed into by pass1/pass2 builds
    pub lfs_root: PathBuf,
    /// Allow-list of packages that refuse removal without --force
    pub protected_set_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("/var/lib/ferrite/db"),
            db_backup_dir: PathBuf::from("/var/lib/ferrite/db-backup"),
            log_dir: PathBuf::from("/var/log/ferrite"),
            hooks_dir: PathBuf::from("/etc/ferrite/hooks"),
            snapshot_dir: PathBuf::from("/var/lib/ferrite/snapshots"),
            state_dir: PathBuf::from("/var/lib/ferrite/state"),
            cache_sources_dir: PathBuf::from("/var/cache/ferrite/sources"),
            cache_packages_dir: PathBuf::from("/var/cache/ferrite/packages"),
            ports_dir: PathBuf::from("/usr/ports"),
            lfs_root: PathBuf::from("/mnt/lfs"),
            protected_set_path: PathBuf::from("/etc/ferrite/protected"),
        }
    }
}

/// Build and fetch behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Concurrent source downloads per package
    pub parallel: usize,
    /// Retry budget for downloads and recipe commands
    pub retry: u32,
    /// Remove per-package work directories after a successful install
    pub clean_after_build: bool,
    /// Abort the whole batch on the first package failure
    pub continue_on_error: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallel: 4,
            retry: 3,
            clean_after_build: true,
            continue_on_error: false,
        }
    }
}

/// Retention and housekeeping knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Snapshots older than this many days are pruned
    pub keep_snapshots_days: u64,
    /// Number of manifest-db backup archives kept by rotation
    pub db_backup_keep: usize,
    /// Commit the ports tree at the end of upgrade/depclean runs
    pub auto_commit: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            keep_snapshots_days: 30,
            db_backup_keep: 10,
            auto_commit: false,
        }
    }
}

/// Main ferrite configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations.
    ///
    /// Precedence: `FERRITE_CONFIG` environment variable, then
    /// `/etc/ferrite/config.toml`, then compiled-in defaults.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&env_path));
        }

        let system_config = Path::new(CONFIG_DIR).join("config.toml");
        if system_config.exists() {
            return Self::load(&system_config);
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        tracing::info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Create every directory the drivers write into.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            &self.paths.db_dir,
            &self.paths.db_backup_dir,
            &self.paths.log_dir,
            &self.paths.snapshot_dir,
            &self.paths.state_dir,
            &self.paths.cache_sources_dir,
            &self.paths.cache_packages_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Load the protected set named by `protected_set_path`.
    pub fn protected_set(&self) -> ProtectedSet {
        ProtectedSet::load(&self.paths.protected_set_path)
    }

    /// Path of the process-wide driver lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.paths.state_dir.join("ferrite.lock")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.build.parallel == 0 {
            return Err(ConfigError::Invalid(
                "build.parallel must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
