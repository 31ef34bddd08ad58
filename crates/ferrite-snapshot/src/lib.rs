//! Point-in-time package snapshots
//!
//! A snapshot is a directory `name-version-TIMESTAMP/` holding the best
//! available capture of an installed package:
//!
//! - `package.tar.zst`: the package archive (copied from the binary cache
//!   when present, else a fresh tar of the files the manifest owns)
//! - `manifest.json`: copy of the live manifest
//! - `metadata.json`: `{package, version, timestamp}`
//! - `sha256.sum`: checksum line over the archive
//!
//! When neither archive source is available the snapshot degrades to a
//! manifest-only capture, which still allows re-registration. The upgrade
//! driver creates one snapshot before any destructive action and restores
//! it on failure.

use chrono::Utc;
use ferrite_db::{sha256_file, Manifest, ManifestStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ARCHIVE_NAME: &str = "package.tar.zst";
pub const MANIFEST_NAME: &str = "manifest.json";
pub const METADATA_NAME: &str = "metadata.json";
pub const CHECKSUM_NAME: &str = "sha256.sum";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Corrupt snapshot {0}: {1}")]
    Corrupt(PathBuf, String),

    #[error("Database error: {0}")]
    Db(#[from] ferrite_db::DbError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub package: String,
    pub version: String,
    pub timestamp: String,
}

/// Directory of snapshots with a stable per-snapshot layout.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture the installed state of a package.
    ///
    /// Archive source preference: the prebuilt package archive when the
    /// caller has one, else a tar of the manifest's file list read from
    /// `root`, else manifest-only. Returns the snapshot directory.
    pub fn create(
        &self,
        manifest: &Manifest,
        package_archive: Option<&Path>,
        root: &Path,
    ) -> Result<PathBuf, SnapshotError> {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let snapdir = self
            .dir
            .join(format!("{}-{}", manifest.id(), timestamp));
        fs::create_dir_all(&snapdir)?;

        let archive = snapdir.join(ARCHIVE_NAME);
        let mut have_archive = false;

        match package_archive {
            Some(cached) if cached.exists() => {
                fs::copy(cached, &archive)?;
                have_archive = true;
                debug!("Snapshot archive copied from {}", cached.display());
            }
            _ => {
                let packed = self.pack_files(manifest, root, &archive)?;
                if packed > 0 {
                    have_archive = true;
                    debug!("Snapshot archive packed from {} live files", packed);
                } else {
                    let _ = fs::remove_file(&archive);
                    warn!(
                        "No archive source for {}, manifest-only snapshot",
                        manifest.id()
                    );
                }
            }
        }

        let manifest_json = serde_json::to_string_pretty(manifest)?;
        fs::write(snapdir.join(MANIFEST_NAME), manifest_json)?;

        let metadata = SnapshotMetadata {
            package: manifest.name.clone(),
            version: manifest.version.clone(),
            timestamp,
        };
        fs::write(
            snapdir.join(METADATA_NAME),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        if have_archive {
            let digest = sha256_file(&archive)?;
            fs::write(
                snapdir.join(CHECKSUM_NAME),
                format!("{digest}  {ARCHIVE_NAME}\n"),
            )?;
        }

        info!("Snapshot created at {}", snapdir.display());
        Ok(snapdir)
    }

    /// Tar the files the manifest owns, as stored under `root`, into a
    /// zstd-compressed archive. Returns how many files were packed; missing
    /// files are skipped with a warning.
    fn pack_files(
        &self,
        manifest: &Manifest,
        root: &Path,
        archive: &Path,
    ) -> Result<usize, SnapshotError> {
        let file = fs::File::create(archive)?;
        let encoder = zstd::stream::write::Encoder::new(file, 0)?.auto_finish();
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut packed = 0;
        for entry in &manifest.files {
            let rel = entry.path().trim_start_matches('/');
            let on_disk = root.join(rel);
            if !on_disk.exists() {
                warn!("Snapshot source missing on disk: {}", on_disk.display());
                continue;
            }
            builder.append_path_with_name(&on_disk, rel)?;
            packed += 1;
        }
        builder.finish()?;
        Ok(packed)
    }

    /// Extract a snapshot back into `root` and re-register its manifest.
    ///
    /// The archive checksum is verified first; a mismatch aborts the
    /// restore rather than deploying corrupt bits.
    pub fn restore(
        &self,
        snapdir: &Path,
        store: &ManifestStore,
        root: &Path,
    ) -> Result<Manifest, SnapshotError> {
        if !snapdir.is_dir() {
            return Err(SnapshotError::NotFound(snapdir.display().to_string()));
        }

        let manifest = Manifest::load(&snapdir.join(MANIFEST_NAME))?;
        let archive = snapdir.join(ARCHIVE_NAME);

        if archive.exists() {
            self.verify_checksum(snapdir, &archive)?;

            let file = fs::File::open(&archive)?;
            let decoder = zstd::stream::read::Decoder::new(file)?;
            let mut tar = tar::Archive::new(decoder);
            tar.set_overwrite(true);
            fs::create_dir_all(root)?;
            tar.unpack(root)?;
            info!("Snapshot {} extracted into {}", snapdir.display(), root.display());
        } else {
            warn!(
                "Snapshot {} has no archive, re-registering manifest only",
                snapdir.display()
            );
        }

        store.add(&manifest, true)?;
        Ok(manifest)
    }

    fn verify_checksum(&self, snapdir: &Path, archive: &Path) -> Result<(), SnapshotError> {
        let sum_file = snapdir.join(CHECKSUM_NAME);
        if !sum_file.exists() {
            return Ok(());
        }
        let recorded = fs::read_to_string(&sum_file)?;
        let expected = recorded.split_whitespace().next().unwrap_or("");
        let actual = sha256_file(archive)?;
        if expected != actual {
            return Err(SnapshotError::Corrupt(
                snapdir.to_path_buf(),
                "archive checksum mismatch".into(),
            ));
        }
        Ok(())
    }

    /// Most recent snapshot directory for a package name, if any.
    pub fn latest_for(&self, name: &str) -> Result<Option<PathBuf>, SnapshotError> {
        let mut candidates: Vec<(String, PathBuf)> = Vec::new();
        if !self.dir.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(contents) = fs::read_to_string(path.join(METADATA_NAME)) else {
                continue;
            };
            let Ok(meta) = serde_json::from_str::<SnapshotMetadata>(&contents) else {
                continue;
            };
            if meta.package == name {
                candidates.push((meta.timestamp, path));
            }
        }
        candidates.sort();
        Ok(candidates.pop().map(|(_, path)| path))
    }

    /// Remove snapshot directories older than `age_days`. Returns how many
    /// were pruned.
    pub fn prune(&self, age_days: u64) -> Result<usize, SnapshotError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let cutoff = Duration::from_secs(age_days * 24 * 60 * 60);
        let now = SystemTime::now();
        let mut pruned = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(modified) = fs::metadata(&path).and_then(|m| m.modified()) else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() > cutoff {
                fs::remove_dir_all(&path)?;
                info!("Pruned old snapshot {}", path.display());
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}
