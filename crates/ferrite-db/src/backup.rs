//! Backup area for replaced and removed manifests
//!
//! Two kinds of backups live under the backup directory:
//! - single manifests moved aside before a destructive store mutation,
//!   named `TIMESTAMP-name-version.json`
//! - full database archives (`db-TIMESTAMP.tar.gz`) written by `backup()`
//!   and consumed by `restore()`, rotated to the most recent N

use crate::DbError;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::{Path, PathBuf};

pub fn timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Copy a manifest into the backup area under a timestamp prefix.
///
/// Never overwrites: a same-second collision gets a numeric suffix.
pub fn backup_manifest(backup_dir: &Path, manifest_path: &Path) -> Result<PathBuf, DbError> {
    fs::create_dir_all(backup_dir)?;

    let file_name = manifest_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DbError::Malformed {
            path: manifest_path.to_path_buf(),
            reason: "manifest path has no filename".into(),
        })?;

    let stamp = timestamp();
    let mut dest = backup_dir.join(format!("{stamp}-{file_name}"));
    let mut counter = 1;
    while dest.exists() {
        dest = backup_dir.join(format!("{stamp}.{counter}-{file_name}"));
        counter += 1;
    }

    fs::copy(manifest_path, &dest)?;
    tracing::debug!("Backed up {} to {}", manifest_path.display(), dest.display());
    Ok(dest)
}

/// Archive the whole database directory into the backup area and rotate old
/// archives down to `keep`.
pub fn backup_db(db_dir: &Path, backup_dir: &Path, keep: usize) -> Result<PathBuf, DbError> {
    fs::create_dir_all(backup_dir)?;

    let archive_path = backup_dir.join(format!("db-{}.tar.gz", timestamp()));
    let file = fs::File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", db_dir)?;
    builder.into_inner()?.finish()?;

    rotate(backup_dir, keep)?;
    tracing::info!("Database backed up to {}", archive_path.display());
    Ok(archive_path)
}

/// Extract a database archive and atomically swap it in for the live
/// directory. The prior directory is kept as `.old.TIMESTAMP` until the
/// swap has fully succeeded, then deleted.
pub fn restore_db(db_dir: &Path, archive: &Path) -> Result<(), DbError> {
    if !archive.exists() {
        return Err(DbError::NotFound(archive.display().to_string()));
    }

    let parent = db_dir.parent().ok_or_else(|| DbError::Malformed {
        path: db_dir.to_path_buf(),
        reason: "db directory has no parent".into(),
    })?;

    let stamp = timestamp();
    let staging = parent.join(format!(".restore-{stamp}"));
    fs::create_dir_all(&staging)?;

    let file = fs::File::open(archive)?;
    let decoder = GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(&staging)?;

    let old = parent.join(format!(
        "{}.old.{stamp}",
        db_dir.file_name().and_then(|n| n.to_str()).unwrap_or("db")
    ));

    if db_dir.exists() {
        fs::rename(db_dir, &old)?;
    }
    if let Err(e) = fs::rename(&staging, db_dir) {
        // Put the original back before reporting the failure.
        if old.exists() {
            let _ = fs::rename(&old, db_dir);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(e.into());
    }

    if old.exists() {
        fs::remove_dir_all(&old)?;
    }
    tracing::info!("Database restored from {}", archive.display());
    Ok(())
}

/// Delete all but the `keep` most recent `db-*.tar.gz` archives.
fn rotate(backup_dir: &Path, keep: usize) -> Result<(), DbError> {
    let mut archives: Vec<PathBuf> = fs::read_dir(backup_dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("db-") && n.ends_with(".tar.gz"))
                .unwrap_or(false)
        })
        .collect();

    // Timestamped names sort chronologically.
    archives.sort();

    if archives.len() > keep {
        let excess = archives.len() - keep;
        for old in &archives[..excess] {
            fs::remove_file(old)?;
            tracing::debug!("Rotated out old backup {}", old.display());
        }
    }
    Ok(())
}
