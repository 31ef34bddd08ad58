//! Manifest store operations
//!
//! Mutations follow two rules without exception: the index is only ever
//! replaced via write-tmp-then-rename, and any manifest about to be
//! overwritten or deleted is first copied to the backup area. A crash
//! between the manifest write and the index write leaves a stale index
//! that `reindex` repairs from the authoritative manifest files.

use crate::backup;
use crate::index::{self, IndexEntry};
use crate::manifest::{dep_name, Manifest, PackageId, Stage};
use crate::DbError;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Content-addressable directory of per-package manifests plus the index.
pub struct ManifestStore {
    db_dir: PathBuf,
    backup_dir: PathBuf,
    backup_keep: usize,
}

/// Result of `verify` for one manifest.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub id: PackageId,
    pub checked: usize,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

impl ManifestStore {
    pub fn new(db_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, backup_keep: usize) -> Self {
        Self {
            db_dir: db_dir.into(),
            backup_dir: backup_dir.into(),
            backup_keep,
        }
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Ensure directories exist and the index is present (as `[]` when the
    /// database is brand new).
    pub fn init(&self) -> Result<(), DbError> {
        fs::create_dir_all(&self.db_dir)?;
        fs::create_dir_all(&self.backup_dir)?;
        if !self.db_dir.join(index::INDEX_FILE).exists() {
            index::write(&self.db_dir, &[])?;
        }
        Ok(())
    }

    pub fn manifest_path(&self, id: &PackageId) -> PathBuf {
        self.db_dir.join(id.manifest_file())
    }

    /// Load the index, rebuilding it from the manifests when it is missing
    /// or corrupt. The manifest directory is authoritative.
    pub fn index(&self) -> Result<Vec<IndexEntry>, DbError> {
        match index::load(&self.db_dir) {
            Ok(entries) => Ok(entries),
            Err(DbError::Malformed { path, reason }) => {
                warn!("Index at {} is corrupt ({}), rebuilding", path.display(), reason);
                self.reindex()
            }
            Err(e) => Err(e),
        }
    }

    /// Register a manifest.
    ///
    /// With `replace = false` an existing `(name, version)` is an
    /// `AlreadyExists` error. With `replace = true` the prior file is moved
    /// to the backup area first. Either way the index is updated after the
    /// manifest write.
    pub fn add(&self, manifest: &Manifest, replace: bool) -> Result<(), DbError> {
        manifest.validate()?;
        self.init()?;

        let id = manifest.id();
        let dest = self.manifest_path(&id);

        if dest.exists() && !replace {
            return Err(DbError::AlreadyExists(id.to_string()));
        }

        self.check_file_conflicts(manifest)?;

        if dest.exists() {
            backup::backup_manifest(&self.backup_dir, &dest)?;
        }

        index::write_json_atomic(&dest, manifest)?;

        let mut entries = self.index()?;
        entries.retain(|e| !(e.name == manifest.name && e.version == manifest.version));
        entries.push(IndexEntry::from_manifest(manifest));
        entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        index::write(&self.db_dir, &entries)?;

        info!("db_add {}", id);
        Ok(())
    }

    /// Remove manifests matching `query`.
    ///
    /// An exact `name-version` removes that one manifest; a bare name with
    /// several installed versions requires `force`. Removed manifests go to
    /// the backup area before deletion.
    pub fn remove(&self, query: &str, force: bool) -> Result<Vec<PackageId>, DbError> {
        let matches = self.resolve(query)?;
        if matches.is_empty() {
            return Err(DbError::NotFound(query.to_string()));
        }
        if matches.len() > 1 && !force {
            return Err(DbError::Ambiguous {
                query: query.to_string(),
                matches: matches.iter().map(|(id, _)| id.to_string()).collect(),
            });
        }

        let mut removed = Vec::new();
        for (id, path) in matches {
            backup::backup_manifest(&self.backup_dir, &path)?;
            fs::remove_file(&path)?;

            let mut entries = self.index()?;
            entries.retain(|e| !(e.name == id.name && e.version == id.version));
            index::write(&self.db_dir, &entries)?;

            info!("db_remove {}", id);
            removed.push(id);
        }
        Ok(removed)
    }

    /// Resolve a query to manifest files: exact `name-version` filename
    /// first, else every manifest whose `name` equals the query.
    pub fn resolve(&self, query: &str) -> Result<Vec<(PackageId, PathBuf)>, DbError> {
        let exact = self.db_dir.join(format!("{query}.json"));
        if exact.exists() {
            let m = Manifest::load(&exact)?;
            return Ok(vec![(m.id(), exact)]);
        }

        let mut out = Vec::new();
        for entry in self.index()? {
            if entry.name == query {
                out.push((entry.id(), self.db_dir.join(&entry.manifest)));
            }
        }
        Ok(out)
    }

    /// Load every manifest matching `query`. `NotFound` when none match.
    pub fn query(&self, query: &str) -> Result<Vec<Manifest>, DbError> {
        let matches = self.resolve(query)?;
        if matches.is_empty() {
            return Err(DbError::NotFound(query.to_string()));
        }
        matches.iter().map(|(_, p)| Manifest::load(p)).collect()
    }

    /// Load exactly one manifest; `Ambiguous` when several versions match.
    pub fn query_one(&self, query: &str) -> Result<Manifest, DbError> {
        let mut found = self.query(query)?;
        if found.len() > 1 {
            return Err(DbError::Ambiguous {
                query: query.to_string(),
                matches: found.iter().map(|m| m.id().to_string()).collect(),
            });
        }
        Ok(found.remove(0))
    }

    /// Installed version(s) of a name, highest first.
    pub fn installed_versions(&self, name: &str) -> Result<Vec<String>, DbError> {
        let mut versions: Vec<String> = self
            .index()?
            .into_iter()
            .filter(|e| e.name == name)
            .map(|e| e.version)
            .collect();
        versions.sort_by(|a, b| compare_versions(b, a));
        Ok(versions)
    }

    /// Iterate index entries, optionally filtered by stage.
    pub fn list(&self, stage: Option<Stage>) -> Result<Vec<IndexEntry>, DbError> {
        let entries = self.index()?;
        Ok(match stage {
            Some(s) => entries.into_iter().filter(|e| e.stage == s).collect(),
            None => entries,
        })
    }

    /// Every installed `name-version` that depends on `name` (after
    /// stripping version predicates) or lists `name` in its `provides`.
    pub fn revdeps(&self, name: &str) -> Result<Vec<String>, DbError> {
        let mut out = Vec::new();
        for entry in self.index()? {
            if entry.name == name {
                continue;
            }
            let depends_on = entry.depends.all().any(|tok| dep_name(tok) == name);
            let provides = entry.provides.iter().any(|p| dep_name(p) == name);
            if depends_on || provides {
                out.push(entry.id().to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Every installed `name-version` that owns `path`. Linear scan over
    /// the manifests, not the index; file lists are not indexed.
    pub fn provides(&self, path: &str) -> Result<Vec<String>, DbError> {
        let mut out = Vec::new();
        for manifest in self.all_manifests()? {
            if manifest.file_paths().any(|p| p == path) {
                out.push(manifest.id().to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Archive the database directory; rotation keeps the most recent N.
    pub fn backup(&self) -> Result<PathBuf, DbError> {
        self.init()?;
        backup::backup_db(&self.db_dir, &self.backup_dir, self.backup_keep)
    }

    /// Swap in a previously created archive, then rebuild the index.
    pub fn restore(&self, archive: &Path) -> Result<(), DbError> {
        backup::restore_db(&self.db_dir, archive)?;
        self.reindex()?;
        Ok(())
    }

    /// Rebuild the index from the manifest files.
    pub fn reindex(&self) -> Result<Vec<IndexEntry>, DbError> {
        let mut entries = Vec::new();
        for manifest in self.all_manifests()? {
            entries.push(IndexEntry::from_manifest(&manifest));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        index::write(&self.db_dir, &entries)?;
        debug!("Reindexed {} manifests", entries.len());
        Ok(entries)
    }

    /// Check listed files on disk: existence always, sha256 when recorded.
    pub fn verify(&self, query: &str) -> Result<Vec<VerifyReport>, DbError> {
        let manifests = self.query(query)?;
        let mut reports = Vec::new();

        for manifest in manifests {
            let mut report = VerifyReport {
                id: manifest.id(),
                checked: 0,
                missing: Vec::new(),
                mismatched: Vec::new(),
            };

            for entry in &manifest.files {
                report.checked += 1;
                let path = Path::new(entry.path());
                if !path.exists() {
                    report.missing.push(entry.path().to_string());
                    continue;
                }
                if let Some(expected) = entry.sha256() {
                    let actual = sha256_file(path)?;
                    if actual != expected {
                        report.mismatched.push(entry.path().to_string());
                    }
                }
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Packages no other installed package depends on, deduplicated to the
    /// highest installed version per name.
    pub fn orphans(&self) -> Result<Vec<PackageId>, DbError> {
        let mut best: std::collections::BTreeMap<String, String> = Default::default();
        for entry in self.index()? {
            if !self.revdeps(&entry.name)?.is_empty() {
                continue;
            }
            match best.get(&entry.name) {
                Some(v) if compare_versions(v, &entry.version).is_ge() => {}
                _ => {
                    best.insert(entry.name, entry.version);
                }
            }
        }
        Ok(best
            .into_iter()
            .map(|(name, version)| PackageId::new(name, version))
            .collect())
    }

    /// Case-insensitive substring search over name, description, origin.
    pub fn search(&self, term: &str) -> Result<Vec<IndexEntry>, DbError> {
        let needle = term.to_lowercase();
        let mut out = Vec::new();
        for manifest in self.all_manifests()? {
            let hit = manifest.name.to_lowercase().contains(&needle)
                || manifest
                    .description
                    .as_deref()
                    .is_some_and(|d| d.to_lowercase().contains(&needle))
                || manifest
                    .origin
                    .as_deref()
                    .is_some_and(|o| o.to_lowercase().contains(&needle));
            if hit {
                out.push(IndexEntry::from_manifest(&manifest));
            }
        }
        Ok(out)
    }

    /// Total on-disk size of the files owned by matching manifests. Falls
    /// back to the recorded size when a file is missing from disk.
    pub fn size(&self, query: &str) -> Result<u64, DbError> {
        let mut total = 0u64;
        for manifest in self.query(query)? {
            for entry in &manifest.files {
                match fs::metadata(entry.path()) {
                    Ok(md) => total += md.len(),
                    Err(_) => total += entry.size().unwrap_or(0),
                }
            }
        }
        Ok(total)
    }

    /// Parse every manifest file in the database directory.
    pub fn all_manifests(&self) -> Result<Vec<Manifest>, DbError> {
        let mut out = Vec::new();
        if !self.db_dir.exists() {
            return Ok(out);
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.db_dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|e| e == "json")
                    && p.file_name().is_some_and(|n| n != index::INDEX_FILE)
            })
            .collect();
        paths.sort();

        for path in paths {
            match Manifest::load(&path) {
                Ok(m) => out.push(m),
                Err(e) => warn!("Skipping unreadable manifest {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }

    /// A path may be owned by at most one installed package. A collision is
    /// fatal unless the incoming manifest `replaces` the current owner.
    ///
    /// `add` runs this itself; the stage runner also calls it before
    /// deploying files so a collision surfaces before anything touches disk.
    pub fn check_file_conflicts(&self, manifest: &Manifest) -> Result<(), DbError> {
        for other in self.all_manifests()? {
            if other.name == manifest.name {
                continue;
            }
            if manifest.replaces.iter().any(|r| r == &other.name) {
                continue;
            }
            for entry in &manifest.files {
                if other.file_paths().any(|p| p == entry.path()) {
                    return Err(DbError::FileConflict {
                        path: entry.path().to_string(),
                        owner: other.id().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Compare two version strings: semver when both parse, else lexicographic.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

/// Hex-encoded SHA-256 of a file's contents, streamed in 8 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String, DbError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
