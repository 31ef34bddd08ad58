//! Derived index over the manifest directory
//!
//! The index is a compact array of summary entries, one per manifest, kept
//! in `index.json` next to the manifests. It exists for fast listing and
//! graph construction; whenever it disagrees with the manifest files, the
//! files win and `reindex` repairs it.

use crate::manifest::{Depends, Manifest, PackageId, Stage};
use crate::DbError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const INDEX_FILE: &str = "index.json";

/// Compact summary of one manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub depends: Depends,
    #[serde(default)]
    pub stage: Stage,
    /// Filename of the backing manifest inside the db directory.
    pub manifest: String,
}

impl IndexEntry {
    pub fn from_manifest(m: &Manifest) -> Self {
        Self {
            name: m.name.clone(),
            version: m.version.clone(),
            origin: m.origin.clone(),
            provides: m.provides.clone(),
            depends: m.depends.clone(),
            stage: m.stage,
            manifest: m.id().manifest_file(),
        }
    }

    pub fn id(&self) -> PackageId {
        PackageId::new(self.name.clone(), self.version.clone())
    }
}

/// Read the index from a db directory. A missing file yields an empty list;
/// a corrupt file is an error the caller repairs with `reindex`.
pub fn load(db_dir: &Path) -> Result<Vec<IndexEntry>, DbError> {
    let path = db_dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_json::from_str(&contents).map_err(|e| DbError::Malformed {
        path,
        reason: e.to_string(),
    })
}

/// Write the index atomically: serialize to a temporary sibling, fsync,
/// then rename over the live file.
pub fn write(db_dir: &Path, entries: &[IndexEntry]) -> Result<(), DbError> {
    let path = db_dir.join(INDEX_FILE);
    write_json_atomic(&path, entries)
}

/// Write any serializable value with the write-tmp-then-rename protocol.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), DbError> {
    use std::io::Write;

    let tmp = path.with_extension("json.tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut f, value)?;
        f.write_all(b"\n")?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileEntry;

    fn manifest(name: &str, version: &str) -> Manifest {
        Manifest {
            name: name.into(),
            version: version.into(),
            stage: Stage::Normal,
            origin: None,
            description: None,
            install_prefix: None,
            files: vec![FileEntry::Path(format!("/usr/bin/{name}"))],
            depends: Depends::default(),
            provides: Vec::new(),
            replaces: Vec::new(),
            build_date: None,
        }
    }

    #[test]
    fn test_entry_from_manifest() {
        let entry = IndexEntry::from_manifest(&manifest("alpha", "1.0"));
        assert_eq!(entry.name, "alpha");
        assert_eq!(entry.manifest, "alpha-1.0.json");
        assert_eq!(entry.id().to_string(), "alpha-1.0");
    }

    #[test]
    fn test_load_missing_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            IndexEntry::from_manifest(&manifest("alpha", "1.0")),
            IndexEntry::from_manifest(&manifest("beta", "2.1")),
        ];

        write(dir.path(), &entries).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].name, "beta");
        // no temporary file left behind
        assert!(!dir.path().join("index.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_index_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), "{not json").unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(DbError::Malformed { .. })
        ));
    }
}
