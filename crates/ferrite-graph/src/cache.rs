//! Persistent graph cache
//!
//! A JSON snapshot of the resolved graph kept under the state directory for
//! fast reverse-dependency queries between runs. The cache is never
//! authoritative: any store mutation invalidates it, and readers fall back
//! to rebuilding from the store whenever it is absent or stale.

use crate::{DepGraph, GraphError};
use chrono::Utc;
use ferrite_db::ManifestStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CACHE_FILE: &str = "graph-cache.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheNode {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub deps: BTreeSet<String>,
    #[serde(default)]
    pub rdeps: BTreeSet<String>,
}

/// Serialized form of a resolved [`DepGraph`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphCache {
    /// RFC-3339 generation time
    pub generated: String,
    pub nodes: BTreeMap<String, CacheNode>,
}

impl GraphCache {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(CACHE_FILE)
    }

    pub fn from_graph(graph: &DepGraph) -> Self {
        let mut nodes = BTreeMap::new();
        for name in graph.nodes() {
            nodes.insert(
                name.to_string(),
                CacheNode {
                    version: graph.version_of(name).map(String::from),
                    deps: graph.deps_of(name).into_iter().collect(),
                    rdeps: graph.revdeps(name).into_iter().collect(),
                },
            );
        }
        Self {
            generated: Utc::now().to_rfc3339(),
            nodes,
        }
    }

    /// Load the cache if present and parseable; `None` otherwise.
    pub fn load(state_dir: &Path) -> Option<Self> {
        let path = Self::path(state_dir);
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(cache) => Some(cache),
            Err(e) => {
                debug!("Ignoring unreadable graph cache {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn write(&self, state_dir: &Path) -> Result<(), GraphError> {
        std::fs::create_dir_all(state_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(state_dir), json)?;
        Ok(())
    }

    /// Drop the cache. Missing file is fine.
    pub fn purge(state_dir: &Path) -> Result<(), GraphError> {
        match std::fs::remove_file(Self::path(state_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rebuild the graph from the current manifest set and persist the cache.
///
/// This is the "graph-sync" entry point the install/upgrade/remove drivers
/// call after mutating the store.
pub fn sync(store: &ManifestStore, state_dir: &Path) -> Result<DepGraph, GraphError> {
    let entries = store.index()?;
    let graph = DepGraph::from_index(&entries);
    GraphCache::from_graph(&graph).write(state_dir)?;
    debug!("Graph cache synced ({} nodes)", entries.len());
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_db::{Depends, FileEntry, Manifest, Stage};

    fn manifest(name: &str, run: &[&str]) -> Manifest {
        Manifest {
            name: name.into(),
            version: "1.0".into(),
            stage: Stage::Normal,
            origin: None,
            description: None,
            install_prefix: None,
            files: vec![FileEntry::Path(format!("/usr/bin/{name}"))],
            depends: Depends {
                build: Vec::new(),
                run: run.iter().map(|s| s.to_string()).collect(),
            },
            provides: Vec::new(),
            replaces: Vec::new(),
            build_date: None,
        }
    }

    #[test]
    fn test_sync_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("db"), dir.path().join("backup"), 5);
        store.add(&manifest("alpha", &[]), false).unwrap();
        store.add(&manifest("beta", &["alpha"]), false).unwrap();

        let state_dir = dir.path().join("state");
        let graph = sync(&store, &state_dir).unwrap();
        assert!(graph.contains("beta"));
        assert!(GraphCache::path(&state_dir).exists());

        let cache = GraphCache::load(&state_dir).unwrap();
        assert_eq!(cache.nodes.len(), 2);
        assert!(cache.nodes["alpha"].rdeps.contains("beta"));
        assert!(cache.nodes["beta"].deps.contains("alpha"));
    }

    #[test]
    fn test_purge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        GraphCache::purge(dir.path()).unwrap();

        std::fs::write(GraphCache::path(dir.path()), "{}").unwrap();
        GraphCache::purge(dir.path()).unwrap();
        assert!(!GraphCache::path(dir.path()).exists());
    }

    #[test]
    fn test_corrupt_cache_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(GraphCache::path(dir.path()), "{broken").unwrap();
        assert!(GraphCache::load(dir.path()).is_none());
    }
}
