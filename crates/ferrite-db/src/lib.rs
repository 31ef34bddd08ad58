//! Manifest database for ferrite
//!
//! Installed packages are tracked as one JSON manifest per `(name, version)`
//! under the database directory, with a derived `index.json` as a fast
//! summary view. The manifest directory is authoritative; the index is a
//! cache that `reindex` can rebuild at any time.
//!
//! All index mutations are write-tmp-then-rename. Every destructive update
//! to a manifest first copies the prior file into the timestamped backup
//! area, so `remove` and `add(replace)` are reversible.

mod backup;
mod index;
mod manifest;
mod store;

pub use index::IndexEntry;
pub use manifest::{Depends, FileEntry, Manifest, PackageId, Stage, dep_name};
pub use store::{compare_versions, sha256_file, ManifestStore, VerifyReport};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Package not found: {0}")]
    NotFound(String),

    #[error("Query '{query}' is ambiguous, matches: {matches:?}")]
    Ambiguous { query: String, matches: Vec<String> },

    #[error("Manifest already exists: {0}")]
    AlreadyExists(String),

    #[error("Malformed manifest {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("File {path} is already owned by {owner}")]
    FileConflict { path: String, owner: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
