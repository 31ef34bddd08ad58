//! Protected package set
//!
//! Packages named here refuse removal unless the caller forces it. The set
//! is the union of a small built-in core and the names listed in the
//! configured file (one per line, `#` starts a comment).

use std::collections::HashSet;
use std::path::Path;

/// Packages that must never be removed implicitly, even when the protected
/// file is absent. Losing any of these bricks the host's ability to rebuild.
const BUILTIN_PROTECTED: &[&str] = &["glibc", "gcc", "binutils", "make", "bash", "coreutils"];

/// Allow-list of packages guarded against removal.
#[derive(Debug, Clone)]
pub struct ProtectedSet {
    names: HashSet<String>,
}

impl ProtectedSet {
    /// Load the set from a file, merging with the built-in core.
    ///
    /// A missing or unreadable file is not an error; the built-ins still
    /// apply.
    pub fn load(path: &Path) -> Self {
        let mut names: HashSet<String> =
            BUILTIN_PROTECTED.iter().map(|s| s.to_string()).collect();

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let entry = line.split('#').next().unwrap_or("").trim();
                    if !entry.is_empty() {
                        names.insert(entry.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No protected file at {}, using built-ins", path.display());
            }
            Err(e) => {
                tracing::warn!("Failed to read protected file {}: {}", path.display(), e);
            }
        }

        Self { names }
    }

    /// An empty set (tests and --force paths).
    pub fn empty() -> Self {
        Self {
            names: HashSet::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
