//! Per-package pipeline checkpoints
//!
//! A checkpoint records which pipeline stages a package has completed, as a
//! JSON file under the state directory. Resume replays from the first
//! incomplete stage; a successful registration clears the file.

use crate::BuildError;
use ferrite_db::PackageId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Ordered pipeline stages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    Downloaded,
    Extracted,
    Patched,
    Built,
    InstalledDestdir,
    Packaged,
    Deployed,
    Registered,
}

impl BuildStep {
    /// Pipeline order.
    pub const ALL: [BuildStep; 8] = [
        BuildStep::Downloaded,
        BuildStep::Extracted,
        BuildStep::Patched,
        BuildStep::Built,
        BuildStep::InstalledDestdir,
        BuildStep::Packaged,
        BuildStep::Deployed,
        BuildStep::Registered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStep::Downloaded => "downloaded",
            BuildStep::Extracted => "extracted",
            BuildStep::Patched => "patched",
            BuildStep::Built => "built",
            BuildStep::InstalledDestdir => "installed_destdir",
            BuildStep::Packaged => "packaged",
            BuildStep::Deployed => "deployed",
            BuildStep::Registered => "registered",
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completed-stage set for one package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub package: String,
    #[serde(default)]
    pub completed: BTreeSet<BuildStep>,
}

impl Checkpoint {
    pub fn new(id: &PackageId) -> Self {
        Self {
            package: id.to_string(),
            completed: BTreeSet::new(),
        }
    }

    pub fn path(state_dir: &Path, id: &PackageId) -> PathBuf {
        state_dir.join(format!("{id}.state"))
    }

    /// Load the checkpoint for a package; a missing file is a fresh start.
    pub fn load(state_dir: &Path, id: &PackageId) -> Self {
        let path = Self::path(state_dir, id);
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Unreadable checkpoint {}: {}, starting over", path.display(), e);
                Self::new(id)
            }),
            Err(_) => Self::new(id),
        }
    }

    pub fn save(&self, state_dir: &Path, id: &PackageId) -> Result<(), BuildError> {
        std::fs::create_dir_all(state_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(state_dir, id), json)?;
        Ok(())
    }

    /// Remove the checkpoint file (after `registered`, or on `clean`).
    pub fn clear(state_dir: &Path, id: &PackageId) -> Result<(), BuildError> {
        let path = Self::path(state_dir, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark(&mut self, step: BuildStep) {
        self.completed.insert(step);
    }

    pub fn is_done(&self, step: BuildStep) -> bool {
        self.completed.contains(&step)
    }

    /// First stage that has not completed, in pipeline order.
    pub fn first_incomplete(&self) -> Option<BuildStep> {
        BuildStep::ALL.iter().copied().find(|s| !self.is_done(*s))
    }
}
