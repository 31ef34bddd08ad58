//! Persisted upgrade batch state
//!
//! Written after every package so a failed batch can resume. The failed
//! package replays first on `--resume`.

use crate::UpgradeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "upgrade_state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeState {
    #[serde(default)]
    pub remaining: Vec<String>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed_current: Option<String>,
}

impl UpgradeState {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(STATE_FILE)
    }

    pub fn fresh(targets: &[String]) -> Self {
        Self {
            remaining: targets.to_vec(),
            completed: Vec::new(),
            failed_current: None,
        }
    }

    /// Load the persisted state; missing or unreadable files yield an
    /// empty batch.
    pub fn load(state_dir: &Path) -> Self {
        let path = Self::path(state_dir);
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Unreadable upgrade state {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), UpgradeError> {
        std::fs::create_dir_all(state_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(state_dir), json)?;
        Ok(())
    }

    pub fn clear(state_dir: &Path) -> Result<(), UpgradeError> {
        match std::fs::remove_file(Self::path(state_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Work queue: the failed package first, then whatever remains.
    pub fn queue(&self) -> Vec<String> {
        let mut queue = Vec::new();
        if let Some(failed) = &self.failed_current {
            queue.push(failed.clone());
        }
        for name in &self.remaining {
            if Some(name) != self.failed_current.as_ref() {
                queue.push(name.clone());
            }
        }
        queue
    }

    pub fn mark_completed(&mut self, name: &str) {
        self.remaining.retain(|n| n != name);
        if self.failed_current.as_deref() == Some(name) {
            self.failed_current = None;
        }
        if !self.completed.iter().any(|n| n == name) {
            self.completed.push(name.to_string());
        }
    }

    pub fn mark_failed(&mut self, name: &str) {
        self.remaining.retain(|n| n != name);
        self.failed_current = Some(name.to_string());
    }
}
