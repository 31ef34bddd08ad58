//! Persisted removal batch state

use crate::RemoveError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "remove_state.json";

/// Progress of one removal batch, written after every package so an
/// interrupted run can resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveState {
    #[serde(default)]
    pub remaining: Vec<String>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed_current: Option<String>,
}

impl RemoveState {
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

    pub fn load(state_dir: &Path) -> Self {
        match std::fs::read_to_string(Self::path(state_dir)) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), RemoveError> {
        std::fs::create_dir_all(state_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(state_dir), json)?;
        Ok(())
    }

    pub fn clear(state_dir: &Path) -> Result<(), RemoveError> {
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
        self.completed.push(name.to_string());
    }

    pub fn mark_failed(&mut self, name: &str) {
        self.remaining.retain(|n| n != name);
        self.failed_current = Some(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_replays_failure_first() {
        let mut state = RemoveState::fresh(&["a".into(), "b".into()]);
        state.mark_failed("a");
        assert_eq!(state.queue(), vec!["a", "b"]);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = RemoveState::fresh(&["a".into()]);
        state.mark_completed("a");
        state.save(dir.path()).unwrap();

        let loaded = RemoveState::load(dir.path());
        assert_eq!(loaded.completed, vec!["a"]);
        assert!(loaded.queue().is_empty());

        RemoveState::clear(dir.path()).unwrap();
        assert!(RemoveState::load(dir.path()).completed.is_empty());
    }
}
