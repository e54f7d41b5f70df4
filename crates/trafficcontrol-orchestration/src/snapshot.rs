//! Best-effort state snapshot across restarts.
//!
//! A small JSON record of the loop flags and active sessions, written
//! atomically (temp file + rename). Restored entries inform logging and
//! alerting only; adapter sessions do not survive a restart.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use trafficcontrol_types::{Model, SessionId, SessionStatus, TaskId};

/// One active session as recorded in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotAgent {
    /// Session id at the time of the snapshot.
    pub session_id: SessionId,
    /// Task the session was executing.
    pub task_id: TaskId,
    /// Model it ran on.
    pub model: Model,
    /// Status at snapshot time.
    pub status: SessionStatus,
    /// Spawn time.
    pub started_at: DateTime<Utc>,
}

/// Persisted loop state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Whether the loop was running.
    pub is_running: bool,
    /// Whether the loop was paused.
    pub is_paused: bool,
    /// Sessions live at snapshot time.
    pub active_agents: Vec<SnapshotAgent>,
}

impl StateSnapshot {
    /// Write the snapshot to `path` atomically.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), agents = self.active_agents.len(), "state snapshot saved");
        Ok(())
    }

    /// Load a snapshot from `path`.
    ///
    /// A missing or malformed file yields `None`; startup proceeds with
    /// empty state either way.
    pub fn load(path: &Path) -> Option<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %path.display(), %error, "state snapshot unreadable");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                warn!(path = %path.display(), %error, "state snapshot malformed, ignoring");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            is_running: true,
            is_paused: false,
            active_agents: vec![SnapshotAgent {
                session_id: SessionId::new(),
                task_id: TaskId::from("t-1"),
                model: Model::Sonnet,
                status: SessionStatus::Running,
                started_at: Utc::now(),
            }],
        }
    }

    #[test]
    fn save_load_round_trips_exactly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let original = snapshot();

        original.save(&path).unwrap();
        let restored = StateSnapshot::load(&path).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn missing_file_yields_none() {
        let dir = tempdir().unwrap();
        assert!(StateSnapshot::load(&dir.path().join("absent.json")).is_none());
    }

    #[test]
    fn malformed_file_yields_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(StateSnapshot::load(&path).is_none());
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        snapshot().save(&path).unwrap();

        let quiesced = StateSnapshot {
            is_running: false,
            is_paused: false,
            active_agents: vec![],
        };
        quiesced.save(&path).unwrap();
        assert_eq!(StateSnapshot::load(&path).unwrap(), quiesced);
        // No temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }
}
