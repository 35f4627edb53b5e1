//! Battle persistence
//!
//! State document, checkpoint records, atomic writes.
//!
//! Layout under `<state_dir>/<battle_id>/`:
//!
//! ```text
//! state.json                      full battle document (single writer)
//! checkpoints/round-000010.json   lightweight checkpoint records
//! heartbeat.json                  progress monitor heartbeat
//! ```
//!
//! Every file is written to a temp sibling and renamed into place so a
//! concurrent reader never sees a partial document.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BattleError, BattleResult};
use crate::model::{Battle, TwinBackend};
use crate::state::BattleState;

pub const STATE_FILE: &str = "state.json";
pub const HEARTBEAT_FILE: &str = "heartbeat.json";
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Serialize `value` as pretty JSON to `path` via temp file + rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> BattleResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BattleError::persistence(parent, e.to_string()))?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BattleError::persistence(path, "path has no file name"))?;
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    std::fs::write(&temp, content).map_err(|e| BattleError::persistence(&temp, e.to_string()))?;
    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        BattleError::persistence(path, e.to_string())
    })
}

/// Read a JSON document, `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> BattleResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        std::fs::read_to_string(path).map_err(|e| BattleError::persistence(path, e.to_string()))?;
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| BattleError::persistence(path, e.to_string()))
}

/// Full persisted battle document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleDocument {
    /// Schema version for forward compatibility.
    pub version: u32,
    #[serde(flatten)]
    pub battle: Battle,
    #[serde(flatten)]
    pub state: BattleState,
    /// Human-readable reason the battle ended, if it has.
    #[serde(default)]
    pub end_reason: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl BattleDocument {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(battle: &Battle, state: &BattleState, end_reason: Option<String>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            battle: battle.clone(),
            state: state.clone(),
            end_reason,
            saved_at: Utc::now(),
        }
    }
}

/// Lightweight per-checkpoint record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub round: u32,
    pub attacker_score: f64,
    pub defender_score: f64,
    pub twin_mode: Option<TwinBackend>,
    pub timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(round: u32, state: &BattleState, twin_mode: Option<TwinBackend>) -> Self {
        Self {
            version: BattleDocument::CURRENT_VERSION,
            round,
            attacker_score: state.attacker_total_score,
            defender_score: state.defender_total_score,
            twin_mode,
            timestamp: Utc::now(),
        }
    }
}

/// On-disk store for one battle.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path, battle_id: &str) -> Self {
        Self {
            dir: state_dir.join(battle_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.dir.join(HEARTBEAT_FILE)
    }

    fn checkpoint_path(&self, round: u32) -> PathBuf {
        self.dir
            .join(CHECKPOINT_DIR)
            .join(format!("round-{round:06}.json"))
    }

    pub fn save_state(&self, doc: &BattleDocument) -> BattleResult<()> {
        write_json_atomic(&self.state_path(), doc)
    }

    pub fn load_state(&self) -> BattleResult<Option<BattleDocument>> {
        let doc: Option<BattleDocument> = read_json(&self.state_path())?;
        if let Some(doc) = &doc {
            if doc.version > BattleDocument::CURRENT_VERSION {
                return Err(BattleError::persistence(
                    self.state_path(),
                    format!(
                        "version mismatch: expected <= {}, found {}",
                        BattleDocument::CURRENT_VERSION,
                        doc.version
                    ),
                ));
            }
        }
        Ok(doc)
    }

    pub fn write_checkpoint(&self, record: &CheckpointRecord) -> BattleResult<()> {
        write_json_atomic(&self.checkpoint_path(record.round), record)
    }

    /// All checkpoint records, oldest first.
    pub fn list_checkpoints(&self) -> BattleResult<Vec<CheckpointRecord>> {
        let dir = self.dir.join(CHECKPOINT_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| BattleError::persistence(&dir, e.to_string()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("round-") && n.ends_with(".json"))
            })
            .collect();
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(record) = read_json::<CheckpointRecord>(&path)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn latest_checkpoint(&self) -> BattleResult<Option<CheckpointRecord>> {
        Ok(self.list_checkpoints()?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BattleMode, BattleStatus, RoundResult};
    use std::time::Duration;

    fn sample_state() -> BattleState {
        let mut state = BattleState::new();
        state
            .record_round(RoundResult {
                round_number: 1,
                findings: vec![],
                patches: vec![],
                attacker_score: 2.0,
                defender_score: 1.0,
                duration: Duration::from_millis(5),
                synced: false,
            })
            .unwrap();
        state
    }

    #[test]
    fn test_state_round_trip_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "b-1");
        let mut battle = Battle::new("b-1", "/srv/app", 10, BattleMode::Sequential);
        battle.transition(BattleStatus::Running).unwrap();

        store
            .save_state(&BattleDocument::new(&battle, &sample_state(), None))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.state_path()).unwrap()).unwrap();
        assert_eq!(raw["id"], "b-1");
        assert_eq!(raw["status"], "running");
        assert_eq!(raw["attacker_total_score"], 2.0);

        let doc = store.load_state().unwrap().unwrap();
        assert_eq!(doc.battle.id, "b-1");
        assert_eq!(doc.state.current_round, 1);
        assert!(doc.state.validate().is_empty());
    }

    #[test]
    fn test_missing_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "nope");
        assert!(store.load_state().unwrap().is_none());
        assert!(store.latest_checkpoint().unwrap().is_none());
    }

    #[test]
    fn test_future_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "b-1");
        let battle = Battle::new("b-1", "/srv/app", 10, BattleMode::Sequential);
        let mut doc = BattleDocument::new(&battle, &BattleState::new(), None);
        doc.version = 99;
        store.save_state(&doc).unwrap();
        assert!(matches!(
            store.load_state(),
            Err(BattleError::Persistence { .. })
        ));
    }

    #[test]
    fn test_checkpoints_sorted_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "b-1");
        let state = sample_state();
        for round in [20, 10, 30] {
            store
                .write_checkpoint(&CheckpointRecord::new(round, &state, Some(TwinBackend::Copy)))
                .unwrap();
        }
        let rounds: Vec<u32> = store
            .list_checkpoints()
            .unwrap()
            .iter()
            .map(|c| c.round)
            .collect();
        assert_eq!(rounds, vec![10, 20, 30]);
        assert_eq!(store.latest_checkpoint().unwrap().unwrap().round, 30);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/doc.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        write_json_atomic(&path, &vec![4]).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["doc.json"]);
        let back: Vec<u32> = read_json(&path).unwrap().unwrap();
        assert_eq!(back, vec![4]);
    }
}
