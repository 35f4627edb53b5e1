//! Progress monitor
//!
//! Best-effort heartbeat for external observers.
//!
//! The orchestrator logs and ignores every monitor error; a broken monitor
//! never stops a battle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::context::BattleContext;
use crate::error::BattleResult;
use crate::model::{Battle, BattleStatus};
use crate::persistence::{read_json, write_json_atomic};

/// Sink for round-by-round progress.
pub trait ProgressMonitor: Send + Sync {
    /// Announce a battle before its first round.
    fn register(&self, battle: &Battle) -> BattleResult<()>;

    /// Report cumulative scores after `round`.
    fn update(&self, round: u32, attacker_score: f64, defender_score: f64) -> BattleResult<()>;

    /// Report the final status.
    fn finish(&self, _status: BattleStatus) -> BattleResult<()> {
        Ok(())
    }
}

/// Monitor that does nothing.
#[derive(Debug, Default)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {
    fn register(&self, _battle: &Battle) -> BattleResult<()> {
        Ok(())
    }

    fn update(&self, _round: u32, _attacker_score: f64, _defender_score: f64) -> BattleResult<()> {
        Ok(())
    }
}

/// Contents of the heartbeat file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub battle_id: String,
    pub pid: u32,
    pub status: BattleStatus,
    pub round: u32,
    pub max_rounds: u32,
    pub attacker_score: f64,
    pub defender_score: f64,
    pub updated_at: DateTime<Utc>,
}

/// Writes a small JSON heartbeat file on every update.
pub struct HeartbeatMonitor {
    ctx: BattleContext,
    path: PathBuf,
    last: Mutex<Option<Heartbeat>>,
}

impl HeartbeatMonitor {
    pub fn new(ctx: BattleContext, path: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            path: path.into(),
            last: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a heartbeat written by any process.
    pub fn read(path: &Path) -> BattleResult<Option<Heartbeat>> {
        read_json(path)
    }

    fn write(&self, edit: impl FnOnce(&mut Heartbeat)) -> BattleResult<()> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let mut beat = last.clone().unwrap_or_else(|| Heartbeat {
            battle_id: self.ctx.battle_id.clone(),
            pid: std::process::id(),
            status: BattleStatus::Running,
            round: 0,
            max_rounds: 0,
            attacker_score: 0.0,
            defender_score: 0.0,
            updated_at: Utc::now(),
        });
        edit(&mut beat);
        beat.updated_at = Utc::now();
        write_json_atomic(&self.path, &beat)?;
        *last = Some(beat);
        Ok(())
    }
}

impl ProgressMonitor for HeartbeatMonitor {
    fn register(&self, battle: &Battle) -> BattleResult<()> {
        self.write(|beat| {
            beat.status = battle.status;
            beat.max_rounds = battle.max_rounds;
        })
    }

    fn update(&self, round: u32, attacker_score: f64, defender_score: f64) -> BattleResult<()> {
        self.write(|beat| {
            beat.status = BattleStatus::Running;
            beat.round = round;
            beat.attacker_score = attacker_score;
            beat.defender_score = defender_score;
        })
    }

    fn finish(&self, status: BattleStatus) -> BattleResult<()> {
        self.write(|beat| beat.status = status)
    }
}
