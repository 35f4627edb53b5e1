//! Battle state
//!
//! Cumulative scores, findings, patches, and round history.
//!
//! The orchestrator is the only writer. Readers (a display thread, the
//! monitor) go through [`SharedBattleState`] and never see a half-applied
//! round because every round is applied under one write lock.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{BattleError, BattleResult};
use crate::model::{FinalMetrics, Finding, Patch, Role, RoundResult};

/// Tolerance when re-checking score totals against round sums.
const SCORE_TOLERANCE: f64 = 1e-9;

/// Who is ahead at the end of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Attacker,
    Defender,
    Draw,
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attacker => write!(f, "attacker"),
            Self::Defender => write!(f, "defender"),
            Self::Draw => write!(f, "draw"),
        }
    }
}

/// Cumulative battle record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BattleState {
    pub current_round: u32,
    pub attacker_total_score: f64,
    pub defender_total_score: f64,
    pub all_findings: Vec<Finding>,
    pub all_patches: Vec<Patch>,
    pub rounds: Vec<RoundResult>,
    /// Display flag: attacker call in flight.
    #[serde(default)]
    pub attacker_active: bool,
    /// Display flag: defender call in flight.
    #[serde(default)]
    pub defender_active: bool,
    /// Rounds whose patches never reached the arena.
    #[serde(default)]
    pub sync_failures: u32,
    /// Consecutive rounds the arena has lagged behind the defender.
    #[serde(default)]
    pub sync_lag: u32,
    #[serde(default)]
    pub final_metrics: Option<FinalMetrics>,
}

impl BattleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_finding_id(&self, id: &str) -> bool {
        self.all_findings.iter().any(|f| f.id == id)
    }

    pub fn has_patch_id(&self, id: &str) -> bool {
        self.all_patches.iter().any(|p| p.id == id)
    }

    /// Append a completed round.
    ///
    /// Rejects out-of-order rounds and reused ids without touching state.
    pub fn record_round(&mut self, result: RoundResult) -> BattleResult<()> {
        let expected = self.current_round + 1;
        if result.round_number != expected {
            return Err(BattleError::RoundOutOfOrder {
                expected,
                got: result.round_number,
            });
        }

        let mut seen = HashSet::new();
        for finding in &result.findings {
            if !seen.insert(finding.id.as_str()) || self.has_finding_id(&finding.id) {
                return Err(BattleError::DuplicateId {
                    kind: "finding",
                    id: finding.id.clone(),
                });
            }
        }
        seen.clear();
        for patch in &result.patches {
            if !seen.insert(patch.id.as_str()) || self.has_patch_id(&patch.id) {
                return Err(BattleError::DuplicateId {
                    kind: "patch",
                    id: patch.id.clone(),
                });
            }
        }

        if !result.patches.is_empty() {
            if result.synced {
                self.sync_lag = 0;
            } else {
                self.sync_failures += 1;
                self.sync_lag += 1;
            }
        }

        self.attacker_total_score += result.attacker_score;
        self.defender_total_score += result.defender_score;
        self.all_findings.extend(result.findings.iter().cloned());
        self.all_patches.extend(result.patches.iter().cloned());
        self.current_round = result.round_number;
        self.rounds.push(result);
        Ok(())
    }

    /// Set or clear a liveness flag.
    pub fn set_active(&mut self, role: Role, active: bool) {
        match role {
            Role::Attacker => self.attacker_active = active,
            Role::Defender => self.defender_active = active,
            Role::Arena => {}
        }
    }

    pub fn winner(&self) -> Winner {
        let diff = self.defender_total_score - self.attacker_total_score;
        if diff.abs() < SCORE_TOLERANCE {
            Winner::Draw
        } else if diff > 0.0 {
            Winner::Defender
        } else {
            Winner::Attacker
        }
    }

    pub fn margin(&self) -> f64 {
        (self.defender_total_score - self.attacker_total_score).abs()
    }

    /// Check the structural invariants of a (possibly reloaded) state.
    ///
    /// Returns every violation found; empty means the state is consistent.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (i, round) in self.rounds.iter().enumerate() {
            let expected = u32::try_from(i + 1).unwrap_or(u32::MAX);
            if round.round_number != expected {
                errors.push(format!(
                    "round at index {i} has number {} (expected {expected})",
                    round.round_number
                ));
            }
        }
        if usize::try_from(self.current_round).ok() != Some(self.rounds.len()) {
            errors.push(format!(
                "current_round {} does not match {} recorded rounds",
                self.current_round,
                self.rounds.len()
            ));
        }

        let attacker_sum: f64 = self.rounds.iter().map(|r| r.attacker_score).sum();
        let defender_sum: f64 = self.rounds.iter().map(|r| r.defender_score).sum();
        if (attacker_sum - self.attacker_total_score).abs() > SCORE_TOLERANCE {
            errors.push(format!(
                "attacker total {} != round sum {attacker_sum}",
                self.attacker_total_score
            ));
        }
        if (defender_sum - self.defender_total_score).abs() > SCORE_TOLERANCE {
            errors.push(format!(
                "defender total {} != round sum {defender_sum}",
                self.defender_total_score
            ));
        }

        let mut ids = HashSet::new();
        for f in &self.all_findings {
            if !ids.insert(f.id.as_str()) {
                errors.push(format!("duplicate finding id {}", f.id));
            }
        }
        ids.clear();
        for p in &self.all_patches {
            if !ids.insert(p.id.as_str()) {
                errors.push(format!("duplicate patch id {}", p.id));
            }
        }

        errors
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "round {} | attacker {:.2} | defender {:.2} | {} findings | {} patches | sync lag {}",
            self.current_round,
            self.attacker_total_score,
            self.defender_total_score,
            self.all_findings.len(),
            self.all_patches.len(),
            self.sync_lag
        )
    }
}

/// Battle state shared with display/monitor readers.
pub type SharedBattleState = Arc<RwLock<BattleState>>;

/// Wrap a state for sharing.
pub fn share(state: BattleState) -> SharedBattleState {
    Arc::new(RwLock::new(state))
}

/// Read lock, recovering from poisoning.
pub fn read_state(shared: &SharedBattleState) -> RwLockReadGuard<'_, BattleState> {
    shared.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write lock, recovering from poisoning.
pub fn write_state(shared: &SharedBattleState) -> RwLockWriteGuard<'_, BattleState> {
    shared.write().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a liveness flag up for the duration of an agent call.
///
/// The flag is cleared on drop, so it resets on early return, error, or
/// cancellation of the enclosing future.
pub struct LivenessGuard {
    shared: SharedBattleState,
    role: Role,
}

impl LivenessGuard {
    pub fn raise(shared: &SharedBattleState, role: Role) -> Self {
        write_state(shared).set_active(role, true);
        Self {
            shared: Arc::clone(shared),
            role,
        }
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        write_state(&self.shared).set_active(self.role, false);
    }
}
