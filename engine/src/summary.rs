//! End-of-battle summary, produced however the battle ended.

use serde::{Deserialize, Serialize};

use crate::model::{Battle, BattleStatus, FinalMetrics};
use crate::state::{BattleState, Winner};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleSummary {
    pub battle_id: String,
    pub status: BattleStatus,
    /// Human-readable reason the battle stopped.
    pub reason: String,
    pub rounds: u32,
    pub attacker_score: f64,
    pub defender_score: f64,
    pub winner: Winner,
    pub margin: f64,
    /// Present once the battle completed normally.
    pub metrics: Option<FinalMetrics>,
    pub sync_failures: u32,
}

impl BattleSummary {
    pub fn new(battle: &Battle, state: &BattleState, reason: impl Into<String>) -> Self {
        Self {
            battle_id: battle.id.clone(),
            status: battle.status,
            reason: reason.into(),
            rounds: state.current_round,
            attacker_score: state.attacker_total_score,
            defender_score: state.defender_total_score,
            winner: state.winner(),
            margin: state.margin(),
            metrics: state.final_metrics,
            sync_failures: state.sync_failures,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == BattleStatus::Failed
    }

    /// Compact summary line.
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "[{}] {} | {} rounds | attacker {:.2} vs defender {:.2} | winner {} (margin {:.2})",
            self.status.to_string().to_uppercase(),
            self.reason,
            self.rounds,
            self.attacker_score,
            self.defender_score,
            self.winner,
            self.margin
        );
        if let Some(m) = &self.metrics {
            line.push_str(&format!(
                " | tdsr {:.2} fdsr {:.2} asc {:.2}",
                m.tdsr, m.fdsr, m.asc
            ));
        }
        if self.sync_failures > 0 {
            line.push_str(&format!(" | {} sync failures", self.sync_failures));
        }
        line
    }
}
