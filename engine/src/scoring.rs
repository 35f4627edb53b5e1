//! Scoring seam and the default severity-weighted scorer.

use std::collections::HashSet;

use crate::model::{FinalMetrics, Finding, Patch};
use crate::state::BattleState;

/// Turns a round's output into scores, and a finished battle into metrics.
pub trait Scorer: Send + Sync {
    /// `(attacker_score, defender_score)` for one round.
    fn score_round(&self, findings: &[Finding], patches: &[Patch], round: u32) -> (f64, f64);

    /// Composite end-of-battle metrics.
    fn final_metrics(&self, state: &BattleState) -> FinalMetrics;
}

/// Bonus per verified patch on top of the covered-severity sum.
pub const VERIFIED_PATCH_BONUS: f64 = 1.0;

/// Severity-weighted scorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeverityScorer;

fn verified_coverage(patches: &[Patch]) -> HashSet<&str> {
    patches
        .iter()
        .filter(|p| p.verified)
        .flat_map(|p| p.finding_ids.iter().map(String::as_str))
        .collect()
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl Scorer for SeverityScorer {
    fn score_round(&self, findings: &[Finding], patches: &[Patch], _round: u32) -> (f64, f64) {
        let attacker = findings.iter().map(|f| f.severity.weight()).sum();

        let covered = verified_coverage(patches);
        let verified = patches.iter().filter(|p| p.verified).count();
        let defender = findings
            .iter()
            .filter(|f| covered.contains(f.id.as_str()))
            .map(|f| f.severity.weight())
            .sum::<f64>()
            + verified as f64 * VERIFIED_PATCH_BONUS;

        (attacker, defender)
    }

    fn final_metrics(&self, state: &BattleState) -> FinalMetrics {
        let covered = verified_coverage(&state.all_patches);
        let defended = state
            .all_findings
            .iter()
            .filter(|f| covered.contains(f.id.as_str()))
            .count();
        let unverified = state.all_patches.iter().filter(|p| !p.verified).count();

        FinalMetrics {
            tdsr: ratio(defended, state.all_findings.len()),
            fdsr: ratio(unverified, state.all_patches.len()),
            asc: if state.rounds.is_empty() {
                0.0
            } else {
                state.attacker_total_score / state.rounds.len() as f64
            },
        }
    }
}
