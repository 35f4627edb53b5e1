//! Termination policy
//!
//! Rolling counters that decide when a battle stops.

use serde::{Deserialize, Serialize};

/// Why the round loop should (or should not) stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Keep going.
    Continue,
    /// Too many consecutive rounds without findings.
    NullProduction { rounds: u32 },
    /// Hard round budget spent.
    MaxRounds { rounds: u32 },
    /// Score deltas stayed flat for too long.
    Converged { rounds: u32 },
}

impl TerminationReason {
    pub fn should_stop(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::NullProduction { rounds } => {
                write!(f, "Null production: no findings for {rounds} consecutive rounds")
            }
            Self::MaxRounds { .. } => write!(f, "Maximum rounds reached"),
            Self::Converged { rounds } => {
                write!(f, "Scores converged: stable for {rounds} consecutive rounds")
            }
        }
    }
}

/// Thresholds for the policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminationConfig {
    pub max_rounds: u32,
    pub null_threshold: u32,
    pub stable_threshold: u32,
    /// Score delta below which a round counts as stable.
    pub epsilon: f64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 50,
            null_threshold: 5,
            stable_threshold: 5,
            epsilon: 0.01,
        }
    }
}

/// Tracks `null_rounds` and `stable_rounds` across the battle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationPolicy {
    config: TerminationConfig,
    null_rounds: u32,
    stable_rounds: u32,
}

impl TerminationPolicy {
    pub fn new(config: TerminationConfig) -> Self {
        Self {
            config,
            null_rounds: 0,
            stable_rounds: 0,
        }
    }

    /// Update counters from one finished round.
    ///
    /// Each counter resets as soon as its condition fails for the round.
    pub fn observe(&mut self, findings: usize, attacker_delta: f64, defender_delta: f64) {
        if findings == 0 {
            self.null_rounds += 1;
        } else {
            self.null_rounds = 0;
        }

        if attacker_delta.abs() < self.config.epsilon && defender_delta.abs() < self.config.epsilon
        {
            self.stable_rounds += 1;
        } else {
            self.stable_rounds = 0;
        }
    }

    /// Decide whether the battle should stop after `current_round` rounds.
    pub fn check(&self, current_round: u32) -> TerminationReason {
        if self.null_rounds >= self.config.null_threshold {
            return TerminationReason::NullProduction {
                rounds: self.null_rounds,
            };
        }
        if current_round >= self.config.max_rounds {
            return TerminationReason::MaxRounds {
                rounds: current_round,
            };
        }
        if self.stable_rounds >= self.config.stable_threshold {
            return TerminationReason::Converged {
                rounds: self.stable_rounds,
            };
        }
        TerminationReason::Continue
    }

    pub fn null_rounds(&self) -> u32 {
        self.null_rounds
    }

    pub fn stable_rounds(&self) -> u32 {
        self.stable_rounds
    }

    pub fn config(&self) -> &TerminationConfig {
        &self.config
    }

    /// Rebuild counters by replaying recorded rounds (used on resume).
    pub fn replay(&mut self, rounds: impl IntoIterator<Item = (usize, f64, f64)>) {
        self.null_rounds = 0;
        self.stable_rounds = 0;
        for (findings, a, d) in rounds {
            self.observe(findings, a, d);
        }
    }
}
