//! Battle data model
//!
//! Battle header, status machine, findings, patches, rounds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BattleError, BattleResult};

/// How attacker/defender work is dispatched within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleMode {
    /// Agent calls run on worker tasks with a timeout.
    #[default]
    Concurrent,
    /// Agent calls run inline on the orchestrator task.
    Sequential,
}

impl std::fmt::Display for BattleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Concurrent => write!(f, "concurrent"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

impl std::str::FromStr for BattleMode {
    type Err = BattleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concurrent" => Ok(Self::Concurrent),
            "sequential" => Ok(Self::Sequential),
            other => Err(BattleError::config(format!("unknown battle mode '{other}'"))),
        }
    }
}

/// Backend strategy used to build the digital twin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwinBackend {
    GitWorktree,
    Docker,
    Qemu,
    Copy,
}

impl std::fmt::Display for TwinBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GitWorktree => write!(f, "git-worktree"),
            Self::Docker => write!(f, "docker"),
            Self::Qemu => write!(f, "qemu"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

impl std::str::FromStr for TwinBackend {
    type Err = BattleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "git-worktree" | "git" | "worktree" => Ok(Self::GitWorktree),
            "docker" | "container" => Ok(Self::Docker),
            "qemu" => Ok(Self::Qemu),
            "copy" => Ok(Self::Copy),
            other => Err(BattleError::config(format!("unknown twin backend '{other}'"))),
        }
    }
}

/// Lifecycle status of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    #[default]
    Pending,
    Running,
    /// Interrupted by the user; twin and state kept for resume.
    Paused,
    Completed,
    Failed,
}

impl BattleStatus {
    /// Whether this is a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [BattleStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Paused, Self::Completed, Self::Failed],
            Self::Paused => &[Self::Running, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }
}

impl std::fmt::Display for BattleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Participant roles. The arena is not an agent, only a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Attacker,
    Defender,
    Arena,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Attacker, Role::Defender, Role::Arena];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attacker => "attacker",
            Self::Defender => "defender",
            Self::Arena => "arena",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Battle header: identity, target, and lifecycle timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battle {
    pub id: String,
    pub target_path: PathBuf,
    pub max_rounds: u32,
    pub mode: BattleMode,
    pub backend: Option<TwinBackend>,
    pub status: BattleStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Battle {
    /// Create a pending battle.
    pub fn new(id: &str, target_path: impl Into<PathBuf>, max_rounds: u32, mode: BattleMode) -> Self {
        Self {
            id: id.to_string(),
            target_path: target_path.into(),
            max_rounds,
            mode,
            backend: None,
            status: BattleStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to a new status, stamping start/completion times.
    pub fn transition(&mut self, to: BattleStatus) -> BattleResult<()> {
        if !self.status.valid_transitions().contains(&to) {
            return Err(BattleError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        if to == BattleStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = to;
        Ok(())
    }
}

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Weight used by the default scorer.
    pub fn weight(self) -> f64 {
        match self {
            Self::Info => 0.0,
            Self::Low => 1.0,
            Self::Medium => 3.0,
            Self::High => 5.0,
            Self::Critical => 10.0,
        }
    }
}

/// A weakness reported by the attacker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub location: String,
    /// Filled in by the orchestrator.
    #[serde(default)]
    pub round: u32,
}

impl Finding {
    pub fn new(id: &str, description: &str, severity: Severity, location: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            severity,
            location: location.to_string(),
            round: 0,
        }
    }
}

/// A remediation produced by the defender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub finding_ids: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub verified: bool,
}

impl Patch {
    pub fn new(id: &str, finding_ids: &[&str], description: &str, verified: bool) -> Self {
        Self {
            id: id.to_string(),
            finding_ids: finding_ids.iter().map(|s| s.to_string()).collect(),
            description: description.to_string(),
            diff: String::new(),
            verified,
        }
    }
}

/// Immutable record of one attack/defense/score cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_number: u32,
    pub findings: Vec<Finding>,
    pub patches: Vec<Patch>,
    pub attacker_score: f64,
    pub defender_score: f64,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Whether patches from this round reached the arena.
    #[serde(default)]
    pub synced: bool,
}

/// Composite end-of-battle metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalMetrics {
    /// True defense success rate.
    pub tdsr: f64,
    /// False defense success rate.
    pub fdsr: f64,
    /// Attack success coefficient.
    pub asc: f64,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
