//! Battle configuration
//!
//! Loading order: `Default` → optional TOML file → environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BattleError, BattleResult};
use crate::model::{BattleMode, TwinBackend};
use crate::termination::TerminationConfig;

/// Digital twin options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinOptions {
    /// Force a backend instead of auto-detecting.
    pub backend: Option<TwinBackend>,
    /// Prebuilt container image (selects Docker when set).
    pub container_image: Option<String>,
    /// Emulated machine type (selects Qemu when set).
    pub qemu_machine: Option<String>,
    pub seccomp_profile: Option<PathBuf>,
    pub memory_limit: String,
    pub pids_limit: u32,
    pub tmpfs_size: String,
    pub debug_port_base: u16,
    pub debug_port_span: u16,
}

impl Default for TwinOptions {
    fn default() -> Self {
        Self {
            backend: None,
            container_image: None,
            qemu_machine: None,
            seccomp_profile: None,
            memory_limit: "512m".into(),
            pids_limit: 256,
            tmpfs_size: "64m".into(),
            debug_port_base: 20_000,
            debug_port_span: 10_000,
        }
    }
}

/// Top-level battle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleConfig {
    pub max_rounds: u32,
    pub mode: BattleMode,
    /// Per-agent-call budget in concurrent mode.
    pub worker_timeout_secs: u64,
    /// Persist a checkpoint every N rounds.
    pub checkpoint_interval: u32,
    pub null_round_threshold: u32,
    pub stable_round_threshold: u32,
    pub stable_epsilon: f64,
    /// Parent directory for per-battle twin workspaces.
    pub work_root: PathBuf,
    /// Parent directory for persisted battle state.
    pub state_dir: PathBuf,
    pub twin: TwinOptions,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            max_rounds: 50,
            mode: BattleMode::Concurrent,
            worker_timeout_secs: 300,
            checkpoint_interval: 10,
            null_round_threshold: 5,
            stable_round_threshold: 5,
            stable_epsilon: 0.01,
            work_root: std::env::temp_dir().join("battle-twins"),
            state_dir: PathBuf::from(".battle"),
            twin: TwinOptions::default(),
        }
    }
}

impl BattleConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> BattleResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML file; missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> BattleResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BattleError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `BATTLE_*` environment overrides.
    pub fn apply_env(&mut self) -> BattleResult<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> BattleResult<()> {
        if let Some(v) = var("BATTLE_MAX_ROUNDS") {
            self.max_rounds = parse_var("BATTLE_MAX_ROUNDS", &v)?;
        }
        if let Some(v) = var("BATTLE_MODE") {
            self.mode = v.parse()?;
        }
        if let Some(v) = var("BATTLE_WORKER_TIMEOUT_SECS") {
            self.worker_timeout_secs = parse_var("BATTLE_WORKER_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("BATTLE_CHECKPOINT_INTERVAL") {
            self.checkpoint_interval = parse_var("BATTLE_CHECKPOINT_INTERVAL", &v)?;
        }
        if let Some(v) = var("BATTLE_NULL_THRESHOLD") {
            self.null_round_threshold = parse_var("BATTLE_NULL_THRESHOLD", &v)?;
        }
        if let Some(v) = var("BATTLE_STABLE_THRESHOLD") {
            self.stable_round_threshold = parse_var("BATTLE_STABLE_THRESHOLD", &v)?;
        }
        if let Some(v) = var("BATTLE_WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
        if let Some(v) = var("BATTLE_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BATTLE_TWIN_BACKEND") {
            self.twin.backend = Some(v.parse()?);
        }
        Ok(())
    }

    /// Reject configurations that cannot run a battle.
    pub fn validate(&self) -> BattleResult<()> {
        let mut problems = Vec::new();
        if self.max_rounds == 0 {
            problems.push("max_rounds must be > 0");
        }
        if self.checkpoint_interval == 0 {
            problems.push("checkpoint_interval must be > 0");
        }
        if self.null_round_threshold == 0 || self.stable_round_threshold == 0 {
            problems.push("termination thresholds must be > 0");
        }
        if self.worker_timeout_secs == 0 {
            problems.push("worker_timeout_secs must be > 0");
        }
        if self.twin.debug_port_span == 0 {
            problems.push("twin.debug_port_span must be > 0");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(BattleError::config(problems.join(", ")))
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn termination(&self) -> TerminationConfig {
        TerminationConfig {
            max_rounds: self.max_rounds,
            null_threshold: self.null_round_threshold,
            stable_threshold: self.stable_round_threshold,
            epsilon: self.stable_epsilon,
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> BattleResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BattleError::config(format!("{key}: invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BattleConfig::default();
        assert_eq!(config.worker_timeout(), Duration::from_secs(300));
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.mode, BattleMode::Concurrent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BATTLE_WORKER_TIMEOUT_SECS", "42"),
            ("BATTLE_MODE", "sequential"),
            ("BATTLE_MAX_ROUNDS", "7"),
            ("BATTLE_TWIN_BACKEND", "copy"),
        ]
        .into_iter()
        .collect();

        let mut config = BattleConfig::default();
        config
            .apply_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.worker_timeout_secs, 42);
        assert_eq!(config.mode, BattleMode::Sequential);
        assert_eq!(config.max_rounds, 7);
        assert_eq!(config.twin.backend, Some(TwinBackend::Copy));
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = BattleConfig::default();
        let err = config
            .apply_vars(|k| (k == "BATTLE_MAX_ROUNDS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, BattleError::Config { .. }));
    }

    #[test]
    fn test_toml_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("battle.toml");
        std::fs::write(
            &path,
            r#"
max_rounds = 12
mode = "sequential"

[twin]
backend = "git_worktree"
pids_limit = 64
"#,
        )
        .unwrap();

        let config = BattleConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.max_rounds, 12);
        assert_eq!(config.mode, BattleMode::Sequential);
        assert_eq!(config.twin.backend, Some(TwinBackend::GitWorktree));
        assert_eq!(config.twin.pids_limit, 64);
        assert_eq!(config.twin.memory_limit, "512m");
        assert_eq!(config.checkpoint_interval, 10);
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let config = BattleConfig {
            max_rounds: 0,
            checkpoint_interval: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_rounds"));
        assert!(err.contains("checkpoint_interval"));
    }
}
