//! Command-line surface for the battle runner.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use battle_engine::{BattleConfig, BattleMode, TwinBackend};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run an attacker/defender battle against a digital twin")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a new battle, or resume a paused one
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Target system to clone into the twin
    #[arg(long, required_unless_present = "resume")]
    pub target: Option<PathBuf>,

    /// Attacker command line (stdout: JSON array of findings)
    #[arg(long)]
    pub attacker: String,

    /// Defender command line (stdin: findings JSON, stdout: JSON array of patches)
    #[arg(long)]
    pub defender: String,

    /// TOML config file (env overrides still apply on top)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Round budget (overrides BATTLE_MAX_ROUNDS)
    #[arg(long)]
    pub max_rounds: Option<u32>,

    /// concurrent | sequential (overrides BATTLE_MODE)
    #[arg(long)]
    pub mode: Option<BattleMode>,

    /// git-worktree | docker | qemu | copy (overrides auto-detection)
    #[arg(long)]
    pub backend: Option<TwinBackend>,

    /// Resume the paused battle with this id
    #[arg(long)]
    pub resume: Option<String>,
}

impl RunArgs {
    /// Defaults → TOML file → `BATTLE_*` env → flags.
    pub fn build_config(&self) -> Result<BattleConfig> {
        let mut config = match &self.config {
            Some(path) => BattleConfig::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BattleConfig::default(),
        };
        config.apply_env().context("applying BATTLE_* overrides")?;

        if let Some(rounds) = self.max_rounds {
            config.max_rounds = rounds;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(backend) = self.backend {
            config.twin.backend = Some(backend);
        }
        config.validate()?;
        Ok(config)
    }
}
