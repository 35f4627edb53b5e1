use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use battle_agents::cli::{Cli, Command, RunArgs};
use battle_agents::{CommandAttacker, CommandDefender};
use battle_engine::{BattleContext, BattleOrchestrator};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = args.build_config()?;
    let attacker = Arc::new(CommandAttacker::from_line(&args.attacker).context("--attacker")?);
    let defender = Arc::new(CommandDefender::from_line(&args.defender).context("--defender")?);

    let mut battle = match (&args.resume, &args.target) {
        (Some(id), _) => {
            let ctx = BattleContext::with_tracing(id);
            BattleOrchestrator::resume(ctx, config, attacker, defender)
                .with_context(|| format!("resuming battle {id}"))?
        }
        (None, Some(target)) => {
            let ctx = BattleContext::with_tracing(&BattleContext::generate_id());
            BattleOrchestrator::new(ctx, config, target, attacker, defender)?
        }
        (None, None) => anyhow::bail!("--target is required for a new battle"),
    };

    info!(
        battle_id = %battle.battle().id,
        state_dir = %battle.store().dir().display(),
        "Battle runner starting"
    );

    let pause = battle.pause_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, pausing after the current step");
            pause.cancel();
        }
    });

    let summary = battle.run().await;
    println!("{}", summary.summary_line());
    if summary.is_failed() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
