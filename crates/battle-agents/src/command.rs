//! Subprocess-backed attacker and defender.
//!
//! Each round runs the configured command line in the role's workspace.
//! The child learns about the round through `BATTLE_*` environment
//! variables and answers with a JSON array on stdout. The defender also
//! gets the round's findings as JSON on stdin.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use battle_engine::{Attacker, Defender, Finding, Patch, Role, RoundContext};

/// Max stderr characters carried into an error message.
const STDERR_TAIL: usize = 2000;

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    /// Split a shell-style command line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = shlex::split(line)
            .with_context(|| format!("unbalanced quoting in command: {line}"))?
            .into_iter();
        let program = parts.next().context("empty agent command")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Environment handed to the child for `role` in `round`.
    pub fn env_for(role: Role, round: &RoundContext) -> HashMap<&'static str, String> {
        let workspace = match role {
            Role::Attacker => &round.workspaces.attacker,
            Role::Defender => &round.workspaces.defender,
            Role::Arena => &round.workspaces.arena,
        };
        HashMap::from([
            ("BATTLE_ID", round.battle_id.clone()),
            ("BATTLE_ROUND", round.round.to_string()),
            ("BATTLE_ROLE", role.to_string()),
            ("BATTLE_ARENA", round.workspaces.arena.display().to_string()),
            ("BATTLE_WORKSPACE", workspace.display().to_string()),
        ])
    }

    /// Run once and return raw stdout. Cancelling `cancel` kills the child.
    pub async fn run(
        &self,
        cwd: &Path,
        env: &HashMap<&'static str, String>,
        stdin: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(cwd)
            .envs(env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&payload).await {
                    debug!("agent closed stdin early: {e}");
                }
            });
        }

        let output = tokio::select! {
            out = child.wait_with_output() => {
                out.with_context(|| format!("waiting on {}", self.program))?
            }
            _ = cancel.cancelled() => bail!("{} cancelled", self.program),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let skip = stderr.chars().count().saturating_sub(STDERR_TAIL);
            let tail: String = stderr.chars().skip(skip).collect();
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                tail.trim()
            );
        }
        Ok(output.stdout)
    }
}

/// Parse an agent's stdout: a JSON array, or nothing at all.
pub fn parse_items<T: DeserializeOwned>(stdout: &[u8]) -> Result<Vec<T>> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).context("agent stdout is not a JSON array")
}

/// Attacker that shells out each round.
#[derive(Debug, Clone)]
pub struct CommandAttacker {
    command: AgentCommand,
}

impl CommandAttacker {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(Self::new(AgentCommand::parse(line)?))
    }
}

#[async_trait]
impl Attacker for CommandAttacker {
    fn name(&self) -> &str {
        &self.command.program
    }

    async fn attack(
        &self,
        round: &RoundContext,
        cancel: CancellationToken,
    ) -> Result<Vec<Finding>> {
        let env = AgentCommand::env_for(Role::Attacker, round);
        let stdout = self
            .command
            .run(&round.workspaces.attacker, &env, None, &cancel)
            .await?;
        let findings: Vec<Finding> = parse_items(&stdout)?;
        debug!(round = round.round, count = findings.len(), "Attacker command returned");
        Ok(findings)
    }
}

/// Defender that shells out each round with the findings on stdin.
#[derive(Debug, Clone)]
pub struct CommandDefender {
    command: AgentCommand,
}

impl CommandDefender {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(Self::new(AgentCommand::parse(line)?))
    }
}

#[async_trait]
impl Defender for CommandDefender {
    fn name(&self) -> &str {
        &self.command.program
    }

    async fn defend(
        &self,
        findings: &[Finding],
        round: &RoundContext,
        cancel: CancellationToken,
    ) -> Result<Vec<Patch>> {
        let env = AgentCommand::env_for(Role::Defender, round);
        let payload = serde_json::to_vec(findings)?;
        let stdout = self
            .command
            .run(&round.workspaces.defender, &env, Some(payload), &cancel)
            .await?;
        let patches: Vec<Patch> = parse_items(&stdout)?;
        if patches.iter().any(|p| p.finding_ids.is_empty()) {
            warn!(round = round.round, "Defender returned patches without finding references");
        }
        Ok(patches)
    }
}
