//! Attacker / defender seams.
//!
//! The decision logic lives outside the engine; these traits are all the
//! orchestrator knows about it. Calls receive a [`CancellationToken`] that
//! fires when the orchestrator stops waiting (timeout or pause), and
//! implementations are expected to return promptly once it does.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::model::{Finding, Patch};
use crate::twin::Workspaces;

/// What an agent gets to know about the round it is playing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundContext {
    pub battle_id: String,
    pub round: u32,
    pub workspaces: Workspaces,
}

#[async_trait]
pub trait Attacker: Send + Sync {
    fn name(&self) -> &str {
        "attacker"
    }

    /// One-time setup once the twin is ready.
    async fn prepare(&self, _workspaces: &Workspaces) -> anyhow::Result<()> {
        Ok(())
    }

    /// Probe the arena and report findings.
    async fn attack(
        &self,
        round: &RoundContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<Vec<Finding>>;
}

#[async_trait]
pub trait Defender: Send + Sync {
    fn name(&self) -> &str {
        "defender"
    }

    async fn prepare(&self, _workspaces: &Workspaces) -> anyhow::Result<()> {
        Ok(())
    }

    /// Remediate `findings` in the defender workspace.
    async fn defend(
        &self,
        findings: &[Finding],
        round: &RoundContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<Vec<Patch>>;
}
