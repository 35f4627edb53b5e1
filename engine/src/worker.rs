//! Bounded execution of agent calls.
//!
//! In concurrent mode each call runs on a pooled task under a deadline. A
//! call that overruns has its token cancelled and is abandoned; the round
//! carries on with an empty result. Sequential mode awaits each call to
//! completion with no deadline. Panics surface as agent errors in both modes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::BattleContext;
use crate::error::{BattleError, BattleResult};
use crate::model::{BattleMode, Role};

/// Worker slots: one attacker call, one defender call.
pub const POOL_SIZE: usize = 2;

pub struct WorkerPool {
    ctx: BattleContext,
    permits: Arc<Semaphore>,
    /// `None` runs calls inline without a deadline.
    timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(ctx: BattleContext, mode: BattleMode, timeout: Duration) -> Self {
        let timeout = match mode {
            BattleMode::Concurrent => Some(timeout),
            BattleMode::Sequential => None,
        };
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(POOL_SIZE)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run one agent call, surfacing timeouts and failures as errors.
    ///
    /// `cancel` is the token handed to the agent; it is cancelled here when
    /// the deadline passes.
    pub async fn run<T, F>(
        &self,
        role: Role,
        cancel: CancellationToken,
        work: F,
    ) -> BattleResult<Vec<T>>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<Vec<T>>> + Send + 'static,
    {
        let Some(limit) = self.timeout else {
            // no deadline, but a panicking agent must not unwind the battle
            return match tokio::spawn(work).await {
                Ok(result) => {
                    result.map_err(|e| BattleError::agent(role.as_str(), format!("{e:#}")))
                }
                Err(join_err) => Err(BattleError::agent(
                    role.as_str(),
                    format!("worker task failed: {join_err}"),
                )),
            };
        };

        let permits = Arc::clone(&self.permits);
        let mut handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| anyhow::anyhow!("worker pool closed: {e}"))?;
            work.await
        });

        tokio::select! {
            joined = tokio::time::timeout(limit, &mut handle) => match joined {
                Ok(Ok(result)) => {
                    result.map_err(|e| BattleError::agent(role.as_str(), format!("{e:#}")))
                }
                Ok(Err(join_err)) => Err(BattleError::agent(
                    role.as_str(),
                    format!("worker task failed: {join_err}"),
                )),
                Err(_) => {
                    cancel.cancel();
                    debug!(role = %role, "Abandoning timed-out worker");
                    Err(BattleError::AgentTimeout {
                        role: role.to_string(),
                        timeout: limit,
                    })
                }
            },
            _ = cancel.cancelled() => {
                Err(BattleError::agent(role.as_str(), "cancelled"))
            }
        }
    }

    /// Run one agent call, degrading any failure to an empty result.
    pub async fn run_or_empty<T, F>(&self, role: Role, cancel: CancellationToken, work: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<Vec<T>>> + Send + 'static,
    {
        match self.run(role, cancel, work).await {
            Ok(items) => items,
            Err(e) => {
                warn!(battle_id = %self.ctx.battle_id, role = %role, "{e}");
                self.ctx.status(&e.status_line());
                Vec::new()
            }
        }
    }
}
