//! Battle orchestrator
//!
//! Drives the attacker→defender→score round loop.
//!
//! Ties together the digital twin, the agents, scoring, termination, and
//! persistence to run one battle end-to-end.
//!
//! ```text
//! pending ──run──▶ running ──terminate──▶ completed   (twin torn down)
//!                     │  ╲
//!                     │   ╲──error──────▶ failed      (twin torn down)
//!                     ▼
//!                   paused ──resume──▶ running         (twin kept)
//! ```
//!
//! Agent output is collected by value and applied to [`BattleState`] by the
//! orchestrator alone, one round at a time, under a single short write lock.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agents::{Attacker, Defender, RoundContext};
use crate::config::BattleConfig;
use crate::context::BattleContext;
use crate::error::{BattleError, BattleResult};
use crate::model::{Battle, BattleStatus, Finding, Patch, Role, RoundResult};
use crate::monitor::{HeartbeatMonitor, ProgressMonitor};
use crate::persistence::{BattleDocument, CheckpointRecord, StateStore};
use crate::scoring::{Scorer, SeverityScorer};
use crate::state::{read_state, share, write_state, BattleState, LivenessGuard, SharedBattleState};
use crate::summary::BattleSummary;
use crate::termination::{TerminationPolicy, TerminationReason};
use crate::twin::DigitalTwin;
use crate::worker::WorkerPool;

/// Reason recorded when a battle is interrupted.
pub const PAUSED_REASON: &str = "Paused by user";

/// How the round loop ended.
#[derive(Debug)]
enum Ending {
    Finished(TerminationReason),
    Paused,
}

/// Fresh id for an attacker finding.
fn finding_id(round: u32) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("F-{round}-{}", &suffix[..8])
}

/// Fresh id for a defender patch.
fn patch_id(round: u32) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("P-{round}-{}", &suffix[..8])
}

/// Stamp findings with their round and give empty or reused ids fresh ones.
pub fn normalize_findings(state: &BattleState, round: u32, findings: &mut [Finding]) {
    let mut used: HashSet<String> = HashSet::new();
    for finding in findings.iter_mut() {
        finding.round = round;
        if finding.id.trim().is_empty()
            || used.contains(&finding.id)
            || state.has_finding_id(&finding.id)
        {
            finding.id = finding_id(round);
        }
        used.insert(finding.id.clone());
    }
}

/// Give empty or reused patch ids fresh ones; log references to unknown findings.
pub fn normalize_patches(
    state: &BattleState,
    round: u32,
    findings: &[Finding],
    patches: &mut [Patch],
) {
    let mut used: HashSet<String> = HashSet::new();
    for patch in patches.iter_mut() {
        if patch.id.trim().is_empty() || used.contains(&patch.id) || state.has_patch_id(&patch.id)
        {
            patch.id = patch_id(round);
        }
        used.insert(patch.id.clone());

        for reference in &patch.finding_ids {
            let known =
                findings.iter().any(|f| &f.id == reference) || state.has_finding_id(reference);
            if !known {
                warn!(round, patch = %patch.id, finding = %reference, "Patch references unknown finding");
            }
        }
    }
}

/// Runs one battle.
pub struct BattleOrchestrator {
    ctx: BattleContext,
    config: BattleConfig,
    battle: Battle,
    state: SharedBattleState,
    twin: DigitalTwin,
    attacker: Arc<dyn Attacker>,
    defender: Arc<dyn Defender>,
    scorer: Arc<dyn Scorer>,
    monitor: Arc<dyn ProgressMonitor>,
    store: StateStore,
    policy: TerminationPolicy,
    pool: WorkerPool,
    pause: CancellationToken,
    /// Set when built by [`BattleOrchestrator::resume`].
    resumed: bool,
}

impl BattleOrchestrator {
    /// New pending battle against `target`.
    pub fn new(
        ctx: BattleContext,
        config: BattleConfig,
        target: impl Into<PathBuf>,
        attacker: Arc<dyn Attacker>,
        defender: Arc<dyn Defender>,
    ) -> BattleResult<Self> {
        config.validate()?;
        let target = target.into();
        let battle = Battle::new(&ctx.battle_id, &target, config.max_rounds, config.mode);
        let twin = DigitalTwin::new(ctx.clone(), target, &config);
        Ok(Self::assemble(
            ctx,
            config,
            battle,
            BattleState::new(),
            twin,
            attacker,
            defender,
            false,
        ))
    }

    /// Pick up a paused (or crashed) battle from its persisted state.
    ///
    /// The document must pass validation and must not be terminal; the twin
    /// is reattached rather than rebuilt when the battle runs.
    pub fn resume(
        ctx: BattleContext,
        mut config: BattleConfig,
        attacker: Arc<dyn Attacker>,
        defender: Arc<dyn Defender>,
    ) -> BattleResult<Self> {
        config.validate()?;
        let store = StateStore::new(&config.state_dir, &ctx.battle_id);
        let doc = store.load_state()?.ok_or_else(|| {
            BattleError::persistence(store.state_path(), "no saved battle to resume")
        })?;

        let errors = doc.state.validate();
        if !errors.is_empty() {
            return Err(BattleError::Corrupted { errors });
        }
        if doc.battle.status.is_terminal() {
            return Err(BattleError::InvalidTransition {
                from: doc.battle.status.to_string(),
                to: BattleStatus::Running.to_string(),
            });
        }
        if doc.battle.id != ctx.battle_id {
            return Err(BattleError::Corrupted {
                errors: vec![format!(
                    "document belongs to battle {}, not {}",
                    doc.battle.id, ctx.battle_id
                )],
            });
        }

        // the saved battle's own shape wins over the caller's config
        config.max_rounds = doc.battle.max_rounds;
        config.mode = doc.battle.mode;
        if doc.battle.backend.is_some() {
            config.twin.backend = doc.battle.backend;
        }

        let mut state = doc.state;
        state.attacker_active = false;
        state.defender_active = false;

        let twin = DigitalTwin::new(ctx.clone(), doc.battle.target_path.clone(), &config);
        let mut orchestrator =
            Self::assemble(ctx, config, doc.battle, state, twin, attacker, defender, true);
        let history: Vec<(usize, f64, f64)> = read_state(&orchestrator.state)
            .rounds
            .iter()
            .map(|r| (r.findings.len(), r.attacker_score, r.defender_score))
            .collect();
        orchestrator.policy.replay(history);
        info!(
            battle_id = %orchestrator.battle.id,
            round = orchestrator.current_round(),
            "Resuming battle"
        );
        Ok(orchestrator)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        ctx: BattleContext,
        config: BattleConfig,
        battle: Battle,
        state: BattleState,
        twin: DigitalTwin,
        attacker: Arc<dyn Attacker>,
        defender: Arc<dyn Defender>,
        resumed: bool,
    ) -> Self {
        let store = StateStore::new(&config.state_dir, &ctx.battle_id);
        let monitor: Arc<dyn ProgressMonitor> =
            Arc::new(HeartbeatMonitor::new(ctx.clone(), store.heartbeat_path()));
        let mut termination = config.termination();
        termination.max_rounds = battle.max_rounds;
        let pool = WorkerPool::new(ctx.clone(), battle.mode, config.worker_timeout());

        Self {
            ctx,
            battle,
            state: share(state),
            twin,
            attacker,
            defender,
            scorer: Arc::new(SeverityScorer),
            monitor,
            store,
            policy: TerminationPolicy::new(termination),
            pool,
            pause: CancellationToken::new(),
            resumed,
            config,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ProgressMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Replace the auto-built twin (custom drivers, tests).
    pub fn with_twin(mut self, twin: DigitalTwin) -> Self {
        self.twin = twin;
        self
    }

    /// Override the per-call worker deadline.
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.pool = WorkerPool::new(self.ctx.clone(), self.battle.mode, timeout);
        self
    }

    /// Token that pauses the battle when cancelled (e.g. on Ctrl-C).
    pub fn pause_token(&self) -> CancellationToken {
        self.pause.clone()
    }

    /// Shared state for display/monitor readers.
    pub fn state(&self) -> SharedBattleState {
        Arc::clone(&self.state)
    }

    pub fn battle(&self) -> &Battle {
        &self.battle
    }

    pub fn twin(&self) -> &DigitalTwin {
        &self.twin
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &BattleConfig {
        &self.config
    }

    pub fn current_round(&self) -> u32 {
        read_state(&self.state).current_round
    }

    /// Run the battle to an end. Never panics or returns an error: every
    /// ending, including failure, yields a summary.
    pub async fn run(&mut self) -> BattleSummary {
        let outcome = match self.start().await {
            Ok(()) => self.round_loop().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Ending::Finished(reason)) => self.complete(reason).await,
            Ok(Ending::Paused) => self.pause_battle(),
            Err(e) => self.fail(e).await,
        }
    }

    /// Twin, agents, monitor registration, `→ running`.
    async fn start(&mut self) -> BattleResult<()> {
        let ready = if self.resumed {
            self.twin.attach().await
        } else {
            self.twin.setup().await
        };
        if !ready {
            return Err(BattleError::setup(
                self.twin.backend().to_string(),
                "digital twin could not be established",
            ));
        }
        self.battle.backend = Some(self.twin.backend());

        let workspaces = self.twin.workspaces();
        self.attacker
            .prepare(&workspaces)
            .await
            .map_err(|e| BattleError::agent(Role::Attacker.as_str(), format!("prepare: {e:#}")))?;
        self.defender
            .prepare(&workspaces)
            .await
            .map_err(|e| BattleError::agent(Role::Defender.as_str(), format!("prepare: {e:#}")))?;

        // a crashed run left the document in `running`
        if self.battle.status != BattleStatus::Running {
            self.battle.transition(BattleStatus::Running)?;
        }
        if let Err(e) = self.monitor.register(&self.battle) {
            warn!(battle_id = %self.battle.id, "Monitor registration failed: {e}");
        }
        self.persist(None);

        info!(
            battle_id = %self.battle.id,
            backend = %self.twin.backend(),
            mode = %self.battle.mode,
            max_rounds = self.battle.max_rounds,
            resumed = self.resumed,
            "Battle started"
        );
        Ok(())
    }

    async fn round_loop(&mut self) -> BattleResult<Ending> {
        loop {
            let current = self.current_round();
            let reason = self.policy.check(current);
            if reason.should_stop() {
                info!(battle_id = %self.battle.id, round = current, "Terminating: {reason}");
                return Ok(Ending::Finished(reason));
            }
            if self.pause.is_cancelled() {
                return Ok(Ending::Paused);
            }

            let Some(result) = self.play_round(current + 1).await else {
                return Ok(Ending::Paused);
            };
            self.apply_round(result)?;
        }
    }

    /// Attack, defend, sync, score. `None` if a pause interrupted the round.
    async fn play_round(&mut self, round: u32) -> Option<RoundResult> {
        let started = Instant::now();
        let round_ctx = RoundContext {
            battle_id: self.battle.id.clone(),
            round,
            workspaces: self.twin.workspaces(),
        };
        debug!(battle_id = %self.battle.id, round, "Round started");

        let mut findings = {
            let _live = LivenessGuard::raise(&self.state, Role::Attacker);
            let attacker = Arc::clone(&self.attacker);
            let call_ctx = round_ctx.clone();
            let token = self.pause.child_token();
            let agent_token = token.clone();
            self.pool
                .run_or_empty(Role::Attacker, token, async move {
                    attacker.attack(&call_ctx, agent_token).await
                })
                .await
        };
        if self.pause.is_cancelled() {
            return None;
        }
        normalize_findings(&read_state(&self.state), round, &mut findings);

        let mut patches = if findings.is_empty() {
            Vec::new()
        } else {
            let _live = LivenessGuard::raise(&self.state, Role::Defender);
            let defender = Arc::clone(&self.defender);
            let call_ctx = round_ctx;
            let call_findings = findings.clone();
            let token = self.pause.child_token();
            let agent_token = token.clone();
            self.pool
                .run_or_empty(Role::Defender, token, async move {
                    defender.defend(&call_findings, &call_ctx, agent_token).await
                })
                .await
        };
        if self.pause.is_cancelled() {
            return None;
        }
        normalize_patches(&read_state(&self.state), round, &findings, &mut patches);

        let synced = patches.is_empty() || self.twin.sync().await;
        let (attacker_score, defender_score) =
            self.scorer.score_round(&findings, &patches, round);

        Some(RoundResult {
            round_number: round,
            findings,
            patches,
            attacker_score,
            defender_score,
            duration: started.elapsed(),
            synced,
        })
    }

    /// Record a finished round and do the per-round bookkeeping.
    fn apply_round(&mut self, result: RoundResult) -> BattleResult<()> {
        let round = result.round_number;
        let findings = result.findings.len();
        let (a, d) = (result.attacker_score, result.defender_score);
        let synced = result.synced;

        let (attacker_total, defender_total, status_line) = {
            let mut state = write_state(&self.state);
            state.record_round(result)?;
            (
                state.attacker_total_score,
                state.defender_total_score,
                state.status_line(),
            )
        };
        self.policy.observe(findings, a, d);

        info!(
            battle_id = %self.battle.id,
            round,
            findings,
            attacker_score = a,
            defender_score = d,
            synced,
            "Round complete"
        );
        self.ctx.status(&status_line);

        if let Err(e) = self.monitor.update(round, attacker_total, defender_total) {
            warn!(battle_id = %self.battle.id, round, "Monitor update failed: {e}");
        }
        if round % self.config.checkpoint_interval == 0 {
            self.persist(None);
            self.checkpoint(round);
        }
        Ok(())
    }

    fn snapshot(&self) -> BattleState {
        read_state(&self.state).clone()
    }

    /// Write the full state document. Failures are reported, never raised.
    fn persist(&self, end_reason: Option<String>) {
        let doc = BattleDocument::new(&self.battle, &self.snapshot(), end_reason);
        if let Err(e) = self.store.save_state(&doc) {
            error!(battle_id = %self.battle.id, "State save failed: {e}");
            self.ctx.status(&e.status_line());
        }
    }

    fn checkpoint(&self, round: u32) {
        let record = CheckpointRecord::new(round, &self.snapshot(), self.battle.backend);
        match self.store.write_checkpoint(&record) {
            Ok(()) => debug!(battle_id = %self.battle.id, round, "Checkpoint written"),
            Err(e) => {
                error!(battle_id = %self.battle.id, round, "Checkpoint failed: {e}");
                self.ctx.status(&e.status_line());
            }
        }
    }

    fn finish_monitor(&self) {
        if let Err(e) = self.monitor.finish(self.battle.status) {
            warn!(battle_id = %self.battle.id, "Monitor finish failed: {e}");
        }
    }

    async fn complete(&mut self, reason: TerminationReason) -> BattleSummary {
        let metrics = {
            let state = read_state(&self.state);
            self.scorer.final_metrics(&state)
        };
        write_state(&self.state).final_metrics = Some(metrics);

        if let Err(e) = self.battle.transition(BattleStatus::Completed) {
            return self.fail(e).await;
        }
        let reason = reason.to_string();
        self.persist(Some(reason.clone()));
        self.checkpoint(self.current_round());
        self.twin.cleanup().await;
        self.finish_monitor();

        let summary = BattleSummary::new(&self.battle, &self.snapshot(), reason);
        info!(battle_id = %self.battle.id, winner = %summary.winner, "Battle completed");
        self.ctx.status(&summary.summary_line());
        summary
    }

    /// Keep the twin; persist so the battle can be resumed.
    fn pause_battle(&mut self) -> BattleSummary {
        if let Err(e) = self.battle.transition(BattleStatus::Paused) {
            warn!(battle_id = %self.battle.id, "Pause transition rejected: {e}");
        }
        self.persist(Some(PAUSED_REASON.to_string()));
        self.checkpoint(self.current_round());
        self.finish_monitor();

        let summary = BattleSummary::new(&self.battle, &self.snapshot(), PAUSED_REASON);
        info!(
            battle_id = %self.battle.id,
            round = summary.rounds,
            "Battle paused, twin kept for resume"
        );
        self.ctx.status(&summary.summary_line());
        summary
    }

    async fn fail(&mut self, err: BattleError) -> BattleSummary {
        error!(battle_id = %self.battle.id, "Battle failed: {err}");
        self.ctx.status(&err.status_line());

        if !self.battle.status.is_terminal() {
            if let Err(e) = self.battle.transition(BattleStatus::Failed) {
                warn!(battle_id = %self.battle.id, "Failed transition rejected: {e}");
            }
        }
        let reason = err.to_string();
        self.persist(Some(reason.clone()));
        self.twin.cleanup().await;
        self.finish_monitor();

        let summary = BattleSummary::new(&self.battle, &self.snapshot(), reason);
        self.ctx.status(&summary.summary_line());
        summary
    }
}
