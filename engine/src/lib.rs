//! Battle Engine
//!
//! Round-based adversarial simulation: an attacker and a defender take turns
//! against an isolated copy of a target system, and the engine keeps score,
//! decides when to stop, and checkpoints progress for resume.
//!
//! # Components
//!
//! - [`twin`]: the digital twin, three isolated workspaces (attacker,
//!   defender, arena) on a git-worktree, copy, container, or emulator backend
//! - [`state`]: cumulative scores, findings, patches, and round history
//! - [`termination`]: null-production, round-budget, and convergence stops
//! - [`orchestrator`]: the round loop tying it all together
//! - [`persistence`] / [`monitor`]: state documents, checkpoints, heartbeat
//!
//! # Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use battle_engine::{Attacker, Defender, BattleConfig, BattleContext, BattleOrchestrator};
//! # async fn demo(attacker: Arc<dyn Attacker>, defender: Arc<dyn Defender>) -> battle_engine::BattleResult<()> {
//! let ctx = BattleContext::with_tracing(&BattleContext::generate_id());
//! let mut battle = BattleOrchestrator::new(ctx, BattleConfig::from_env()?, "./target", attacker, defender)?;
//! let summary = battle.run().await;
//! println!("{}", summary.summary_line());
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod persistence;
pub mod scoring;
pub mod state;
pub mod summary;
pub mod termination;
pub mod twin;
pub mod worker;

pub use agents::{Attacker, Defender, RoundContext};
pub use config::{BattleConfig, TwinOptions};
pub use context::{BattleContext, BufferConsole, Console, TracingConsole};
pub use error::{BattleError, BattleResult};
pub use model::{
    Battle, BattleMode, BattleStatus, FinalMetrics, Finding, Patch, Role, RoundResult, Severity,
    TwinBackend,
};
pub use monitor::{Heartbeat, HeartbeatMonitor, NullMonitor, ProgressMonitor};
pub use orchestrator::BattleOrchestrator;
pub use persistence::{BattleDocument, CheckpointRecord, StateStore};
pub use scoring::{Scorer, SeverityScorer};
pub use state::{BattleState, LivenessGuard, SharedBattleState, Winner};
pub use summary::BattleSummary;
pub use termination::{TerminationConfig, TerminationPolicy, TerminationReason};
pub use twin::{detect_backend, DigitalTwin, TwinDriver, TwinLayout, TwinPhase, Workspaces};
