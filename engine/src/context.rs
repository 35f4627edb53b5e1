//! Explicit per-battle context handed to every component constructor.

use std::sync::{Arc, Mutex, PoisonError};

/// Sink for human-readable status lines.
pub trait Console: Send + Sync {
    fn status(&self, line: &str);
}

/// Forwards status lines to `tracing`.
pub struct TracingConsole;

impl Console for TracingConsole {
    fn status(&self, line: &str) {
        tracing::info!(target: "battle::console", "{line}");
    }
}

/// Collects status lines in memory.
#[derive(Default)]
pub struct BufferConsole {
    lines: Mutex<Vec<String>>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Console for BufferConsole {
    fn status(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }
}

/// Battle identity plus the console every component reports through.
#[derive(Clone)]
pub struct BattleContext {
    pub battle_id: String,
    console: Arc<dyn Console>,
}

impl BattleContext {
    pub fn new(battle_id: &str, console: Arc<dyn Console>) -> Self {
        Self {
            battle_id: battle_id.to_string(),
            console,
        }
    }

    /// Context that logs through `tracing`.
    pub fn with_tracing(battle_id: &str) -> Self {
        Self::new(battle_id, Arc::new(TracingConsole))
    }

    /// Fresh battle id: `battle-<yyyymmdd-hhmmss>-<8 hex>`.
    pub fn generate_id() -> String {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("battle-{stamp}-{}", &suffix[..8])
    }

    pub fn status(&self, line: &str) {
        self.console.status(line);
    }
}

impl std::fmt::Debug for BattleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BattleContext")
            .field("battle_id", &self.battle_id)
            .finish_non_exhaustive()
    }
}
