//! Battle error types
//!
//! One error enum for every engine operation. Component-local failures
//! (twin setup/sync, agent work) are usually converted into boolean or
//! empty-result signals at the call site; the variants here carry the
//! detail that gets logged on the way.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type BattleResult<T> = Result<T, BattleError>;

/// Errors that can occur while running a battle
#[derive(Error, Debug)]
pub enum BattleError {
    /// Digital twin could not be provisioned
    #[error("Twin setup failed ({backend}): {message}")]
    SetupFailed { backend: String, message: String },

    /// External command (git, docker) exited unsuccessfully
    #[error("Command failed: {operation} - {message}")]
    Command { operation: String, message: String },

    /// Defender changes could not be propagated to the arena
    #[error("Arena sync failed: {message}")]
    SyncFailed { message: String },

    /// State or checkpoint could not be written/read
    #[error("Persistence error at {path}: {message}")]
    Persistence { path: PathBuf, message: String },

    /// Agent call exceeded its time budget
    #[error("{role} timed out after {}s", timeout.as_secs())]
    AgentTimeout { role: String, timeout: Duration },

    /// Agent call returned an error or panicked
    #[error("{role} failed: {message}")]
    Agent { role: String, message: String },

    /// Status or twin state machine violation
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A round result arrived out of order
    #[error("Round {got} recorded out of order (expected {expected})")]
    RoundOutOfOrder { expected: u32, got: u32 },

    /// A finding or patch id was reused
    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    /// Persisted state failed integrity validation
    #[error("Corrupted battle state: {}", errors.join("; "))]
    Corrupted { errors: Vec<String> },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BattleError {
    /// Create a setup failure
    pub fn setup(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SetupFailed {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a command failure
    pub fn command(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a sync failure
    pub fn sync(message: impl Into<String>) -> Self {
        Self::SyncFailed {
            message: message.into(),
        }
    }

    /// Create a persistence failure
    pub fn persistence(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an agent failure
    pub fn agent(role: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Agent {
            role: role.into(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Command { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("index.lock")
                    || lower.contains("could not lock")
                    || lower.contains("another git process")
                    || lower.contains("unable to create")
                    || lower.contains("timeout")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Short human-readable status line for the console
    pub fn status_line(&self) -> String {
        match self {
            Self::SetupFailed { backend, .. } => {
                format!("Setup failure: could not build {backend} twin, battle aborted")
            }
            Self::AgentTimeout { role, timeout } => {
                format!("{role} timed out after {}s, treating as empty", timeout.as_secs())
            }
            Self::Agent { role, .. } => format!("{role} errored, treating as empty"),
            Self::SyncFailed { .. } => "Sync failure: arena left un-patched this round".into(),
            Self::Persistence { .. } => "Persistence failure: state not saved".into(),
            other => other.to_string(),
        }
    }
}
