//! Battle Agents
//!
//! Subprocess adapters that plug external attack/defense tooling into the
//! battle engine, plus the `battle-agents` runner.
//!
//! The engine never decides what to attack or how to patch; whatever command
//! the operator configures does. See [`command`] for the child-process
//! contract.

pub mod cli;
pub mod command;

pub use command::{AgentCommand, CommandAttacker, CommandDefender};
