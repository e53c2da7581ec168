//! Declarative system rules evaluated against a virtual filesystem.
//!
//! Rules never touch the real filesystem while they run. Their writes land
//! in an overlay of pending layers that is merged on read, committed only
//! when the rule passes, and recorded as a revert batch so the change can be
//! undone.
//!
//! The public API is organised into these layers:
//!
//! - **[`overlay`]**: pending layers per path and the merge algorithm
//! - **[`apply`]**: committing the overlay, revert batches and environments
//! - **[`rules`]**: collection resolution and rule evaluation
//! - **[`system`]**: daemon and package queries offered to scripts
//! - **[`commands`]**: top-level subcommand orchestration
#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

pub mod apply;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod overlay;
pub mod rules;
pub mod session;
pub mod system;

pub use error::SpitoError;
pub use session::Session;
