//! # procsup library
//!
//! Supervision engine for a declared set of long-running commands: per-service
//! state machine, restart budgets, signal fan-out and a line-based control
//! socket, all multiplexed on a single-threaded cooperative event loop.
//! The `procsup` binary is a thin wrapper around this library.

pub mod cli;
pub mod config;
pub mod control;
pub mod event;
pub mod logging;
pub mod supervisor;
