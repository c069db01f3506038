//! Command-line interface for relayq.
//!
//! Provides producer, operator, and worker commands over one Redis store.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
