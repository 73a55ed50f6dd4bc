//! Command-line interface for inferelay.
//!
//! Provides commands for batch submission, endpoint health inspection,
//! retry queue management, and connection probing.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
