//! Command-line interface for reconforge.
//!
//! Provides the single `reconforge <dataset>` entry point and its
//! environment-backed options.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
