//! Command-line interface for redjob.
//!
//! Provides operator commands for checking connectivity, inspecting queue
//! statistics and dead letters, recovering abandoned leases, dispatching
//! payloads and serving the health endpoint.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, StoreArgs};
