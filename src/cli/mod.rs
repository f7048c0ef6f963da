//! Command-line surface of the `pool` binary.
//!
//! Every invocation rebuilds a [`PoolManager`](crate::manager::PoolManager)
//! from the descriptors in `--state-dir`, runs one command and drains the
//! pools again.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
