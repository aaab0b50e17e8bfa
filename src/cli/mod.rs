//! # CLI Module
//!
//! Command-line entry points for the `corouter` binary.
//!
//! ## Commands
//!
//! ### `demo`
//!
//! Builds a router with a suspending `/delay` route, a controller-method
//! route and a failing route, drives a few requests through it and prints
//! each response:
//!
//! ```bash
//! corouter demo --delay-ms 100 --requests 3
//! ```
//!
//! ### `config`
//!
//! Prints the effective runtime configuration (defaults, optional YAML file,
//! then `COROUTER_*` overrides) as YAML.

mod commands;

pub use commands::{demo_router, run_cli, Cli, Commands};
