//! `tidewire` command-line tool.
//!
//! Runs a demo echo service over tidewire channels and talks to it.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;
pub mod logging;

pub use cli::Cli;
pub use config::Settings;
pub use error::{CliError, CliResult};
