//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::LogFormat;

/// tidewire - commands and events over a persistent TCP channel
#[derive(Debug, Parser)]
#[command(name = "tidewire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "TIDEWIRE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, value_enum, env = "TIDEWIRE_LOG_FORMAT", global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the echo service until interrupted
    Serve {
        /// Address to bind, host:port
        #[arg(long, env = "TIDEWIRE_BIND")]
        bind: Option<String>,

        /// Maximum concurrent connections
        #[arg(long)]
        max_connections: Option<usize>,

        /// Run handlers one at a time, in arrival order
        #[arg(long)]
        serial: bool,
    },

    /// Send an echo command and print the answer
    Call(MessageArgs),

    /// Send a notify event
    Notify(MessageArgs),

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments shared by `call` and `notify`.
#[derive(Debug, Clone, Args)]
pub struct MessageArgs {
    /// Server address, host:port
    #[arg(long, short, env = "TIDEWIRE_ADDRESS")]
    pub address: Option<String>,

    /// Business tag carried with the message
    #[arg(long)]
    pub tag: Option<i64>,

    /// Text field of the message
    #[arg(long, default_value = "hello")]
    pub foo: String,

    /// Number field of the message
    #[arg(long, default_value_t = 0)]
    pub bar: i32,

    /// Seconds to wait for the answer
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Configuration subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Dump,
    /// Check the configuration file
    Validate,
}
