//! tidewire CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use tidewire_cli::cli::{Cli, Command, ConfigAction};
use tidewire_cli::commands::{self, serve::ServeOptions};
use tidewire_cli::config::Settings;
use tidewire_cli::error::CliResult;
use tidewire_cli::logging::{LogConfig, init_logging};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let mut log_config = if cli.debug {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    log_config = log_config.with_format(cli.log_format.unwrap_or(settings.log.format));
    if let Some(filter) = &settings.log.filter {
        log_config = log_config.with_filter(filter.clone());
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, settings: Settings) -> CliResult<()> {
    match cli.command {
        Command::Serve {
            bind,
            max_connections,
            serial,
        } => {
            let options = ServeOptions {
                bind,
                max_connections,
                serial,
            };
            commands::serve::run(&settings, &options).await
        }
        Command::Call(args) => commands::message::call(&settings, &args).await,
        Command::Notify(args) => commands::message::notify(&settings, &args).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&settings, cli.config.as_deref()),
            ConfigAction::Validate => commands::config::validate(&settings),
        },
    }
}
