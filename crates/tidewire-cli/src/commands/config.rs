//! Configuration commands.

use std::path::Path;

use crate::config::Settings;
use crate::error::CliResult;

/// Prints the effective configuration as TOML.
pub fn dump(settings: &Settings, path: Option<&Path>) -> CliResult<()> {
    let text = settings.to_toml()?;
    match path {
        Some(path) => println!("# {}", path.display()),
        None => println!("# defaults (no --config given)"),
    }
    println!("{text}");
    Ok(())
}

/// Validates the configuration. Loading already parsed and checked it.
pub fn validate(settings: &Settings) -> CliResult<()> {
    // Addresses are only resolved on use; catch obvious typos here.
    for (key, address) in [
        ("server.bind_address", &settings.server.bind_address),
        ("client.address", &settings.client.address),
    ] {
        if address.rsplit_once(':').is_none_or(|(_, port)| port.parse::<u16>().is_err()) {
            println!("warning: {key} `{address}` has no valid port");
        }
    }
    println!("Configuration is valid.");
    Ok(())
}
