//! Serve command: runs the echo service in the foreground until SIGINT or
//! SIGTERM.

use std::sync::Arc;

use tidewire_channel::{SerialExecutor, ServerChannel};
use tidewire_protocol::ContentRegistry;
use tracing::{error, info};

use crate::config::Settings;
use crate::demo;
use crate::error::CliResult;

/// Options given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub bind: Option<String>,
    pub max_connections: Option<usize>,
    pub serial: bool,
}

/// Binds the echo service. Returns once the socket accepts connections.
pub async fn start(settings: &Settings, options: &ServeOptions) -> CliResult<ServerChannel> {
    let mut config = settings.server_config(options.bind.as_deref());
    if let Some(max) = options.max_connections {
        config = config.with_max_connections(max);
    }

    let registry = if settings.server.strict {
        ContentRegistry::strict()
    } else {
        ContentRegistry::new()
    };

    let mut server = ServerChannel::bind(config, Arc::new(registry)).await?;
    if options.serial {
        server = server.with_executor(Arc::new(SerialExecutor::new()));
    }

    server.listen(|channel| {
        if let Err(e) = demo::register_handlers(channel.dispatcher()) {
            error!(error = %e, "Failed to register echo handlers");
            return;
        }
        info!(channel_id = channel.id(), peer = %channel.peer_addr(), "Client connected");
        let channel_id = channel.id();
        channel.on_disconnect(move |peer| {
            info!(channel_id, %peer, "Client disconnected");
        });
    })?;

    info!(address = %server.local_addr(), serial = options.serial, "Echo service ready");
    Ok(server)
}

/// Runs the echo service until a shutdown signal arrives.
pub async fn run(settings: &Settings, options: &ServeOptions) -> CliResult<()> {
    let server = start(settings, options).await?;

    shutdown_signal().await?;
    info!("Shutting down...");
    server.close();

    info!("Server stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> CliResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> CliResult<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating shutdown");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_binds_requested_address() {
        let options = ServeOptions {
            bind: Some("127.0.0.1:0".into()),
            max_connections: Some(2),
            serial: true,
        };
        let server = start(&Settings::default(), &options).await.unwrap();
        assert!(server.local_addr().ip().is_loopback());
        assert_ne!(server.local_addr().port(), 0);
        server.close();
    }
}
