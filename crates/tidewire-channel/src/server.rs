//! TCP listener producing one [`Channel`] per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tidewire_protocol::ContentRegistry;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, wait_closed};
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, ChannelResult};
use crate::executor::{self, Executor};

/// Accepts peers and hands each one out as a [`Channel`].
pub struct ServerChannel {
    config: ServerConfig,
    registry: Arc<ContentRegistry>,
    executor: Arc<dyn Executor>,
    local_addr: SocketAddr,
    /// Taken by `listen`.
    listener: std::sync::Mutex<Option<TcpListener>>,
    connection_semaphore: Arc<Semaphore>,
    listening: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerChannel")
            .field("local_addr", &self.local_addr)
            .field("max_connections", &self.config.max_connections)
            .finish()
    }
}

impl ServerChannel {
    /// Binds the listening socket. On success the port accepts connections.
    pub async fn bind(config: ServerConfig, registry: Arc<ContentRegistry>) -> ChannelResult<Self> {
        let listener = TcpListener::bind(&config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            executor: executor::current(),
            local_addr,
            listener: std::sync::Mutex::new(Some(listener)),
            connection_semaphore,
            listening: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Runs handler work for accepted channels on `executor`.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections.
    ///
    /// `on_connect` runs for every new channel before its receive loop
    /// starts; register handlers there.
    ///
    /// The accept loop, and `on_connect` with it, runs on its own tokio
    /// task. The server's executor only runs handler work, which keeps a
    /// serial executor free to serve every accepted channel.
    pub fn listen<F>(&self, on_connect: F) -> ChannelResult<()>
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyListening);
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(ChannelError::AlreadyListening)?;

        let acceptor = Acceptor {
            listener,
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            executor: Arc::clone(&self.executor),
            connection_semaphore: Arc::clone(&self.connection_semaphore),
            on_connect: Box::new(on_connect),
        };
        tokio::spawn(acceptor.run(self.shutdown.subscribe()));
        Ok(())
    }

    /// Stops accepting. Channels already handed out stay open.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            info!(address = %self.local_addr, "Server stopped accepting");
        }
        // Drop the listener if `listen` was never called.
        self.listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct Acceptor {
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<ContentRegistry>,
    executor: Arc<dyn Executor>,
    connection_semaphore: Arc<Semaphore>,
    on_connect: Box<dyn Fn(&Channel) + Send + Sync>,
}

impl Acceptor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                () = wait_closed(&mut shutdown) => break,
                accepted = self.accept() => match accepted {
                    Ok((stream, permit)) => self.open(stream, permit),
                    Err(e) => {
                        // Continue accepting despite errors
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
        debug!("Accept loop stopped");
    }

    async fn accept(&self) -> ChannelResult<(TcpStream, OwnedSemaphorePermit)> {
        let permit = Arc::clone(&self.connection_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ChannelError::closed("server is shutting down"))?;
        let (stream, addr) = self.listener.accept().await?;
        debug!(peer = %addr, "Accepted new connection");
        Ok((stream, permit))
    }

    fn open(&self, stream: TcpStream, permit: OwnedSemaphorePermit) {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&self.registry)));
        let channel = match Channel::with_permit(
            stream,
            dispatcher,
            self.config.channel.clone(),
            Arc::clone(&self.executor),
            Some(permit),
        ) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Dropping connection");
                return;
            }
        };

        (self.on_connect)(&channel);
        channel.start();
    }
}
