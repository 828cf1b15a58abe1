//! Outbound connection with optional reconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tidewire_protocol::{ContentRegistry, Envelope};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{Channel, wait_closed};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, ChannelResult};
use crate::executor::{self, Executor};
use crate::proxy::MessageChannel;

type ConnectListener = Arc<dyn Fn(&Channel) + Send + Sync>;

struct ClientInner {
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<dyn Executor>,
    current: Mutex<Option<Channel>>,
    connect_listeners: Mutex<Vec<ConnectListener>>,
    supervising: AtomicBool,
    closing: watch::Sender<bool>,
    /// Serializes connection attempts.
    connecting: tokio::sync::Mutex<()>,
}

/// Client side of a connection.
///
/// Handlers registered on [`ClientChannel::dispatcher`] survive
/// reconnections. Cheap to clone.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("address", &self.inner.config.address)
            .field("connected", &self.channel().is_ok())
            .finish()
    }
}

impl ClientChannel {
    /// Creates a client. Nothing is connected until [`ClientChannel::connect`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(config: ClientConfig, registry: Arc<ContentRegistry>) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                dispatcher: Arc::new(Dispatcher::new(registry)),
                executor: executor::current(),
                current: Mutex::new(None),
                connect_listeners: Mutex::new(Vec::new()),
                supervising: AtomicBool::new(false),
                closing,
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Runs handler work on `executor`. Must be called before the client is
    /// cloned.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.executor = executor;
        } else {
            warn!("Client already shared, keeping its executor");
        }
        self
    }

    /// Handlers for commands and events sent by the server.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Registers a callback fired on every successful connection, before the
    /// channel starts receiving.
    pub fn on_connect(&self, listener: impl Fn(&Channel) + Send + Sync + 'static) {
        lock(&self.inner.connect_listeners).push(Arc::new(listener));
    }

    /// Connects to the configured address.
    ///
    /// Returns the live channel if already connected. A failed attempt is
    /// returned to the caller and not retried; the reconnect policy only
    /// applies after a connection has been established.
    pub async fn connect(&self) -> ChannelResult<Channel> {
        let channel = self.inner.connect_once().await?;

        if let Some(policy) = self.inner.config.reconnect
            && !self.inner.supervising.swap(true, Ordering::SeqCst)
        {
            tokio::spawn(supervise(Arc::clone(&self.inner), policy));
        }
        Ok(channel)
    }

    /// Returns the live channel.
    pub fn channel(&self) -> ChannelResult<Channel> {
        self.inner.live().ok_or(ChannelError::NotConnected)
    }

    /// Stops reconnecting and closes the current channel.
    pub async fn close(&self) {
        self.inner.closing.send_replace(true);
        let current = lock(&self.inner.current).take();
        if let Some(channel) = current {
            channel.close().await;
        }
    }
}

impl ClientInner {
    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    fn live(&self) -> Option<Channel> {
        lock(&self.current)
            .as_ref()
            .filter(|channel| !channel.is_closed())
            .cloned()
    }

    /// Returns the live channel or establishes a new one. Attempts never
    /// overlap, so at most one channel is open per client.
    async fn connect_once(&self) -> ChannelResult<Channel> {
        let _connecting = self.connecting.lock().await;
        if self.is_closing() {
            return Err(ChannelError::closed("client is closed"));
        }
        if let Some(channel) = self.live() {
            return Ok(channel);
        }
        self.establish().await
    }

    async fn establish(&self) -> ChannelResult<Channel> {
        let address = &self.config.address;
        let timeout = self.config.connect_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ChannelError::Connect {
                    address: address.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ChannelError::Connect {
                    address: address.clone(),
                    message: format!("timed out after {timeout:?}"),
                });
            }
        };

        let channel = Channel::new(
            stream,
            Arc::clone(&self.dispatcher),
            self.config.channel.clone(),
            Arc::clone(&self.executor),
        )?;

        let listeners = lock(&self.connect_listeners).clone();
        for listener in listeners {
            listener(&channel);
        }
        channel.start();

        // `close` raises `closing` before taking `current`, so checking it
        // under the same lock never leaves a channel behind.
        let installed = {
            let mut current = lock(&self.current);
            if self.is_closing() {
                false
            } else {
                *current = Some(channel.clone());
                true
            }
        };
        if !installed {
            debug!(channel_id = channel.id(), "Client closed while connecting");
            channel.close().await;
            return Err(ChannelError::closed("client is closed"));
        }

        info!(channel_id = channel.id(), peer = %channel.peer_addr(), "Connected");
        Ok(channel)
    }

    fn current(&self) -> Option<Channel> {
        lock(&self.current).clone()
    }
}

async fn supervise(inner: Arc<ClientInner>, policy: ReconnectPolicy) {
    let mut closing = inner.closing.subscribe();

    while let Some(channel) = inner.current() {
        tokio::select! {
            () = wait_closed(&mut closing) => break,
            () = channel.closed() => {}
        }

        let mut delay = policy.initial_backoff;
        loop {
            warn!(address = %inner.config.address, ?delay, "Connection lost, reconnecting");
            tokio::select! {
                () = wait_closed(&mut closing) => return,
                () = tokio::time::sleep(delay) => {}
            }

            match inner.connect_once().await {
                Ok(_) => break,
                Err(e) => {
                    debug!(error = %e, "Reconnect attempt failed");
                    delay = policy.next_backoff(delay);
                }
            }
        }
    }
    debug!("Reconnect supervisor stopped");
}

impl MessageChannel for ClientChannel {
    fn registry(&self) -> Arc<ContentRegistry> {
        Arc::clone(self.inner.dispatcher.registry())
    }

    fn send_event(&self, envelope: Envelope) -> BoxFuture<'_, ChannelResult<()>> {
        async move { self.channel()?.send(envelope).await }.boxed()
    }

    fn request(&self, envelope: Envelope) -> BoxFuture<'_, ChannelResult<Envelope>> {
        async move { self.channel()?.send_command(envelope).await?.wait().await }.boxed()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn connect_failure_is_reported() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = ClientChannel::new(
            ClientConfig::new(address.clone()).with_connect_timeout(Duration::from_secs(2)),
            Arc::new(ContentRegistry::new()),
        );
        let err = client.connect().await.unwrap_err();
        assert!(
            matches!(err, ChannelError::Connect { address: ref a, .. } if *a == address),
            "{err}"
        );
        assert!(matches!(client.channel(), Err(ChannelError::NotConnected)));
    }

    #[tokio::test]
    async fn closed_client_refuses_to_connect() {
        let client = ClientChannel::new(ClientConfig::default(), Arc::new(ContentRegistry::new()));
        client.close().await;
        let err = client.connect().await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn requests_without_connection_fail() {
        let client = ClientChannel::new(ClientConfig::default(), Arc::new(ContentRegistry::new()));
        let err = client
            .request(Envelope::command("echo", None, serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
    }
}
