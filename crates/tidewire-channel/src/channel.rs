//! A live connection to one peer.
//!
//! A [`Channel`] owns both halves of a TCP stream. Writes go through a
//! single async mutex so frames never interleave. One receive loop per
//! channel reads frames, completes pending commands with their answers and
//! hands inbound commands and events to the dispatcher on the channel's
//! executor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tidewire_protocol::{
    CLOSE_CONNECTION, Category, CloseConnection, ContentRegistry, Envelope, FrameReader,
    FrameWriter, ProtocolError,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{OwnedSemaphorePermit, watch};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, ChannelResult};
use crate::executor::Executor;
use crate::pending::{AnswerReceiver, PendingTable};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type DisconnectListener = Box<dyn FnOnce(SocketAddr) + Send>;

struct Inner {
    id: u64,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    pending: PendingTable,
    writer: tokio::sync::Mutex<Option<FrameWriter<OwnedWriteHalf>>>,
    /// Taken by `start`.
    reader: Mutex<Option<FrameReader<OwnedReadHalf>>>,
    closed: watch::Sender<bool>,
    close_reason: Mutex<Option<String>>,
    disconnect_listeners: Mutex<Vec<DisconnectListener>>,
    config: ChannelConfig,
    executor: Arc<dyn Executor>,
    /// Server connection slot, released on close.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

/// Bidirectional message channel over one TCP connection.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    /// Wraps a connected stream. Call [`Channel::start`] once handlers are
    /// registered.
    pub fn new(
        stream: TcpStream,
        dispatcher: Arc<Dispatcher>,
        config: ChannelConfig,
        executor: Arc<dyn Executor>,
    ) -> ChannelResult<Self> {
        Self::with_permit(stream, dispatcher, config, executor, None)
    }

    pub(crate) fn with_permit(
        stream: TcpStream,
        dispatcher: Arc<Dispatcher>,
        config: ChannelConfig,
        executor: Arc<dyn Executor>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> ChannelResult<Self> {
        let peer = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);

        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(channel_id = id, %peer, "Channel created");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                peer,
                dispatcher,
                pending: PendingTable::new(),
                writer: tokio::sync::Mutex::new(Some(FrameWriter::new(write_half))),
                reader: Mutex::new(Some(FrameReader::new(read_half))),
                closed,
                close_reason: Mutex::new(None),
                disconnect_listeners: Mutex::new(Vec::new()),
                config,
                executor,
                permit: Mutex::new(permit),
            }),
        })
    }

    /// Process-unique channel id, used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Content registry shared with the dispatcher.
    pub fn registry(&self) -> &Arc<ContentRegistry> {
        self.inner.dispatcher.registry()
    }

    /// Handlers for inbound commands and events.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Returns true once the channel has been torn down.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Number of commands waiting for an answer.
    pub fn pending_commands(&self) -> usize {
        self.inner.pending.len()
    }

    /// Starts the receive loop. Calling it again is a no-op.
    ///
    /// The loop runs on its own tokio task for the life of the channel;
    /// only handler work goes to the channel's executor, so a
    /// [`SerialExecutor`](crate::SerialExecutor) is never occupied by it.
    pub fn start(&self) {
        let Some(reader) = lock(&self.inner.reader).take() else {
            debug!(channel_id = self.inner.id, "Receive loop already started");
            return;
        };
        if self.is_closed() {
            return;
        }
        tokio::spawn(self.clone().receive_loop(reader));
    }

    /// Completes when the channel is closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.inner.closed.subscribe()).await;
    }

    /// Registers a callback fired once, after the channel closes.
    ///
    /// Fires immediately if the channel is already closed.
    pub fn on_disconnect(&self, listener: impl FnOnce(SocketAddr) + Send + 'static) {
        let mut listeners = lock(&self.inner.disconnect_listeners);
        if self.is_closed() {
            drop(listeners);
            listener(self.inner.peer);
        } else {
            listeners.push(Box::new(listener));
        }
    }

    /// Writes one envelope.
    pub async fn send(&self, envelope: Envelope) -> ChannelResult<()> {
        let record = serde_json::to_vec(&envelope).map_err(ProtocolError::from)?;

        let write_result = {
            let mut writer = self.inner.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(self.closed_error());
            };
            writer.write_frame(&record).await
        };

        match write_result {
            Ok(()) => {
                debug!(
                    channel_id = self.inner.id,
                    category = ?envelope.category,
                    type_id = %envelope.type_id,
                    correlation_id = ?envelope.correlation_id,
                    "Sent message"
                );
                Ok(())
            }
            Err(e) if e.is_framing() => Err(e.into()),
            Err(e) => {
                warn!(channel_id = self.inner.id, error = %e, "Write failed, closing channel");
                self.shutdown(format!("write failed: {e}")).await;
                Err(e.into())
            }
        }
    }

    /// Sends a command and returns a handle to its answer.
    ///
    /// The correlation id is assigned here; any id already on the envelope
    /// is replaced.
    pub async fn send_command(&self, mut envelope: Envelope) -> ChannelResult<PendingAnswer> {
        if !envelope.is_command() {
            return Err(ChannelError::descriptor(format!(
                "{} is not a command",
                envelope.type_id
            )));
        }

        let (id, rx) = self.inner.pending.register(&envelope.type_id)?;
        envelope.correlation_id = Some(id);
        let pending = PendingAnswer {
            id,
            type_id: envelope.type_id.clone(),
            timeout: self.inner.config.command_timeout,
            rx,
            inner: Arc::clone(&self.inner),
        };

        // On failure `pending` is dropped, which removes the entry.
        self.send(envelope).await?;
        Ok(pending)
    }

    /// Closes the channel.
    ///
    /// Fails every pending command with `ConnectionClosed`. Idempotent.
    pub async fn close(&self) {
        self.shutdown("closed locally".to_string()).await;
    }

    /// Asks the peer to close, waits for its acknowledgement, then closes.
    ///
    /// Pending commands on both sides fail with the reason
    /// `"<code>: <description>"`.
    pub async fn close_with_reason(&self, code: i32, description: &str) -> ChannelResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let reason = format!("{code}: {description}");
        lock(&self.inner.close_reason).get_or_insert_with(|| reason.clone());

        let content = CloseConnection {
            code,
            description: description.to_string(),
        };
        let payload = self.registry().encode(&content)?;
        match self
            .send_command(Envelope::command(CLOSE_CONNECTION, None, payload))
            .await
        {
            Ok(pending) => {
                match tokio::time::timeout(self.inner.config.close_timeout, pending.wait()).await {
                    Ok(Ok(_)) => debug!(channel_id = self.inner.id, "Peer acknowledged close"),
                    Ok(Err(e)) => debug!(channel_id = self.inner.id, error = %e, "Close not acknowledged"),
                    Err(_) => warn!(
                        channel_id = self.inner.id,
                        timeout = ?self.inner.config.close_timeout,
                        "Peer did not acknowledge close in time"
                    ),
                }
            }
            Err(e) => debug!(channel_id = self.inner.id, error = %e, "Failed to send close request"),
        }

        self.shutdown(reason).await;
        Ok(())
    }

    fn closed_error(&self) -> ChannelError {
        let reason = lock(&self.inner.close_reason)
            .clone()
            .unwrap_or_else(|| "channel is closed".to_string());
        ChannelError::closed(reason)
    }

    async fn shutdown(&self, reason: String) {
        if self.inner.closed.send_replace(true) {
            return;
        }

        let reason = lock(&self.inner.close_reason)
            .get_or_insert(reason)
            .clone();
        let failed = self
            .inner
            .pending
            .fail_all(ChannelError::closed(reason.clone()));

        if let Some(mut writer) = self.inner.writer.lock().await.take()
            && let Err(e) = writer.shutdown().await
        {
            debug!(channel_id = self.inner.id, error = %e, "Socket shutdown failed");
        }
        lock(&self.inner.reader).take();
        lock(&self.inner.permit).take();

        info!(
            channel_id = self.inner.id,
            peer = %self.inner.peer,
            %reason,
            failed_commands = failed,
            "Channel closed"
        );

        let listeners = std::mem::take(&mut *lock(&self.inner.disconnect_listeners));
        for listener in listeners {
            listener(self.inner.peer);
        }
    }

    async fn receive_loop(self, mut reader: FrameReader<OwnedReadHalf>) {
        let mut closed = self.inner.closed.subscribe();
        debug!(channel_id = self.inner.id, peer = %self.inner.peer, "Receive loop started");

        let reason = loop {
            let frame = tokio::select! {
                () = wait_closed(&mut closed) => break None,
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(Some(record)) => {
                    if let Some(reason) = self.handle_record(&record).await {
                        break Some(reason);
                    }
                }
                Ok(None) => break Some("connection closed by peer".to_string()),
                Err(e) if e.is_framing() => {
                    warn!(channel_id = self.inner.id, error = %e, "Framing error, closing channel");
                    break Some(format!("framing error: {e}"));
                }
                Err(e) => break Some(format!("read failed: {e}")),
            }
        };

        drop(reader);
        if let Some(reason) = reason {
            self.shutdown(reason).await;
        }
        debug!(channel_id = self.inner.id, "Receive loop stopped");
    }

    /// Handles one inbound record. Returns a close reason when the channel
    /// must stop.
    async fn handle_record(&self, record: &[u8]) -> Option<String> {
        let envelope: Envelope = match serde_json::from_slice(record) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel_id = self.inner.id, error = %e, "Dropping undecodable message");
                return None;
            }
        };

        match envelope.category {
            Category::Answer => {
                self.complete_answer(envelope);
                None
            }
            Category::Command if envelope.type_id == CLOSE_CONNECTION => {
                Some(self.answer_close_request(envelope).await)
            }
            Category::Command if envelope.correlation_id.is_none() => {
                warn!(
                    channel_id = self.inner.id,
                    type_id = %envelope.type_id,
                    "Dropping command without correlation id"
                );
                None
            }
            Category::Command | Category::Event => {
                self.dispatch(envelope);
                None
            }
        }
    }

    fn complete_answer(&self, envelope: Envelope) {
        let Some(id) = envelope.correlation_id else {
            warn!(channel_id = self.inner.id, type_id = %envelope.type_id, "Answer without correlation id");
            return;
        };
        if let Some(expected) = self.inner.pending.type_id_of(id)
            && expected != envelope.type_id
        {
            warn!(
                channel_id = self.inner.id,
                correlation_id = id,
                %expected,
                type_id = %envelope.type_id,
                "Answer type does not match its command"
            );
        }
        if !self.inner.pending.complete(id, Ok(envelope)) {
            debug!(
                channel_id = self.inner.id,
                correlation_id = id,
                "Dropping answer for unknown correlation id"
            );
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let channel = self.clone();
        let task: BoxFuture<'static, ()> = async move {
            let Some(answer) = channel.inner.dispatcher.dispatch(envelope).await else {
                return;
            };
            if let Err(e) = channel.send(answer).await {
                debug!(channel_id = channel.inner.id, error = %e, "Failed to send answer");
            }
        }
        .boxed();
        self.inner.executor.execute(task);
    }

    async fn answer_close_request(&self, request: Envelope) -> String {
        let content: CloseConnection = self
            .registry()
            .decode(Category::Command, CLOSE_CONNECTION, request.payload.clone())
            .unwrap_or_else(|e| {
                warn!(channel_id = self.inner.id, error = %e, "Malformed close request");
                CloseConnection::default()
            });
        info!(
            channel_id = self.inner.id,
            code = content.code,
            description = %content.description,
            "Peer requested close"
        );

        if let Err(e) = self.send(Envelope::answer_to(&request, Value::Null)).await {
            debug!(channel_id = self.inner.id, error = %e, "Failed to acknowledge close");
        }
        format!("{}: {}", content.code, content.description)
    }
}

/// Handle to the answer of one command.
///
/// Dropping it before the answer arrives forgets the command; a late answer
/// is then dropped by the receive loop.
pub struct PendingAnswer {
    id: u64,
    type_id: String,
    timeout: Option<Duration>,
    rx: AnswerReceiver,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PendingAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAnswer")
            .field("correlation_id", &self.id)
            .field("type_id", &self.type_id)
            .finish()
    }
}

impl PendingAnswer {
    /// Correlation id assigned to the command.
    pub fn correlation_id(&self) -> u64 {
        self.id
    }

    /// Waits for the answer envelope.
    ///
    /// Failed answers become [`ChannelError::Remote`].
    pub async fn wait(mut self) -> ChannelResult<Envelope> {
        let received = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(correlation_id = self.id, type_id = %self.type_id, "Command timed out");
                    return Err(ChannelError::Timeout {
                        type_id: self.type_id.clone(),
                        timeout,
                    });
                }
            },
            None => (&mut self.rx).await,
        };

        let envelope = received.map_err(|_| ChannelError::closed("answer was never delivered"))??;
        match envelope.error_payload() {
            Some(error) => Err(ChannelError::Remote(error)),
            None => Ok(envelope),
        }
    }
}

impl Drop for PendingAnswer {
    fn drop(&mut self) {
        self.inner.pending.remove(self.id);
    }
}

pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // The sender lives as long as the channel; an error means it is gone.
    let _ = closed.wait_for(|closed| *closed).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
