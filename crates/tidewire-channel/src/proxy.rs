//! Typed calls against a [`ServiceDescriptor`].

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tidewire_protocol::{Category, ContentRegistry, Envelope};
use tracing::debug;

use crate::channel::Channel;
use crate::descriptor::{MethodDescriptor, MethodKind, ServiceDescriptor};
use crate::error::{ChannelError, ChannelResult};

/// Something envelopes can be sent through.
///
/// Implemented by [`Channel`] and [`ClientChannel`](crate::ClientChannel),
/// so a proxy can be bound to a single connection or to a reconnecting
/// client.
pub trait MessageChannel: Send + Sync {
    /// Registry used to encode and decode contents.
    fn registry(&self) -> Arc<ContentRegistry>;

    /// Writes a one-way envelope.
    fn send_event(&self, envelope: Envelope) -> BoxFuture<'_, ChannelResult<()>>;

    /// Sends a command and waits for its answer.
    fn request(&self, envelope: Envelope) -> BoxFuture<'_, ChannelResult<Envelope>>;
}

impl MessageChannel for Channel {
    fn registry(&self) -> Arc<ContentRegistry> {
        Arc::clone(Channel::registry(self))
    }

    fn send_event(&self, envelope: Envelope) -> BoxFuture<'_, ChannelResult<()>> {
        self.send(envelope).boxed()
    }

    fn request(&self, envelope: Envelope) -> BoxFuture<'_, ChannelResult<Envelope>> {
        async move { self.send_command(envelope).await?.wait().await }.boxed()
    }
}

/// Client-side stub for a service.
#[derive(Debug, Clone)]
pub struct ServiceProxy<C> {
    descriptor: Arc<ServiceDescriptor>,
    channel: C,
}

impl<C: MessageChannel> ServiceProxy<C> {
    /// Binds a descriptor to a channel.
    pub fn new(descriptor: Arc<ServiceDescriptor>, channel: C) -> Self {
        Self {
            descriptor,
            channel,
        }
    }

    /// The bound descriptor.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Calls a command method and waits for its typed answer.
    ///
    /// If the answer shape has a `tag` field, it is set from the answer
    /// envelope's tag before decoding.
    pub async fn command<Req, Res>(
        &self,
        method: &str,
        tag: Option<i64>,
        content: &Req,
    ) -> ChannelResult<Res>
    where
        Req: Serialize + 'static,
        Res: DeserializeOwned + 'static,
    {
        let method = self.method(method)?;
        method.check_call::<Req>(MethodKind::Command, tag)?;
        method.check_answer::<Res>()?;

        let registry = self.channel.registry();
        let payload = registry.encode(content)?;
        let answer = self
            .channel
            .request(Envelope::command(method.type_id(), tag, payload))
            .await?;

        let mut payload = answer.payload;
        registry.apply_tag(
            Category::Answer,
            method.type_id(),
            &mut payload,
            answer.tag,
            true,
        );
        Ok(registry.decode(Category::Answer, method.type_id(), payload)?)
    }

    /// Fires an event method. Returns once the event is written.
    pub async fn event<Req>(&self, method: &str, tag: Option<i64>, content: &Req) -> ChannelResult<()>
    where
        Req: Serialize + 'static,
    {
        let method = self.method(method)?;
        method.check_call::<Req>(MethodKind::Event, tag)?;

        let payload = self.channel.registry().encode(content)?;
        self.channel
            .send_event(Envelope::event(method.type_id(), tag, payload))
            .await
    }

    fn method(&self, name: &str) -> ChannelResult<&MethodDescriptor> {
        self.descriptor.method(name).ok_or_else(|| {
            debug!(service = %self.descriptor.name(), method = name, "Unknown method");
            ChannelError::descriptor(format!(
                "service {} has no method {name}",
                self.descriptor.name()
            ))
        })
    }
}
