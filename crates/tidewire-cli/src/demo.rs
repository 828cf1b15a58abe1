//! The echo service used by `serve`, `call` and `notify`.

use serde::{Deserialize, Serialize};
use tidewire_channel::{ChannelResult, Dispatcher, ServiceDescriptor, TagParam};
use tidewire_protocol::ContentRegistry;
use tracing::info;

/// Service name.
pub const SERVICE: &str = "echo";
/// Echo command type id.
pub const ECHO: &str = "echo";
/// Notify event type id.
pub const NOTIFY: &str = "notify";
/// Constant the echo handler puts in every reply.
pub const QUX: i32 = 456;

/// Echo command content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub foo: String,
    pub bar: i32,
}

/// Echo answer. `tag` mirrors the command's tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoReply {
    pub foo: String,
    pub qux: i32,
    pub tag: Option<i64>,
}

/// Notify event content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub foo: String,
    pub bar: i32,
}

/// Describes the echo service for proxies.
pub fn service(registry: &ContentRegistry) -> ChannelResult<ServiceDescriptor> {
    ServiceDescriptor::builder(SERVICE)
        .command::<EchoRequest, EchoReply>(ECHO, ECHO, TagParam::Declared)
        .event::<Notice>(NOTIFY, NOTIFY, TagParam::Declared)
        .build(registry)
}

/// Registers the echo service handlers.
pub fn register_handlers(dispatcher: &Dispatcher) -> ChannelResult<()> {
    dispatcher.on_command(ECHO, |tag, request: EchoRequest| async move {
        info!(?tag, foo = %request.foo, bar = request.bar, "Echo");
        Ok(EchoReply {
            foo: request.foo,
            qux: QUX,
            tag: None,
        })
    })?;
    dispatcher.on_event(NOTIFY, |tag, notice: Notice| async move {
        info!(?tag, foo = %notice.foo, bar = notice.bar, "Received notice");
        Ok(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidewire_channel::{ClientChannel, ClientConfig, ServerChannel, ServerConfig, ServiceProxy};

    #[tokio::test]
    async fn echo_round_trip() {
        let server = ServerChannel::bind(
            ServerConfig::new("127.0.0.1:0"),
            Arc::new(ContentRegistry::new()),
        )
        .await
        .unwrap();
        server
            .listen(|channel| register_handlers(channel.dispatcher()).unwrap())
            .unwrap();

        let registry = Arc::new(ContentRegistry::new());
        let descriptor = Arc::new(service(&registry).unwrap());
        let client = ClientChannel::new(
            ClientConfig::new(server.local_addr().to_string()),
            registry,
        );
        client.connect().await.unwrap();
        let proxy = ServiceProxy::new(descriptor, client.clone());

        let reply: EchoReply = proxy
            .command(
                ECHO,
                Some(42),
                &EchoRequest {
                    foo: "x".into(),
                    bar: 123,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            EchoReply {
                foo: "x".into(),
                qux: QUX,
                tag: Some(42)
            }
        );

        proxy
            .event(
                NOTIFY,
                Some(321),
                &Notice {
                    foo: "e".into(),
                    bar: 200,
                },
            )
            .await
            .unwrap();
        client.close().await;
    }

    #[test]
    fn reply_wire_form() {
        let reply = EchoReply {
            foo: "x".into(),
            qux: QUX,
            tag: None,
        };
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"foo":"x","qux":456,"tag":null}"#
        );
    }
}
