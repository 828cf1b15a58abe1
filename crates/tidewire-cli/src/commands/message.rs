//! `call` and `notify`: one-shot clients of the echo service.

use std::sync::Arc;

use tidewire_channel::{ClientChannel, ServiceProxy};
use tidewire_protocol::ContentRegistry;
use tracing::debug;

use crate::cli::MessageArgs;
use crate::config::Settings;
use crate::demo::{self, EchoReply, EchoRequest, Notice};
use crate::error::{CliError, CliResult};

/// Close code sent when a one-shot client is done.
const CLIENT_DONE: i32 = 0;

async fn connect(settings: &Settings, args: &MessageArgs) -> CliResult<ServiceProxy<ClientChannel>> {
    let config = settings.client_config(args.address.as_deref(), args.timeout);
    let registry = Arc::new(ContentRegistry::new());
    let descriptor = Arc::new(demo::service(&registry)?);

    let client = ClientChannel::new(config, registry);
    let channel = client.connect().await?;
    debug!(peer = %channel.peer_addr(), "Connected to echo service");
    Ok(ServiceProxy::new(descriptor, client))
}

async fn finish(proxy: &ServiceProxy<ClientChannel>) {
    if let Ok(channel) = proxy.channel().channel()
        && let Err(e) = channel.close_with_reason(CLIENT_DONE, "client done").await
    {
        debug!(error = %e, "Graceful close failed");
    }
    proxy.channel().close().await;
}

/// Sends one echo command and returns the reply.
pub async fn send_echo(settings: &Settings, args: &MessageArgs) -> CliResult<EchoReply> {
    let proxy = connect(settings, args).await?;
    let request = EchoRequest {
        foo: args.foo.clone(),
        bar: args.bar,
    };
    let reply = proxy.command(demo::ECHO, args.tag, &request).await;
    finish(&proxy).await;
    Ok(reply?)
}

/// Sends one notify event.
pub async fn send_notice(settings: &Settings, args: &MessageArgs) -> CliResult<()> {
    let proxy = connect(settings, args).await?;
    let notice = Notice {
        foo: args.foo.clone(),
        bar: args.bar,
    };
    let sent = proxy.event(demo::NOTIFY, args.tag, &notice).await;
    finish(&proxy).await;
    Ok(sent?)
}

/// `tidewire call`: prints the reply as JSON.
pub async fn call(settings: &Settings, args: &MessageArgs) -> CliResult<()> {
    let reply = send_echo(settings, args).await?;
    let json = serde_json::to_string_pretty(&reply).map_err(|e| CliError::Serialize(e.to_string()))?;
    println!("{json}");
    Ok(())
}

/// `tidewire notify`.
pub async fn notify(settings: &Settings, args: &MessageArgs) -> CliResult<()> {
    send_notice(settings, args).await?;
    println!("sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::serve::{self, ServeOptions};
    use tidewire_channel::ChannelError;

    fn args(address: String, tag: Option<i64>) -> MessageArgs {
        MessageArgs {
            address: Some(address),
            tag,
            foo: "x".into(),
            bar: 123,
            timeout: Some(5),
        }
    }

    async fn server() -> tidewire_channel::ServerChannel {
        let options = ServeOptions {
            bind: Some("127.0.0.1:0".into()),
            ..ServeOptions::default()
        };
        serve::start(&Settings::default(), &options).await.unwrap()
    }

    #[tokio::test]
    async fn echo_against_running_server() {
        let server = server().await;
        let address = server.local_addr().to_string();

        let reply = send_echo(&Settings::default(), &args(address.clone(), Some(42)))
            .await
            .unwrap();
        assert_eq!(
            reply,
            EchoReply {
                foo: "x".into(),
                qux: demo::QUX,
                tag: Some(42)
            }
        );

        let untagged = send_echo(&Settings::default(), &args(address, None))
            .await
            .unwrap();
        assert_eq!(untagged.tag, None);
    }

    #[tokio::test]
    async fn notice_against_running_server() {
        let server = server().await;
        let address = server.local_addr().to_string();
        send_notice(&Settings::default(), &args(address, Some(321)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = send_echo(&Settings::default(), &args(address, None))
            .await
            .unwrap_err();
        assert!(
            matches!(err, CliError::Channel(ChannelError::Connect { .. })),
            "{err}"
        );
    }
}
