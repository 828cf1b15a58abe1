//! Channels, dispatch and service proxies for the tidewire protocol.
//!
//! This crate provides:
//! - [`Channel`]: one TCP connection with a receive loop and a pending
//!   command table
//! - [`ServerChannel`] and [`ClientChannel`] to obtain channels
//! - [`Dispatcher`] routing inbound commands and events to handlers
//! - [`ServiceDescriptor`] and [`ServiceProxy`] for typed calls
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde::{Deserialize, Serialize};
//! use tidewire_channel::{
//!     ClientChannel, ClientConfig, ServerChannel, ServerConfig, ServiceDescriptor, ServiceProxy,
//!     TagParam,
//! };
//! use tidewire_protocol::ContentRegistry;
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(ContentRegistry::new());
//!
//!     let server = ServerChannel::bind(ServerConfig::new("127.0.0.1:7070"), registry.clone()).await?;
//!     server.listen(|channel| {
//!         let _ = channel
//!             .dispatcher()
//!             .on_command("greet", |_tag, greet: Greet| async move {
//!                 Ok(format!("hello {}", greet.name))
//!             });
//!     })?;
//!
//!     let service = ServiceDescriptor::builder("greeter")
//!         .command::<Greet, String>("greet", "greet", TagParam::None)
//!         .build(&registry)?;
//!     let client = ClientChannel::new(ClientConfig::new("127.0.0.1:7070"), registry);
//!     client.connect().await?;
//!
//!     let proxy = ServiceProxy::new(Arc::new(service), client);
//!     let reply: String = proxy
//!         .command("greet", None, &Greet { name: "tide".into() })
//!         .await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

mod channel;
mod client;
mod config;
mod descriptor;
mod dispatcher;
mod error;
pub mod executor;
mod pending;
mod proxy;
mod server;

pub use channel::{Channel, PendingAnswer};
pub use client::ClientChannel;
pub use config::{ChannelConfig, ClientConfig, DEFAULT_PORT, ReconnectPolicy, ServerConfig};
pub use descriptor::{
    MethodDescriptor, MethodKind, ServiceDescriptor, ServiceDescriptorBuilder, TagParam,
};
pub use dispatcher::{Dispatcher, Handler, HandlerResult};
pub use error::{ChannelError, ChannelResult};
pub use executor::{Executor, SerialExecutor};
pub use proxy::{MessageChannel, ServiceProxy};
pub use server::ServerChannel;
