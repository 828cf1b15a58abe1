//! Channel, server and client configuration.

use std::time::Duration;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 7070;

/// Per-channel settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long a command waits for its answer. `None` waits until the
    /// answer arrives or the channel closes.
    pub command_timeout: Option<Duration>,

    /// How long `close_with_reason` waits for the peer's acknowledgement.
    pub close_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_timeout: None,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelConfig {
    /// Builder: set command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Builder: set close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind, `host:port`.
    pub bind_address: String,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Settings applied to every accepted channel.
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_connections: 100,
            channel: ChannelConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration with the given bind address.
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Default::default()
        }
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set channel settings.
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt after a disconnect.
    pub initial_backoff: Duration,
    /// Upper bound for the delay.
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(64),
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay that follows `current`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server address, `host:port`.
    pub address: String,

    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,

    /// Reconnection policy; `None` disables reconnection.
    pub reconnect: Option<ReconnectPolicy>,

    /// Settings for the established channel.
    pub channel: ChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            connect_timeout: Duration::from_secs(5),
            reconnect: None,
            channel: ChannelConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a new client configuration for the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Builder: set connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: enable reconnection.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Builder: set channel settings.
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}
