//! Channel error types.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tidewire_protocol::{Category, ErrorPayload, ProtocolError};

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur on a channel.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The channel was torn down while the operation was pending.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// No handler registered for an inbound message type.
    #[error("no handler registered for {category:?}/{type_id}")]
    HandlerNotFound { category: Category, type_id: String },

    /// A handler is already registered for this message type.
    #[error("handler for {category:?}/{type_id} already registered")]
    DuplicateHandler { category: Category, type_id: String },

    /// The peer answered with an error payload.
    #[error("remote error: {0}")]
    Remote(ErrorPayload),

    /// No answer within the configured timeout.
    #[error("no answer to {type_id} within {timeout:?}")]
    Timeout { type_id: String, timeout: Duration },

    /// Could not establish the TCP connection.
    #[error("failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    /// The client has no live connection.
    #[error("not connected")]
    NotConnected,

    /// `listen` was called twice on the same server.
    #[error("server is already listening")]
    AlreadyListening,

    /// Invalid service description or call against it.
    #[error("service error: {0}")]
    Descriptor(String),

    /// Protocol error (framing, encoding, registry).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error (socket).
    #[error("IO error: {0}")]
    Io(String),
}

impl ChannelError {
    /// Creates a connection-closed error.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Creates a descriptor error.
    pub fn descriptor(message: impl Into<String>) -> Self {
        Self::Descriptor(message.into())
    }

    /// Returns true if the error means the connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
