//! Protocol error types.

use thiserror::Error;

use crate::types::Category;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or framing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No shape was registered for this category and type id.
    #[error("unknown content type: {category:?}/{type_id}")]
    UnknownType { category: Category, type_id: String },

    /// A different shape is already registered under this key.
    #[error("content type {category:?}/{type_id} already registered as {existing}, not {requested}")]
    ShapeConflict {
        category: Category,
        type_id: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// The caller asked to decode into a type that is not the registered shape.
    #[error("content type {category:?}/{type_id} is registered as {registered}, not {requested}")]
    ShapeMismatch {
        category: Category,
        type_id: String,
        registered: &'static str,
        requested: &'static str,
    },

    /// Payload does not match the registered shape.
    #[error("decode failed for {type_id}: {message}")]
    Decode { type_id: String, message: String },

    /// Failed to serialize or parse JSON.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// Zero-length record.
    #[error("empty message")]
    EmptyMessage,

    /// Byte stream ended in the middle of a record.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Creates a decode error.
    pub fn decode(type_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            type_id: type_id.into(),
            message: message.into(),
        }
    }

    /// Returns true if record boundaries can no longer be trusted.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::MessageTooLarge { .. } | Self::EmptyMessage | Self::IncompleteMessage { .. }
        )
    }
}
