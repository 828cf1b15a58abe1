//! Wire model, content registry and framing for tidewire.
//!
//! # Protocol Overview
//!
//! Records are sent as length-prefixed JSON:
//! - 4 bytes: record length (u32, big-endian)
//! - N bytes: JSON [`Envelope`]
//!
//! # Envelope Structure
//!
//! - `category`: `1` command, `2` answer, `3` event
//! - `type_id`: application message type
//! - `correlation_id`: matches an answer to its command, `null` on events
//! - `status`: `1` success, `2` failed (answers only)
//! - `tag`: optional application tag, echoed on answers
//! - `payload`: content encoded per the shape registered in the
//!   [`ContentRegistry`]
//!
//! Absent values are written as explicit `null`. Enums declared with
//! [`ordinal_enum!`] travel as ordinals and timestamps as epoch seconds
//! (see [`timestamp`]).
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use tidewire_protocol::{Envelope, decode_message, encode_message};
//!
//! let command = Envelope::command("echo", Some(42), json!({"foo": "x", "bar": 1}));
//! let bytes = encode_message(&command).unwrap();
//! let decoded: Envelope = decode_message(&bytes).unwrap();
//! assert_eq!(decoded, command);
//! ```

mod error;
mod framing;
mod ordinal;
mod registry;
pub mod timestamp;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter, decode_message, encode_message, frame};
pub use registry::{ContentRegistry, DecodeMode};
pub use types::{
    CLOSE_CONNECTION, Category, CloseConnection, Envelope, ErrorPayload, Status, TAG_FIELD, codes,
};

#[doc(hidden)]
pub use serde as __serde;

/// Maximum record size (1 MB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
