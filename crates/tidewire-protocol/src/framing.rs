//! Length-prefixed record framing.
//!
//! Every envelope is framed with a 4-byte big-endian length prefix followed
//! by the JSON payload:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON envelope   |
//! +----------------+------------------+
//! ```
//!
//! A zero or oversized length means the stream can no longer be split into
//! records; callers must treat those errors as fatal for the connection
//! (see [`ProtocolError::is_framing`]).

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// Encodes a message to bytes with length prefix.
///
/// # Example
///
/// ```rust
/// use serde_json::Value;
/// use tidewire_protocol::{Envelope, encode_message};
///
/// let envelope = Envelope::event("ping", None, Value::Null);
/// let bytes = encode_message(&envelope).unwrap();
/// assert!(bytes.len() > 4);
/// ```
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    frame(&json)
}

/// Prefixes an already encoded record with its length.
pub fn frame(record: &[u8]) -> ProtocolResult<Vec<u8>> {
    let len = u32::try_from(record.len()).unwrap_or(u32::MAX);
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(4 + record.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(record);
    Ok(buffer)
}

/// Decodes a message from a complete framed buffer.
///
/// ```rust
/// use serde_json::Value;
/// use tidewire_protocol::{Envelope, decode_message, encode_message};
///
/// let envelope = Envelope::event("ping", Some(3), Value::Null);
/// let bytes = encode_message(&envelope).unwrap();
/// let decoded: Envelope = decode_message(&bytes).unwrap();
/// assert_eq!(decoded.tag, Some(3));
/// ```
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    let Some(len_bytes) = data.first_chunk::<4>() else {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4,
            received: data.len(),
        });
    };

    let len = check_length(u32::from_be_bytes(*len_bytes))?;
    if data.len() < 4 + len {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4 + len,
            received: data.len(),
        });
    }

    let message = serde_json::from_slice(&data[4..4 + len])?;
    Ok(message)
}

fn check_length(len: u32) -> ProtocolResult<usize> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    Ok(len as usize)
}

/// Reads length-prefixed records from an async byte stream.
///
/// Partial reads are accumulated until a full record is available.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a new FrameReader wrapping the given reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads one record body (without its prefix).
    ///
    /// Returns `Ok(None)` on a clean EOF between records.
    pub async fn read_frame(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self.reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::IncompleteMessage {
                    expected: len_buf.len(),
                    received: filled,
                });
            }
            filled += n;
        }

        let len = check_length(u32::from_be_bytes(len_buf))?;

        let mut record = vec![0u8; len];
        let mut received = 0;
        while received < len {
            let n = self.reader.read(&mut record[received..]).await?;
            if n == 0 {
                return Err(ProtocolError::IncompleteMessage {
                    expected: len,
                    received,
                });
            }
            received += n;
        }
        Ok(Some(record))
    }

    /// Reads and parses one record.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        match self.read_frame().await? {
            Some(record) => Ok(Some(serde_json::from_slice(&record)?)),
            None => Ok(None),
        }
    }

    /// Unwraps this FrameReader, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes length-prefixed records to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a new FrameWriter wrapping the given writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one record body and flushes it.
    pub async fn write_frame(&mut self, record: &[u8]) -> ProtocolResult<()> {
        let data = frame(record)?;
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Serializes and writes one message.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> ProtocolResult<()> {
        let record = serde_json::to_vec(message)?;
        self.write_frame(&record).await
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Unwraps this FrameWriter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
