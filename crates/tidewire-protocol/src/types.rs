//! Envelope and control payload types for the tidewire protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type id of the built-in command that asks the peer to close the connection.
pub const CLOSE_CONNECTION: &str = "close-connection";

/// Name of the payload field that mirrors the envelope tag.
pub const TAG_FIELD: &str = "tag";

/// Message category.
///
/// Encoded as an integer on the wire (`1`, `2`, `3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Category {
    /// Request expecting exactly one correlated answer.
    Command,
    /// Response to a command.
    Answer,
    /// One-way notification.
    Event,
}

impl From<Category> for u8 {
    fn from(category: Category) -> Self {
        match category {
            Category::Command => 1,
            Category::Answer => 2,
            Category::Event => 3,
        }
    }
}

impl TryFrom<u8> for Category {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Command),
            2 => Ok(Self::Answer),
            3 => Ok(Self::Event),
            other => Err(format!("unknown message category {other}")),
        }
    }
}

/// Outcome carried by an answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    /// Payload is the registered answer shape.
    #[default]
    Success,
    /// Payload is an [`ErrorPayload`].
    Failed,
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Success => 1,
            Status::Failed => 2,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Success),
            2 => Ok(Self::Failed),
            other => Err(format!("unknown message status {other}")),
        }
    }
}

/// One wire message.
///
/// `correlation_id` is the transport-level match between a command and its
/// answer. `tag` is an application value and is never interpreted by the
/// engine beyond being echoed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message category.
    pub category: Category,
    /// Application message type.
    pub type_id: String,
    /// Set on commands and answers, `null` on events.
    pub correlation_id: Option<u64>,
    /// Answer outcome; always `Success` on commands and events.
    #[serde(default)]
    pub status: Status,
    /// Optional business tag.
    pub tag: Option<i64>,
    /// Encoded content, `null` for unit content.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Creates a command envelope. The correlation id is assigned by the channel.
    pub fn command(type_id: impl Into<String>, tag: Option<i64>, payload: Value) -> Self {
        Self {
            category: Category::Command,
            type_id: type_id.into(),
            correlation_id: None,
            status: Status::Success,
            tag,
            payload,
        }
    }

    /// Creates an event envelope.
    pub fn event(type_id: impl Into<String>, tag: Option<i64>, payload: Value) -> Self {
        Self {
            category: Category::Event,
            type_id: type_id.into(),
            correlation_id: None,
            status: Status::Success,
            tag,
            payload,
        }
    }

    /// Creates a successful answer to `command`, echoing its correlation id and tag.
    pub fn answer_to(command: &Envelope, payload: Value) -> Self {
        Self {
            category: Category::Answer,
            type_id: command.type_id.clone(),
            correlation_id: command.correlation_id,
            status: Status::Success,
            tag: command.tag,
            payload,
        }
    }

    /// Creates a failed answer to `command`.
    pub fn failure_to(command: &Envelope, error: &ErrorPayload) -> Self {
        Self {
            category: Category::Answer,
            type_id: command.type_id.clone(),
            correlation_id: command.correlation_id,
            status: Status::Failed,
            tag: command.tag,
            payload: serde_json::to_value(error).unwrap_or(Value::Null),
        }
    }

    /// Returns true for commands.
    pub fn is_command(&self) -> bool {
        self.category == Category::Command
    }

    /// Returns true for events.
    pub fn is_event(&self) -> bool {
        self.category == Category::Event
    }

    /// Returns true for answers.
    pub fn is_answer(&self) -> bool {
        self.category == Category::Answer
    }

    /// Returns true for failed answers.
    pub fn is_failure(&self) -> bool {
        self.is_answer() && self.status == Status::Failed
    }

    /// Extracts the error payload of a failed answer.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if !self.is_failure() {
            return None;
        }
        Some(
            serde_json::from_value(self.payload.clone()).unwrap_or_else(|_| {
                ErrorPayload::new(
                    ErrorPayload::ENGINE_GROUP,
                    codes::INTERNAL_ERROR,
                    "malformed error payload",
                )
            }),
        )
    }
}

/// Error codes produced by the engine itself.
pub mod codes {
    /// No shape registered for the inbound type id.
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    /// No handler registered for the inbound type id.
    pub const HANDLER_NOT_FOUND: &str = "handler_not_found";
    /// Inbound content did not match the registered shape.
    pub const DECODE_ERROR: &str = "decode_error";
    /// Handler panicked.
    pub const HANDLER_FAILED: &str = "handler_failed";
    /// Anything else.
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Payload of a failed answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error group; negative values are reserved for the engine.
    pub group: i32,
    /// Machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub description: String,
}

impl ErrorPayload {
    /// Group used for engine-generated errors.
    pub const ENGINE_GROUP: i32 = -1;

    /// Creates an error payload.
    pub fn new(group: i32, code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            group,
            code: code.into(),
            description: description.into(),
        }
    }

    /// Creates an engine error payload.
    pub fn engine(code: &str, description: impl Into<String>) -> Self {
        Self::new(Self::ENGINE_GROUP, code, description)
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.group, self.code, self.description)
    }
}

/// Content of the [`CLOSE_CONNECTION`] command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseConnection {
    /// Application close code.
    pub code: i32,
    /// Reason for closing.
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_wire_values() {
        assert_eq!(serde_json::to_string(&Category::Command).unwrap(), "1");
        assert_eq!(serde_json::to_string(&Category::Answer).unwrap(), "2");
        assert_eq!(serde_json::to_string(&Category::Event).unwrap(), "3");
        assert!(serde_json::from_str::<Category>("0").is_err());
        assert!(serde_json::from_str::<Category>("4").is_err());
    }

    #[test]
    fn envelope_serializes_nulls_explicitly() {
        let envelope = Envelope::event("notify", None, Value::Null);
        let json = serde_json::to_string(&envelope).unwrap();
        insta::assert_snapshot!(json, @r#"{"category":3,"type_id":"notify","correlation_id":null,"status":1,"tag":null,"payload":null}"#);
    }

    #[test]
    fn envelope_missing_optional_fields() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"category":1,"type_id":"ping","correlation_id":4}"#).unwrap();
        assert_eq!(envelope.status, Status::Success);
        assert_eq!(envelope.tag, None);
        assert_eq!(envelope.payload, Value::Null);
        assert_eq!(envelope.correlation_id, Some(4));
    }

    #[test]
    fn answer_echoes_correlation_and_tag() {
        let mut command = Envelope::command("echo", Some(42), json!({"foo": "x", "bar": 1}));
        command.correlation_id = Some(9);

        let answer = Envelope::answer_to(&command, json!({"foo": "x"}));
        assert!(answer.is_answer());
        assert_eq!(answer.correlation_id, Some(9));
        assert_eq!(answer.tag, Some(42));
        assert_eq!(answer.type_id, "echo");
        assert!(!answer.is_failure());
    }

    #[test]
    fn failure_roundtrips_error_payload() {
        let mut command = Envelope::command("echo", None, Value::Null);
        command.correlation_id = Some(1);

        let error = ErrorPayload::engine(codes::HANDLER_NOT_FOUND, "no handler for echo");
        let answer = Envelope::failure_to(&command, &error);

        assert!(answer.is_failure());
        assert_eq!(answer.error_payload(), Some(error));
    }

    #[test]
    fn malformed_error_payload_is_reported_as_internal() {
        let mut command = Envelope::command("echo", None, Value::Null);
        command.correlation_id = Some(1);
        let mut answer = Envelope::answer_to(&command, json!("oops"));
        answer.status = Status::Failed;

        let error = answer.error_payload().unwrap();
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert_eq!(error.group, ErrorPayload::ENGINE_GROUP);
    }

    #[test]
    fn success_answer_has_no_error_payload() {
        let command = Envelope::command("echo", None, Value::Null);
        let answer = Envelope::answer_to(&command, Value::Null);
        assert_eq!(answer.error_payload(), None);
    }
}
