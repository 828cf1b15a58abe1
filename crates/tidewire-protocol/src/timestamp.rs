//! Timestamps as integer epoch seconds (UTC).
//!
//! Use with `#[serde(with = "...")]` on `DateTime<Utc>` fields:
//!
//! ```rust
//! use chrono::{DateTime, TimeZone, Utc};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Reading {
//!     #[serde(with = "tidewire_protocol::timestamp::epoch_seconds")]
//!     taken_at: DateTime<Utc>,
//!     #[serde(with = "tidewire_protocol::timestamp::epoch_seconds_option")]
//!     expires_at: Option<DateTime<Utc>>,
//! }
//!
//! let reading = Reading {
//!     taken_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
//!     expires_at: None,
//! };
//! let json = serde_json::to_string(&reading).unwrap();
//! assert_eq!(json, r#"{"taken_at":1700000000,"expires_at":null}"#);
//! ```

pub use chrono::serde::ts_seconds as epoch_seconds;
pub use chrono::serde::ts_seconds_option as epoch_seconds_option;

use chrono::{DateTime, Utc};

/// Zero value for timestamp fields in shapes that derive `Default`.
pub fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Stamped {
        #[serde(with = "super::epoch_seconds")]
        at: DateTime<Utc>,
        #[serde(with = "super::epoch_seconds_option")]
        until: Option<DateTime<Utc>>,
    }

    #[test]
    fn encodes_integer_seconds() {
        let value = Stamped {
            at: Utc.timestamp_opt(1234, 0).unwrap(),
            until: Some(Utc.timestamp_opt(100, 0).unwrap()),
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"at":1234,"until":100}"#);

        let back: Stamped = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn null_stays_null() {
        let value = Stamped {
            at: super::unix_epoch(),
            until: None,
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"at":0,"until":null}"#);

        let back: Stamped = serde_json::from_str(&json).unwrap();
        assert_eq!(back.until, None);
    }

    #[test]
    fn sub_second_precision_is_dropped() {
        let value = Stamped {
            at: Utc.timestamp_opt(10, 999_000_000).unwrap(),
            until: None,
        };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"at":10,"until":null}"#);
    }
}
