//! Aggregated query status.
//!
//! A `QueryStatus` is either OK or a non-empty ordered list of error
//! messages. It is the value a query accumulates over its lifetime and the
//! payload of every fragment-control RPC result. Assignment through
//! [`QueryStatus::update`] is sticky: once non-OK, later errors are ignored
//! and OK never overwrites an error.

use serde::{Deserialize, Serialize};

/// Status code carried in the wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    InternalError,
}

/// Wire form of a status: `{status_code, error_msgs}`. An empty message
/// list means OK regardless of the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusWire {
    pub status_code: StatusCode,
    pub error_msgs: Vec<String>,
}

/// OK, or an ordered list of error messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStatus {
    error_msgs: Vec<String>,
}

impl QueryStatus {
    /// The OK status.
    pub fn ok() -> Self {
        QueryStatus { error_msgs: Vec::new() }
    }

    /// A status carrying a single error message.
    pub fn error(msg: impl Into<String>) -> Self {
        QueryStatus { error_msgs: vec![msg.into()] }
    }

    /// A status carrying an ordered list of messages. An empty list is OK.
    pub fn from_msgs(msgs: Vec<String>) -> Self {
        QueryStatus { error_msgs: msgs }
    }

    pub fn is_ok(&self) -> bool {
        self.error_msgs.is_empty()
    }

    pub fn error_msgs(&self) -> &[String] {
        &self.error_msgs
    }

    /// All error messages joined with newlines; empty for OK.
    pub fn message(&self) -> String {
        self.error_msgs.join("\n")
    }

    /// Sticky merge: adopt `other` only while still OK.
    pub fn update(&mut self, other: &QueryStatus) {
        if self.is_ok() {
            *self = other.clone();
        }
    }

    /// Append a message, turning an OK status into an error.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.error_msgs.push(msg.into());
    }

    pub fn to_wire(&self) -> StatusWire {
        if self.is_ok() {
            StatusWire { status_code: StatusCode::Ok, error_msgs: Vec::new() }
        } else {
            StatusWire {
                status_code: StatusCode::InternalError,
                error_msgs: self.error_msgs.clone(),
            }
        }
    }

    pub fn from_wire(wire: &StatusWire) -> Self {
        // An empty message list means OK, whatever the code claims.
        QueryStatus { error_msgs: wire.error_msgs.clone() }
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ok() {
            write!(f, "OK")
        } else {
            write!(f, "{}", self.message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_round_trip() {
        let s = QueryStatus::ok();
        let wire = s.to_wire();
        assert_eq!(wire.status_code, StatusCode::Ok);
        assert!(wire.error_msgs.is_empty());
        assert_eq!(QueryStatus::from_wire(&wire), s);
    }

    #[test]
    fn test_error_round_trip() {
        let s = QueryStatus::from_msgs(vec!["first".into(), "second".into()]);
        let wire = s.to_wire();
        assert_eq!(wire.status_code, StatusCode::InternalError);
        assert_eq!(wire.error_msgs, vec!["first", "second"]);
        assert_eq!(QueryStatus::from_wire(&wire), s);
    }

    #[test]
    fn test_empty_wire_list_is_ok() {
        let wire = StatusWire { status_code: StatusCode::InternalError, error_msgs: vec![] };
        assert!(QueryStatus::from_wire(&wire).is_ok());
    }

    #[test]
    fn test_sticky_update() {
        let mut s = QueryStatus::ok();
        s.update(&QueryStatus::error("boom"));
        assert_eq!(s.message(), "boom");
        // Later errors do not replace the first.
        s.update(&QueryStatus::error("later"));
        assert_eq!(s.message(), "boom");
        // OK never downgrades an error.
        s.update(&QueryStatus::ok());
        assert_eq!(s.message(), "boom");
    }

    #[test]
    fn test_message_joins_with_newline() {
        let s = QueryStatus::from_msgs(vec!["a".into(), "b".into()]);
        assert_eq!(s.message(), "a\nb");
    }
}
