//! Handler failures and their classification.

use std::fmt;

/// How a handler failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Might succeed on a later attempt; retried with backoff.
    Transient,

    /// Retrying cannot help; the row is dead-lettered immediately.
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure reported by a handler for one task (or a whole batch).
///
/// The message is what ends up in the row's `last_error` column.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }
}

/// Payloads that fail to decode go through the normal retry cycle.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::transient(format!("payload decode failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_bare_message() {
        let err = HandlerError::transient("smtp timeout");
        assert_eq!(err.to_string(), "smtp timeout");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(!err.is_permanent());
    }

    #[test]
    fn decode_errors_are_transient() {
        let json_err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = HandlerError::from(json_err);
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.message().starts_with("payload decode failed"));
    }
}
