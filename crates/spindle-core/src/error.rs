use thiserror::Error;

use crate::ports::StoreError;

/// Errors surfaced by the queue API (registration, enqueue, startup).
///
/// Handler failures are not here: those are `HandlerError`s, recorded on the
/// row and never returned to the caller.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no handler registered for task name={0}")]
    UnknownTask(String),

    #[error("duplicate handler for task name={0}")]
    DuplicateTaskName(String),

    /// Names the application declared it needs but never registered.
    #[error("expected task names are not registered: {}", .0.join(", "))]
    MissingTaskNames(Vec<String>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] ::config::ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_names_are_listed() {
        let err = QueueError::MissingTaskNames(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "expected task names are not registered: a, b");
    }

    #[test]
    fn store_errors_convert() {
        let err: QueueError = StoreError::Unavailable("pool closed".into()).into();
        assert!(matches!(err, QueueError::Store(StoreError::Unavailable(_))));
        assert_eq!(err.to_string(), "task store unavailable: pool closed");
    }
}
