use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Key '{key}' does not hold a {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("No such key: '{0}'")]
    NoSuchKey(String),

    #[error("Contention on '{key}': gave up after {attempts} attempts in {elapsed:?}")]
    Contention {
        key: String,
        attempts: usize,
        elapsed: Duration,
    },

    #[error("Data source failed for task '{task_id}': {message}")]
    DataSource { task_id: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl EngineError {
    /// Errors that a later polling cycle may simply outlive.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Store(_) | EngineError::Contention { .. } | EngineError::DataSource { .. }
        )
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, EngineError::Contention { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_errors_become_serialization() {
        let err: EngineError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, EngineError::Serialization(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(EngineError::Store("down".into()).is_transient());
        assert!(!EngineError::Config("bad".into()).is_transient());
        assert!(!EngineError::Worker("panicked".into()).is_contention());
    }
}
