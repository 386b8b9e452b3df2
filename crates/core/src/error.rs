use serde::{Deserialize, Serialize};

use crate::GroupId;

/// Errors surfaced by the engine to submitters and readers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PopError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("shard unreachable: group {0}")]
    ShardUnreachable(GroupId),
    #[error("dead-lettered after {attempts} attempt(s): {reason}")]
    DeadLettered { attempts: u32, reason: String },
    #[error("ingest queue closed")]
    QueueClosed,
    #[error("internal: {0}")]
    Internal(String),
}

impl PopError {
    /// Whether the ingest path may redeliver a message that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PopError::Storage(_) | PopError::ShardUnreachable(_))
    }

    pub fn storage(e: anyhow::Error) -> Self { PopError::Storage(format!("{:#}", e)) }
}

pub type PopResult<T> = Result<T, PopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(PopError::Storage("disk full".into()).is_retryable());
        assert!(PopError::ShardUnreachable(GroupId(3)).is_retryable());
        assert!(!PopError::Validation("amount".into()).is_retryable());
        assert!(!PopError::QueueClosed.is_retryable());
    }
}
