//! Error taxonomy for the tiering engine.
//!
//! Variants are grouped by the scope that recovers them:
//! configuration errors abort an invocation, per-item errors are contained
//! by the batch loop, batch errors by the orchestrator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TieringError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("schedule '{0}' not found or disabled")]
    ScheduleNotFound(String),

    #[error("queue item {0} not found")]
    QueueItemNotFound(i64),

    #[error("policy {0} not found")]
    PolicyNotFound(i64),

    #[error("batch '{0}' not found")]
    BatchNotFound(String),

    #[error("schedule '{0}' already has a running batch")]
    ConcurrentRun(String),

    #[error("invalid execution window '{0}' (expected HH:MM-HH:MM)")]
    InvalidWindow(String),

    #[error("unknown action type '{0}'")]
    UnknownAction(String),

    #[error("{0} is not implemented")]
    NotImplemented(String),

    #[error("action failed: {0}")]
    Action(String),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TieringError {
    /// Errors that invalidate the whole invocation before any work starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::ScheduleNotFound(_) | Self::BatchNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TieringError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(TieringError::ScheduleNotFound("nightly".into()).is_configuration());
        assert!(TieringError::BatchNotFound("BATCH_X".into()).is_configuration());
        assert!(!TieringError::QueueItemNotFound(7).is_configuration());
        assert!(!TieringError::Action("boom".into()).is_configuration());
    }

    #[test]
    fn test_messages() {
        let e = TieringError::NotImplemented("MERGE".into());
        assert_eq!(e.to_string(), "MERGE is not implemented");
        let e = TieringError::InvalidWindow("25:00-01:00".into());
        assert!(e.to_string().contains("HH:MM-HH:MM"));
    }
}
