//! Error model shared by the migration stores, dispatcher and coordinator.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::range::ShardId;
use crate::store::StoreError;

/// Result type used by every public operation in this crate.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Failures surfaced to callers of the migration core.
///
/// Task-local conditions (stale task, unknown filtering metadata) never show
/// up here; the submitter and recovery sweep resolve them per task.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A coordinator document with this migration id is already recorded.
    #[error(
        "found a migration coordinator document with the same migration id {migration_id}; attempted migration: {document}"
    )]
    DuplicateMigration { migration_id: Uuid, document: String },

    /// A range deletion task with this migration id is already recorded.
    #[error(
        "found a range deletion task with the same migration id {migration_id}; attempted task: {task}"
    )]
    DuplicateRangeDeletion { migration_id: Uuid, task: String },

    /// A remote command exhausted its retries or came back with an error.
    #[error("command {command} to shard {shard_id} failed after {attempts} attempt(s): {reason}")]
    Dispatch {
        shard_id: ShardId,
        command: String,
        attempts: u32,
        reason: String,
    },

    /// The shard registry has no address for this shard.
    #[error("shard {0} not found in shard registry")]
    ShardNotFound(ShardId),

    /// Refreshing filtering metadata from the authoritative source failed.
    #[error("filtering metadata refresh for {namespace} failed: {source:#}")]
    MetadataRefresh {
        namespace: String,
        #[source]
        source: anyhow::Error,
    },

    /// Physical deletion of a range finished with an error.
    #[error("range deletion for migration {migration_id} failed: {reason}")]
    RangeDeletionFailed { migration_id: Uuid, reason: String },

    #[error("invalid chunk range: {0}")]
    InvalidRange(String),

    /// The coordinator is not in a state that permits the operation.
    #[error("migration {migration_id} is {state}; cannot {operation}")]
    InvalidState {
        migration_id: Uuid,
        state: &'static str,
        operation: &'static str,
    },

    /// Commit was requested after abort, or the other way around.
    #[error("migration {migration_id} was already decided as {decided}; cannot {operation}")]
    ConflictingDecision {
        migration_id: Uuid,
        decided: &'static str,
        operation: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A store operation moved to the blocking pool panicked or was cancelled.
    #[error("blocking store task failed: {0}")]
    BlockingTask(#[from] tokio::task::JoinError),
}

impl MigrationError {
    /// Maps this error onto the code reported across the command boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            MigrationError::DuplicateMigration { .. }
            | MigrationError::DuplicateRangeDeletion { .. } => ErrorCode::DuplicateIntent,
            MigrationError::Dispatch { .. } => ErrorCode::DispatchFailed,
            MigrationError::ShardNotFound(_) => ErrorCode::ShardNotFound,
            MigrationError::MetadataRefresh { .. } => ErrorCode::MetadataRefreshFailed,
            MigrationError::RangeDeletionFailed { .. } => ErrorCode::RangeDeletionFailed,
            MigrationError::InvalidRange(_) => ErrorCode::BadValue,
            MigrationError::InvalidState { .. } | MigrationError::ConflictingDecision { .. } => {
                ErrorCode::IllegalOperation
            }
            MigrationError::Store(StoreError::DuplicateKey { .. }) => ErrorCode::DuplicateKey,
            MigrationError::Store(_) | MigrationError::BlockingTask(_) => ErrorCode::StorageError,
        }
    }
}

/// Error codes carried in remote command responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadValue,
    DuplicateKey,
    DuplicateIntent,
    DispatchFailed,
    ShardNotFound,
    MetadataRefreshFailed,
    RangeDeletionFailed,
    IllegalOperation,
    StorageError,
    FailedToParse,
    /// The receiving node is shutting down or not accepting commands.
    ShuttingDown,
    /// The receiving node could not finish the command in time.
    ExceededTimeLimit,
}

impl ErrorCode {
    /// Whether an idempotent command answered with this code may be resent.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::ShuttingDown | ErrorCode::ExceededTimeLimit | ErrorCode::StorageError
        )
    }
}
