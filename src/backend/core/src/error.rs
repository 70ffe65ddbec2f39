//! Error handling for the task execution core.
//!
//! This module provides:
//! - A single crate-wide error type with context where it helps
//! - Machine-readable error codes for programmatic handling
//! - A retryability classification carried into task failures: a system
//!   error converted into a [`crate::tasks::task::TaskError`] becomes a
//!   permanent failure unless it is retryable
//!
//! Errors never cross the event boundary between subsystems; events carry
//! optional error payloads instead (see [`crate::events`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::status::TaskStatus;
use crate::tasks::task::TaskId;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for task system operations.
pub type Result<T> = std::result::Result<T, TaskSystemError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by embedding applications for
/// programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Task lifecycle (1000-1099)
    TaskNotFound,
    InvalidTaskState,
    UniqueViolation,
    InvalidStateTransition,

    // Scheduling (1100-1199)
    JobNotFound,
    InvalidSchedule,

    // Persistence (2000-2099)
    StorageError,
    SerializationError,
    DeserializationError,

    // Configuration (5000-5099)
    ConfigurationError,

    // Internal (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::TaskNotFound => 1000,
            Self::InvalidTaskState => 1001,
            Self::UniqueViolation => 1002,
            Self::InvalidStateTransition => 1003,
            Self::JobNotFound => 1100,
            Self::InvalidSchedule => 1101,
            Self::StorageError => 2000,
            Self::SerializationError => 2001,
            Self::DeserializationError => 2002,
            Self::ConfigurationError => 5000,
            Self::InternalError => 9000,
        }
    }

    /// Get the stable name of this code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::InvalidTaskState => "INVALID_TASK_STATE",
            Self::UniqueViolation => "UNIQUE_VIOLATION",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::InvalidSchedule => "INVALID_SCHEDULE",
            Self::StorageError => "STORAGE_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::DeserializationError => "DESERIALIZATION_ERROR",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.numeric_code())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors surfaced by the task execution core.
#[derive(Debug, Error)]
pub enum TaskSystemError {
    /// An operation referenced a task id that is not tracked.
    #[error("task {id} not found")]
    TaskNotFound { id: TaskId },

    /// An operation referenced an unknown scheduled job.
    #[error("scheduled job '{job_id}' not found")]
    JobNotFound { job_id: String },

    /// An operation is not legal in the task's current state
    /// (e.g. pause on a task that is not running).
    #[error("cannot {operation} task {id} in state {status}")]
    InvalidTaskState {
        id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    /// A status write violated the task lifecycle state machine.
    #[error("illegal status transition {from} -> {to} for task {id}")]
    InvalidStateTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Admission was rejected by the uniqueness index.
    #[error("task with unique key '{key}' already enqueued")]
    UniqueViolation { key: String },

    /// A schedule trigger failed validation.
    #[error("invalid schedule: {reason}")]
    InvalidSchedule { reason: String },

    /// The persistent store failed to read or write a blob.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// A value could not be serialized to JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted blob could not be reconstructed into a live task.
    #[error("cannot deserialize task of kind '{kind}': {reason}")]
    Deserialization { kind: String, reason: String },

    /// A configuration value is out of range or missing.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// An unexpected internal failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TaskSystemError {
    /// Create a storage error from any displayable source.
    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage {
            message: message.to_string(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the machine-readable code for this error.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TaskNotFound { .. } => ErrorCode::TaskNotFound,
            Self::JobNotFound { .. } => ErrorCode::JobNotFound,
            Self::InvalidTaskState { .. } => ErrorCode::InvalidTaskState,
            Self::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::UniqueViolation { .. } => ErrorCode::UniqueViolation,
            Self::InvalidSchedule { .. } => ErrorCode::InvalidSchedule,
            Self::Storage { .. } => ErrorCode::StorageError,
            Self::Serialization(_) => ErrorCode::SerializationError,
            Self::Deserialization { .. } => ErrorCode::DeserializationError,
            Self::Configuration { .. } => ErrorCode::ConfigurationError,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether retrying the failing operation could succeed.
    ///
    /// Storage failures are transient by assumption (the caller continues
    /// with last-known state); everything else reflects a caller error or
    /// an unrecoverable blob. Consumed by the `From<TaskSystemError>`
    /// conversion on [`crate::tasks::task::TaskError`]: a non-retryable
    /// system error escaping a task body becomes a permanent failure the
    /// queue never retries.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Internal { .. })
    }
}
