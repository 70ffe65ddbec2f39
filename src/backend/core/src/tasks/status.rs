//! Task status and uniqueness classification.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// Task Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a task in its execution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task is waiting in the queue
    Pending,
    /// Task is currently executing
    Running,
    /// Task finished successfully
    Completed,
    /// Task failed (may or may not retry)
    Failed,
    /// Task was cancelled by user/system
    Cancelled,
    /// Task is temporarily paused
    Paused,
    /// Task is waiting to retry after failure
    Retrying,
}

impl TaskStatus {
    /// The persisted enum name of this status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
            Self::Retrying => "RETRYING",
        }
    }

    /// Parse a persisted enum name back into a status.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "PAUSED" => Some(Self::Paused),
            "RETRYING" => Some(Self::Retrying),
            _ => None,
        }
    }

    /// Check if the status is terminal for the queue's view of the task.
    ///
    /// A failed task with retries remaining is re-admitted through
    /// `Retrying`, so `Failed` here means "failed as observed"; the queue
    /// decides whether it stays terminal.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if a transition to `target` is legal.
    ///
    /// Every status write is validated against this machine (see
    /// [`super::task::TaskCore::set_status`]). Beyond the plain run
    /// lifecycle it admits retry re-admission (`Retrying → Pending`),
    /// the chain's inter-attempt `Running ↔ Retrying` hops, and the
    /// fresh-attempt resets a chain applies to its children
    /// (`Failed → Pending`, and `Completed → Pending` when the whole
    /// chain re-runs).
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Running, Retrying)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Failed, Retrying)
                | (Failed, Pending)
                | (Completed, Pending)
                | (Retrying, Pending)
                | (Retrying, Running)
                | (Retrying, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Unique Type
// ═══════════════════════════════════════════════════════════════════════════════

/// Uniqueness constraint applied at queue admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UniqueType {
    /// No uniqueness constraint.
    #[default]
    None,
    /// Only one instance per unique key may exist in pending or running.
    Job,
    /// Only one instance per unique key may wait in pending; once it is
    /// running another may be enqueued.
    UntilProcessing,
}

impl UniqueType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Job => "JOB",
            Self::UntilProcessing => "UNTIL_PROCESSING",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NONE" => Some(Self::None),
            "JOB" => Some(Self::Job),
            "UNTIL_PROCESSING" => Some(Self::UntilProcessing),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Paused,
            TaskStatus::Retrying,
        ] {
            assert_eq!(TaskStatus::from_name(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_name("BOGUS"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_lifecycle_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(&Running));
        assert!(Pending.can_transition_to(&Cancelled));
        assert!(Running.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Running));
        assert!(Paused.can_transition_to(&Cancelled));
        assert!(Failed.can_transition_to(&Retrying));
        assert!(Retrying.can_transition_to(&Pending));
        // Fresh-attempt resets applied by a chain to its children.
        assert!(Failed.can_transition_to(&Pending));
        assert!(Completed.can_transition_to(&Pending));

        assert!(!Completed.can_transition_to(&Running));
        assert!(!Pending.can_transition_to(&Paused));
        assert!(!Cancelled.can_transition_to(&Running));
        // No self-transitions.
        assert!(!Running.can_transition_to(&Running));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Retrying).unwrap(),
            "\"RETRYING\""
        );
        assert_eq!(
            serde_json::to_string(&UniqueType::UntilProcessing).unwrap(),
            "\"UNTIL_PROCESSING\""
        );
    }
}
