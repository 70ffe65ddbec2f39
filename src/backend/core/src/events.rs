//! Domain events emitted by the task execution core.
//!
//! Every externally observable state change flows through a single
//! broadcast [`EventBus`]; embedding applications subscribe once (via
//! [`crate::tasks::manager::TaskManager::subscribe`]) and receive the
//! full stream. Delivery is in-process; receivers must be non-blocking
//! and lagging receivers lose the oldest events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::tasks::status::TaskStatus;
use crate::tasks::task::TaskId;

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// An event emitted by the task system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TaskEvent {
    /// The manager finished construction and state load.
    SystemReady,
    /// A task was registered with the tracker.
    TaskAdded { id: TaskId },
    /// A task was removed from the tracker.
    TaskRemoved { id: TaskId },
    /// A task was admitted to the queue.
    TaskQueued { id: TaskId },
    /// A task changed status.
    TaskStatusUpdated { id: TaskId, status: TaskStatus },
    /// A task reported progress (0-100).
    TaskProgressUpdated { id: TaskId, progress: u8 },
    /// A task reached a terminal state for this run.
    TaskFinished {
        id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    },
    /// A failed task snapshot was appended to the failure history.
    FailedTaskLogged { snapshot: Value },
    /// The queue's pending/running counts changed.
    QueueStatusChanged,
    /// A job was registered with the scheduler.
    JobScheduled { job_id: String, task_id: TaskId },
    /// A scheduled job was removed.
    JobUnscheduled { job_id: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Bus
// ═══════════════════════════════════════════════════════════════════════════════

/// Broadcast channel carrying [`TaskEvent`]s to any number of subscribers.
///
/// Cloning the bus is cheap; all clones feed the same channel. Emitting
/// never blocks — events published with no active subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers.
    pub fn emit(&self, event: TaskEvent) {
        // A send error only means there are no receivers right now.
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let id = TaskId::new();
        bus.emit(TaskEvent::TaskAdded { id });
        bus.emit(TaskEvent::TaskStatusUpdated {
            id,
            status: TaskStatus::Running,
        });

        match rx.recv().await.unwrap() {
            TaskEvent::TaskAdded { id: got } => assert_eq!(got, id),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            TaskEvent::TaskStatusUpdated { status, .. } => {
                assert_eq!(status, TaskStatus::Running)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit(TaskEvent::QueueStatusChanged);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = TaskEvent::JobScheduled {
            job_id: "task_abc".to_string(),
            task_id: TaskId::new(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "jobScheduled");
        assert_eq!(json["job_id"], "task_abc");
    }
}
