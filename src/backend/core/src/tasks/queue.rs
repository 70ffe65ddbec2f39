//! FIFO task queue with concurrency limits, uniqueness and retry logic.
//!
//! Admission appends to a FIFO pending queue after consulting the
//! uniqueness index; dispatch moves tasks into the bounded running set
//! and spawns one worker per task. Completion handling applies the
//! retry policy (re-enqueueing through a detached timer) and persists
//! the pending state.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use crate::error::{Result, TaskSystemError};
use crate::events::{EventBus, TaskEvent};
use crate::storage::{keys, Storage};
use crate::tasks::registry::TaskRegistry;
use crate::tasks::status::{TaskStatus, UniqueType};
use crate::tasks::task::{Task, TaskId};
use crate::tasks::tracker::TaskTracker;

/// Pending/running counts for one unique key.
#[derive(Debug, Default, Clone, Copy)]
struct UniqueSlots {
    pending: usize,
    running: usize,
}

struct QueueState {
    pending: VecDeque<Arc<dyn Task>>,
    running: HashMap<TaskId, Arc<dyn Task>>,
    unique: HashMap<String, UniqueSlots>,
    max_concurrent: usize,
}

/// FIFO admission, concurrency control and retry engine.
///
/// All admission, dispatch and completion handling serializes on one
/// internal mutex; workers themselves run as plain tokio tasks, so the
/// lock is never held across an await.
pub struct TaskQueue {
    me: Weak<TaskQueue>,
    tracker: Arc<TaskTracker>,
    storage: Arc<dyn Storage>,
    registry: Arc<TaskRegistry>,
    events: EventBus,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    /// Create a queue. `max_concurrent` is clamped to at least one.
    pub fn new(
        tracker: Arc<TaskTracker>,
        storage: Arc<dyn Storage>,
        registry: Arc<TaskRegistry>,
        events: EventBus,
        max_concurrent: usize,
    ) -> Arc<Self> {
        let max_concurrent = max_concurrent.max(1);
        tracing::info!(max_concurrent, "task queue initialized");
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            tracker,
            storage,
            registry,
            events,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: HashMap::new(),
                unique: HashMap::new(),
                max_concurrent,
            }),
        })
    }

    // ─── Admission ───────────────────────────────────────────────────────────

    /// Admit a task into the queue.
    ///
    /// Returns `false` when the uniqueness index rejects the admission;
    /// the rejection is logged at warn and is otherwise a no-op.
    /// Must be called within a tokio runtime.
    pub fn add_task(&self, task: Arc<dyn Task>) -> bool {
        let id = task.core().id();
        let unique_type = task.core().unique_type();
        let pending_len = {
            let mut state = self.state.lock();
            if unique_type != UniqueType::None {
                let key = task.unique_key();
                let slots = state.unique.entry(key.clone()).or_default();
                let rejected = match unique_type {
                    UniqueType::Job => slots.pending > 0 || slots.running > 0,
                    UniqueType::UntilProcessing => slots.pending > 0,
                    UniqueType::None => false,
                };
                if rejected {
                    tracing::warn!(
                        task_id = %id,
                        key = %key,
                        unique_type = unique_type.as_str(),
                        "admission rejected by uniqueness index"
                    );
                    return false;
                }
                slots.pending += 1;
            }
            state.pending.push_back(task.clone());
            state.pending.len()
        };

        self.tracker.add_task(task.clone());
        tracing::info!(
            task_id = %id,
            name = %task.core().name(),
            queue_size = pending_len,
            "task queued"
        );
        self.events.emit(TaskEvent::TaskQueued { id });
        self.events.emit(TaskEvent::QueueStatusChanged);
        self.process_queue();
        true
    }

    /// Update the concurrency limit. An increase takes effect on the next
    /// dispatch pass; running tasks are never interrupted.
    pub fn set_max_concurrent(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(TaskSystemError::Configuration {
                message: "max concurrent tasks must be greater than zero".to_string(),
            });
        }
        self.state.lock().max_concurrent = count;
        tracing::info!(max_concurrent = count, "max concurrent tasks updated");
        self.process_queue();
        Ok(())
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    /// Dispatch pending tasks while slots are free, skipping entries that
    /// were cancelled while waiting.
    pub fn process_queue(&self) {
        enum Dispatch {
            Run(Arc<dyn Task>, usize),
            Skip(Arc<dyn Task>),
        }

        loop {
            // Pop and slot claim happen under one lock so concurrent
            // dispatch passes cannot overshoot the concurrency limit.
            let action = {
                let mut state = self.state.lock();
                if state.running.len() >= state.max_concurrent {
                    break;
                }
                let Some(task) = state.pending.pop_front() else {
                    break;
                };
                if task.core().status() == TaskStatus::Cancelled || task.core().is_stopped() {
                    Self::release_pending_slot(&mut state, &task);
                    Dispatch::Skip(task)
                } else {
                    if task.core().unique_type() != UniqueType::None {
                        let key = task.unique_key();
                        if let Some(slots) = state.unique.get_mut(&key) {
                            slots.pending = slots.pending.saturating_sub(1);
                            slots.running += 1;
                        }
                    }
                    state.running.insert(task.core().id(), task.clone());
                    let running_len = state.running.len();
                    Dispatch::Run(task, running_len)
                }
            };

            let (task, running_len) = match action {
                Dispatch::Skip(task) => {
                    let id = task.core().id();
                    tracing::info!(task_id = %id, "skipping cancelled pending task");
                    if self.tracker.remove_task(id).is_err() {
                        tracing::warn!(task_id = %id, "cancelled task was not tracked");
                    }
                    continue;
                }
                Dispatch::Run(task, running_len) => (task, running_len),
            };

            let id = task.core().id();
            if let Some(queue) = self.me.upgrade() {
                let worker_task = task.clone();
                tokio::spawn(async move {
                    let status = worker_task.run().await;
                    queue.handle_completion(worker_task, status);
                });
            }
            tracing::info!(
                task_id = %id,
                name = %task.core().name(),
                running = running_len,
                "task started"
            );
            self.events.emit(TaskEvent::QueueStatusChanged);
        }
    }

    // ─── Completion & retry ──────────────────────────────────────────────────

    /// Handle a finished run: release the slot, apply the retry policy or
    /// finalize, persist pending state and dispatch again.
    fn handle_completion(&self, task: Arc<dyn Task>, status: TaskStatus) {
        let id = task.core().id();
        {
            let mut state = self.state.lock();
            state.running.remove(&id);
            if task.core().unique_type() != UniqueType::None {
                let key = task.unique_key();
                if let Some(slots) = state.unique.get_mut(&key) {
                    slots.running = slots.running.saturating_sub(1);
                    if slots.pending == 0 && slots.running == 0 {
                        state.unique.remove(&key);
                    }
                }
            }
        }
        tracing::info!(task_id = %id, status = %status, "task completed");

        let core = task.core();
        let permanent = core.error().map(|e| e.permanent).unwrap_or(false);
        let retryable = status == TaskStatus::Failed
            && !core.is_stopped()
            && !permanent
            && core.current_retry_attempts() < core.max_retries();

        if retryable {
            let attempt = core.increment_retry();
            core.update_status(TaskStatus::Retrying);
            let delay = core.retry_delay();
            tracing::info!(
                task_id = %id,
                attempt,
                max_retries = core.max_retries(),
                delay_secs = delay.as_secs(),
                "task will retry"
            );
            self.tracker.log_failed_task(&task);
            if let Some(queue) = self.me.upgrade() {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.requeue(task);
                });
            }
        } else {
            match status {
                TaskStatus::Failed => {
                    if permanent {
                        tracing::warn!(task_id = %id, "permanent failure, retry skipped");
                    }
                    self.tracker.log_failed_task(&task);
                }
                TaskStatus::Completed => self.tracker.record_completed(&task),
                _ => {}
            }
            if self.tracker.remove_task(id).is_err() {
                tracing::warn!(task_id = %id, "finished task was not tracked");
            }
        }

        self.save_state();
        self.events.emit(TaskEvent::QueueStatusChanged);
        self.process_queue();
    }

    /// Re-admit a task whose retry delay expired. A task cancelled while
    /// waiting is dropped instead.
    fn requeue(&self, task: Arc<dyn Task>) {
        let id = task.core().id();
        if task.core().is_stopped() {
            tracing::info!(task_id = %id, "dropping cancelled task at retry expiry");
            if self.tracker.remove_task(id).is_err() {
                tracing::warn!(task_id = %id, "cancelled retrying task was not tracked");
            }
            self.save_state();
            self.events.emit(TaskEvent::QueueStatusChanged);
            return;
        }

        tracing::info!(task_id = %id, name = %task.core().name(), "re-enqueueing task for retry");
        task.core().reset_for_retry();
        {
            // Straight back into pending: the task is still tracked, so
            // re-admission must not go through add_task again.
            let mut state = self.state.lock();
            if task.core().unique_type() != UniqueType::None {
                state.unique.entry(task.unique_key()).or_default().pending += 1;
            }
            state.pending.push_back(task);
        }
        self.events.emit(TaskEvent::QueueStatusChanged);
        self.process_queue();
    }

    fn release_pending_slot(state: &mut QueueState, task: &Arc<dyn Task>) {
        if task.core().unique_type() == UniqueType::None {
            return;
        }
        let key = task.unique_key();
        if let Some(slots) = state.unique.get_mut(&key) {
            slots.pending = slots.pending.saturating_sub(1);
            if slots.pending == 0 && slots.running == 0 {
                state.unique.remove(&key);
            }
        }
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }

    /// Queue statistics snapshot.
    pub fn queue_status(&self) -> Value {
        let state = self.state.lock();
        json!({
            "pending": state.pending.len(),
            "running": state.running.len(),
            "maxConcurrent": state.max_concurrent,
        })
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    /// Persist the serialized blobs of persistent pending tasks.
    pub fn save_state(&self) {
        let blobs: Vec<Value> = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .filter(|task| task.core().is_persistent())
                .map(|task| task.serialize())
                .collect()
        };
        let count = blobs.len();
        if let Err(error) = self.storage.save(keys::PENDING_TASKS, Value::Array(blobs)) {
            tracing::error!(%error, "failed to persist pending tasks");
        } else {
            tracing::debug!(count, "persisted pending tasks");
        }
    }

    /// Restore persisted pending tasks through the registry and re-admit
    /// them. Blobs without a kind discriminator are skipped with a
    /// warning; reconstruction failures are logged and skipped.
    pub fn load_state(&self) {
        let Some(Value::Array(blobs)) = self.storage.load(keys::PENDING_TASKS) else {
            tracing::debug!("no persisted pending tasks to load");
            return;
        };
        tracing::info!(count = blobs.len(), "restoring persisted pending tasks");
        for blob in blobs {
            if blob["kind"].as_str().is_none() {
                tracing::warn!("cannot restore task: missing kind discriminator");
                continue;
            }
            match self.registry.deserialize(&blob) {
                Ok(task) => {
                    self.add_task(task);
                }
                Err(error) => {
                    tracing::error!(%error, "failed to restore task, skipping");
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
