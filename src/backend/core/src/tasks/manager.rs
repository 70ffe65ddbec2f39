//! The task system facade.
//!
//! [`TaskManager`] wires the tracker, queue, scheduler and store together
//! and exposes the public surface embedding applications use: task and
//! chain submission (immediate or scheduled), lifecycle control, bulk
//! tag operations, introspection and persistence. All subsystem events
//! flow through one shared [`EventBus`], so [`TaskManager::subscribe`]
//! is the single subscription point.

use serde_json::Value;
use std::sync::Arc;

use crate::config::TaskSystemConfig;
use crate::error::{Result, TaskSystemError};
use crate::events::{EventBus, TaskEvent};
use crate::storage::{JsonStorage, Storage};
use crate::tasks::chain::{TaskChain, CHAINED_CHILD_TAG};
use crate::tasks::queue::TaskQueue;
use crate::tasks::registry::TaskRegistry;
use crate::tasks::scheduler::{TaskScheduler, Trigger};
use crate::tasks::status::TaskStatus;
use crate::tasks::task::{Task, TaskId};
use crate::tasks::tracker::TaskTracker;

/// Central orchestrator for the task system.
///
/// Construction loads persisted state (pending tasks, histories,
/// scheduled jobs) and emits [`TaskEvent::SystemReady`]. Must be created
/// within a tokio runtime.
pub struct TaskManager {
    config: TaskSystemConfig,
    storage: Arc<dyn Storage>,
    registry: Arc<TaskRegistry>,
    events: EventBus,
    tracker: Arc<TaskTracker>,
    queue: Arc<TaskQueue>,
    scheduler: Arc<TaskScheduler>,
}

impl TaskManager {
    /// Create a manager backed by the default JSON file store.
    pub fn new(config: TaskSystemConfig, registry: Arc<TaskRegistry>) -> Arc<Self> {
        let storage = Arc::new(JsonStorage::new(&config.storage_path));
        Self::with_storage(config, registry, storage)
    }

    /// Create a manager over a custom store.
    pub fn with_storage(
        config: TaskSystemConfig,
        registry: Arc<TaskRegistry>,
        storage: Arc<dyn Storage>,
    ) -> Arc<Self> {
        let events = EventBus::new(config.event_capacity);
        Self::with_parts(config, registry, storage, events)
    }

    /// Create a manager over a custom store and a caller-owned event bus.
    ///
    /// Subscribing to the bus before construction guarantees delivery of
    /// the `SystemReady` event.
    pub fn with_parts(
        config: TaskSystemConfig,
        registry: Arc<TaskRegistry>,
        storage: Arc<dyn Storage>,
        events: EventBus,
    ) -> Arc<Self> {
        tracing::info!("initializing task manager subsystems");
        let tracker = Arc::new(TaskTracker::new(
            storage.clone(),
            events.clone(),
            config.history_limit,
        ));
        let queue = TaskQueue::new(
            tracker.clone(),
            storage.clone(),
            registry.clone(),
            events.clone(),
            config.max_concurrent_tasks,
        );
        let scheduler = TaskScheduler::new(
            queue.clone(),
            registry.clone(),
            storage.clone(),
            events.clone(),
        );

        let manager = Arc::new(Self {
            config,
            storage,
            registry,
            events,
            tracker,
            queue,
            scheduler,
        });
        manager.queue.load_state();
        manager.scheduler.load_jobs();
        tracing::info!("task manager initialized");
        manager.events.emit(TaskEvent::SystemReady);
        manager
    }

    // ─── Observation ─────────────────────────────────────────────────────────

    /// Subscribe to every event the system emits.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// The kind registry used for deserialization.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// The active configuration.
    pub fn config(&self) -> &TaskSystemConfig {
        &self.config
    }

    // ─── Submission ──────────────────────────────────────────────────────────

    /// Submit a task for execution, immediately or on a schedule.
    pub fn add_task(&self, task: Arc<dyn Task>, schedule: Option<Trigger>) -> Result<()> {
        match schedule {
            Some(trigger) => {
                tracing::info!(
                    task_id = %task.core().id(),
                    name = %task.core().name(),
                    "scheduling task"
                );
                self.scheduler.schedule(task, trigger)?;
            }
            None => {
                tracing::info!(
                    task_id = %task.core().id(),
                    name = %task.core().name(),
                    "adding task to queue"
                );
                self.queue.add_task(task);
            }
        }
        Ok(())
    }

    /// Submit a chain built with [`TaskChain::builder`]. Returns the
    /// chain's task id.
    pub fn add_chain_task(&self, chain: TaskChain, schedule: Option<Trigger>) -> Result<TaskId> {
        let id = chain.core().id();
        self.add_task(Arc::new(chain), schedule)?;
        Ok(id)
    }

    // ─── Lifecycle control ───────────────────────────────────────────────────

    /// Cancel a tracked task.
    pub async fn cancel_task(&self, id: TaskId) -> Result<()> {
        let task = self
            .tracker
            .get_task(id)
            .ok_or(TaskSystemError::TaskNotFound { id })?;
        task.cancel().await;
        Ok(())
    }

    /// Pause a running task.
    pub fn pause_task(&self, id: TaskId) -> Result<()> {
        let task = self
            .tracker
            .get_task(id)
            .ok_or(TaskSystemError::TaskNotFound { id })?;
        task.pause()
    }

    /// Resume a paused task.
    pub fn resume_task(&self, id: TaskId) -> Result<()> {
        let task = self
            .tracker
            .get_task(id)
            .ok_or(TaskSystemError::TaskNotFound { id })?;
        task.resume()
    }

    /// Cancel every task carrying `tag`. Chain children are skipped
    /// unless `include_chain_children` is set, keeping chain-level
    /// control authoritative over child lifecycle. Returns the number of
    /// tasks cancelled.
    pub async fn stop_tasks_by_tag(&self, tag: &str, include_chain_children: bool) -> usize {
        let mut stopped = 0;
        for task in self.tracker.tasks_by_tag(tag) {
            if !include_chain_children && task.core().has_tag(CHAINED_CHILD_TAG) {
                continue;
            }
            task.cancel().await;
            stopped += 1;
        }
        tracing::info!(tag, stopped, include_chain_children, "bulk stop by tag");
        stopped
    }

    /// Pause every running task carrying `tag`; non-running tasks are
    /// skipped. Returns the number of tasks paused.
    pub fn pause_tasks_by_tag(&self, tag: &str, include_chain_children: bool) -> usize {
        let mut paused = 0;
        for task in self.tracker.tasks_by_tag(tag) {
            if !include_chain_children && task.core().has_tag(CHAINED_CHILD_TAG) {
                continue;
            }
            if task.pause().is_ok() {
                paused += 1;
            }
        }
        tracing::info!(tag, paused, include_chain_children, "bulk pause by tag");
        paused
    }

    /// Route an externally supplied progress value to a chain.
    pub fn update_chain_progress(&self, chain_id: TaskId, progress: u8) -> Result<()> {
        let task = self
            .tracker
            .get_task(chain_id)
            .ok_or(TaskSystemError::TaskNotFound { id: chain_id })?;
        match task.as_chain() {
            Some(chain) => {
                chain.apply_external_progress(progress);
                Ok(())
            }
            None => Err(TaskSystemError::InvalidTaskState {
                id: chain_id,
                status: task.core().status(),
                operation: "update chain progress on",
            }),
        }
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    /// Current status of a tracked task.
    pub fn get_task_status(&self, id: TaskId) -> Result<TaskStatus> {
        let task = self
            .tracker
            .get_task(id)
            .ok_or(TaskSystemError::TaskNotFound { id })?;
        Ok(task.core().status())
    }

    /// Serialized view of one task, with chain metadata where relevant.
    pub fn get_task_info(&self, id: TaskId) -> Result<Value> {
        self.tracker.get_task_info(id)
    }

    /// Serialized views of all active tasks.
    pub fn get_all_tasks(&self) -> Vec<Value> {
        self.tracker.all_tasks_info()
    }

    /// The failed task history, oldest first.
    pub fn get_failed_tasks(&self) -> Vec<Value> {
        self.tracker.failed_history()
    }

    /// The completed task history, oldest first.
    pub fn get_completed_tasks(&self) -> Vec<Value> {
        self.tracker.completed_history()
    }

    /// Live handles of tasks carrying `tag`.
    pub fn get_tasks_by_tag(&self, tag: &str) -> Vec<Arc<dyn Task>> {
        self.tracker.tasks_by_tag(tag)
    }

    /// Whether any active task carries `tag`.
    pub fn has_tasks_with_tag(&self, tag: &str) -> bool {
        self.tracker.has_tasks_with_tag(tag)
    }

    /// Queue statistics snapshot.
    pub fn get_queue_status(&self) -> Value {
        self.queue.queue_status()
    }

    /// Listing of scheduled jobs.
    pub fn get_scheduled_jobs(&self) -> Vec<Value> {
        self.scheduler.scheduled_jobs()
    }

    /// Remove a scheduled job.
    pub fn unschedule_job(&self, job_id: &str) -> Result<()> {
        self.scheduler.unschedule(job_id)
    }

    /// Update the queue's concurrency limit (must be greater than zero).
    pub fn set_max_concurrent_tasks(&self, count: usize) -> Result<()> {
        tracing::info!(count, "setting max concurrent tasks");
        self.queue.set_max_concurrent(count)
    }

    // ─── Persistence & lifecycle ─────────────────────────────────────────────

    /// Reload pending tasks and histories from the store.
    pub fn load_state(&self) {
        tracing::info!("loading task manager state");
        self.queue.load_state();
        self.tracker.load_state();
    }

    /// Persist pending tasks, histories and scheduled jobs.
    pub fn save_state(&self) {
        tracing::info!("saving task manager state");
        self.queue.save_state();
        self.tracker.save_state();
        self.scheduler.save_jobs();
    }

    /// Save all state and stop the scheduler's timers. Running tasks are
    /// not interrupted.
    pub fn shutdown(&self) {
        tracing::info!("shutting down task manager");
        self.save_state();
        self.scheduler.shutdown();
        tracing::info!("task manager shutdown complete");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::tasks::task::tests::{ProbeTask, SlowLoopTask};
    use crate::tasks::task::TaskCore;
    use chrono::Utc;
    use std::time::{Duration, Instant};

    fn manager_with(max_concurrent: usize) -> (Arc<TaskManager>, tokio::sync::broadcast::Receiver<TaskEvent>) {
        let registry = Arc::new(TaskRegistry::with_chain());
        registry.register("ProbeTask", |_, blob| {
            Ok(Arc::new(ProbeTask::with_core(TaskCore::from_blob(
                "ProbeTask",
                blob,
            ))))
        });
        let events = EventBus::new(1024);
        let rx = events.subscribe();
        let config = TaskSystemConfig {
            max_concurrent_tasks: max_concurrent,
            ..Default::default()
        };
        let manager = TaskManager::with_parts(
            config,
            registry,
            Arc::new(MemoryStorage::new()),
            events,
        );
        (manager, rx)
    }

    async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + timeout;
        while !condition() {
            if Instant::now() > deadline {
                panic!("condition not met within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn slow(name: &str, tags: &[&str]) -> Arc<SlowLoopTask> {
        let task = SlowLoopTask::new(name, 50, Duration::from_millis(20));
        for tag in tags {
            task.core().add_tag(*tag);
        }
        Arc::new(task)
    }

    #[tokio::test]
    async fn test_system_ready_and_task_roundtrip() {
        let (manager, mut rx) = manager_with(3);
        assert!(matches!(rx.try_recv().unwrap(), TaskEvent::SystemReady));

        let task = Arc::new(ProbeTask::new("T"));
        let id = task.core().id();
        manager.add_task(task, None).unwrap();
        wait_until(Duration::from_secs(2), || manager.get_all_tasks().is_empty()).await;

        let completed = manager.get_completed_tasks();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0]["id"], id.to_string());
    }

    #[tokio::test]
    async fn test_lifecycle_control_errors() {
        let (manager, _rx) = manager_with(3);
        let missing = TaskId::new();
        assert!(matches!(
            manager.cancel_task(missing).await,
            Err(TaskSystemError::TaskNotFound { .. })
        ));
        assert!(matches!(
            manager.pause_task(missing),
            Err(TaskSystemError::TaskNotFound { .. })
        ));
        assert!(matches!(
            manager.resume_task(missing),
            Err(TaskSystemError::TaskNotFound { .. })
        ));
        assert!(matches!(
            manager.get_task_status(missing),
            Err(TaskSystemError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume_running_task() {
        let (manager, _rx) = manager_with(3);
        let task = slow("Pausable", &[]);
        let id = task.core().id();
        manager.add_task(task.clone() as Arc<dyn Task>, None).unwrap();
        wait_until(Duration::from_secs(1), || {
            manager.get_task_status(id).ok() == Some(TaskStatus::Running)
        })
        .await;

        manager.pause_task(id).unwrap();
        assert_eq!(manager.get_task_status(id).unwrap(), TaskStatus::Paused);
        // Pausing again is an invalid state transition.
        assert!(matches!(
            manager.pause_task(id),
            Err(TaskSystemError::InvalidTaskState { .. })
        ));

        manager.resume_task(id).unwrap();
        assert_eq!(manager.get_task_status(id).unwrap(), TaskStatus::Running);
        manager.cancel_task(id).await.unwrap();
        wait_until(Duration::from_secs(2), || manager.get_all_tasks().is_empty()).await;
    }

    #[tokio::test]
    async fn test_bulk_stop_excludes_chain_children_by_default() {
        let (manager, _rx) = manager_with(8);
        let net1 = slow("Net1", &["Network"]);
        let net2 = slow("Net2", &["Network"]);
        let disk = slow("Disk1", &["Disk"]);
        let chain_child = slow("ChainChild", &["Network"]);
        let chain = TaskChain::builder("Chain")
            .task(chain_child.clone() as Arc<dyn Task>)
            .build();

        manager.add_task(net1.clone() as Arc<dyn Task>, None).unwrap();
        manager.add_task(net2.clone() as Arc<dyn Task>, None).unwrap();
        manager.add_task(disk.clone() as Arc<dyn Task>, None).unwrap();
        manager.add_chain_task(chain, None).unwrap();
        wait_until(Duration::from_secs(1), || {
            chain_child.core().status() == TaskStatus::Running
        })
        .await;

        let stopped = manager.stop_tasks_by_tag("Network", false).await;
        assert_eq!(stopped, 2);
        assert!(net1.core().is_stopped());
        assert!(net2.core().is_stopped());
        assert!(!disk.core().is_stopped());
        assert!(!chain_child.core().is_stopped());

        let stopped = manager.stop_tasks_by_tag("Network", true).await;
        assert!(stopped >= 1);
        assert!(chain_child.core().is_stopped());

        manager.stop_tasks_by_tag("Disk", false).await;
        wait_until(Duration::from_secs(3), || manager.get_all_tasks().is_empty()).await;
    }

    #[tokio::test]
    async fn test_chain_submission_and_context_result() {
        let (manager, _rx) = manager_with(3);
        let a = Arc::new(ProbeTask::new("A"));
        let b = Arc::new(ProbeTask::new("B"));
        let chain = TaskChain::builder("Pipeline")
            .tasks([a as Arc<dyn Task>, b as Arc<dyn Task>])
            .build();
        chain.context().set("seed", serde_json::json!(7));

        let chain_id = manager.add_chain_task(chain, None).unwrap();
        wait_until(Duration::from_secs(2), || manager.get_all_tasks().is_empty()).await;

        let completed = manager.get_completed_tasks();
        let entry = completed
            .iter()
            .find(|entry| entry["id"] == chain_id.to_string())
            .expect("chain in completed history");
        assert_eq!(entry["status"], "COMPLETED");
        assert_eq!(entry["result"]["seed"], 7);
    }

    #[tokio::test]
    async fn test_update_chain_progress() {
        let (manager, _rx) = manager_with(3);
        let child = slow("Slow", &[]);
        let chain = TaskChain::builder("Progress Chain")
            .task(child as Arc<dyn Task>)
            .build();
        let chain_id = manager.add_chain_task(chain, None).unwrap();
        wait_until(Duration::from_secs(1), || {
            manager.get_task_status(chain_id).ok() == Some(TaskStatus::Running)
        })
        .await;

        manager.update_chain_progress(chain_id, 42).unwrap();
        let info = manager.get_task_info(chain_id).unwrap();
        assert_eq!(info["progress"], 42);

        // Non-chain targets are rejected.
        let plain = Arc::new(ProbeTask::new("Plain")) as Arc<dyn Task>;
        let plain_id = plain.core().id();
        manager.add_task(plain, None).unwrap();
        let result = manager.update_chain_progress(plain_id, 10);
        assert!(matches!(
            result,
            Err(TaskSystemError::InvalidTaskState { .. })
                | Err(TaskSystemError::TaskNotFound { .. })
        ));

        manager.cancel_task(chain_id).await.unwrap();
        wait_until(Duration::from_secs(3), || manager.get_all_tasks().is_empty()).await;
    }

    #[tokio::test]
    async fn test_scheduled_submission_route() {
        let (manager, _rx) = manager_with(3);
        let task = Arc::new(ProbeTask::new("Later"));
        let id = task.core().id();
        manager
            .add_task(
                task as Arc<dyn Task>,
                Some(Trigger::Date {
                    run_at: Utc::now() + chrono::Duration::milliseconds(200),
                }),
            )
            .unwrap();

        assert_eq!(manager.get_scheduled_jobs().len(), 1);
        assert_eq!(manager.get_queue_status()["pending"], 0);

        wait_until(Duration::from_secs(3), || {
            manager.get_scheduled_jobs().is_empty()
        })
        .await;
        wait_until(Duration::from_secs(2), || {
            manager
                .get_completed_tasks()
                .iter()
                .any(|entry| entry["id"] == id.to_string())
        })
        .await;
    }

    #[tokio::test]
    async fn test_queue_status_and_concurrency_setting() {
        let (manager, _rx) = manager_with(2);
        let status = manager.get_queue_status();
        assert_eq!(status["pending"], 0);
        assert_eq!(status["running"], 0);
        assert_eq!(status["maxConcurrent"], 2);

        assert!(manager.set_max_concurrent_tasks(5).is_ok());
        assert_eq!(manager.get_queue_status()["maxConcurrent"], 5);
        assert!(manager.set_max_concurrent_tasks(0).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_saves_state_and_stops_timers() {
        let registry = Arc::new(TaskRegistry::with_chain());
        registry.register("ProbeTask", |_, blob| {
            Ok(Arc::new(ProbeTask::with_core(TaskCore::from_blob(
                "ProbeTask",
                blob,
            ))))
        });
        let storage = Arc::new(MemoryStorage::new());
        let manager = TaskManager::with_storage(
            TaskSystemConfig::default(),
            registry,
            storage.clone(),
        );
        let task = Arc::new(ProbeTask::new("Scheduled"));
        manager
            .add_task(
                task as Arc<dyn Task>,
                Some(Trigger::Date {
                    run_at: Utc::now() + chrono::Duration::seconds(3600),
                }),
            )
            .unwrap();

        manager.shutdown();
        assert!(manager.get_scheduled_jobs().is_empty());
        // All four top-level keys were written.
        for key in [
            crate::storage::keys::PENDING_TASKS,
            crate::storage::keys::SCHEDULED_JOBS,
            crate::storage::keys::FAILED_TASK_HISTORY,
            crate::storage::keys::COMPLETED_TASK_HISTORY,
        ] {
            assert!(storage.load(key).is_some(), "{key} persisted");
        }
        // The scheduled job survives shutdown for the next start.
        assert_eq!(
            storage
                .load(crate::storage::keys::SCHEDULED_JOBS)
                .unwrap()
                .as_array()
                .unwrap()
                .len(),
            1
        );
    }
}
