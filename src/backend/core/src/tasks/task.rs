//! Task definitions and lifecycle management.
//!
//! This module provides the core abstractions for defining tasks:
//!
//! - **Task trait**: the interface every concrete task kind implements
//! - **TaskCore**: shared lifecycle state (status, progress, retry
//!   bookkeeping, tags) embedded by every concrete task
//! - **TaskControl**: cooperative cancellation flag plus the pause gate
//! - **TaskError**: structured failure payload with a permanence flag

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Result, TaskSystemError};
use crate::events::{EventBus, TaskEvent};
use crate::tasks::chain::TaskChain;
use crate::tasks::context::ChainContext;
use crate::tasks::status::{TaskStatus, UniqueType};

/// Bounded wait used by the pause gate so cancellation stays observable
/// even if a wake-up is missed.
pub(crate) const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ═══════════════════════════════════════════════════════════════════════════════
// Task Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a task instance, assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured failure payload produced by a task body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    /// Human-readable description of the failure
    pub message: String,
    /// Optional machine-readable failure kind
    pub kind: Option<String>,
    /// A permanent failure is never retried, regardless of the retry budget
    pub permanent: bool,
}

impl TaskError {
    /// Create a retryable failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            permanent: false,
        }
    }

    /// Create a permanent (non-retryable) failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            permanent: true,
        }
    }

    /// Attach a failure kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(kind) = &self.kind {
            write!(f, " ({kind})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

impl From<TaskSystemError> for TaskError {
    fn from(error: TaskSystemError) -> Self {
        Self {
            message: error.to_string(),
            kind: Some(error.code().as_str().to_string()),
            permanent: !error.is_retryable(),
        }
    }
}

/// Result type returned by task bodies.
pub type TaskResult = std::result::Result<(), TaskError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Task Control (cancellation + pause gate)
// ═══════════════════════════════════════════════════════════════════════════════

/// Cooperative cancellation flag and pause gate shared with the task body.
///
/// Cancellation is never preemptive: the body observes the stop flag at
/// its next [`TaskControl::is_stopped`] or [`TaskControl::check_paused`]
/// call. The pause gate blocks the body with a bounded wait so a
/// cancellation issued while paused is observed within one poll interval.
#[derive(Debug)]
pub struct TaskControl {
    stop_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
}

impl TaskControl {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);
        Self { stop_tx, pause_tx }
    }

    /// Check if a stop has been requested. Non-blocking.
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Check if the task is currently paused.
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Request a stop and wake any pause wait.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Clear the stop flag (used when re-admitting a task for retry).
    pub fn clear_stop(&self) {
        self.stop_tx.send_replace(false);
    }

    /// Set or clear the pause flag, waking any waiter.
    pub fn set_paused(&self, paused: bool) {
        self.pause_tx.send_replace(paused);
    }

    /// Block while the task is paused.
    ///
    /// Returns promptly when the task is resumed or stopped; otherwise
    /// re-checks at least every [`PAUSE_POLL_INTERVAL`].
    pub async fn check_paused(&self) {
        loop {
            if self.is_stopped() || !self.is_paused() {
                return;
            }
            let mut pause_rx = self.pause_tx.subscribe();
            let mut stop_rx = self.stop_tx.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
                _ = pause_rx.changed() => {}
                _ = stop_rx.changed() => {}
            }
        }
    }

    /// Sleep for `duration`, returning early when a stop is requested.
    ///
    /// Returns `true` if the full duration elapsed, `false` on stop.
    pub async fn sleep_cancellable(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = async {
                loop {
                    if stop_rx.changed().await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                    if *stop_rx.borrow() {
                        return;
                    }
                }
            } => false,
        }
    }
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Core
// ═══════════════════════════════════════════════════════════════════════════════

/// Mutable lifecycle state guarded by the core's mutex.
#[derive(Debug)]
struct TaskState {
    name: String,
    description: String,
    status: TaskStatus,
    progress: u8,
    result: Option<Value>,
    error: Option<TaskError>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    is_persistent: bool,
    max_retries: u32,
    retry_delay: Duration,
    current_retry_attempts: u32,
    fail_silently: bool,
    chain_id: Option<TaskId>,
    tags: HashSet<String>,
    unique_type: UniqueType,
}

/// Shared lifecycle state embedded by every concrete task.
///
/// The core owns the identity, the serializable state, the control flags
/// and the (tracker-attached) event sender. Concrete tasks hold exactly
/// one and expose it through [`Task::core`].
#[derive(Debug)]
pub struct TaskCore {
    id: TaskId,
    state: Mutex<TaskState>,
    control: TaskControl,
    events: Mutex<Option<EventBus>>,
    chain_context: Mutex<Option<Arc<ChainContext>>>,
}

impl TaskCore {
    /// Create a new core for a task of the given kind.
    ///
    /// The kind name is always present in the tag set.
    pub fn new(kind: &str, name: impl Into<String>) -> Self {
        let id = TaskId::new();
        let name = name.into();
        let mut tags = HashSet::new();
        tags.insert(kind.to_string());
        tracing::debug!(task_id = %id, name = %name, kind, "task created");
        Self {
            id,
            state: Mutex::new(TaskState {
                name,
                description: String::new(),
                status: TaskStatus::Pending,
                progress: 0,
                result: None,
                error: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                is_persistent: false,
                max_retries: 0,
                retry_delay: Duration::from_secs(5),
                current_retry_attempts: 0,
                fail_silently: false,
                chain_id: None,
                tags,
                unique_type: UniqueType::None,
            }),
            control: TaskControl::new(),
            events: Mutex::new(None),
            chain_context: Mutex::new(None),
        }
    }

    // ─── Builder-style construction ──────────────────────────────────────────

    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.state.lock().description = description.into();
        self
    }

    pub fn with_persistent(self, persistent: bool) -> Self {
        self.state.lock().is_persistent = persistent;
        self
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        self.state.lock().max_retries = max_retries;
        self
    }

    /// Delay between retry attempts; clamped to at least one second.
    pub fn with_retry_delay_secs(self, secs: u64) -> Self {
        self.state.lock().retry_delay = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_fail_silently(self, fail_silently: bool) -> Self {
        self.state.lock().fail_silently = fail_silently;
        self
    }

    pub fn with_unique_type(self, unique_type: UniqueType) -> Self {
        self.state.lock().unique_type = unique_type;
        self
    }

    pub fn with_tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.state.lock();
            for tag in tags {
                state.tags.insert(tag.into());
            }
        }
        self
    }

    // ─── Getters ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn description(&self) -> String {
        self.state.lock().description.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn progress(&self) -> u8 {
        self.state.lock().progress
    }

    pub fn result(&self) -> Option<Value> {
        self.state.lock().result.clone()
    }

    pub fn error(&self) -> Option<TaskError> {
        self.state.lock().error.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.lock().created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().finished_at
    }

    pub fn is_persistent(&self) -> bool {
        self.state.lock().is_persistent
    }

    pub fn max_retries(&self) -> u32 {
        self.state.lock().max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.state.lock().retry_delay
    }

    pub fn current_retry_attempts(&self) -> u32 {
        self.state.lock().current_retry_attempts
    }

    pub fn fail_silently(&self) -> bool {
        self.state.lock().fail_silently
    }

    pub fn chain_id(&self) -> Option<TaskId> {
        self.state.lock().chain_id
    }

    pub fn unique_type(&self) -> UniqueType {
        self.state.lock().unique_type
    }

    pub fn control(&self) -> &TaskControl {
        &self.control
    }

    // ─── Tags ────────────────────────────────────────────────────────────────

    pub fn tags(&self) -> HashSet<String> {
        self.state.lock().tags.clone()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.state.lock().tags.contains(tag)
    }

    pub fn add_tag(&self, tag: impl Into<String>) {
        self.state.lock().tags.insert(tag.into());
    }

    pub fn remove_tag(&self, tag: &str) {
        self.state.lock().tags.remove(tag);
    }

    // ─── Cooperative control shortcuts ───────────────────────────────────────

    /// Check if a stop has been requested. Task bodies must poll this.
    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    /// Block while paused; see [`TaskControl::check_paused`].
    pub async fn check_paused(&self) {
        self.control.check_paused().await
    }

    /// Interruptible sleep; see [`TaskControl::sleep_cancellable`].
    pub async fn sleep_cancellable(&self, duration: Duration) -> bool {
        self.control.sleep_cancellable(duration).await
    }

    // ─── Mutators ────────────────────────────────────────────────────────────

    /// Update status and emit a status event.
    ///
    /// Every write is validated against the lifecycle state machine
    /// ([`TaskStatus::can_transition_to`]); an illegal transition leaves
    /// the status untouched and returns
    /// [`TaskSystemError::InvalidStateTransition`].
    pub fn set_status(&self, new_status: TaskStatus) -> Result<()> {
        let old_status = {
            let mut state = self.state.lock();
            if !state.status.can_transition_to(&new_status) {
                return Err(TaskSystemError::InvalidStateTransition {
                    id: self.id,
                    from: state.status,
                    to: new_status,
                });
            }
            let old = state.status;
            state.status = new_status;
            old
        };
        tracing::debug!(
            task_id = %self.id,
            from = %old_status,
            to = %new_status,
            "task status changed"
        );
        self.emit(TaskEvent::TaskStatusUpdated {
            id: self.id,
            status: new_status,
        });
        Ok(())
    }

    /// Apply a lifecycle transition that cannot be propagated as an
    /// error (worker, chain and cancellation paths). A rejection is
    /// logged and leaves the status unchanged.
    pub(crate) fn update_status(&self, new_status: TaskStatus) {
        if let Err(error) = self.set_status(new_status) {
            tracing::warn!(task_id = %self.id, %error, "status transition rejected");
        }
    }

    /// Update progress (clamped to 100) and emit a progress event.
    pub fn set_progress(&self, value: u8) {
        let clamped = value.min(100);
        self.state.lock().progress = clamped;
        self.emit(TaskEvent::TaskProgressUpdated {
            id: self.id,
            progress: clamped,
        });
    }

    pub fn set_result(&self, result: Value) {
        self.state.lock().result = Some(result);
    }

    pub fn set_error(&self, error: Option<TaskError>) {
        self.state.lock().error = error;
    }

    /// Stamp the owning chain's id. Called by `TaskChain` on construction.
    pub fn set_chain_id(&self, chain_id: TaskId) {
        self.state.lock().chain_id = Some(chain_id);
    }

    /// Inject the shared chain context. Called by `TaskChain` only.
    pub fn set_chain_context(&self, context: Arc<ChainContext>) {
        *self.chain_context.lock() = Some(context);
    }

    /// The shared chain context, if this task runs inside a chain.
    pub fn chain_context(&self) -> Option<Arc<ChainContext>> {
        self.chain_context.lock().clone()
    }

    pub(crate) fn mark_started(&self) {
        self.state.lock().started_at = Some(Utc::now());
    }

    pub(crate) fn mark_finished(&self) -> Option<chrono::Duration> {
        let mut state = self.state.lock();
        let finished = Utc::now();
        state.finished_at = Some(finished);
        state.started_at.map(|started| finished - started)
    }

    /// Consume one retry attempt, returning the new attempt count.
    pub(crate) fn increment_retry(&self) -> u32 {
        let mut state = self.state.lock();
        state.current_retry_attempts += 1;
        state.current_retry_attempts
    }

    /// Reset the task for a fresh run attempt inside a chain: back to
    /// `Pending` with zero progress and no error. The stop flag is left
    /// untouched so a cancelled chain stays cancelled.
    pub fn reset_for_attempt(&self) {
        self.set_error(None);
        {
            let mut state = self.state.lock();
            state.progress = 0;
        }
        if self.status() != TaskStatus::Pending {
            self.update_status(TaskStatus::Pending);
        }
    }

    /// Reset the task for queue re-admission after a retry delay: a full
    /// attempt reset plus a cleared stop flag.
    pub fn reset_for_retry(&self) {
        self.control.clear_stop();
        self.reset_for_attempt();
    }

    // ─── Events ──────────────────────────────────────────────────────────────

    /// Attach the engine's event bus. Called by the tracker when the task
    /// is registered; emissions before that are dropped.
    pub(crate) fn attach_events(&self, bus: EventBus) {
        *self.events.lock() = Some(bus);
    }

    /// Detach from the event bus. Called by the tracker on removal.
    pub(crate) fn detach_events(&self) {
        *self.events.lock() = None;
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        let bus = self.events.lock().clone();
        if let Some(bus) = bus {
            bus.emit(event);
        }
    }

    pub(crate) fn emit_finished(&self) {
        let (status, result, error) = {
            let state = self.state.lock();
            (
                state.status,
                state.result.clone(),
                state.error.as_ref().map(|e| e.message.clone()),
            )
        };
        self.emit(TaskEvent::TaskFinished {
            id: self.id,
            status,
            result,
            error,
        });
    }

    // ─── Serialization ───────────────────────────────────────────────────────

    /// Serialize the core fields into the persisted blob layout.
    pub fn serialize_core(&self, kind: &str) -> Map<String, Value> {
        let state = self.state.lock();
        let mut tags: Vec<&String> = state.tags.iter().collect();
        tags.sort();

        let mut map = Map::new();
        map.insert("id".into(), Value::String(self.id.to_string()));
        map.insert("kind".into(), Value::String(kind.to_string()));
        map.insert("name".into(), Value::String(state.name.clone()));
        map.insert(
            "description".into(),
            Value::String(state.description.clone()),
        );
        map.insert("status".into(), Value::String(state.status.as_str().into()));
        map.insert("progress".into(), Value::from(state.progress));
        map.insert(
            "result".into(),
            state.result.clone().unwrap_or(Value::Null),
        );
        map.insert(
            "error".into(),
            state
                .error
                .as_ref()
                .and_then(|e| serde_json::to_value(e).ok())
                .unwrap_or(Value::Null),
        );
        map.insert(
            "createdAt".into(),
            Value::String(state.created_at.to_rfc3339()),
        );
        map.insert(
            "startedAt".into(),
            state
                .started_at
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        map.insert(
            "finishedAt".into(),
            state
                .finished_at
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        map.insert("isPersistent".into(), Value::Bool(state.is_persistent));
        map.insert("maxRetries".into(), Value::from(state.max_retries));
        map.insert(
            "retryDelaySeconds".into(),
            Value::from(state.retry_delay.as_secs()),
        );
        map.insert(
            "currentRetryAttempts".into(),
            Value::from(state.current_retry_attempts),
        );
        map.insert("failSilently".into(), Value::Bool(state.fail_silently));
        map.insert(
            "chainId".into(),
            state
                .chain_id
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null),
        );
        map.insert(
            "tags".into(),
            Value::Array(tags.iter().map(|t| Value::String((*t).clone())).collect()),
        );
        map.insert(
            "uniqueType".into(),
            Value::String(state.unique_type.as_str().into()),
        );
        map
    }

    /// Reconstruct a core from a persisted blob, restoring the original id
    /// and all serialized lifecycle fields.
    pub fn from_blob(kind: &str, data: &Value) -> Self {
        let core = Self::new(kind, data["name"].as_str().unwrap_or("Unnamed task"));
        {
            let mut state = core.state.lock();
            if let Some(description) = data["description"].as_str() {
                state.description = description.to_string();
            }
            if let Some(status) = data["status"].as_str().and_then(TaskStatus::from_name) {
                state.status = status;
            }
            if let Some(progress) = data["progress"].as_u64() {
                state.progress = progress.min(100) as u8;
            }
            if !data["result"].is_null() {
                state.result = Some(data["result"].clone());
            }
            if !data["error"].is_null() {
                state.error = serde_json::from_value(data["error"].clone()).ok();
            }
            state.created_at = parse_timestamp(&data["createdAt"]).unwrap_or(state.created_at);
            state.started_at = parse_timestamp(&data["startedAt"]);
            state.finished_at = parse_timestamp(&data["finishedAt"]);
            state.is_persistent = data["isPersistent"].as_bool().unwrap_or(false);
            state.max_retries = data["maxRetries"].as_u64().unwrap_or(0) as u32;
            state.retry_delay =
                Duration::from_secs(data["retryDelaySeconds"].as_u64().unwrap_or(5).max(1));
            state.current_retry_attempts =
                data["currentRetryAttempts"].as_u64().unwrap_or(0) as u32;
            state.fail_silently = data["failSilently"].as_bool().unwrap_or(false);
            state.chain_id = data["chainId"].as_str().and_then(|s| s.parse().ok());
            if let Some(tags) = data["tags"].as_array() {
                for tag in tags.iter().filter_map(|t| t.as_str()) {
                    state.tags.insert(tag.to_string());
                }
            }
            if let Some(unique) = data["uniqueType"].as_str().and_then(UniqueType::from_name) {
                state.unique_type = unique;
            }
        }
        if let Some(id) = data["id"].as_str().and_then(|s| s.parse().ok()) {
            // The id field is immutable after construction, so rebuild.
            return Self { id, ..core };
        }
        core
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The interface every concrete task kind implements.
///
/// A concrete task embeds a [`TaskCore`] and provides `handle()` (the
/// body) and `cleanup_on_cancel()` (idempotent, invoked from `cancel()`).
/// The body must periodically call [`TaskCore::is_stopped`] and
/// [`TaskCore::check_paused`] to honor cancellation and pause.
///
/// # Errors
///
/// Return [`TaskError::new`] for transient failures that may be retried
/// under the task's retry policy, and [`TaskError::permanent`] for
/// failures that must never be retried.
#[async_trait]
pub trait Task: Send + Sync {
    /// Stable kind discriminator, used for serialization and the
    /// deserializer registry.
    fn kind(&self) -> &'static str;

    /// The shared lifecycle core.
    fn core(&self) -> &TaskCore;

    /// Execute the task body.
    async fn handle(&self) -> TaskResult;

    /// Task-specific cleanup invoked from `cancel()`. Must be idempotent
    /// and safe to call at any point of the lifecycle.
    async fn cleanup_on_cancel(&self);

    /// Kind-specific fields merged into the serialized blob.
    fn extra_fields(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Identity used by the queue's uniqueness index.
    fn unique_key(&self) -> String {
        self.kind().to_string()
    }

    /// Downcast hook for the chain composite.
    fn as_chain(&self) -> Option<&TaskChain> {
        None
    }

    /// Execute the full lifecycle: transition to `Running`, invoke the
    /// body, resolve the terminal status (a stop observed at any point
    /// wins as `Cancelled`), stamp timestamps and emit the finished
    /// event. Safe to invoke on any worker.
    async fn run(&self) -> TaskStatus {
        let core = self.core();

        if core.is_stopped() {
            if core.status() != TaskStatus::Cancelled {
                core.update_status(TaskStatus::Cancelled);
            }
            core.mark_finished();
            core.emit_finished();
            return TaskStatus::Cancelled;
        }

        core.mark_started();
        tracing::info!(task_id = %core.id(), name = %core.name(), "task starting execution");
        core.update_status(TaskStatus::Running);

        let outcome = AssertUnwindSafe(self.handle()).catch_unwind().await;

        let final_status = match outcome {
            Ok(Ok(())) => {
                if core.is_stopped() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Completed
                }
            }
            Ok(Err(error)) => {
                core.set_error(Some(error));
                if core.is_stopped() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                }
            }
            Err(panic) => {
                let message = panic_message(panic);
                core.set_error(Some(TaskError::new(format!("task panicked: {message}"))));
                if core.is_stopped() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                }
            }
        };

        if core.status() != final_status {
            core.update_status(final_status);
        }
        let duration = core.mark_finished();
        let duration_secs = duration
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        match final_status {
            TaskStatus::Failed if core.fail_silently() => {
                tracing::debug!(
                    task_id = %core.id(),
                    duration_secs,
                    error = %core.error().map(|e| e.message).unwrap_or_default(),
                    "task failed silently"
                );
            }
            TaskStatus::Failed => {
                tracing::error!(
                    task_id = %core.id(),
                    duration_secs,
                    error = %core.error().map(|e| e.message).unwrap_or_default(),
                    "task failed"
                );
            }
            status => {
                tracing::info!(task_id = %core.id(), duration_secs, %status, "task finished");
            }
        }

        core.emit_finished();
        final_status
    }

    /// Request cancellation.
    ///
    /// Non-blocking with respect to the body: sets the stop flag, wakes
    /// any pause wait and invokes the cleanup hook. A task that is still
    /// `Pending` or `Paused` transitions directly to `Cancelled`; an
    /// in-flight body observes the flag and returns.
    async fn cancel(&self) {
        let core = self.core();
        tracing::info!(task_id = %core.id(), name = %core.name(), "cancelling task");
        core.control().request_stop();
        if matches!(core.status(), TaskStatus::Pending | TaskStatus::Paused) {
            core.update_status(TaskStatus::Cancelled);
        }
        core.control().set_paused(false);
        self.cleanup_on_cancel().await;
    }

    /// Pause a running task. The body blocks at its next `check_paused()`.
    ///
    /// `Paused` is only reachable from `Running`, so the state machine
    /// itself rejects a pause in any other state; no state changes on
    /// rejection.
    fn pause(&self) -> Result<()> {
        let core = self.core();
        core.set_status(TaskStatus::Paused)
            .map_err(|_| TaskSystemError::InvalidTaskState {
                id: core.id(),
                status: core.status(),
                operation: "pause",
            })?;
        core.control().set_paused(true);
        Ok(())
    }

    /// Resume a paused task.
    ///
    /// `Running` is reachable from other states too, so resume carries
    /// its own precondition; the write itself still goes through the
    /// validated transition.
    fn resume(&self) -> Result<()> {
        let core = self.core();
        let status = core.status();
        if status != TaskStatus::Paused {
            return Err(TaskSystemError::InvalidTaskState {
                id: core.id(),
                status,
                operation: "resume",
            });
        }
        core.set_status(TaskStatus::Running)?;
        core.control().set_paused(false);
        Ok(())
    }

    /// Serialize the task into its persisted blob: core fields, the kind
    /// discriminator and any kind-specific extras.
    fn serialize(&self) -> Value {
        let mut map = self.core().serialize_core(self.kind());
        for (key, value) in self.extra_fields() {
            map.insert(key, value);
        }
        Value::Object(map)
    }
}

impl fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind())
            .field("id", &self.core().id())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Task that reports progress 50 then 100 and succeeds.
    pub(crate) struct ProbeTask {
        core: TaskCore,
        pub handle_calls: AtomicU32,
        pub cleanup_calls: AtomicU32,
    }

    impl ProbeTask {
        pub fn new(name: &str) -> Self {
            Self {
                core: TaskCore::new("ProbeTask", name),
                handle_calls: AtomicU32::new(0),
                cleanup_calls: AtomicU32::new(0),
            }
        }

        pub fn with_core(core: TaskCore) -> Self {
            Self {
                core,
                handle_calls: AtomicU32::new(0),
                cleanup_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Task for ProbeTask {
        fn kind(&self) -> &'static str {
            "ProbeTask"
        }

        fn core(&self) -> &TaskCore {
            &self.core
        }

        async fn handle(&self) -> TaskResult {
            self.handle_calls.fetch_add(1, Ordering::SeqCst);
            self.core.set_progress(50);
            if !self.core.is_stopped() {
                self.core.set_progress(100);
            }
            Ok(())
        }

        async fn cleanup_on_cancel(&self) {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Task that fails a configured number of times before succeeding.
    pub(crate) struct FlakyTask {
        core: TaskCore,
        pub fail_count: u32,
        pub handle_calls: AtomicU32,
        pub permanent: bool,
    }

    impl FlakyTask {
        pub fn new(name: &str, fail_count: u32) -> Self {
            Self {
                core: TaskCore::new("FlakyTask", name),
                fail_count,
                handle_calls: AtomicU32::new(0),
                permanent: false,
            }
        }

        pub fn with_core(core: TaskCore, fail_count: u32) -> Self {
            Self {
                core,
                fail_count,
                handle_calls: AtomicU32::new(0),
                permanent: false,
            }
        }
    }

    #[async_trait]
    impl Task for FlakyTask {
        fn kind(&self) -> &'static str {
            "FlakyTask"
        }

        fn core(&self) -> &TaskCore {
            &self.core
        }

        async fn handle(&self) -> TaskResult {
            let call = self.handle_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_count {
                if self.permanent {
                    return Err(TaskError::permanent(format!("deliberate failure #{call}")));
                }
                return Err(TaskError::new(format!("deliberate failure #{call}")));
            }
            self.core.set_progress(100);
            Ok(())
        }

        async fn cleanup_on_cancel(&self) {}
    }

    /// Task that loops with a pause check per iteration.
    pub(crate) struct SlowLoopTask {
        core: TaskCore,
        pub iterations: u32,
        pub iteration_delay: Duration,
        pub completed_iterations: AtomicU32,
    }

    impl SlowLoopTask {
        pub fn new(name: &str, iterations: u32, iteration_delay: Duration) -> Self {
            Self {
                core: TaskCore::new("SlowLoopTask", name),
                iterations,
                iteration_delay,
                completed_iterations: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Task for SlowLoopTask {
        fn kind(&self) -> &'static str {
            "SlowLoopTask"
        }

        fn core(&self) -> &TaskCore {
            &self.core
        }

        async fn handle(&self) -> TaskResult {
            for _ in 0..self.iterations {
                if self.core.is_stopped() {
                    return Ok(());
                }
                self.core.check_paused().await;
                tokio::time::sleep(self.iteration_delay).await;
                self.completed_iterations.fetch_add(1, Ordering::SeqCst);
            }
            self.core.set_progress(100);
            Ok(())
        }

        async fn cleanup_on_cancel(&self) {}
    }

    #[test]
    fn test_task_initialization() {
        let task = ProbeTask::with_core(
            TaskCore::new("ProbeTask", "Test Task")
                .with_description("Test Description")
                .with_max_retries(3)
                .with_retry_delay_secs(10),
        );
        let core = task.core();
        assert_eq!(core.name(), "Test Task");
        assert_eq!(core.description(), "Test Description");
        assert_eq!(core.max_retries(), 3);
        assert_eq!(core.retry_delay(), Duration::from_secs(10));
        assert_eq!(core.status(), TaskStatus::Pending);
        assert_eq!(core.progress(), 0);
        assert!(core.has_tag("ProbeTask"));
    }

    #[test]
    fn test_retry_delay_clamped_to_one_second() {
        let core = TaskCore::new("ProbeTask", "t").with_retry_delay_secs(0);
        assert_eq!(core.retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_progress_clamping() {
        let core = TaskCore::new("ProbeTask", "t");
        core.set_progress(150);
        assert_eq!(core.progress(), 100);
        core.set_progress(42);
        assert_eq!(core.progress(), 42);
    }

    #[test]
    fn test_tag_mutation() {
        let core = TaskCore::new("ProbeTask", "t").with_tags(["GroupA"]);
        assert!(core.has_tag("GroupA"));
        assert!(core.has_tag("ProbeTask"));
        core.add_tag("GroupB");
        assert!(core.has_tag("GroupB"));
        core.remove_tag("GroupB");
        assert!(!core.has_tag("GroupB"));
    }

    #[tokio::test]
    async fn test_run_success_emits_events_in_order() {
        let task = ProbeTask::new("Test");
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        task.core().attach_events(bus);

        let status = task.run().await;
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(task.handle_calls.load(Ordering::SeqCst), 1);
        assert!(task.core().started_at().is_some());
        assert!(task.core().finished_at().is_some());

        let mut observed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            observed.push(event);
        }
        assert!(matches!(
            observed[0],
            TaskEvent::TaskStatusUpdated {
                status: TaskStatus::Running,
                ..
            }
        ));
        assert!(matches!(
            observed[1],
            TaskEvent::TaskProgressUpdated { progress: 50, .. }
        ));
        assert!(matches!(
            observed[2],
            TaskEvent::TaskProgressUpdated { progress: 100, .. }
        ));
        assert!(matches!(
            observed[3],
            TaskEvent::TaskStatusUpdated {
                status: TaskStatus::Completed,
                ..
            }
        ));
        assert!(matches!(
            observed[4],
            TaskEvent::TaskFinished {
                status: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_failure_records_error() {
        let task = FlakyTask::new("Failing", 99);
        let status = task.run().await;
        assert_eq!(status, TaskStatus::Failed);
        let error = task.core().error().unwrap();
        assert!(error.message.contains("deliberate failure"));
        assert!(!error.permanent);
    }

    #[tokio::test]
    async fn test_run_catches_panic_as_failure() {
        struct PanickingTask {
            core: TaskCore,
        }

        #[async_trait]
        impl Task for PanickingTask {
            fn kind(&self) -> &'static str {
                "PanickingTask"
            }
            fn core(&self) -> &TaskCore {
                &self.core
            }
            async fn handle(&self) -> TaskResult {
                panic!("boom");
            }
            async fn cleanup_on_cancel(&self) {}
        }

        let task = PanickingTask {
            core: TaskCore::new("PanickingTask", "p"),
        };
        let status = task.run().await;
        assert_eq!(status, TaskStatus::Failed);
        assert!(task.core().error().unwrap().message.contains("boom"));
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let task = ProbeTask::new("Test");
        task.cancel().await;
        assert!(task.core().is_stopped());
        assert_eq!(task.cleanup_calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.core().status(), TaskStatus::Cancelled);

        let status = task.run().await;
        assert_eq!(status, TaskStatus::Cancelled);
        assert_eq!(task.handle_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let task = ProbeTask::new("Test");
        assert!(matches!(
            task.pause(),
            Err(TaskSystemError::InvalidTaskState { .. })
        ));
        task.core().set_status(TaskStatus::Running).unwrap();
        task.pause().unwrap();
        assert_eq!(task.core().status(), TaskStatus::Paused);
        // Pausing an already paused task is rejected too.
        assert!(matches!(
            task.pause(),
            Err(TaskSystemError::InvalidTaskState { .. })
        ));

        assert!(task.resume().is_ok());
        assert_eq!(task.core().status(), TaskStatus::Running);
        assert!(matches!(
            task.resume(),
            Err(TaskSystemError::InvalidTaskState { .. })
        ));
    }

    #[test]
    fn test_set_status_rejects_illegal_transition() {
        let core = TaskCore::new("ProbeTask", "t");
        core.set_status(TaskStatus::Running).unwrap();
        core.set_status(TaskStatus::Completed).unwrap();

        let error = core.set_status(TaskStatus::Running).unwrap_err();
        assert!(matches!(
            error,
            TaskSystemError::InvalidStateTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Running,
                ..
            }
        ));
        // Status is untouched by the rejected write.
        assert_eq!(core.status(), TaskStatus::Completed);
        // Self-transitions are not part of the machine either.
        assert!(core.set_status(TaskStatus::Completed).is_err());
    }

    #[test]
    fn test_system_error_converts_to_task_error() {
        let error: TaskError = TaskSystemError::TaskNotFound { id: TaskId::new() }.into();
        assert!(error.permanent);
        assert_eq!(error.kind.as_deref(), Some("TASK_NOT_FOUND"));

        // Retryable system errors stay retryable as task failures.
        let error: TaskError = TaskSystemError::storage("disk full").into();
        assert!(!error.permanent);
        assert_eq!(error.kind.as_deref(), Some("STORAGE_ERROR"));
    }

    #[tokio::test]
    async fn test_check_paused_blocks_body() {
        let task = Arc::new(SlowLoopTask::new("Block", 20, Duration::from_millis(20)));
        let runner = {
            let task = task.clone();
            tokio::spawn(async move { task.run().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let count_at_pause = task.completed_iterations.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let count_while_paused = task.completed_iterations.load(Ordering::SeqCst);
        // At most one iteration may straddle the pause point.
        assert!(count_while_paused <= count_at_pause + 1);

        task.resume().unwrap();
        let status = runner.await.unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(task.completed_iterations.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_cancel_while_paused_unblocks() {
        let task = Arc::new(SlowLoopTask::new("CancelPaused", 50, Duration::from_millis(20)));
        let runner = {
            let task = task.clone();
            tokio::spawn(async move { task.run().await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        task.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(task.core().status(), TaskStatus::Paused);

        task.cancel().await;
        let status = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("cancel must unblock the paused body")
            .unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
        assert!(!task.core().control().is_paused());
    }

    #[tokio::test]
    async fn test_sleep_cancellable_interrupted() {
        let control = TaskControl::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let stop_tx = control.stop_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_tx.send_replace(true);
            let _ = done_tx.send(());
        });

        let start = std::time::Instant::now();
        let completed = control.sleep_cancellable(Duration::from_secs(30)).await;
        assert!(!completed);
        assert!(start.elapsed() < Duration::from_secs(5));
        let _ = done_rx.await;
    }

    #[test]
    fn test_serialize_blob_layout() {
        let task = ProbeTask::with_core(
            TaskCore::new("ProbeTask", "Test Task")
                .with_description("desc")
                .with_persistent(true)
                .with_max_retries(2)
                .with_unique_type(UniqueType::Job),
        );
        let blob = task.serialize();
        assert_eq!(blob["kind"], "ProbeTask");
        assert_eq!(blob["name"], "Test Task");
        assert_eq!(blob["status"], "PENDING");
        assert_eq!(blob["isPersistent"], true);
        assert_eq!(blob["maxRetries"], 2);
        assert_eq!(blob["uniqueType"], "JOB");
        assert!(blob["tags"]
            .as_array()
            .unwrap()
            .contains(&Value::String("ProbeTask".into())));
        assert_eq!(blob["id"], task.core().id().to_string());
    }

    #[test]
    fn test_from_blob_restores_identity_and_state() {
        let original = TaskCore::new("ProbeTask", "Round Trip")
            .with_persistent(true)
            .with_max_retries(4)
            .with_retry_delay_secs(7)
            .with_tags(["Extra"]);
        original.set_progress(30);
        let blob = Value::Object(original.serialize_core("ProbeTask"));

        let restored = TaskCore::from_blob("ProbeTask", &blob);
        assert_eq!(restored.id(), original.id());
        assert_eq!(restored.name(), "Round Trip");
        assert_eq!(restored.progress(), 30);
        assert_eq!(restored.max_retries(), 4);
        assert_eq!(restored.retry_delay(), Duration::from_secs(7));
        assert!(restored.is_persistent());
        assert!(restored.has_tag("Extra"));
        assert!(restored.has_tag("ProbeTask"));
    }
}
