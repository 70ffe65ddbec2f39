//! Sequential task composition with shared context.
//!
//! A [`TaskChain`] is itself a task whose body runs its children one at a
//! time, sharing a [`ChainContext`] between them. Child failures are
//! handled per-kind through [`ChainRetryBehavior`]; the chain's own retry
//! budget backs the `RetryChain` behavior.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::tasks::context::ChainContext;
use crate::tasks::registry::TaskRegistry;
use crate::tasks::status::TaskStatus;
use crate::tasks::task::{Task, TaskCore, TaskError, TaskId, TaskResult};

/// Tag stamped on every task owned by a chain. Bulk tag operations skip
/// tasks carrying it by default so chain-level control stays the single
/// source of truth over child lifecycle.
pub const CHAINED_CHILD_TAG: &str = "_ChainedChild";

/// Kind discriminator of the chain composite.
pub const CHAIN_KIND: &str = "TaskChain";

// ═══════════════════════════════════════════════════════════════════════════════
// Chain Retry Behavior
// ═══════════════════════════════════════════════════════════════════════════════

/// How the chain proceeds when a child fails after exhausting its own
/// task-level retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainRetryBehavior {
    /// Stop the entire chain immediately. The default.
    #[default]
    StopChain,
    /// Skip the failed child and continue with the next one.
    SkipTask,
    /// Retry only the failed child. Task-level retries have already been
    /// applied at this point, so this is equivalent to `StopChain`.
    RetryTask,
    /// Restart the entire chain from the first child, consuming one of
    /// the chain's own retry attempts.
    RetryChain,
}

impl ChainRetryBehavior {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StopChain => "STOP_CHAIN",
            Self::SkipTask => "SKIP_TASK",
            Self::RetryTask => "RETRY_TASK",
            Self::RetryChain => "RETRY_CHAIN",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "STOP_CHAIN" => Some(Self::StopChain),
            "SKIP_TASK" => Some(Self::SkipTask),
            "RETRY_TASK" => Some(Self::RetryTask),
            "RETRY_CHAIN" => Some(Self::RetryChain),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Chain
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpointed outcome of one child task.
#[derive(Debug, Clone)]
struct ChildState {
    status: TaskStatus,
    result: Option<Value>,
    error: Option<String>,
}

impl Default for ChildState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }
}

/// Mutable chain execution state.
#[derive(Debug, Default)]
struct ChainState {
    current_index: usize,
    chain_retry_attempts: u32,
    task_states: HashMap<TaskId, ChildState>,
}

/// Composite task running children sequentially with shared context and
/// chain-level retry semantics.
pub struct TaskChain {
    core: TaskCore,
    children: Vec<Arc<dyn Task>>,
    context: Arc<ChainContext>,
    retry_behavior_map: HashMap<String, ChainRetryBehavior>,
    state: Mutex<ChainState>,
    external_progress: AtomicBool,
}

impl TaskChain {
    /// Start building a chain with the given display name.
    pub fn builder(name: impl Into<String>) -> TaskChainBuilder {
        TaskChainBuilder::new(name)
    }

    /// Assemble a chain from a finished core and its children: stamp each
    /// child with the chain id, the child tags and the shared context.
    fn assemble(
        core: TaskCore,
        children: Vec<Arc<dyn Task>>,
        context: Arc<ChainContext>,
        retry_behavior_map: HashMap<String, ChainRetryBehavior>,
    ) -> Self {
        let chain_id = core.id();
        let mut task_states = HashMap::new();
        for child in &children {
            child.core().set_chain_id(chain_id);
            child.core().add_tag(CHAINED_CHILD_TAG);
            child.core().add_tag(format!("Parent_{chain_id}"));
            child.core().set_chain_context(context.clone());
            task_states.insert(child.core().id(), ChildState::default());
        }
        tracing::info!(
            chain_id = %chain_id,
            name = %core.name(),
            children = children.len(),
            "task chain created"
        );
        Self {
            core,
            children,
            context,
            retry_behavior_map,
            state: Mutex::new(ChainState {
                task_states,
                ..Default::default()
            }),
            external_progress: AtomicBool::new(false),
        }
    }

    /// The chain's children in execution order.
    pub fn children(&self) -> &[Arc<dyn Task>] {
        &self.children
    }

    /// The shared context handle.
    pub fn context(&self) -> &Arc<ChainContext> {
        &self.context
    }

    /// Number of whole-chain retries consumed so far.
    pub fn chain_retry_attempts(&self) -> u32 {
        self.state.lock().chain_retry_attempts
    }

    /// Index of the child currently (or next) being executed.
    pub fn current_index(&self) -> usize {
        self.state.lock().current_index
    }

    /// Apply a progress value supplied by an external subscriber; the
    /// default per-child calculation is skipped for the current step.
    pub fn apply_external_progress(&self, progress: u8) {
        self.core.set_progress(progress);
        self.external_progress.store(true, Ordering::SeqCst);
        tracing::debug!(
            chain_id = %self.core.id(),
            progress,
            "chain progress updated externally"
        );
    }

    fn update_default_progress(&self) {
        let total = self.children.len();
        if total == 0 {
            self.core.set_progress(100);
            return;
        }
        let index = self.state.lock().current_index;
        let progress = (((index + 1) * 100) / total).min(100) as u8;
        self.core.set_progress(progress);
    }

    fn record_child_state(&self, child: &Arc<dyn Task>) {
        let child_core = child.core();
        self.state.lock().task_states.insert(
            child_core.id(),
            ChildState {
                status: child_core.status(),
                result: child_core.result(),
                error: child_core.error().map(|e| e.message),
            },
        );
    }

    /// Run one child up to `max_retries + 1` times, sleeping the child's
    /// retry delay between attempts. The chain shows `Retrying` during
    /// the delay. Returns `true` on child completion; cancellation of the
    /// chain or the child ends the attempts immediately.
    async fn execute_child_with_retry(&self, child: &Arc<dyn Task>) -> bool {
        let core = &self.core;
        let child_core = child.core();
        let max_attempts = child_core.max_retries() + 1;
        let mut attempt = 0;

        while attempt < max_attempts {
            if core.is_stopped() {
                return false;
            }
            if attempt > 0 {
                core.update_status(TaskStatus::Retrying);
                tracing::info!(
                    chain_id = %core.id(),
                    child = %child_core.name(),
                    attempt,
                    max_retries = child_core.max_retries(),
                    "retrying child task"
                );
                if !core
                    .control()
                    .sleep_cancellable(child_core.retry_delay())
                    .await
                {
                    return false;
                }
                core.update_status(TaskStatus::Running);
            }
            if core.is_stopped() {
                return false;
            }

            child_core.reset_for_attempt();
            let status = child.run().await;
            self.record_child_state(child);

            match status {
                TaskStatus::Completed => {
                    tracing::info!(
                        chain_id = %core.id(),
                        child = %child_core.name(),
                        "child task completed"
                    );
                    return true;
                }
                TaskStatus::Cancelled => return false,
                _ => {}
            }
            if core.is_stopped() {
                return false;
            }
            attempt += 1;
        }

        tracing::warn!(
            chain_id = %core.id(),
            child = %child_core.name(),
            attempts = max_attempts,
            "child task failed after all attempts"
        );
        false
    }
}

#[async_trait]
impl Task for TaskChain {
    fn kind(&self) -> &'static str {
        CHAIN_KIND
    }

    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn as_chain(&self) -> Option<&TaskChain> {
        Some(self)
    }

    async fn handle(&self) -> TaskResult {
        let core = &self.core;
        tracing::info!(
            chain_id = %core.id(),
            name = %core.name(),
            children = self.children.len(),
            "chain starting execution"
        );

        if self.children.is_empty() {
            self.update_default_progress();
            core.set_result(self.context.data());
            return Ok(());
        }

        loop {
            let index = self.state.lock().current_index;
            if index >= self.children.len() {
                break;
            }
            if core.is_stopped() {
                return Ok(());
            }

            self.external_progress.store(false, Ordering::SeqCst);
            let child = &self.children[index];
            child.core().set_chain_context(self.context.clone());
            tracing::info!(
                chain_id = %core.id(),
                position = index + 1,
                total = self.children.len(),
                child = %child.core().name(),
                "chain executing child"
            );

            let success = self.execute_child_with_retry(child).await;

            if core.is_stopped() || child.core().status() == TaskStatus::Cancelled {
                // The run() wrapper resolves a stopped chain as Cancelled.
                if core.status() != TaskStatus::Failed {
                    core.control().request_stop();
                }
                tracing::info!(chain_id = %core.id(), "chain cancelled");
                return Ok(());
            }

            if !success {
                let behavior = self
                    .retry_behavior_map
                    .get(child.kind())
                    .copied()
                    .unwrap_or_default();
                tracing::warn!(
                    chain_id = %core.id(),
                    child = %child.core().name(),
                    behavior = behavior.as_str(),
                    "child failed, applying chain behavior"
                );
                match behavior {
                    ChainRetryBehavior::StopChain | ChainRetryBehavior::RetryTask => {
                        return Err(TaskError::new(format!(
                            "child task '{}' failed and chain is configured to stop",
                            child.core().name()
                        )));
                    }
                    ChainRetryBehavior::SkipTask => {
                        self.state.lock().current_index += 1;
                        continue;
                    }
                    ChainRetryBehavior::RetryChain => {
                        let attempt = {
                            let mut state = self.state.lock();
                            if state.chain_retry_attempts < core.max_retries() {
                                state.chain_retry_attempts += 1;
                                state.current_index = 0;
                                for child_state in state.task_states.values_mut() {
                                    child_state.status = TaskStatus::Pending;
                                    child_state.error = None;
                                }
                                Some(state.chain_retry_attempts)
                            } else {
                                None
                            }
                        };
                        match attempt {
                            Some(attempt) => {
                                tracing::info!(
                                    chain_id = %core.id(),
                                    attempt,
                                    max_retries = core.max_retries(),
                                    "retrying entire chain"
                                );
                                continue;
                            }
                            None => {
                                return Err(TaskError::new(format!(
                                    "chain failed after {} retry attempts",
                                    core.max_retries()
                                )));
                            }
                        }
                    }
                }
            }

            if !self.external_progress.load(Ordering::SeqCst) {
                self.update_default_progress();
            }
            self.state.lock().current_index += 1;
        }

        core.set_result(self.context.data());
        tracing::info!(chain_id = %core.id(), name = %core.name(), "chain completed");
        Ok(())
    }

    async fn cleanup_on_cancel(&self) {
        tracing::debug!(chain_id = %self.core.id(), "chain cancellation cleanup");
        for child in &self.children {
            child.cancel().await;
        }
    }

    fn extra_fields(&self) -> Map<String, Value> {
        let state = self.state.lock();
        let mut map = Map::new();
        map.insert(
            "tasks".into(),
            Value::Array(self.children.iter().map(|c| c.serialize()).collect()),
        );
        map.insert(
            "currentTaskIndex".into(),
            Value::from(state.current_index as u64),
        );
        map.insert("chainContext".into(), self.context.serialize());
        map.insert(
            "taskStates".into(),
            Value::Object(
                state
                    .task_states
                    .iter()
                    .map(|(id, child)| {
                        let mut entry = Map::new();
                        entry.insert(
                            "status".into(),
                            Value::String(child.status.as_str().into()),
                        );
                        entry.insert(
                            "result".into(),
                            child.result.clone().unwrap_or(Value::Null),
                        );
                        entry.insert(
                            "error".into(),
                            child
                                .error
                                .clone()
                                .map(Value::String)
                                .unwrap_or(Value::Null),
                        );
                        (id.to_string(), Value::Object(entry))
                    })
                    .collect(),
            ),
        );
        map.insert(
            "retryBehaviorMap".into(),
            Value::Object(
                self.retry_behavior_map
                    .iter()
                    .map(|(kind, behavior)| {
                        (kind.clone(), Value::String(behavior.as_str().into()))
                    })
                    .collect(),
            ),
        );
        map.insert(
            "chainRetryAttempts".into(),
            Value::from(state.chain_retry_attempts),
        );
        map
    }
}

impl TaskChain {
    /// Reconstruct a chain from its persisted blob.
    ///
    /// Children are rebuilt through the kind registry; a child whose kind
    /// is unknown or whose blob is malformed is logged and skipped, the
    /// rest of the chain proceeds.
    pub fn deserialize(registry: &TaskRegistry, data: &Value) -> Result<TaskChain> {
        let core = TaskCore::from_blob(CHAIN_KIND, data);

        let mut children: Vec<Arc<dyn Task>> = Vec::new();
        if let Some(blobs) = data["tasks"].as_array() {
            for blob in blobs {
                match registry.deserialize(blob) {
                    Ok(child) => children.push(child),
                    Err(error) => {
                        tracing::error!(%error, "failed to deserialize chain child, skipping");
                    }
                }
            }
        }

        let context = match ChainContext::deserialize(&data["chainContext"]) {
            Ok(context) => Arc::new(context),
            Err(_) => Arc::new(ChainContext::new(core.id())),
        };

        let mut retry_behavior_map = HashMap::new();
        if let Some(map) = data["retryBehaviorMap"].as_object() {
            for (kind, value) in map {
                let behavior = value
                    .as_str()
                    .and_then(ChainRetryBehavior::from_name)
                    .unwrap_or_else(|| {
                        tracing::warn!(kind = %kind, "unknown retry behavior, using default");
                        ChainRetryBehavior::StopChain
                    });
                retry_behavior_map.insert(kind.clone(), behavior);
            }
        }

        let chain = Self::assemble(core, children, context, retry_behavior_map);
        {
            let mut state = chain.state.lock();
            state.current_index = data["currentTaskIndex"].as_u64().unwrap_or(0) as usize;
            state.chain_retry_attempts =
                data["chainRetryAttempts"].as_u64().unwrap_or(0) as u32;
            if let Some(states) = data["taskStates"].as_object() {
                for (id, entry) in states {
                    if let Ok(id) = id.parse::<TaskId>() {
                        state.task_states.insert(
                            id,
                            ChildState {
                                status: entry["status"]
                                    .as_str()
                                    .and_then(TaskStatus::from_name)
                                    .unwrap_or(TaskStatus::Pending),
                                result: (!entry["result"].is_null())
                                    .then(|| entry["result"].clone()),
                                error: entry["error"].as_str().map(String::from),
                            },
                        );
                    }
                }
            }
        }
        tracing::info!(
            chain_id = %chain.core.id(),
            name = %chain.core.name(),
            resume_at = chain.current_index() + 1,
            "task chain deserialized"
        );
        Ok(chain)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`TaskChain`].
pub struct TaskChainBuilder {
    name: String,
    description: String,
    tasks: Vec<Arc<dyn Task>>,
    retry_behavior_map: HashMap<String, ChainRetryBehavior>,
    is_persistent: bool,
    max_retries: u32,
    retry_delay_secs: u64,
    fail_silently: bool,
    tags: Vec<String>,
}

impl TaskChainBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
            retry_behavior_map: HashMap::new(),
            is_persistent: false,
            max_retries: 0,
            retry_delay_secs: 5,
            fail_silently: false,
            tags: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a child to the chain.
    pub fn task(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Append several children in order.
    pub fn tasks(mut self, tasks: impl IntoIterator<Item = Arc<dyn Task>>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Set the behavior applied when a child of the given kind fails.
    pub fn retry_behavior(
        mut self,
        kind: impl Into<String>,
        behavior: ChainRetryBehavior,
    ) -> Self {
        self.retry_behavior_map.insert(kind.into(), behavior);
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.is_persistent = persistent;
        self
    }

    /// Chain-level retry budget, consumed by `RetryChain`.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    pub fn fail_silently(mut self, fail_silently: bool) -> Self {
        self.fail_silently = fail_silently;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn build(self) -> TaskChain {
        let core = TaskCore::new(CHAIN_KIND, self.name)
            .with_description(self.description)
            .with_persistent(self.is_persistent)
            .with_max_retries(self.max_retries)
            .with_retry_delay_secs(self.retry_delay_secs)
            .with_fail_silently(self.fail_silently)
            .with_tags(self.tags);
        let context = Arc::new(ChainContext::new(core.id()));
        TaskChain::assemble(core, self.tasks, context, self.retry_behavior_map)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
