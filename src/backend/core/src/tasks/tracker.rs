//! Registry of active tasks with tag indexing and bounded histories.
//!
//! The tracker is the authoritative view of which tasks exist. It indexes
//! tasks by tag for O(1) + O(k) lookups, keeps metadata for chain
//! children, and maintains two bounded FIFO histories (failed and
//! completed snapshots) persisted through the store.

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::{Result, TaskSystemError};
use crate::events::{EventBus, TaskEvent};
use crate::storage::{keys, Storage};
use crate::tasks::task::{Task, TaskId};

/// Metadata kept for tasks that run inside a chain.
#[derive(Debug, Clone)]
pub struct ChainChildMeta {
    pub chain_id: TaskId,
    pub parent_name: String,
}

#[derive(Default)]
struct TrackerState {
    active: HashMap<TaskId, Arc<dyn Task>>,
    tag_index: HashMap<String, HashSet<TaskId>>,
    chain_children: HashMap<TaskId, ChainChildMeta>,
    failed_history: VecDeque<Value>,
    completed_history: VecDeque<Value>,
}

/// Tracks active tasks, their tags and the failure/completion histories.
pub struct TaskTracker {
    storage: Arc<dyn Storage>,
    events: EventBus,
    history_limit: usize,
    state: RwLock<TrackerState>,
}

impl TaskTracker {
    /// Create a tracker and load persisted histories.
    pub fn new(storage: Arc<dyn Storage>, events: EventBus, history_limit: usize) -> Self {
        let tracker = Self {
            storage,
            events,
            history_limit: history_limit.max(1),
            state: RwLock::new(TrackerState::default()),
        };
        tracker.load_state();
        tracing::info!(history_limit = tracker.history_limit, "task tracker initialized");
        tracker
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Register a task (and, for a chain, its children) and attach the
    /// event bus. Returns `false` for a duplicate id.
    pub fn add_task(&self, task: Arc<dyn Task>) -> bool {
        let id = task.core().id();
        {
            let mut state = self.state.write();
            if state.active.contains_key(&id) {
                tracing::warn!(task_id = %id, "task already tracked");
                return false;
            }
            task.core().attach_events(self.events.clone());
            Self::index_tags(&mut state.tag_index, &task, id);
            state.active.insert(id, task.clone());

            if let Some(chain) = task.as_chain() {
                let parent_name = task.core().name();
                for child in chain.children() {
                    let child_id = child.core().id();
                    state.chain_children.insert(
                        child_id,
                        ChainChildMeta {
                            chain_id: id,
                            parent_name: parent_name.clone(),
                        },
                    );
                    if !state.active.contains_key(&child_id) {
                        child.core().attach_events(self.events.clone());
                        Self::index_tags(&mut state.tag_index, child, child_id);
                        state.active.insert(child_id, child.clone());
                    }
                }
            }
        }
        tracing::info!(task_id = %id, name = %task.core().name(), "task added to tracker");
        self.events.emit(TaskEvent::TaskAdded { id });
        true
    }

    /// Remove a task from tracking. Chain removal cascades to children.
    pub fn remove_task(&self, id: TaskId) -> Result<()> {
        let task = {
            let mut state = self.state.write();
            let task = state
                .active
                .remove(&id)
                .ok_or(TaskSystemError::TaskNotFound { id })?;

            Self::unindex_tags(&mut state.tag_index, &task, id);
            if let Some(chain) = task.as_chain() {
                for child in chain.children() {
                    let child_id = child.core().id();
                    state.chain_children.remove(&child_id);
                    if let Some(child_task) = state.active.remove(&child_id) {
                        Self::unindex_tags(&mut state.tag_index, &child_task, child_id);
                        child_task.core().detach_events();
                    }
                }
            }
            state.chain_children.remove(&id);
            task.core().detach_events();
            task
        };
        tracing::info!(task_id = %id, name = %task.core().name(), "task removed from tracker");
        self.events.emit(TaskEvent::TaskRemoved { id });
        Ok(())
    }

    fn index_tags(
        tag_index: &mut HashMap<String, HashSet<TaskId>>,
        task: &Arc<dyn Task>,
        id: TaskId,
    ) {
        for tag in task.core().tags() {
            tag_index.entry(tag).or_default().insert(id);
        }
    }

    fn unindex_tags(
        tag_index: &mut HashMap<String, HashSet<TaskId>>,
        task: &Arc<dyn Task>,
        id: TaskId,
    ) {
        for tag in task.core().tags() {
            if let Some(ids) = tag_index.get_mut(&tag) {
                ids.remove(&id);
                if ids.is_empty() {
                    tag_index.remove(&tag);
                }
            }
        }
    }

    // ─── Lookups ─────────────────────────────────────────────────────────────

    /// The live task handle, if tracked.
    pub fn get_task(&self, id: TaskId) -> Option<Arc<dyn Task>> {
        self.state.read().active.get(&id).cloned()
    }

    /// Serialized view of one task, augmented with chain metadata.
    pub fn get_task_info(&self, id: TaskId) -> Result<Value> {
        let (task, meta) = {
            let state = self.state.read();
            let task = state
                .active
                .get(&id)
                .cloned()
                .ok_or(TaskSystemError::TaskNotFound { id })?;
            (task, state.chain_children.get(&id).cloned())
        };

        let mut info = task.serialize();
        let map = info.as_object_mut().expect("task blobs are objects");
        if let Some(chain) = task.as_chain() {
            map.insert(
                "subTasks".into(),
                Value::Array(chain.children().iter().map(|c| c.serialize()).collect()),
            );
            map.insert("chainContext".into(), chain.context().serialize());
        } else if let Some(meta) = meta {
            map.insert("isChainChild".into(), Value::Bool(true));
            map.insert(
                "parentChainName".into(),
                Value::String(meta.parent_name),
            );
        }
        Ok(info)
    }

    /// Serialized views of every active task.
    pub fn all_tasks_info(&self) -> Vec<Value> {
        let tasks: Vec<Arc<dyn Task>> = self.state.read().active.values().cloned().collect();
        tasks.iter().map(|t| t.serialize()).collect()
    }

    /// Number of tracked tasks (chain children included).
    pub fn active_count(&self) -> usize {
        self.state.read().active.len()
    }

    /// Metadata for a chain child, if `id` belongs to one.
    pub fn chain_child_meta(&self, id: TaskId) -> Option<ChainChildMeta> {
        self.state.read().chain_children.get(&id).cloned()
    }

    /// Ids of tasks carrying `tag`.
    pub fn ids_by_tag(&self, tag: &str) -> Vec<TaskId> {
        self.state
            .read()
            .tag_index
            .get(tag)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Live handles of tasks carrying `tag`.
    pub fn tasks_by_tag(&self, tag: &str) -> Vec<Arc<dyn Task>> {
        let state = self.state.read();
        state
            .tag_index
            .get(tag)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.active.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any active task carries `tag`.
    pub fn has_tasks_with_tag(&self, tag: &str) -> bool {
        self.state
            .read()
            .tag_index
            .get(tag)
            .is_some_and(|ids| !ids.is_empty())
    }

    // ─── Histories ───────────────────────────────────────────────────────────

    /// Append a failure snapshot to the bounded history and persist it.
    pub fn log_failed_task(&self, task: &Arc<dyn Task>) {
        let mut snapshot = task.serialize();
        if let Some(map) = snapshot.as_object_mut() {
            map.insert(
                "failedAt".into(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        {
            let mut state = self.state.write();
            let limit = self.history_limit;
            Self::push_bounded(&mut state.failed_history, snapshot.clone(), limit);
        }
        self.save_state();
        tracing::warn!(
            task_id = %task.core().id(),
            error = %task.core().error().map(|e| e.message).unwrap_or_default(),
            "failed task logged"
        );
        self.events.emit(TaskEvent::FailedTaskLogged { snapshot });
    }

    /// Append a completion snapshot to the bounded history and persist it.
    pub fn record_completed(&self, task: &Arc<dyn Task>) {
        let mut snapshot = task.serialize();
        if let Some(map) = snapshot.as_object_mut() {
            map.insert(
                "completedAt".into(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        {
            let mut state = self.state.write();
            let limit = self.history_limit;
            Self::push_bounded(&mut state.completed_history, snapshot, limit);
        }
        self.save_state();
    }

    fn push_bounded(history: &mut VecDeque<Value>, item: Value, limit: usize) {
        history.push_back(item);
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// Snapshot of the failed task history, oldest first.
    pub fn failed_history(&self) -> Vec<Value> {
        self.state.read().failed_history.iter().cloned().collect()
    }

    /// Snapshot of the completed task history, oldest first.
    pub fn completed_history(&self) -> Vec<Value> {
        self.state
            .read()
            .completed_history
            .iter()
            .cloned()
            .collect()
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    /// Load both histories from the store.
    pub fn load_state(&self) {
        let failed = self
            .storage
            .load(keys::FAILED_TASK_HISTORY)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        let completed = self
            .storage
            .load(keys::COMPLETED_TASK_HISTORY)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        let mut state = self.state.write();
        state.failed_history = failed.into();
        state.completed_history = completed.into();
    }

    /// Persist both histories. Storage failures are logged; the tracker
    /// continues with in-memory state.
    pub fn save_state(&self) {
        let (failed, completed) = {
            let state = self.state.read();
            (
                Value::Array(state.failed_history.iter().cloned().collect()),
                Value::Array(state.completed_history.iter().cloned().collect()),
            )
        };
        if let Err(error) = self.storage.save(keys::FAILED_TASK_HISTORY, failed) {
            tracing::error!(%error, "failed to persist failure history");
        }
        if let Err(error) = self.storage.save(keys::COMPLETED_TASK_HISTORY, completed) {
            tracing::error!(%error, "failed to persist completion history");
        }
    }
}
