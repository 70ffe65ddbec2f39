//! Task execution core.
//!
//! A concurrent, persistent, in-process engine that accepts units of
//! work, enforces ordering and uniqueness constraints, executes them on
//! a bounded worker pool, retries failures under policy, schedules
//! future or recurring submissions, and composes tasks into sequential
//! chains with shared context.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           TaskManager (facade)                       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐  │
//! │  │  Scheduler │──▶│   Queue    │──▶│  Workers   │   │  Tracker   │  │
//! │  │ (timers)   │   │ (FIFO +    │   │ (bounded   │   │ (registry, │  │
//! │  │            │   │ uniqueness)│   │  tokio)    │   │ tag index) │  │
//! │  └────────────┘   └────────────┘   └────────────┘   └────────────┘  │
//! │         │                │                │                │        │
//! │         └────────────────┴───────┬────────┴────────────────┘        │
//! │                                  ▼                                  │
//! │                        Store (key → JSON blob)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Submission flows from the manager to the scheduler (timed) or the
//! queue (immediate). The queue registers each task with the tracker,
//! dispatches to a worker when a slot is free, observes the finished
//! run and applies the retry policy. Every state change is published on
//! the shared event bus.
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskforge_core::prelude::*;
//!
//! struct SyncTask { core: TaskCore }
//!
//! #[async_trait]
//! impl Task for SyncTask {
//!     fn kind(&self) -> &'static str { "SyncTask" }
//!     fn core(&self) -> &TaskCore { &self.core }
//!
//!     async fn handle(&self) -> TaskResult {
//!         self.core.check_paused().await;
//!         if self.core.is_stopped() { return Ok(()); }
//!         self.core.set_progress(100);
//!         Ok(())
//!     }
//!
//!     async fn cleanup_on_cancel(&self) {}
//! }
//!
//! let registry = Arc::new(TaskRegistry::with_chain());
//! registry.register("SyncTask", |_, blob| {
//!     Ok(Arc::new(SyncTask { core: TaskCore::from_blob("SyncTask", blob) }))
//! });
//! let manager = TaskManager::new(TaskSystemConfig::default(), registry);
//! manager.add_task(Arc::new(SyncTask { core: TaskCore::new("SyncTask", "sync") }), None)?;
//! ```

pub mod chain;
pub mod context;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod task;
pub mod tracker;

pub use chain::{ChainRetryBehavior, TaskChain, TaskChainBuilder, CHAINED_CHILD_TAG, CHAIN_KIND};
pub use context::ChainContext;
pub use manager::TaskManager;
pub use queue::TaskQueue;
pub use registry::TaskRegistry;
pub use scheduler::{ScheduledJob, TaskScheduler, Trigger};
pub use status::{TaskStatus, UniqueType};
pub use task::{Task, TaskControl, TaskCore, TaskError, TaskId, TaskResult};
pub use tracker::{ChainChildMeta, TaskTracker};
