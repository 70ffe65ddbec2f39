//! # Taskforge Core
//!
//! A concurrent, persistent, in-process task execution engine.
//!
//! ## Architecture
//!
//! - **Task**: abstract unit of work with lifecycle, progress and
//!   cooperative pause/cancel
//! - **TaskChain**: sequential composite with shared context and
//!   chain-level retry semantics
//! - **Tracker**: authoritative registry of active tasks with tag index
//!   and bounded failure/completion histories
//! - **Queue**: FIFO admission, concurrency limit, uniqueness
//!   enforcement and retry scheduling
//! - **Scheduler**: one-shot, interval and daily-cron submissions via
//!   timers
//! - **Manager**: the facade aggregating the subsystems behind one API
//!   and one event stream
//! - **Storage**: key → JSON blob persistence checkpoints

pub mod config;
pub mod error;
pub mod events;
pub mod storage;
pub mod tasks;
pub mod telemetry;

pub use error::{ErrorCode, Result, TaskSystemError};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::config::TaskSystemConfig;
    pub use crate::error::{ErrorCode, Result, TaskSystemError};
    pub use crate::events::{EventBus, TaskEvent};
    pub use crate::storage::{JsonStorage, MemoryStorage, Storage};
    pub use crate::tasks::{
        ChainContext, ChainRetryBehavior, Task, TaskChain, TaskChainBuilder, TaskControl,
        TaskCore, TaskError, TaskId, TaskManager, TaskRegistry, TaskResult, TaskStatus,
        Trigger, UniqueType,
    };
    pub use async_trait::async_trait;
}

