//! Timer-driven task scheduling.
//!
//! Supports one-shot (`date`), recurring (`interval`) and daily
//! wall-clock (`cron`) triggers. Each job holds a serialized task blob;
//! on every fire the task is reconstructed through the kind registry
//! (original id restored) and submitted to the queue. Timers are
//! detached tokio tasks, aborted on unschedule and shutdown.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{Result, TaskSystemError};
use crate::events::{EventBus, TaskEvent};
use crate::storage::{keys, Storage};
use crate::tasks::queue::TaskQueue;
use crate::tasks::registry::TaskRegistry;
use crate::tasks::task::{Task, TaskId};

// ═══════════════════════════════════════════════════════════════════════════════
// Triggers
// ═══════════════════════════════════════════════════════════════════════════════

/// When (and how often) a scheduled job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Fire once at a wall-clock instant, strictly in the future.
    Date { run_at: DateTime<Utc> },
    /// Fire repeatedly, `every_secs` apart.
    Interval { every_secs: u64 },
    /// Fire daily at `hour:minute` (UTC).
    Cron { hour: u32, minute: u32 },
}

impl Trigger {
    /// Persisted trigger discriminator.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Date { .. } => "date",
            Self::Interval { .. } => "interval",
            Self::Cron { .. } => "cron",
        }
    }
}

/// The next `hour:minute` occurrence strictly after `now`: today if still
/// ahead, otherwise tomorrow.
fn next_cron_occurrence(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .expect("validated hour/minute")
        .and_utc();
    if today <= now {
        today + chrono::Duration::days(1)
    } else {
        today
    }
}

fn delay_until(target: DateTime<Utc>) -> Duration {
    (target - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduled Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A job registered with the scheduler: serialized task data plus the
/// live timer handle. The scheduler does not hold live tasks between
/// firings.
pub struct ScheduledJob {
    pub job_id: String,
    pub task_id: TaskId,
    pub kind: String,
    pub task_data: Value,
    pub trigger: Trigger,
    pub next_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledJob {
    /// Serialize the job for persistence.
    fn to_record(&self) -> Value {
        let mut record = json!({
            "jobId": self.job_id,
            "taskId": self.task_id.to_string(),
            "kind": self.kind,
            "taskData": self.task_data,
            "trigger": self.trigger.name(),
            "nextFire": self.next_fire.map(|t| t.to_rfc3339()),
            "createdAt": self.created_at.to_rfc3339(),
        });
        let map = record.as_object_mut().expect("record is an object");
        match self.trigger {
            Trigger::Date { .. } => {}
            Trigger::Interval { every_secs } => {
                map.insert("intervalSeconds".into(), Value::from(every_secs));
            }
            Trigger::Cron { hour, minute } => {
                map.insert("hour".into(), Value::from(hour));
                map.insert("minute".into(), Value::from(minute));
            }
        }
        record
    }

    /// Reconstruct the trigger from a persisted record.
    fn trigger_from_record(record: &Value) -> Option<Trigger> {
        match record["trigger"].as_str()? {
            "date" => {
                let run_at = record["nextFire"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
                    .with_timezone(&Utc);
                Some(Trigger::Date { run_at })
            }
            "interval" => Some(Trigger::Interval {
                every_secs: record["intervalSeconds"].as_u64()?,
            }),
            "cron" => Some(Trigger::Cron {
                hour: record["hour"].as_u64()? as u32,
                minute: record["minute"].as_u64().unwrap_or(0) as u32,
            }),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Defers task admissions to a future instant or interval via timers.
pub struct TaskScheduler {
    me: Weak<TaskScheduler>,
    queue: Arc<TaskQueue>,
    registry: Arc<TaskRegistry>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    jobs: DashMap<String, ScheduledJob>,
}

impl TaskScheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<TaskRegistry>,
        storage: Arc<dyn Storage>,
        events: EventBus,
    ) -> Arc<Self> {
        tracing::info!("task scheduler initialized");
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue,
            registry,
            storage,
            events,
            jobs: DashMap::new(),
        })
    }

    /// Validate a trigger and compute its first fire instant.
    fn first_fire(trigger: &Trigger) -> Result<DateTime<Utc>> {
        match trigger {
            Trigger::Date { run_at } => {
                let now = Utc::now();
                if *run_at <= now {
                    return Err(TaskSystemError::InvalidSchedule {
                        reason: format!("run date {run_at} is not in the future"),
                    });
                }
                Ok(*run_at)
            }
            Trigger::Interval { every_secs } => {
                if *every_secs == 0 {
                    return Err(TaskSystemError::InvalidSchedule {
                        reason: "interval must be greater than zero seconds".to_string(),
                    });
                }
                Ok(Utc::now() + chrono::Duration::seconds(*every_secs as i64))
            }
            Trigger::Cron { hour, minute } => {
                if *hour > 23 || *minute > 59 {
                    return Err(TaskSystemError::InvalidSchedule {
                        reason: format!("invalid cron time {hour:02}:{minute:02}"),
                    });
                }
                Ok(next_cron_occurrence(Utc::now(), *hour, *minute))
            }
        }
    }

    /// Register a task for deferred execution. Returns the job id
    /// (`task_<taskId>`). Must be called within a tokio runtime.
    pub fn schedule(&self, task: Arc<dyn Task>, trigger: Trigger) -> Result<String> {
        let next_fire = Self::first_fire(&trigger)?;
        let task_id = task.core().id();
        let job_id = format!("task_{task_id}");

        let job = ScheduledJob {
            job_id: job_id.clone(),
            task_id,
            kind: task.kind().to_string(),
            task_data: task.serialize(),
            trigger: trigger.clone(),
            next_fire: Some(next_fire),
            created_at: Utc::now(),
            handle: Some(self.spawn_timer(job_id.clone(), trigger.clone(), next_fire)),
        };
        if let Some(previous) = self.jobs.insert(job_id.clone(), job) {
            if let Some(handle) = previous.handle {
                handle.abort();
            }
        }
        self.save_jobs();
        self.events.emit(TaskEvent::JobScheduled {
            job_id: job_id.clone(),
            task_id,
        });
        tracing::info!(
            job_id = %job_id,
            task_id = %task_id,
            trigger = trigger.name(),
            next_fire = %next_fire,
            "task scheduled"
        );
        Ok(job_id)
    }

    /// Remove a scheduled job and stop its timer.
    pub fn unschedule(&self, job_id: &str) -> Result<()> {
        let (_, job) = self
            .jobs
            .remove(job_id)
            .ok_or_else(|| TaskSystemError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        if let Some(handle) = job.handle {
            handle.abort();
        }
        self.save_jobs();
        self.events.emit(TaskEvent::JobUnscheduled {
            job_id: job_id.to_string(),
        });
        tracing::info!(job_id, "job unscheduled");
        Ok(())
    }

    /// Listing of all scheduled jobs.
    pub fn scheduled_jobs(&self) -> Vec<Value> {
        self.jobs
            .iter()
            .map(|job| {
                json!({
                    "id": job.job_id,
                    "name": job.task_data["name"].clone(),
                    "taskId": job.task_id.to_string(),
                    "trigger": job.trigger.name(),
                    "nextRun": job.next_fire.map(|t| t.to_rfc3339()),
                    "createdAt": job.created_at.to_rfc3339(),
                })
            })
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn contains_job(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Stop all timers. State was saved by the owner beforehand; the
    /// cleared in-memory map is deliberately not persisted so jobs
    /// survive a restart.
    pub fn shutdown(&self) {
        tracing::info!(jobs = self.jobs.len(), "shutting down task scheduler");
        for mut entry in self.jobs.iter_mut() {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
            }
        }
        self.jobs.clear();
    }

    // ─── Timer internals ─────────────────────────────────────────────────────

    fn spawn_timer(
        &self,
        job_id: String,
        trigger: Trigger,
        first_fire: DateTime<Utc>,
    ) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            match trigger {
                Trigger::Date { .. } => {
                    tokio::time::sleep(delay_until(first_fire)).await;
                    let Some(scheduler) = me.upgrade() else { return };
                    scheduler.fire(&job_id);
                    tracing::info!(job_id = %job_id, "one-time job completed, removing");
                    if let Err(error) = scheduler.unschedule(&job_id) {
                        tracing::warn!(job_id = %job_id, %error, "could not remove fired job");
                    }
                }
                Trigger::Interval { every_secs } => {
                    let mut next = first_fire;
                    loop {
                        tokio::time::sleep(delay_until(next)).await;
                        let Some(scheduler) = me.upgrade() else { return };
                        scheduler.fire(&job_id);
                        next = Utc::now() + chrono::Duration::seconds(every_secs as i64);
                        scheduler.set_next_fire(&job_id, next);
                        scheduler.save_jobs();
                    }
                }
                Trigger::Cron { hour, minute } => {
                    let mut next = first_fire;
                    loop {
                        tokio::time::sleep(delay_until(next)).await;
                        let Some(scheduler) = me.upgrade() else { return };
                        scheduler.fire(&job_id);
                        next = next_cron_occurrence(Utc::now(), hour, minute);
                        scheduler.set_next_fire(&job_id, next);
                        scheduler.save_jobs();
                        tracing::info!(job_id = %job_id, next_fire = %next, "cron job rescheduled");
                    }
                }
            }
        })
    }

    /// Reconstruct the job's task and admit it to the queue.
    fn fire(&self, job_id: &str) {
        let Some((kind, task_data, task_id)) = self
            .jobs
            .get(job_id)
            .map(|job| (job.kind.clone(), job.task_data.clone(), job.task_id))
        else {
            return;
        };
        tracing::info!(job_id, task_id = %task_id, kind = %kind, "executing scheduled task");
        match self.registry.deserialize(&task_data) {
            Ok(task) => {
                self.queue.add_task(task);
            }
            Err(error) => {
                tracing::error!(job_id, %error, "failed to reconstruct scheduled task");
            }
        }
    }

    fn set_next_fire(&self, job_id: &str, next: DateTime<Utc>) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.next_fire = Some(next);
        }
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    /// Persist one record per job.
    pub fn save_jobs(&self) {
        let records: Vec<Value> = self.jobs.iter().map(|job| job.to_record()).collect();
        let count = records.len();
        if let Err(error) = self
            .storage
            .save(keys::SCHEDULED_JOBS, Value::Array(records))
        {
            tracing::error!(%error, "failed to persist scheduled jobs");
        } else {
            tracing::debug!(count, "persisted scheduled jobs");
        }
    }

    /// Restore persisted jobs at startup.
    ///
    /// Past `date` jobs are dropped. `interval` timers resume relative
    /// to their stored next fire (one full interval from now if that is
    /// already past); `cron` timers recompute the next wall-clock
    /// occurrence. Must be called within a tokio runtime.
    pub fn load_jobs(&self) {
        let Some(Value::Array(records)) = self.storage.load(keys::SCHEDULED_JOBS) else {
            tracing::debug!("no persisted jobs to load");
            return;
        };
        tracing::info!(count = records.len(), "loading persisted jobs");
        let now = Utc::now();

        for record in records {
            let Some(job_id) = record["jobId"].as_str().map(String::from) else {
                tracing::warn!("job record has no jobId, skipping");
                continue;
            };
            if self.jobs.contains_key(&job_id) {
                continue;
            }
            let Some(trigger) = ScheduledJob::trigger_from_record(&record) else {
                tracing::warn!(job_id = %job_id, "job record has an invalid trigger, skipping");
                continue;
            };
            let Some(task_id) = record["taskId"].as_str().and_then(|s| s.parse().ok()) else {
                tracing::warn!(job_id = %job_id, "job record has an invalid taskId, skipping");
                continue;
            };
            let stored_next = record["nextFire"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));

            let next_fire = match trigger {
                Trigger::Date { run_at } => {
                    if run_at <= now {
                        tracing::info!(
                            job_id = %job_id,
                            run_at = %run_at,
                            "skipping past one-time job"
                        );
                        continue;
                    }
                    run_at
                }
                Trigger::Interval { every_secs } => match stored_next {
                    Some(next) if next > now => next,
                    _ => now + chrono::Duration::seconds(every_secs as i64),
                },
                Trigger::Cron { hour, minute } => next_cron_occurrence(now, hour, minute),
            };

            let created_at = record["createdAt"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now);

            let job = ScheduledJob {
                job_id: job_id.clone(),
                task_id,
                kind: record["kind"].as_str().unwrap_or_default().to_string(),
                task_data: record["taskData"].clone(),
                trigger: trigger.clone(),
                next_fire: Some(next_fire),
                created_at,
                handle: Some(self.spawn_timer(job_id.clone(), trigger, next_fire)),
            };
            self.jobs.insert(job_id.clone(), job);
            tracing::info!(job_id = %job_id, next_fire = %next_fire, "persisted job restored");
        }
        self.save_jobs();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
