//! Durable background job queue.
//!
//! Producers enqueue typed payloads; a registered handler gates each
//! payload before any row is written. Workers claim jobs through
//! `dequeue` (atomic, busy-retried) and report back via `complete` /
//! `fail`. Failures ride capped exponential backoff until the retry
//! budget is spent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::db::{BrainDb, JobRow, JobStatus, QueueStats};
use crate::error::{BrainError, Result};
use crate::util;

/// Per-job knobs for `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first.
    pub priority: i64,
    /// Overrides the default retry budget when set.
    pub max_retries: Option<i64>,
    /// Earliest eligibility is `now + delay_ms`.
    pub delay_ms: i64,
    /// Producer tag for diagnostics.
    pub source: Option<String>,
    /// Chains fan-out jobs back to their origin.
    pub root_job_id: Option<String>,
}

pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Handle passed to handlers for milestone reporting and cooperative
/// cancellation. The worker sets the cancel flag at shutdown; handlers
/// should check it across I/O boundaries.
#[derive(Debug, Clone)]
pub struct JobProgress {
    job_id: String,
    cancelled: Arc<AtomicBool>,
}

impl JobProgress {
    pub fn new(job_id: String, cancelled: Arc<AtomicBool>) -> Self {
        Self { job_id, cancelled }
    }

    #[cfg(test)]
    pub fn detached(job_id: &str) -> Self {
        Self::new(job_id.to_string(), Arc::new(AtomicBool::new(false)))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn report(&self, step: u32, total: u32) {
        log::debug!("Job {}: progress {}/{}", self.job_id, step, total);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A typed background work handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job `type` this handler owns.
    fn job_type(&self) -> &str;

    /// Gate payloads before a row is written. Reject with
    /// `InvalidJobData`.
    fn validate(&self, data: &Value) -> Result<()>;

    /// Execute the job. The returned value is persisted in the job's
    /// `result` column.
    async fn process(&self, data: Value, progress: &JobProgress) -> Result<Value>;

    /// Called after `process` errors, before the retry transition.
    async fn on_error(&self, _job_id: &str, _error: &BrainError) {}
}

/// Queue status view for callers polling a job they enqueued.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusInfo {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub scheduled_for: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
    pub source: Option<String>,
    pub created_at: i64,
}

impl From<JobRow> for JobStatusInfo {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            job_type: row.job_type,
            status: row.status,
            priority: row.priority,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            scheduled_for: row.scheduled_for,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
            source: row.source,
            created_at: row.created_at,
        }
    }
}

pub struct JobQueue {
    db: Arc<BrainDb>,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl JobQueue {
    pub fn new(db: Arc<BrainDb>) -> Self {
        Self {
            db,
            handlers: DashMap::new(),
        }
    }

    /// Register the handler for a job type. Re-registration replaces the
    /// previous handler (latest wins; used by tests).
    pub fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        log::debug!("JobQueue: registered handler for `{}`", job_type);
        self.handlers.insert(job_type, handler);
    }

    pub fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|h| Arc::clone(h.value()))
    }

    /// Validate and persist a job. No row is written when the payload
    /// fails the handler's gate.
    pub fn enqueue(&self, job_type: &str, data: Value, opts: EnqueueOptions) -> Result<String> {
        let handler = self.handler(job_type).ok_or_else(|| {
            BrainError::InvalidJobData(format!("no handler registered for `{job_type}`"))
        })?;
        handler.validate(&data)?;

        let now = util::now_millis();
        let row = JobRow {
            id: util::new_id(),
            job_type: job_type.to_string(),
            data: serde_json::to_string(&data)?,
            status: JobStatus::Pending,
            priority: opts.priority,
            retry_count: 0,
            max_retries: opts.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            scheduled_for: now + opts.delay_ms.max(0),
            started_at: None,
            completed_at: None,
            last_error: None,
            result: None,
            source: opts.source,
            root_job_id: opts.root_job_id,
            metadata: None,
            created_at: now,
        };
        self.db.insert_job(&row)?;

        log::debug!(
            "JobQueue: enqueued {} `{}` priority={}",
            row.id,
            job_type,
            row.priority
        );
        Ok(row.id)
    }

    /// Claim the next eligible job, absorbing transient contention with
    /// the store's busy-retry helper.
    pub fn dequeue(&self) -> Result<Option<JobRow>> {
        self.db
            .with_busy_retry(|db| db.dequeue_job(util::now_millis()))
    }

    pub fn complete(&self, job_id: &str, result: Option<Value>) -> Result<()> {
        let serialized = match result {
            Some(value) => Some(serde_json::to_string(&value)?),
            None => None,
        };
        self.db
            .complete_job(job_id, serialized.as_deref(), util::now_millis())
    }

    /// Record a failure: back off and retry while budget remains,
    /// otherwise park the job as `failed`.
    pub fn fail(&self, job_id: &str, error: &str) -> Result<JobStatus> {
        let status = self.db.fail_job(job_id, error, util::now_millis())?;
        match status {
            JobStatus::Pending => log::info!("JobQueue: {job_id} failed, retrying ({error})"),
            _ => log::warn!("JobQueue: {job_id} failed permanently ({error})"),
        }
        Ok(status)
    }

    pub fn get_status(&self, job_id: &str) -> Result<Option<JobStatusInfo>> {
        Ok(self.db.get_job(job_id)?.map(JobStatusInfo::from))
    }

    /// Every job targeting the given entity id, newest first.
    pub fn get_status_by_entity(&self, entity_id: &str) -> Result<Vec<JobStatusInfo>> {
        Ok(self
            .db
            .get_jobs_for_entity(entity_id)?
            .into_iter()
            .map(JobStatusInfo::from)
            .collect())
    }

    pub fn get_stats(&self) -> Result<QueueStats> {
        self.db.queue_stats()
    }

    /// Garbage-collect terminal jobs older than `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let cutoff = util::now_millis() - max_age.as_millis() as i64;
        self.db.cleanup_jobs(cutoff)
    }

    /// Return long-running `processing` jobs to `pending`.
    pub fn reset_stuck_jobs(&self, threshold: Duration) -> Result<usize> {
        self.db
            .reset_stuck_jobs(threshold.as_millis() as i64, util::now_millis())
    }
}
