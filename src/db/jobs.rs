//! Job table operations.
//!
//! The queue is durable FIFO-with-priority. Dequeue is a single
//! `BEGIN IMMEDIATE` transaction so no two workers can own the same job;
//! failure transitions apply capped exponential backoff until the retry
//! budget is spent.

use rusqlite::{params, OptionalExtension};

use super::{BrainDb, JobRow, JobStatus, QueueStats};
use crate::error::Result;

/// First retry delay; doubles per retry.
pub const RETRY_BASE_DELAY_MS: i64 = 1_000;
/// Backoff ceiling.
pub const RETRY_MAX_DELAY_MS: i64 = 60_000;

const JOB_COLUMNS: &str = "id, type, data, status, priority, retry_count, max_retries, \
     scheduled_for, started_at, completed_at, last_error, result, source, root_job_id, \
     metadata, created_at";

impl BrainDb {
    pub fn insert_job(&self, row: &JobRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, type, data, status, priority, retry_count, max_retries,
                                   scheduled_for, started_at, completed_at, last_error, result,
                                   source, root_job_id, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    row.id,
                    row.job_type,
                    row.data,
                    row.status.as_str(),
                    row.priority,
                    row.retry_count,
                    row.max_retries,
                    row.scheduled_for,
                    row.started_at,
                    row.completed_at,
                    row.last_error,
                    row.result,
                    row.source,
                    row.root_job_id,
                    row.metadata,
                    row.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Claim the next eligible job: `pending`, due, highest priority
    /// first, oldest schedule first. The select-then-flip runs inside one
    /// immediate transaction so concurrent dequeues never share a row.
    pub fn dequeue_job(&self, now: i64) -> Result<Option<JobRow>> {
        self.with_transaction(|conn| {
            let candidate = conn
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs
                         WHERE status = 'pending' AND scheduled_for <= ?1
                         ORDER BY priority DESC, scheduled_for ASC
                         LIMIT 1"
                    ),
                    params![now],
                    map_job_row,
                )
                .optional()?;

            let Some(mut job) = candidate else {
                return Ok(None);
            };

            conn.execute(
                "UPDATE jobs SET status = 'processing', started_at = ?2 WHERE id = ?1",
                params![job.id, now],
            )?;
            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            Ok(Some(job))
        })
    }

    /// `processing → completed`.
    pub fn complete_job(&self, job_id: &str, result: Option<&str>, now: i64) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET status = 'completed', completed_at = ?2, result = ?3
                 WHERE id = ?1 AND status = 'processing'",
                params![job_id, now, result],
            )?;
            if changed == 0 {
                log::warn!("Jobs: complete({job_id}) matched no processing row");
            }
            Ok(())
        })
    }

    /// `processing → pending` with backoff while the retry budget lasts,
    /// else `processing → failed`. Returns the resulting status.
    pub fn fail_job(&self, job_id: &str, error: &str, now: i64) -> Result<JobStatus> {
        self.with_transaction(|conn| {
            let job = conn
                .query_row(
                    "SELECT retry_count, max_retries FROM jobs
                     WHERE id = ?1 AND status = 'processing'",
                    params![job_id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            let Some((retry_count, max_retries)) = job else {
                log::warn!("Jobs: fail({job_id}) matched no processing row");
                return Ok(JobStatus::Failed);
            };

            if retry_count < max_retries {
                let delay = retry_backoff_ms(retry_count);
                conn.execute(
                    "UPDATE jobs
                     SET status = 'pending', retry_count = retry_count + 1,
                         last_error = ?2, scheduled_for = ?3, started_at = NULL
                     WHERE id = ?1",
                    params![job_id, error, now + delay],
                )?;
                Ok(JobStatus::Pending)
            } else {
                conn.execute(
                    "UPDATE jobs
                     SET status = 'failed', completed_at = ?2, last_error = ?3
                     WHERE id = ?1",
                    params![job_id, now, error],
                )?;
                Ok(JobStatus::Failed)
            }
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                    params![job_id],
                    map_job_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Jobs whose payload targets the given entity id, newest first.
    pub fn get_jobs_for_entity(&self, entity_id: &str) -> Result<Vec<JobRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE json_extract(data, '$.id') = ?1
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map(params![entity_id], map_job_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut stats = QueueStats::default();
            for row in rows {
                let (status, count) = row?;
                match JobStatus::parse(&status) {
                    Ok(JobStatus::Pending) => stats.pending = count,
                    Ok(JobStatus::Processing) => stats.processing = count,
                    Ok(JobStatus::Completed) => stats.completed = count,
                    Ok(JobStatus::Failed) => stats.failed = count,
                    Err(_) => log::warn!("Jobs: unknown status `{status}` in stats"),
                }
            }
            Ok(stats)
        })
    }

    /// Garbage-collect terminal jobs older than the cutoff. Returns how
    /// many rows were removed.
    pub fn cleanup_jobs(&self, cutoff: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM jobs
                 WHERE status IN ('completed', 'failed')
                   AND completed_at IS NOT NULL AND completed_at < ?1",
                params![cutoff],
            )?;
            Ok(removed)
        })
    }

    /// Return jobs stuck in `processing` beyond the threshold to
    /// `pending`. The sweep cannot kill a rogue handler, but it makes the
    /// job eligible again once the owner is presumed dead.
    pub fn reset_stuck_jobs(&self, threshold_ms: i64, now: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let reset = conn.execute(
                "UPDATE jobs SET status = 'pending', started_at = NULL
                 WHERE status = 'processing'
                   AND started_at IS NOT NULL AND started_at < ?1",
                params![now - threshold_ms],
            )?;
            if reset > 0 {
                log::info!("Jobs: reset {reset} stuck job(s) to pending");
            }
            Ok(reset)
        })
    }
}

/// Backoff for the N-th retry: `min(1000·2^n, 60000)` ms.
pub fn retry_backoff_ms(retry_count: i64) -> i64 {
    let shifted = RETRY_BASE_DELAY_MS.saturating_mul(1_i64 << retry_count.clamp(0, 16));
    shifted.min(RETRY_MAX_DELAY_MS)
}

fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    let status: String = row.get(3)?;
    Ok(JobRow {
        id: row.get(0)?,
        job_type: row.get(1)?,
        data: row.get(2)?,
        status: JobStatus::parse(&status).map_err(|e| {
            rusqlite::Error::UserFunctionError(Box::new(e))
        })?,
        priority: row.get(4)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        scheduled_for: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        last_error: row.get(10)?,
        result: row.get(11)?,
        source: row.get(12)?,
        root_job_id: row.get(13)?,
        metadata: row.get(14)?,
        created_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, priority: i64, scheduled_for: i64) -> JobRow {
        JobRow {
            id: id.into(),
            job_type: "embedding".into(),
            data: format!(r#"{{"id":"{id}","entityType":"note"}}"#),
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            max_retries: 3,
            scheduled_for,
            started_at: None,
            completed_at: None,
            last_error: None,
            result: None,
            source: None,
            root_job_id: None,
            metadata: None,
            created_at: scheduled_for,
        }
    }

    #[test]
    fn test_dequeue_orders_by_priority_then_schedule() {
        let db = BrainDb::open_in_memory().unwrap();
        db.insert_job(&job("low-old", 0, 10)).unwrap();
        db.insert_job(&job("high-new", 5, 50)).unwrap();
        db.insert_job(&job("low-new", 0, 50)).unwrap();

        let first = db.dequeue_job(100).unwrap().unwrap();
        assert_eq!(first.id, "high-new");
        let second = db.dequeue_job(100).unwrap().unwrap();
        assert_eq!(second.id, "low-old");
    }

    #[test]
    fn test_dequeue_skips_future_jobs() {
        let db = BrainDb::open_in_memory().unwrap();
        db.insert_job(&job("future", 0, 1_000)).unwrap();
        assert!(db.dequeue_job(500).unwrap().is_none());
        assert!(db.dequeue_job(1_000).unwrap().is_some());
    }

    #[test]
    fn test_dequeue_claims_exclusively() {
        let db = BrainDb::open_in_memory().unwrap();
        db.insert_job(&job("only", 0, 0)).unwrap();

        let first = db.dequeue_job(10).unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, JobStatus::Processing);
        // Already processing: a second dequeue finds nothing.
        assert!(db.dequeue_job(10).unwrap().is_none());
    }

    #[test]
    fn test_fail_applies_backoff_then_terminal() {
        let db = BrainDb::open_in_memory().unwrap();
        db.insert_job(&job("j1", 0, 0)).unwrap();

        let mut now = 0i64;
        // maxRetries = 3 → three backoff retries, fourth failure is terminal.
        for expected_retry in 1..=3i64 {
            let claimed = db.dequeue_job(now).unwrap().unwrap();
            assert_eq!(claimed.id, "j1");
            let status = db.fail_job("j1", "boom", now).unwrap();
            assert_eq!(status, JobStatus::Pending);

            let row = db.get_job("j1").unwrap().unwrap();
            assert_eq!(row.retry_count, expected_retry);
            assert_eq!(row.last_error.as_deref(), Some("boom"));
            assert_eq!(
                row.scheduled_for,
                now + retry_backoff_ms(expected_retry - 1)
            );
            assert!(row.started_at.is_none());
            now = row.scheduled_for;
        }

        db.dequeue_job(now).unwrap().unwrap();
        let status = db.fail_job("j1", "final", now).unwrap();
        assert_eq!(status, JobStatus::Failed);

        let row = db.get_job("j1").unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.completed_at, Some(now));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(retry_backoff_ms(0), 1_000);
        assert_eq!(retry_backoff_ms(1), 2_000);
        assert_eq!(retry_backoff_ms(5), 32_000);
        assert_eq!(retry_backoff_ms(6), 60_000);
        assert_eq!(retry_backoff_ms(50), 60_000);
    }

    #[test]
    fn test_complete_records_result() {
        let db = BrainDb::open_in_memory().unwrap();
        db.insert_job(&job("j1", 0, 0)).unwrap();
        db.dequeue_job(5).unwrap().unwrap();
        db.complete_job("j1", Some(r#"{"ok":true}"#), 9).unwrap();

        let row = db.get_job("j1").unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.completed_at, Some(9));
        assert_eq!(row.result.as_deref(), Some(r#"{"ok":true}"#));
    }

    #[test]
    fn test_stats_and_cleanup() {
        let db = BrainDb::open_in_memory().unwrap();
        db.insert_job(&job("a", 0, 0)).unwrap();
        db.insert_job(&job("b", 0, 0)).unwrap();
        db.dequeue_job(1).unwrap().unwrap();
        db.complete_job("a", None, 10).unwrap();

        let stats = db.queue_stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total(), 2);

        assert_eq!(db.cleanup_jobs(100).unwrap(), 1);
        assert!(db.get_job("a").unwrap().is_none());
        assert!(db.get_job("b").unwrap().is_some());
    }

    #[test]
    fn test_reset_stuck_jobs() {
        let db = BrainDb::open_in_memory().unwrap();
        db.insert_job(&job("stuck", 0, 0)).unwrap();
        db.dequeue_job(0).unwrap().unwrap();

        // 10 minutes later with a 5 minute threshold.
        let reset = db.reset_stuck_jobs(300_000, 600_000).unwrap();
        assert_eq!(reset, 1);

        let row = db.get_job("stuck").unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.started_at.is_none());

        // Fresh processing jobs are left alone.
        db.dequeue_job(600_000).unwrap().unwrap();
        assert_eq!(db.reset_stuck_jobs(300_000, 600_001).unwrap(), 0);
    }

    #[test]
    fn test_jobs_for_entity() {
        let db = BrainDb::open_in_memory().unwrap();
        db.insert_job(&job("j1", 0, 0)).unwrap();
        let mut other = job("j2", 0, 1);
        other.data = r#"{"id":"someone-else","entityType":"note"}"#.into();
        db.insert_job(&other).unwrap();

        let jobs = db.get_jobs_for_entity("j1").unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "j1");
    }
}
