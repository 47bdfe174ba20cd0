//! Background worker pool.
//!
//! N concurrent tasks poll the queue, dispatch to the registered
//! handler, and report completion or failure back to the queue. A
//! periodic sweep (and one pass at startup) returns stuck `processing`
//! jobs to `pending`. Shutdown is graceful: polling stops, the
//! cancellation flag is raised for cooperative handlers, and all
//! in-flight work is awaited.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::queue::{JobProgress, JobQueue};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent worker tasks.
    pub concurrency: usize,
    /// Idle sleep between polls.
    pub poll_interval: Duration,
    /// Hard ceiling per handler invocation; also the stuck threshold.
    pub max_processing_time: Duration,
    /// Cadence of the stuck-job sweep.
    pub stuck_sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(1_000),
            max_processing_time: Duration::from_secs(300),
            stuck_sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
    pub active: u64,
    pub uptime_secs: u64,
    pub running: bool,
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    config: WorkerConfig,
    running: AtomicBool,
    cancelled: Arc<AtomicBool>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    processed: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            running: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active: AtomicU64::new(0),
            started_at: Mutex::new(None),
        }
    }

    /// Spawn the worker tasks and the stuck-job sweeper. Calling start on
    /// a running pool is a no-op.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            log::debug!("WorkerPool: start ignored, already running");
            return;
        }
        self.cancelled.store(false, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);

        // Recover jobs orphaned by a previous crash before polling.
        match self.queue.reset_stuck_jobs(self.config.max_processing_time) {
            Ok(0) => {}
            Ok(n) => log::info!("WorkerPool: startup sweep reset {n} stuck job(s)"),
            Err(e) => log::warn!("WorkerPool: startup sweep failed: {e}"),
        }

        let mut handles = self.handles.lock();
        for worker_id in 0..self.config.concurrency.max(1) {
            let pool = Arc::clone(&self);
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                pool.run_worker(worker_id, rx).await;
            }));
        }

        let pool = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            pool.run_sweeper(rx).await;
        }));

        log::info!(
            "WorkerPool: started {} worker(s), poll interval {:?}",
            self.config.concurrency.max(1),
            self.config.poll_interval
        );
    }

    /// Graceful shutdown: cease polling, raise the cancellation flag,
    /// await all in-flight handlers. Safe to call twice.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("WorkerPool: worker task panicked: {e}");
            }
        }
        log::info!("WorkerPool: stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            uptime_secs: (*self.started_at.lock())
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            running: self.is_running(),
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        log::debug!("Worker {worker_id}: started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let job = match self.queue.dequeue() {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    log::warn!("Worker {worker_id}: dequeue failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            self.active.fetch_add(1, Ordering::Relaxed);
            self.process_job(worker_id, job).await;
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
        log::debug!("Worker {worker_id}: stopped");
    }

    async fn process_job(&self, worker_id: usize, job: crate::db::JobRow) {
        let Some(handler) = self.queue.handler(&job.job_type) else {
            log::warn!(
                "Worker {worker_id}: no handler for `{}` (job {})",
                job.job_type,
                job.id
            );
            let _ = self.queue.fail(&job.id, "no handler registered");
            self.failed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let data: serde_json::Value = match serde_json::from_str(&job.data) {
            Ok(data) => data,
            Err(e) => {
                let _ = self.queue.fail(&job.id, &format!("payload parse failed: {e}"));
                self.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        log::debug!("Worker {worker_id}: processing {} `{}`", job.id, job.job_type);
        let progress = JobProgress::new(job.id.clone(), Arc::clone(&self.cancelled));

        let outcome = tokio::time::timeout(
            self.config.max_processing_time,
            handler.process(data, &progress),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => {
                if let Err(e) = self.queue.complete(&job.id, Some(result)) {
                    log::warn!("Worker {worker_id}: complete({}) failed: {e}", job.id);
                }
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(error)) => {
                let _ = self.queue.fail(&job.id, &error.to_string());
                handler.on_error(&job.id, &error).await;
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                let message = format!(
                    "timed out after {:?}",
                    self.config.max_processing_time
                );
                let _ = self.queue.fail(&job.id, &message);
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.stuck_sweep_interval) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            match self.queue.reset_stuck_jobs(self.config.max_processing_time) {
                Ok(0) => {}
                Ok(n) => log::info!("WorkerPool: sweep reset {n} stuck job(s)"),
                Err(e) => log::warn!("WorkerPool: sweep failed: {e}"),
            }
        }
    }
}
