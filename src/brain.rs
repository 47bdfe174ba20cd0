//! Composition root: opens the store and wires the registry, event bus,
//! embedding model, job queue, worker pool, and entity service together.

use std::sync::Arc;

use crate::config::BrainConfig;
use crate::db::BrainDb;
use crate::embedding_job::EmbeddingJobHandler;
use crate::embeddings::EmbeddingService;
use crate::error::Result;
use crate::events::EventBus;
use crate::queue::JobQueue;
use crate::registry::EntityRegistry;
use crate::service::EntityService;
use crate::worker::{WorkerConfig, WorkerPool};

pub struct Brain {
    pub config: BrainConfig,
    pub db: Arc<BrainDb>,
    pub registry: Arc<EntityRegistry>,
    pub events: EventBus,
    pub embedder: Arc<EmbeddingService>,
    pub queue: Arc<JobQueue>,
    pub service: Arc<EntityService>,
    pub worker: Arc<WorkerPool>,
}

impl Brain {
    /// Open the file-backed store described by `config`. The embedding
    /// model starts uninitialized; call `initialize_embeddings` before
    /// starting workers in production, or leave it and let embedding
    /// jobs retry until the model is ready.
    pub fn open(config: BrainConfig) -> Result<Self> {
        let db = Arc::new(BrainDb::open(&config.data_dir()?)?);
        Self::wire(config, db, Arc::new(EmbeddingService::new()))
    }

    /// In-memory store with deterministic hash embeddings. The test and
    /// demo entry point.
    pub fn open_in_memory() -> Result<Self> {
        let config = BrainConfig::default();
        let dimension = config.embeddings.dimension;
        Self::wire(
            config,
            Arc::new(BrainDb::open_in_memory()?),
            Arc::new(EmbeddingService::hash_only(dimension)),
        )
    }

    fn wire(config: BrainConfig, db: Arc<BrainDb>, embedder: Arc<EmbeddingService>) -> Result<Self> {
        let registry = Arc::new(EntityRegistry::new());
        let events = EventBus::default();
        let queue = Arc::new(JobQueue::new(Arc::clone(&db)));

        let service = Arc::new(EntityService::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            Arc::clone(&queue),
            events.clone(),
            Arc::clone(&embedder),
        ));

        queue.register_handler(Arc::new(EmbeddingJobHandler::new(
            Arc::downgrade(&service),
            Arc::clone(&embedder),
            events.clone(),
        )));

        let worker = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            WorkerConfig {
                concurrency: config.worker.concurrency,
                poll_interval: config.poll_interval(),
                max_processing_time: config.max_processing_time(),
                stuck_sweep_interval: config.stuck_sweep_interval(),
            },
        ));

        Ok(Self {
            config,
            db,
            registry,
            events,
            embedder,
            queue,
            service,
            worker,
        })
    }

    /// Load the real embedding model, downloading into the configured
    /// cache dir on first run. Falls back to hash embeddings offline.
    pub fn initialize_embeddings(&self) -> Result<()> {
        self.embedder.initialize(self.config.model_cache_dir()?)
    }

    pub fn start_workers(&self) {
        Arc::clone(&self.worker).start();
    }

    pub async fn shutdown(&self) {
        self.worker.stop().await;
    }

    /// Queue garbage collection; returns removed job rows.
    pub fn run_maintenance(&self) -> Result<usize> {
        self.queue.cleanup(self.config.cleanup_max_age())
    }
}
