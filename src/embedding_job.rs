//! Embedding job handler.
//!
//! The payload carries only `{id, entityType, contentHash, operation}`,
//! never content. The handler re-reads the entity and treats the hash as
//! the staleness oracle: a deleted entity or a superseded hash is a
//! successful no-op, because a newer job (or nothing at all) is the
//! authoritative follow-up.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::embeddings::EmbeddingService;
use crate::error::{BrainError, Result};
use crate::events::{EntityEvent, EventBus};
use crate::queue::{JobHandler, JobProgress};
use crate::service::EntityService;
use crate::types::StoredEmbedding;

pub const EMBEDDING_JOB_TYPE: &str = "embedding";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingOperation {
    Create,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingJobData {
    pub id: String,
    pub entity_type: String,
    pub content_hash: String,
    pub operation: EmbeddingOperation,
}

pub struct EmbeddingJobHandler {
    /// Weak: the queue owns the handler and the service owns the queue;
    /// a strong reference here would cycle.
    service: Weak<EntityService>,
    embedder: Arc<EmbeddingService>,
    events: EventBus,
}

impl EmbeddingJobHandler {
    pub fn new(
        service: Weak<EntityService>,
        embedder: Arc<EmbeddingService>,
        events: EventBus,
    ) -> Self {
        Self { service, embedder, events }
    }

    fn parse(data: &Value) -> Result<EmbeddingJobData> {
        let parsed: EmbeddingJobData = serde_json::from_value(data.clone())
            .map_err(|e| BrainError::InvalidJobData(e.to_string()))?;
        if parsed.id.is_empty() || parsed.entity_type.is_empty() || parsed.content_hash.is_empty() {
            return Err(BrainError::InvalidJobData(
                "id, entityType and contentHash must be non-empty".to_string(),
            ));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl JobHandler for EmbeddingJobHandler {
    fn job_type(&self) -> &str {
        EMBEDDING_JOB_TYPE
    }

    fn validate(&self, data: &Value) -> Result<()> {
        Self::parse(data).map(|_| ())
    }

    async fn process(&self, data: Value, progress: &JobProgress) -> Result<Value> {
        let job = Self::parse(&data)?;
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| BrainError::Index("entity service shut down".to_string()))?;

        progress.report(0, 2);

        // Liveness: a deleted entity makes the job meaningless, not failed.
        let Some(entity) = service.get_entity_raw(&job.entity_type, &job.id)? else {
            log::info!(
                "EmbeddingJob {}: {}/{} deleted, nothing to embed",
                progress.job_id(),
                job.entity_type,
                job.id
            );
            return Ok(json!({ "skipped": "entity-deleted" }));
        };

        // Staleness: a newer write already queued its own job.
        if entity.content_hash != job.content_hash {
            log::info!(
                "EmbeddingJob {}: {}/{} superseded (hash {} != {})",
                progress.job_id(),
                job.entity_type,
                job.id,
                &entity.content_hash[..8.min(entity.content_hash.len())],
                &job.content_hash[..8.min(job.content_hash.len())]
            );
            return Ok(json!({ "skipped": "stale-content" }));
        }

        let vector = self.embedder.embed_document(&entity.content)?;
        progress.report(1, 2);

        service.store_embedding(StoredEmbedding {
            entity_id: entity.id.clone(),
            entity_type: entity.entity_type.clone(),
            embedding: vector,
            content_hash: job.content_hash.clone(),
        })?;

        self.events.emit(EntityEvent::EmbeddingReady {
            entity_type: entity.entity_type.clone(),
            entity_id: entity.id.clone(),
            entity,
        });
        progress.report(2, 2);

        Ok(json!({ "status": "embedded", "operation": job.operation }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MarkdownAdapter;
    use crate::db::BrainDb;
    use crate::queue::JobQueue;
    use crate::registry::{EntityRegistry, EntityTypeConfig};
    use crate::schema::Schema;
    use crate::types::{EntityInput, Metadata, WriteOptions};
    use crate::util;

    struct Fixture {
        service: Arc<EntityService>,
        handler: EmbeddingJobHandler,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(BrainDb::open_in_memory().unwrap());
        let registry = Arc::new(EntityRegistry::new());
        let queue = Arc::new(JobQueue::new(Arc::clone(&db)));
        let embedder = Arc::new(EmbeddingService::hash_only(32));

        registry
            .register(
                "note",
                Schema::new(),
                Arc::new(MarkdownAdapter::default()),
                EntityTypeConfig::default(),
            )
            .unwrap();

        let service = Arc::new(EntityService::new(
            db,
            registry,
            Arc::clone(&queue),
            crate::events::EventBus::default(),
            Arc::clone(&embedder),
        ));
        let handler = EmbeddingJobHandler::new(
            Arc::downgrade(&service),
            embedder,
            service.events().clone(),
        );
        queue.register_handler(Arc::new(EmbeddingJobHandler::new(
            Arc::downgrade(&service),
            Arc::new(EmbeddingService::hash_only(32)),
            service.events().clone(),
        )));
        Fixture { service, handler }
    }

    fn job_data(id: &str, hash: &str) -> Value {
        serde_json::to_value(EmbeddingJobData {
            id: id.into(),
            entity_type: "note".into(),
            content_hash: hash.into(),
            operation: EmbeddingOperation::Create,
        })
        .unwrap()
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let fx = fixture();
        assert!(fx.handler.validate(&job_data("", "h")).is_err());
        assert!(fx
            .handler
            .validate(&json!({"id": "a", "entityType": "note"}))
            .is_err());
        assert!(fx.handler.validate(&job_data("a", "h")).is_ok());
    }

    #[tokio::test]
    async fn test_fresh_job_writes_embedding_and_emits() {
        let fx = fixture();
        let mut rx = fx.service.events().subscribe();
        fx.service
            .create_entity(
                EntityInput {
                    id: Some("n1".into()),
                    entity_type: "note".into(),
                    content: "hello".into(),
                    metadata: Metadata::new(),
                },
                WriteOptions::default(),
            )
            .unwrap();

        let result = fx
            .handler
            .process(
                job_data("n1", &util::content_hash("hello")),
                &JobProgress::detached("job-1"),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "embedded");

        // Drain events: created, then embedding:ready.
        let mut saw_ready = false;
        while let Ok(event) = rx.try_recv() {
            if event.name() == "entity:embedding:ready" {
                saw_ready = true;
            }
        }
        assert!(saw_ready);
    }

    #[tokio::test]
    async fn test_stale_job_is_successful_noop() {
        let fx = fixture();
        fx.service
            .create_entity(
                EntityInput {
                    id: Some("n1".into()),
                    entity_type: "note".into(),
                    content: "v2".into(),
                    metadata: Metadata::new(),
                },
                WriteOptions::default(),
            )
            .unwrap();

        // Job still carries the v1 hash.
        let result = fx
            .handler
            .process(
                job_data("n1", &util::content_hash("v1")),
                &JobProgress::detached("job-1"),
            )
            .await
            .unwrap();
        assert_eq!(result["skipped"], "stale-content");
    }

    #[tokio::test]
    async fn test_deleted_entity_is_successful_noop() {
        let fx = fixture();
        let result = fx
            .handler
            .process(
                job_data("ghost", &util::content_hash("x")),
                &JobProgress::detached("job-1"),
            )
            .await
            .unwrap();
        assert_eq!(result["skipped"], "entity-deleted");
    }

    #[tokio::test]
    async fn test_dropped_service_errors() {
        let fx = fixture();
        let handler = fx.handler;
        drop(fx.service);
        let result = handler
            .process(job_data("n1", "h"), &JobProgress::detached("job-1"))
            .await;
        assert!(matches!(result, Err(BrainError::Index(_))));
    }
}
