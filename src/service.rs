//! Entity service: the public façade over the store.
//!
//! Writes are validated through the registry, content-hashed, committed
//! synchronously (immediate visibility), announced on the event bus, and
//! followed by an embedding job for embeddable types. Reads hydrate rows
//! and, for `get_entity`, expand inline image references.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::db::{BrainDb, EmbeddingRow, EntityRow};
use crate::embedding_job::{EmbeddingJobData, EmbeddingOperation, EMBEDDING_JOB_TYPE};
use crate::embeddings::{self, EmbeddingService};
use crate::error::{BrainError, Result};
use crate::events::{EntityEvent, EventBus};
use crate::queue::{EnqueueOptions, JobQueue};
use crate::registry::EntityRegistry;
use crate::resolver;
use crate::search::SearchEngine;
use crate::types::{
    Entity, EntityInput, ListOptions, SearchOptions, SearchResult, StoredEmbedding, UpsertReceipt,
    WriteOptions, WriteReceipt,
};
use crate::util;

/// Sequential dedup probes before falling back to a random suffix.
const DEDUP_SCAN_LIMIT: u32 = 100;
/// Length of the random fallback token.
const DEDUP_TOKEN_LEN: usize = 8;

pub struct EntityService {
    db: Arc<BrainDb>,
    registry: Arc<EntityRegistry>,
    queue: Arc<JobQueue>,
    events: EventBus,
    search: SearchEngine,
    /// Serializes dedup reservations per `{type}/{base-id}` so concurrent
    /// deduplicating callers never resolve to the same id.
    dedup_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EntityService {
    pub fn new(
        db: Arc<BrainDb>,
        registry: Arc<EntityRegistry>,
        queue: Arc<JobQueue>,
        events: EventBus,
        embedder: Arc<EmbeddingService>,
    ) -> Self {
        let search = SearchEngine::new(Arc::clone(&db), Arc::clone(&registry), embedder);
        Self {
            db,
            registry,
            queue,
            events,
            search,
            dedup_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Create an entity. The row is committed before this returns; the
    /// embedding job (embeddable types only) completes later and gates
    /// search visibility.
    pub fn create_entity(&self, input: EntityInput, opts: WriteOptions) -> Result<WriteReceipt> {
        let entity = self.build_entity(&input)?;

        match (&input.id, opts.deduplicate_id) {
            (Some(base), true) => {
                let base = base.clone();
                self.insert_deduplicated(entity, &base)
            }
            _ => {
                self.db.insert_entity(&EntityRow::from_entity(&entity)?)?;
                self.after_create(entity)
            }
        }
    }

    /// Full replacement of an existing entity. `created` is preserved,
    /// `updated` refreshed, the hash recomputed.
    pub fn update_entity(&self, input: EntityInput) -> Result<WriteReceipt> {
        let id = input.id.clone().ok_or_else(|| {
            BrainError::Validation("update requires an entity id".to_string())
        })?;
        let existing = self
            .db
            .get_entity_row(&input.entity_type, &id)?
            .ok_or_else(|| BrainError::NotFound {
                entity_type: input.entity_type.clone(),
                id: id.clone(),
            })?;

        let mut entity = self.build_entity(&input)?;
        entity.id = id;
        entity.created = existing.created;
        entity.updated = util::now_millis().max(existing.created);

        if !self.db.replace_entity(&EntityRow::from_entity(&entity)?)? {
            return Err(BrainError::NotFound {
                entity_type: entity.entity_type,
                id: entity.id,
            });
        }

        self.events.emit(EntityEvent::Updated {
            entity_type: entity.entity_type.clone(),
            entity_id: entity.id.clone(),
            entity: entity.clone(),
        });

        let job_id = self.maybe_enqueue_embedding(&entity, EmbeddingOperation::Update)?;
        Ok(WriteReceipt { entity_id: entity.id, job_id })
    }

    /// Create-or-update. Exactly one path is taken; a concurrent create
    /// winning the race downgrades this call to an update.
    pub fn upsert_entity(&self, input: EntityInput, opts: WriteOptions) -> Result<UpsertReceipt> {
        let exists = match &input.id {
            Some(id) => self.db.entity_exists(&input.entity_type, id)?,
            None => false,
        };

        if exists {
            let receipt = self.update_entity(input)?;
            return Ok(UpsertReceipt {
                entity_id: receipt.entity_id,
                job_id: receipt.job_id,
                created: false,
            });
        }

        match self.create_entity(input.clone(), opts) {
            Ok(receipt) => Ok(UpsertReceipt {
                entity_id: receipt.entity_id,
                job_id: receipt.job_id,
                created: true,
            }),
            Err(BrainError::Duplicate { .. }) => {
                let receipt = self.update_entity(input)?;
                Ok(UpsertReceipt {
                    entity_id: receipt.entity_id,
                    job_id: receipt.job_id,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Remove an entity and (via cascade) its embedding. Returns whether
    /// a row existed; the deletion event fires only when it did.
    pub fn delete_entity(&self, entity_type: &str, id: &str) -> Result<bool> {
        let deleted = self.db.delete_entity_row(entity_type, id)?;
        if deleted {
            self.events.emit(EntityEvent::Deleted {
                entity_type: entity_type.to_string(),
                entity_id: id.to_string(),
            });
        }
        Ok(deleted)
    }

    /// Upsert the vector for an entity. Never touches the `entities` row.
    pub fn store_embedding(&self, stored: StoredEmbedding) -> Result<()> {
        self.db.upsert_embedding(&EmbeddingRow {
            entity_id: stored.entity_id,
            entity_type: stored.entity_type,
            embedding: embeddings::vector_to_blob(&stored.embedding),
            content_hash: stored.content_hash,
        })
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Fetch an entity with inline image references expanded. Types on
    /// the resolver blocklist (`image` itself) skip resolution.
    pub fn get_entity(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        let Some(mut entity) = self.get_entity_raw(entity_type, id)? else {
            return Ok(None);
        };

        if !resolver::is_resolution_blocked(entity_type) {
            let resolved = resolver::resolve_images(self, &entity.content);
            if resolved.resolved > 0 || resolved.failed > 0 {
                log::debug!(
                    "EntityService: resolved {}/{} image refs for {}/{}",
                    resolved.resolved,
                    resolved.resolved + resolved.failed,
                    entity_type,
                    id
                );
            }
            entity.content = resolved.content;
        }
        Ok(Some(entity))
    }

    /// Fetch without content resolution. Used by the resolver and the
    /// embedding handler to avoid re-entering the resolution pipeline.
    pub fn get_entity_raw(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        match self.db.get_entity_row(entity_type, id)? {
            Some(row) => Ok(Some(row.into_entity()?)),
            None => Ok(None),
        }
    }

    pub fn list_entities(&self, entity_type: &str, opts: &ListOptions) -> Result<Vec<Entity>> {
        let rows = self.db.list_entity_rows(entity_type, opts)?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    pub fn count_entities(&self, entity_type: &str, opts: &ListOptions) -> Result<i64> {
        self.db.count_entity_rows(entity_type, opts)
    }

    /// Weighted vector search over entities with a fresh embedding.
    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        self.search.search(query, opts)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    /// Validate input and assemble the entity to persist: id assigned,
    /// hash computed, metadata extracted through the type's adapter.
    fn build_entity(&self, input: &EntityInput) -> Result<Entity> {
        if !self.registry.has(&input.entity_type) {
            return Err(BrainError::UnknownType(input.entity_type.clone()));
        }
        let adapter = self.registry.get_adapter(&input.entity_type)?;

        let now = util::now_millis();
        let mut entity = Entity {
            id: input.id.clone().unwrap_or_else(util::new_id),
            entity_type: input.entity_type.clone(),
            content: input.content.clone(),
            content_hash: util::content_hash(&input.content),
            metadata: input.metadata.clone(),
            created: now,
            updated: now,
        };

        entity.metadata = adapter.extract_metadata(&entity)?;
        self.registry
            .validate(&input.entity_type, &Value::Object(entity.metadata.clone()))?;
        Ok(entity)
    }

    /// Insert under the per-base-id mutex, probing `base`, `base-2`, …
    /// `base-100`, then random suffixes. Holding the lock across the
    /// probe-and-insert keeps concurrent dedups disjoint.
    fn insert_deduplicated(&self, mut entity: Entity, base: &str) -> Result<WriteReceipt> {
        let key = format!("{}/{}", entity.entity_type, base);
        let lock = self
            .dedup_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();

        entity.id = self.resolve_free_id(&entity.entity_type, base)?;
        self.db.insert_entity(&EntityRow::from_entity(&entity)?)?;
        self.after_create(entity)
    }

    fn resolve_free_id(&self, entity_type: &str, base: &str) -> Result<String> {
        if !self.db.entity_exists(entity_type, base)? {
            return Ok(base.to_string());
        }
        for n in 2..=DEDUP_SCAN_LIMIT {
            let candidate = format!("{base}-{n}");
            if !self.db.entity_exists(entity_type, &candidate)? {
                return Ok(candidate);
            }
        }
        // Sequential space exhausted; random tokens are effectively free.
        loop {
            let candidate = format!("{}-{}", base, util::random_token(DEDUP_TOKEN_LEN));
            if !self.db.entity_exists(entity_type, &candidate)? {
                return Ok(candidate);
            }
        }
    }

    fn after_create(&self, entity: Entity) -> Result<WriteReceipt> {
        self.events.emit(EntityEvent::Created {
            entity_type: entity.entity_type.clone(),
            entity_id: entity.id.clone(),
            entity: entity.clone(),
        });
        let job_id = self.maybe_enqueue_embedding(&entity, EmbeddingOperation::Create)?;
        Ok(WriteReceipt { entity_id: entity.id, job_id })
    }

    /// Enqueue the embedding job for embeddable types; non-embeddable
    /// types return an empty job id. The payload carries only the hash;
    /// the handler re-reads content and treats the hash as the staleness
    /// oracle.
    fn maybe_enqueue_embedding(
        &self,
        entity: &Entity,
        operation: EmbeddingOperation,
    ) -> Result<String> {
        if !self.registry.is_embeddable(&entity.entity_type)? {
            return Ok(String::new());
        }

        let data = serde_json::to_value(EmbeddingJobData {
            id: entity.id.clone(),
            entity_type: entity.entity_type.clone(),
            content_hash: entity.content_hash.clone(),
            operation,
        })?;

        self.queue.enqueue(
            EMBEDDING_JOB_TYPE,
            data,
            EnqueueOptions {
                source: Some("entity-service".to_string()),
                ..Default::default()
            },
        )
    }
}
