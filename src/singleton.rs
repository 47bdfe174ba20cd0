//! Singleton entities: types modeled as a single well-known row whose id
//! equals the entity type. A thin convention over the service: ensure on
//! startup, cached reads, invalidate on change.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::service::EntityService;
use crate::types::{Entity, EntityInput, Metadata, WriteOptions};

pub struct SingletonEntity {
    service: Arc<EntityService>,
    entity_type: String,
    cache: RwLock<Option<Entity>>,
}

impl SingletonEntity {
    pub fn new(service: Arc<EntityService>, entity_type: &str) -> Self {
        Self {
            service,
            entity_type: entity_type.to_string(),
            cache: RwLock::new(None),
        }
    }

    /// Create the row if absent, then return it. Idempotent; meant for
    /// startup.
    pub fn ensure(&self, default_content: &str, default_metadata: Metadata) -> Result<Entity> {
        if let Some(existing) = self.service.get_entity_raw(&self.entity_type, &self.entity_type)? {
            *self.cache.write() = Some(existing.clone());
            return Ok(existing);
        }

        let receipt = self.service.create_entity(
            EntityInput {
                id: Some(self.entity_type.clone()),
                entity_type: self.entity_type.clone(),
                content: default_content.to_string(),
                metadata: default_metadata,
            },
            WriteOptions::default(),
        )?;
        log::info!("Singleton: created {}/{}", self.entity_type, receipt.entity_id);

        let entity = self
            .service
            .get_entity_raw(&self.entity_type, &self.entity_type)?
            .ok_or_else(|| crate::error::BrainError::NotFound {
                entity_type: self.entity_type.clone(),
                id: self.entity_type.clone(),
            })?;
        *self.cache.write() = Some(entity.clone());
        Ok(entity)
    }

    /// Cached read; falls through to the store on a cold cache. Returns
    /// `None` when `ensure` has never run and no row exists.
    pub fn get(&self) -> Result<Option<Entity>> {
        if let Some(cached) = self.cache.read().clone() {
            return Ok(Some(cached));
        }
        let entity = self.service.get_entity_raw(&self.entity_type, &self.entity_type)?;
        if let Some(ref entity) = entity {
            *self.cache.write() = Some(entity.clone());
        }
        Ok(entity)
    }

    /// Drop the cache after an external update.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }
}
