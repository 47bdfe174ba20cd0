//! Runtime catalog of entity types.
//!
//! Maps each `entity_type` to its schema, adapter, and config (search
//! weight, embeddability). The registry has an explicit lifecycle
//! (construct, register, `reset` in tests) rather than living as ambient
//! process state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::adapter::EntityAdapter;
use crate::error::{BrainError, Result};
use crate::schema::Schema;

/// Per-type behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct EntityTypeConfig {
    /// Search ranking multiplier.
    pub weight: f64,
    /// When false, writes skip the embedding job and rows never surface
    /// in search.
    pub embeddable: bool,
}

impl Default for EntityTypeConfig {
    fn default() -> Self {
        Self { weight: 1.0, embeddable: true }
    }
}

struct Registration {
    schema: Schema,
    adapter: Arc<dyn EntityAdapter>,
    config: EntityTypeConfig,
    /// Additive frontmatter extensions, applied in registration order.
    frontmatter_extensions: Vec<Schema>,
}

#[derive(Default)]
pub struct EntityRegistry {
    types: RwLock<HashMap<String, Registration>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Fails with `AlreadyRegistered` on duplicates.
    pub fn register(
        &self,
        entity_type: &str,
        schema: Schema,
        adapter: Arc<dyn EntityAdapter>,
        config: EntityTypeConfig,
    ) -> Result<()> {
        let mut types = self.types.write();
        if types.contains_key(entity_type) {
            return Err(BrainError::AlreadyRegistered(entity_type.to_string()));
        }
        types.insert(
            entity_type.to_string(),
            Registration {
                schema,
                adapter,
                config,
                frontmatter_extensions: Vec::new(),
            },
        );
        log::debug!("Registry: registered entity type `{}`", entity_type);
        Ok(())
    }

    /// Append a frontmatter extension for a registered type. Extensions
    /// never mutate the adapter; they compose into the effective schema
    /// on every `effective_frontmatter_schema` call.
    pub fn extend_frontmatter(&self, entity_type: &str, extension: Schema) -> Result<()> {
        let mut types = self.types.write();
        let reg = types
            .get_mut(entity_type)
            .ok_or_else(|| BrainError::UnknownType(entity_type.to_string()))?;
        reg.frontmatter_extensions.push(extension);
        Ok(())
    }

    pub fn has(&self, entity_type: &str) -> bool {
        self.types.read().contains_key(entity_type)
    }

    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_adapter(&self, entity_type: &str) -> Result<Arc<dyn EntityAdapter>> {
        self.types
            .read()
            .get(entity_type)
            .map(|r| Arc::clone(&r.adapter))
            .ok_or_else(|| BrainError::UnknownType(entity_type.to_string()))
    }

    pub fn get_schema(&self, entity_type: &str) -> Result<Schema> {
        self.types
            .read()
            .get(entity_type)
            .map(|r| r.schema.clone())
            .ok_or_else(|| BrainError::UnknownType(entity_type.to_string()))
    }

    pub fn get_config(&self, entity_type: &str) -> Result<EntityTypeConfig> {
        self.types
            .read()
            .get(entity_type)
            .map(|r| r.config)
            .ok_or_else(|| BrainError::UnknownType(entity_type.to_string()))
    }

    pub fn is_embeddable(&self, entity_type: &str) -> Result<bool> {
        self.get_config(entity_type).map(|c| c.embeddable)
    }

    /// Validate a value against the type's entity schema. Returns the
    /// validated value; adapters own the finer-grained markdown parse.
    pub fn validate(&self, entity_type: &str, value: &Value) -> Result<Value> {
        let schema = self.get_schema(entity_type)?;
        schema.validate(value)
    }

    /// Search ranking weights for every registered type.
    pub fn weight_map(&self) -> HashMap<String, f64> {
        self.types
            .read()
            .iter()
            .map(|(name, reg)| (name.clone(), reg.config.weight))
            .collect()
    }

    /// The adapter's base frontmatter schema merged with all extensions,
    /// composed fresh on every call.
    pub fn effective_frontmatter_schema(&self, entity_type: &str) -> Result<Schema> {
        let types = self.types.read();
        let reg = types
            .get(entity_type)
            .ok_or_else(|| BrainError::UnknownType(entity_type.to_string()))?;

        let mut schema = reg.adapter.frontmatter_schema();
        for extension in &reg.frontmatter_extensions {
            schema = schema.merged_with(extension);
        }
        Ok(schema)
    }

    /// Drop every registration. Test lifecycle hook.
    pub fn reset(&self) {
        self.types.write().clear();
    }
}
