//! Shared type definitions for the entity store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque key→value metadata attached to an entity. The store never
/// interprets it beyond filter/sort paths; it must round-trip losslessly.
pub type Metadata = serde_json::Map<String, Value>;

/// A persisted unit of knowledge, keyed by `(id, entity_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    /// Markdown with optional YAML frontmatter. The adapter for the type
    /// decides what lives here vs. in `metadata`.
    pub content: String,
    /// SHA-256 hex digest of `content`, recomputed at every write.
    pub content_hash: String,
    pub metadata: Metadata,
    /// Millis since epoch.
    pub created: i64,
    pub updated: i64,
}

/// Input for `create_entity`. The id is optional; absent ids are generated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub entity_type: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Options for create/update/upsert.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// On id collision, resolve to `id-2`, `id-3`, … instead of failing.
    pub deduplicate_id: bool,
}

/// Returned by create/update: the committed id and the enqueued embedding
/// job id (empty for non-embeddable types).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub entity_id: String,
    pub job_id: String,
}

/// Returned by upsert: which path was taken.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertReceipt {
    pub entity_id: String,
    pub job_id: String,
    pub created: bool,
}

/// Sortable fields for `list_entities`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Created,
    Updated,
    /// Arbitrary metadata JSON path, e.g. `title` or `author.name`.
    Metadata(String),
}

#[derive(Debug, Clone)]
pub struct SortField {
    pub key: SortKey,
    pub descending: bool,
}

impl SortField {
    pub fn desc(key: SortKey) -> Self {
        Self { key, descending: true }
    }

    pub fn asc(key: SortKey) -> Self {
        Self { key, descending: false }
    }
}

/// Options for `list_entities` / `count_entities`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Stable ordering; defaults to `updated desc` when empty.
    pub sort: Vec<SortField>,
    /// Metadata equality filters, ANDed together.
    pub filter: Vec<(String, Value)>,
    /// Keep only rows where `metadata.status = "published"` or status is absent.
    pub published_only: bool,
}

/// Options for `search`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Restrict to these entity types.
    pub types: Vec<String>,
    /// Exclude these entity types.
    pub exclude_types: Vec<String>,
    /// Per-type ranking weight overrides (on top of registry weights).
    pub weights: Vec<(String, f64)>,
}

/// One search hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub entity: Entity,
    /// `(1 − distance/2) · weight(entity_type)`.
    pub score: f64,
    /// ~200-char window around the first query occurrence.
    pub excerpt: String,
}

/// A vector row destined for the `embeddings` table.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub entity_id: String,
    pub entity_type: String,
    pub embedding: Vec<f32>,
    /// The digest the vector was computed from. Authoritative only while
    /// it matches the entity's current hash.
    pub content_hash: String,
}
