//! Row types for the three tables.

use serde::{Deserialize, Serialize};

use crate::error::{BrainError, Result};
use crate::types::{Entity, Metadata};

/// A row from `entities`. Metadata stays as raw JSON text until
/// hydration so the column round-trips losslessly.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: String,
    pub entity_type: String,
    pub content: String,
    pub content_hash: String,
    pub metadata: String,
    pub created: i64,
    pub updated: i64,
}

impl EntityRow {
    pub fn from_entity(entity: &Entity) -> Result<Self> {
        Ok(Self {
            id: entity.id.clone(),
            entity_type: entity.entity_type.clone(),
            content: entity.content.clone(),
            content_hash: entity.content_hash.clone(),
            metadata: serde_json::to_string(&entity.metadata)?,
            created: entity.created,
            updated: entity.updated,
        })
    }

    pub fn into_entity(self) -> Result<Entity> {
        let metadata: Metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| BrainError::Serialization(format!("metadata column: {e}")))?;
        Ok(Entity {
            id: self.id,
            entity_type: self.entity_type,
            content: self.content,
            content_hash: self.content_hash,
            metadata,
            created: self.created,
            updated: self.updated,
        })
    }
}

/// A row from `embeddings`.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub entity_id: String,
    pub entity_type: String,
    pub embedding: Vec<u8>,
    pub content_hash: String,
}

/// Job lifecycle states. The only legal transitions are
/// `pending → processing → (completed | pending | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(BrainError::Serialization(format!(
                "unknown job status `{other}`"
            ))),
        }
    }
}

/// A row from `jobs`.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub data: String,
    pub status: JobStatus,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub scheduled_for: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
    pub result: Option<String>,
    pub source: Option<String>,
    pub root_job_id: Option<String>,
    pub metadata: Option<String>,
    pub created_at: i64,
}

/// Counts by status, plus totals.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
