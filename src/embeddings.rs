//! Embedding generation.
//!
//! Three-state model: a fastembed-backed local ONNX model
//! (nomic-embed-text-v1.5, quantized), a deterministic hash fallback for
//! dev/test/offline, and an unavailable state where every call errors.
//! The rest of the crate treats this as a pure `text → Vec<f32>` surface.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::{BrainError, Result};

pub const DEFAULT_DIMENSION: usize = 768;

/// Asymmetric retrieval prefixes for nomic-embed-text-v1.5: documents
/// and queries embed into different regions of the same space.
pub const DOCUMENT_PREFIX: &str = "search_document: ";
pub const QUERY_PREFIX: &str = "search_query: ";

enum ModelState {
    /// Real inference via fastembed.
    Onnx {
        model: fastembed::TextEmbedding,
        dimension: usize,
    },
    /// Deterministic unit-norm bag-of-tokens vectors.
    HashFallback { dimension: usize },
    /// Every embed call fails with `Index`.
    Unavailable { reason: String },
}

impl std::fmt::Debug for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx { dimension, .. } => write!(f, "Onnx(dim={})", dimension),
            Self::HashFallback { dimension } => write!(f, "HashFallback(dim={})", dimension),
            Self::Unavailable { reason } => write!(f, "Unavailable({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingStatus {
    Ready { dimension: usize },
    Unavailable { reason: String },
}

/// Shared embedding service. Cheap to clone via `Arc` at the call sites;
/// the inner mutex serializes model access (fastembed sessions are not
/// re-entrant).
#[derive(Debug)]
pub struct EmbeddingService {
    state: Mutex<ModelState>,
}

impl EmbeddingService {
    /// Start unavailable; call `initialize` to load the real model.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ModelState::Unavailable {
                reason: "embedding model not initialized".to_string(),
            }),
        }
    }

    /// Deterministic hash-only service. Used by tests and offline setups.
    pub fn hash_only(dimension: usize) -> Self {
        Self {
            state: Mutex::new(ModelState::HashFallback { dimension }),
        }
    }

    /// Load the quantized nomic model, downloading into `cache_dir` on
    /// first run. Falls back to hash embeddings when the model cannot be
    /// loaded (no network, missing ONNX runtime); degraded quality is a
    /// valid state, not a fatal error.
    pub fn initialize(&self, cache_dir: PathBuf) -> Result<()> {
        use fastembed::{EmbeddingModel as FE, InitOptions, TextEmbedding};

        let options = InitOptions::new(FE::NomicEmbedTextV15Q)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(false);

        let mut state = self.state.lock();
        match TextEmbedding::try_new(options) {
            Ok(model) => {
                log::info!("EmbeddingService: loaded nomic-embed-text-v1.5 (quantized)");
                *state = ModelState::Onnx {
                    model,
                    dimension: DEFAULT_DIMENSION,
                };
            }
            Err(e) => {
                log::warn!("EmbeddingService: model unavailable, using hash fallback: {e}");
                *state = ModelState::HashFallback {
                    dimension: DEFAULT_DIMENSION,
                };
            }
        }
        Ok(())
    }

    pub fn set_unavailable(&self, reason: String) {
        *self.state.lock() = ModelState::Unavailable { reason };
    }

    pub fn status(&self) -> EmbeddingStatus {
        match &*self.state.lock() {
            ModelState::Onnx { dimension, .. } | ModelState::HashFallback { dimension } => {
                EmbeddingStatus::Ready { dimension: *dimension }
            }
            ModelState::Unavailable { reason } => EmbeddingStatus::Unavailable {
                reason: reason.clone(),
            },
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.status(), EmbeddingStatus::Ready { .. })
    }

    pub fn dimension(&self) -> Option<usize> {
        match self.status() {
            EmbeddingStatus::Ready { dimension } => Some(dimension),
            EmbeddingStatus::Unavailable { .. } => None,
        }
    }

    /// Embed entity content for storage.
    pub fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&format!("{}{}", DOCUMENT_PREFIX, text))
    }

    /// Embed a search query.
    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&format!("{}{}", QUERY_PREFIX, text))
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut state = self.state.lock();
        match &mut *state {
            ModelState::Onnx { model, dimension } => {
                let results = model
                    .embed(vec![text], None)
                    .map_err(|e| BrainError::Index(format!("fastembed embed failed: {e}")))?;
                let mut vector = results
                    .into_iter()
                    .next()
                    .ok_or_else(|| BrainError::Index("fastembed returned no vectors".into()))?;
                vector.truncate(*dimension);
                Ok(vector)
            }
            ModelState::HashFallback { dimension } => Ok(hash_embed(text, *dimension)),
            ModelState::Unavailable { reason } => Err(BrainError::Index(reason.clone())),
        }
    }
}

impl Default for EmbeddingService {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic unit-norm bag-of-tokens embedding. Quality is far below
/// the real model but ordering is stable, which is what tests and offline
/// operation need.
fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0_f32; dimension];
    let mut tokens = 0usize;

    for token in text.split_whitespace() {
        let token = token.to_lowercase();
        if token.is_empty() {
            continue;
        }
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let digest = hasher.finish();
        let idx = (digest as usize) % dimension;
        vector[idx] += if digest & 1 == 0 { 1.0 } else { -1.0 };
        tokens += 1;
    }

    if tokens == 0 {
        return vector;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

// ---------------------------------------------------------------------------
// Vector codec + distance
// ---------------------------------------------------------------------------

/// Encode a vector as little-endian f32 bytes for the BLOB column.
pub fn vector_to_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode a BLOB column back into a vector.
pub fn blob_to_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(BrainError::Index(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    let mut values = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(values)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (va, vb) in a.iter().zip(b.iter()) {
        dot += va * vb;
        norm_a += va * va;
        norm_b += vb * vb;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine distance in `[0, 2]`; mismatched or empty vectors read as
/// maximally distant so they fall out of search.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 2.0;
    }
    1.0 - cosine_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let original = vec![0.1_f32, -0.5, 1.25, 0.0];
        let restored = blob_to_vector(&vector_to_blob(&original)).unwrap();
        assert_eq!(original.len(), restored.len());
        for (a, b) in original.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blob_rejects_ragged_length() {
        assert!(blob_to_vector(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_hash_embed_deterministic_and_normalized() {
        let a = hash_embed("hello world", DEFAULT_DIMENSION);
        let b = hash_embed("hello world", DEFAULT_DIMENSION);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_ranking() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.9, 0.1, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_distance(&a, &b) < cosine_distance(&a, &c));
    }

    #[test]
    fn test_mismatched_vectors_are_maximally_distant() {
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), 2.0);
    }

    #[test]
    fn test_hash_only_service_embeds() {
        let service = EmbeddingService::hash_only(64);
        assert!(service.is_ready());
        let vector = service.embed_document("some text").unwrap();
        assert_eq!(vector.len(), 64);
    }

    #[test]
    fn test_unavailable_service_errors() {
        let service = EmbeddingService::new();
        assert!(!service.is_ready());
        assert!(matches!(
            service.embed_query("q"),
            Err(BrainError::Index(_))
        ));
    }

    #[test]
    fn test_document_and_query_prefixes_differ() {
        let service = EmbeddingService::hash_only(64);
        let doc = service.embed_document("same text").unwrap();
        let query = service.embed_query("same text").unwrap();
        assert_ne!(doc, query);
    }
}
