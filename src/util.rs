//! Small shared helpers: hashing, clocks, id generation.

use rand::RngExt;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of entity content. The store's staleness oracle:
/// recomputed on every write, never accepted from callers.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh entity/job id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Random lowercase alphanumeric token for dedup overflow suffixes.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.random_range(0..chars.len())] as char
        })
        .collect()
}
