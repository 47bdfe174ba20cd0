//! Read-time expansion of inline entity references.
//!
//! `![alt](entity://image/{id})` becomes an inline data URI built from
//! the referenced `image` entity. Lookups go through `get_entity_raw` so
//! resolution never re-enters its own pipeline, and the `image` type is
//! blocklisted from resolution entirely.

use std::collections::HashMap;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;

use crate::service::EntityService;

/// Types whose content is never resolved (recursion guard).
pub const RESOLUTION_BLOCKLIST: &[&str] = &["image"];

const IMAGE_TYPE: &str = "image";
const DEFAULT_MIME: &str = "image/png";

#[derive(Debug, Clone)]
pub struct ResolvedContent {
    pub content: String,
    /// References successfully expanded.
    pub resolved: usize,
    /// References left in place (missing entity, bad payload).
    pub failed: usize,
}

pub fn is_resolution_blocked(entity_type: &str) -> bool {
    RESOLUTION_BLOCKLIST.contains(&entity_type)
}

fn image_ref_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"!\[([^\]]*)\]\(entity://image/([^)\s]+)\)").unwrap()
    })
}

/// Expand every image reference in `content`. Lookups are deduplicated
/// per call; every occurrence counts toward resolved/failed.
pub fn resolve_images(service: &EntityService, content: &str) -> ResolvedContent {
    let pattern = image_ref_pattern();
    if !pattern.is_match(content) {
        return ResolvedContent {
            content: content.to_string(),
            resolved: 0,
            failed: 0,
        };
    }

    // Batch: fetch each distinct id once.
    let mut uris: HashMap<String, Option<String>> = HashMap::new();
    for captures in pattern.captures_iter(content) {
        let id = captures[2].to_string();
        if uris.contains_key(&id) {
            continue;
        }
        let uri = lookup_data_uri(service, &id);
        uris.insert(id, uri);
    }

    let mut resolved = 0usize;
    let mut failed = 0usize;
    let content = pattern.replace_all(content, |captures: &regex::Captures<'_>| {
        let alt = &captures[1];
        let id = &captures[2];
        match uris.get(id).and_then(Clone::clone) {
            Some(uri) => {
                resolved += 1;
                format!("![{alt}]({uri})")
            }
            None => {
                failed += 1;
                captures[0].to_string()
            }
        }
    });

    ResolvedContent {
        content: content.into_owned(),
        resolved,
        failed,
    }
}

/// Fetch an image entity and shape its content into a data URI. Content
/// already in `data:` form passes through; otherwise it is treated as a
/// base64 payload paired with `metadata.mimeType`.
fn lookup_data_uri(service: &EntityService, id: &str) -> Option<String> {
    let entity = match service.get_entity_raw(IMAGE_TYPE, id) {
        Ok(Some(entity)) => entity,
        Ok(None) => {
            log::debug!("Resolver: image/{id} not found");
            return None;
        }
        Err(e) => {
            log::warn!("Resolver: image/{id} lookup failed: {e}");
            return None;
        }
    };

    let payload = entity.content.trim();
    if payload.starts_with("data:") {
        return Some(payload.to_string());
    }

    if BASE64.decode(payload).is_err() {
        log::debug!("Resolver: image/{id} payload is not valid base64");
        return None;
    }

    let mime = entity
        .metadata
        .get("mimeType")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_MIME);
    Some(format!("data:{mime};base64,{payload}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MarkdownAdapter;
    use crate::db::BrainDb;
    use crate::embeddings::EmbeddingService;
    use crate::events::EventBus;
    use crate::queue::JobQueue;
    use crate::registry::{EntityRegistry, EntityTypeConfig};
    use crate::schema::{FieldKind, Schema};
    use crate::types::{EntityInput, Metadata, WriteOptions};
    use serde_json::json;
    use std::sync::Arc;

    fn service() -> Arc<EntityService> {
        let db = Arc::new(BrainDb::open_in_memory().unwrap());
        let registry = Arc::new(EntityRegistry::new());
        let queue = Arc::new(JobQueue::new(Arc::clone(&db)));

        registry
            .register(
                "note",
                Schema::new(),
                Arc::new(MarkdownAdapter::default()),
                EntityTypeConfig { weight: 1.0, embeddable: false },
            )
            .unwrap();
        registry
            .register(
                "image",
                Schema::new().field("mimeType", FieldKind::String),
                Arc::new(MarkdownAdapter::default()),
                EntityTypeConfig { weight: 1.0, embeddable: false },
            )
            .unwrap();

        Arc::new(EntityService::new(
            db,
            registry,
            queue,
            EventBus::default(),
            Arc::new(EmbeddingService::hash_only(16)),
        ))
    }

    fn seed_image(service: &EntityService, id: &str, content: &str, mime: Option<&str>) {
        let mut metadata = Metadata::new();
        if let Some(mime) = mime {
            metadata.insert("mimeType".into(), json!(mime));
        }
        service
            .create_entity(
                EntityInput {
                    id: Some(id.into()),
                    entity_type: "image".into(),
                    content: content.into(),
                    metadata,
                },
                WriteOptions::default(),
            )
            .unwrap();
    }

    #[test]
    fn test_resolves_base64_payload_with_mime() {
        let service = service();
        seed_image(&service, "logo", "aGVsbG8=", Some("image/jpeg"));

        let out = resolve_images(&service, "Intro ![logo](entity://image/logo) outro");
        assert_eq!(out.resolved, 1);
        assert_eq!(out.failed, 0);
        assert!(out.content.contains("![logo](data:image/jpeg;base64,aGVsbG8=)"));
    }

    #[test]
    fn test_data_uri_passthrough_and_default_mime() {
        let service = service();
        seed_image(&service, "a", "data:image/gif;base64,R0lGOD==", None);
        seed_image(&service, "b", "aGVsbG8=", None);

        let out = resolve_images(
            &service,
            "![a](entity://image/a) and ![b](entity://image/b)",
        );
        assert_eq!(out.resolved, 2);
        assert!(out.content.contains("data:image/gif;base64,R0lGOD=="));
        assert!(out.content.contains("data:image/png;base64,aGVsbG8="));
    }

    #[test]
    fn test_unresolved_reference_left_in_place() {
        let service = service();
        let source = "![missing](entity://image/ghost)";
        let out = resolve_images(&service, source);
        assert_eq!(out.resolved, 0);
        assert_eq!(out.failed, 1);
        assert_eq!(out.content, source);
    }

    #[test]
    fn test_invalid_base64_counts_as_failure() {
        let service = service();
        seed_image(&service, "junk", "not base64 at all!!", None);
        let out = resolve_images(&service, "![x](entity://image/junk)");
        assert_eq!(out.failed, 1);
        assert!(out.content.contains("entity://image/junk"));
    }

    #[test]
    fn test_duplicate_references_fetch_once_but_count_each() {
        let service = service();
        seed_image(&service, "logo", "aGVsbG8=", None);
        let out = resolve_images(
            &service,
            "![one](entity://image/logo) ![two](entity://image/logo)",
        );
        assert_eq!(out.resolved, 2);
        assert!(!out.content.contains("entity://"));
    }

    #[test]
    fn test_content_without_references_is_untouched() {
        let service = service();
        let out = resolve_images(&service, "plain ![alt](https://example.com/x.png)");
        assert_eq!(out.resolved, 0);
        assert_eq!(out.failed, 0);
        assert_eq!(out.content, "plain ![alt](https://example.com/x.png)");
    }

    #[test]
    fn test_blocklist_contains_image() {
        assert!(is_resolution_blocked("image"));
        assert!(!is_resolution_blocked("note"));
    }

    #[test]
    fn test_get_entity_applies_resolution() {
        let service = service();
        seed_image(&service, "logo", "aGVsbG8=", None);
        service
            .create_entity(
                EntityInput {
                    id: Some("n1".into()),
                    entity_type: "note".into(),
                    content: "See ![logo](entity://image/logo)".into(),
                    metadata: Metadata::new(),
                },
                WriteOptions::default(),
            )
            .unwrap();

        let hydrated = service.get_entity("note", "n1").unwrap().unwrap();
        assert!(hydrated.content.contains("data:image/png;base64,"));

        // Raw read keeps the reference; the stored row is untouched.
        let raw = service.get_entity_raw("note", "n1").unwrap().unwrap();
        assert!(raw.content.contains("entity://image/logo"));

        // Image entities themselves are never resolved.
        let image = service.get_entity("image", "logo").unwrap().unwrap();
        assert_eq!(image.content, "aGVsbG8=");
    }
}
