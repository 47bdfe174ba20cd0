//! Weighted vector search.
//!
//! One SQL statement joins `entities` with `embeddings` (hash equality
//! included; the entity's hash is ground truth), scores rows with the
//! registered `cosine_distance` function, weights per type, cuts at
//! distance 1.0, and paginates. Rows without a fresh embedding cannot
//! appear: that is how new writes stay out of search until their
//! embedding job completes.

use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::params_from_iter;

use crate::db::{BrainDb, EntityRow};
use crate::embeddings::{vector_to_blob, EmbeddingService};
use crate::error::Result;
use crate::registry::EntityRegistry;
use crate::types::{SearchOptions, SearchResult};

pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Characters kept on each side of the query match in an excerpt.
const EXCERPT_RADIUS: usize = 100;

pub struct SearchEngine {
    db: Arc<BrainDb>,
    registry: Arc<EntityRegistry>,
    embedder: Arc<EmbeddingService>,
}

impl SearchEngine {
    pub fn new(
        db: Arc<BrainDb>,
        registry: Arc<EntityRegistry>,
        embedder: Arc<EmbeddingService>,
    ) -> Self {
        Self { db, registry, embedder }
    }

    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed_query(query)?;
        let query_blob = vector_to_blob(&vector);

        // Registry weights, overridden per call.
        let mut weights = self.registry.weight_map();
        for (entity_type, weight) in &opts.weights {
            weights.insert(entity_type.clone(), *weight);
        }
        let mut weights: Vec<(String, f64)> = weights
            .into_iter()
            .filter(|(_, w)| (*w - 1.0).abs() > f64::EPSILON)
            .collect();
        weights.sort_by(|a, b| a.0.cmp(&b.0));

        // SQL text and bindings are built strictly in step so positional
        // parameters line up.
        let mut params: Vec<SqlValue> = Vec::new();
        let mut sql = String::from(
            "SELECT id, entity_type, content, content_hash, metadata, created, updated, \
             (1.0 - distance / 2.0) * ",
        );

        if weights.is_empty() {
            sql.push_str("1.0");
        } else {
            sql.push_str("CASE entity_type");
            for (entity_type, weight) in &weights {
                sql.push_str(" WHEN ? THEN ?");
                params.push(SqlValue::Text(entity_type.clone()));
                params.push(SqlValue::Real(*weight));
            }
            sql.push_str(" ELSE 1.0 END");
        }

        sql.push_str(
            " AS weighted_score FROM ( \
               SELECT e.id AS id, e.entity_type AS entity_type, e.content AS content, \
                      e.content_hash AS content_hash, e.metadata AS metadata, \
                      e.created AS created, e.updated AS updated, \
                      cosine_distance(m.embedding, ?) AS distance \
               FROM entities e \
               INNER JOIN embeddings m \
                       ON m.entity_id = e.id \
                      AND m.entity_type = e.entity_type \
                      AND m.content_hash = e.content_hash",
        );
        params.push(SqlValue::Blob(query_blob));

        if !opts.types.is_empty() {
            sql.push_str(" WHERE e.entity_type IN (");
            push_placeholders(&mut sql, &mut params, &opts.types);
            sql.push(')');
        }
        if !opts.exclude_types.is_empty() {
            sql.push_str(if opts.types.is_empty() { " WHERE" } else { " AND" });
            sql.push_str(" e.entity_type NOT IN (");
            push_placeholders(&mut sql, &mut params, &opts.exclude_types);
            sql.push(')');
        }

        sql.push_str(
            ") WHERE distance < 1.0 \
             ORDER BY weighted_score DESC, id ASC \
             LIMIT ? OFFSET ?",
        );
        params.push(SqlValue::Integer(
            opts.limit.unwrap_or(DEFAULT_SEARCH_LIMIT) as i64,
        ));
        params.push(SqlValue::Integer(opts.offset.unwrap_or(0) as i64));

        let hits = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                Ok((
                    EntityRow {
                        id: row.get(0)?,
                        entity_type: row.get(1)?,
                        content: row.get(2)?,
                        content_hash: row.get(3)?,
                        metadata: row.get(4)?,
                        created: row.get(5)?,
                        updated: row.get(6)?,
                    },
                    row.get::<_, f64>(7)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut results = Vec::with_capacity(hits.len());
        for (row, score) in hits {
            let entity = row.into_entity()?;
            let excerpt = build_excerpt(&entity.content, query);
            results.push(SearchResult { entity, score, excerpt });
        }

        log::debug!("Search: `{query}` returned {} hit(s)", results.len());
        Ok(results)
    }
}

fn push_placeholders(sql: &mut String, params: &mut Vec<SqlValue>, values: &[String]) {
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        sql.push('?');
        params.push(SqlValue::Text(value.clone()));
    }
}

/// ~200-char window centered on the first case-insensitive occurrence of
/// the query, with ellipses where truncated; falls back to the content
/// prefix when the query text does not appear verbatim.
fn build_excerpt(content: &str, query: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return String::new();
    }

    let (window_start, window_end) = match find_case_insensitive(&chars, query) {
        Some(match_start) => {
            let center = match_start + query.chars().count() / 2;
            let start = center.saturating_sub(EXCERPT_RADIUS);
            let end = (center + EXCERPT_RADIUS).min(chars.len());
            // Give unused left budget to the right edge.
            (start, end)
        }
        None => (0, (EXCERPT_RADIUS * 2).min(chars.len())),
    };

    let body: String = chars[window_start..window_end].iter().collect();
    let mut excerpt = String::new();
    if window_start > 0 {
        excerpt.push_str("...");
    }
    excerpt.push_str(body.trim());
    if window_end < chars.len() {
        excerpt.push_str("...");
    }
    excerpt
}

/// Position (in chars) of the first case-insensitive occurrence.
/// Per-char lowercasing keeps indices aligned with the source.
fn find_case_insensitive(content: &[char], query: &str) -> Option<usize> {
    let needle: Vec<char> = query
        .chars()
        .map(|c| c.to_lowercase().next().unwrap_or(c))
        .collect();
    if needle.is_empty() || needle.len() > content.len() {
        return None;
    }
    let haystack: Vec<char> = content
        .iter()
        .map(|c| c.to_lowercase().next().unwrap_or(*c))
        .collect();
    haystack
        .windows(needle.len())
        .position(|window| window == needle.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MarkdownAdapter;
    use crate::db::{EmbeddingRow, EntityRow};
    use crate::registry::EntityTypeConfig;
    use crate::schema::Schema;
    use crate::util;

    struct Fixture {
        engine: SearchEngine,
        db: Arc<BrainDb>,
        embedder: Arc<EmbeddingService>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(BrainDb::open_in_memory().unwrap());
        let registry = Arc::new(EntityRegistry::new());
        let embedder = Arc::new(EmbeddingService::hash_only(64));

        for (name, weight) in [("note", 1.0), ("article", 2.0)] {
            registry
                .register(
                    name,
                    Schema::new(),
                    Arc::new(MarkdownAdapter::default()),
                    EntityTypeConfig { weight, embeddable: true },
                )
                .unwrap();
        }

        let engine = SearchEngine::new(
            Arc::clone(&db),
            registry,
            Arc::clone(&embedder),
        );
        Fixture { engine, db, embedder }
    }

    /// Insert an entity and, unless `stale`, a fresh embedding row.
    fn seed(fx: &Fixture, entity_type: &str, id: &str, content: &str, embedded: bool, stale: bool) {
        let hash = util::content_hash(content);
        fx.db
            .insert_entity(&EntityRow {
                id: id.into(),
                entity_type: entity_type.into(),
                content: content.into(),
                content_hash: hash.clone(),
                metadata: "{}".into(),
                created: 1,
                updated: 1,
            })
            .unwrap();
        if embedded {
            let vector = fx.embedder.embed_document(content).unwrap();
            fx.db
                .upsert_embedding(&EmbeddingRow {
                    entity_id: id.into(),
                    entity_type: entity_type.into(),
                    embedding: vector_to_blob(&vector),
                    content_hash: if stale { "stale-hash".into() } else { hash },
                })
                .unwrap();
        }
    }

    #[test]
    fn test_entities_without_embeddings_are_invisible() {
        let fx = fixture();
        seed(&fx, "note", "pending", "fresh knowledge pending embedding", false, false);
        let hits = fx.engine.search("knowledge", &SearchOptions::default()).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_stale_embeddings_are_invisible() {
        let fx = fixture();
        seed(&fx, "note", "stale", "superseded content version", true, true);
        let hits = fx.engine.search("superseded content", &SearchOptions::default()).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_match_scores_and_excerpt() {
        let fx = fixture();
        seed(&fx, "note", "n1", "Rust ownership and borrowing explained", true, false);
        let hits = fx
            .engine
            .search("Rust ownership and borrowing explained", &SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.id, "n1");
        assert!(hits[0].score > 0.0);
        assert!(hits[0].excerpt.contains("ownership"));
    }

    #[test]
    fn test_type_filters() {
        let fx = fixture();
        seed(&fx, "note", "n1", "shared topic words here", true, false);
        seed(&fx, "article", "a1", "shared topic words here", true, false);

        let only_notes = SearchOptions {
            types: vec!["note".into()],
            ..Default::default()
        };
        let hits = fx.engine.search("shared topic words", &only_notes).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.entity_type, "note");

        let no_notes = SearchOptions {
            exclude_types: vec!["note".into()],
            ..Default::default()
        };
        let hits = fx.engine.search("shared topic words", &no_notes).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.entity_type, "article");
    }

    #[test]
    fn test_weight_multiplier_orders_results() {
        let fx = fixture();
        // Identical content: same distance, so the heavier type wins.
        seed(&fx, "note", "n1", "identical corpus text", true, false);
        seed(&fx, "article", "a1", "identical corpus text", true, false);

        let hits = fx.engine.search("identical corpus text", &SearchOptions::default()).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entity.entity_type, "article");
        assert!(hits[0].score > hits[1].score);

        // Per-call override flips the order.
        let opts = SearchOptions {
            weights: vec![("article".into(), 0.1)],
            ..Default::default()
        };
        let hits = fx.engine.search("identical corpus text", &opts).unwrap();
        assert_eq!(hits[0].entity.entity_type, "note");
    }

    #[test]
    fn test_pagination_is_stable() {
        let fx = fixture();
        for i in 0..4 {
            seed(&fx, "note", &format!("n{i}"), "repeated page content", true, false);
        }
        let page = |offset: usize| {
            fx.engine
                .search(
                    "repeated page content",
                    &SearchOptions {
                        limit: Some(2),
                        offset: Some(offset),
                        ..Default::default()
                    },
                )
                .unwrap()
                .into_iter()
                .map(|hit| hit.entity.id)
                .collect::<Vec<_>>()
        };
        // Equal scores: the id tie-break keeps pages disjoint and ordered.
        assert_eq!(page(0), vec!["n0", "n1"]);
        assert_eq!(page(2), vec!["n2", "n3"]);
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let fx = fixture();
        seed(&fx, "note", "n1", "anything", true, false);
        assert!(fx.engine.search("   ", &SearchOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn test_excerpt_centers_match() {
        let padding = "lorem ipsum dolor sit amet ".repeat(20);
        let content = format!("{padding}THE NEEDLE SENTENCE{padding}");
        let excerpt = build_excerpt(&content, "the needle");
        assert!(excerpt.contains("THE NEEDLE"));
        assert!(excerpt.starts_with("..."));
        assert!(excerpt.ends_with("..."));
        assert!(excerpt.chars().count() <= 2 * EXCERPT_RADIUS + 6 + 1);
    }

    #[test]
    fn test_excerpt_prefix_fallback() {
        let content = "short body without the term";
        assert_eq!(build_excerpt(content, "zzz"), content);
    }
}
