//! Embedding table operations.
//!
//! Writes here never touch the `entities` row; the `content_hash` column
//! records which content version a vector was computed from, and search
//! treats the entity's hash as ground truth.

use rusqlite::{params, OptionalExtension};

use super::{BrainDb, EmbeddingRow};
use crate::error::Result;

impl BrainDb {
    /// Insert or replace the vector for an entity.
    pub fn upsert_embedding(&self, row: &EmbeddingRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO embeddings (entity_id, entity_type, embedding, content_hash)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_id, entity_type) DO UPDATE SET
                    embedding = excluded.embedding,
                    content_hash = excluded.content_hash",
                params![row.entity_id, row.entity_type, row.embedding, row.content_hash],
            )?;
            Ok(())
        })
    }

    pub fn get_embedding(&self, entity_type: &str, entity_id: &str) -> Result<Option<EmbeddingRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT entity_id, entity_type, embedding, content_hash
                     FROM embeddings WHERE entity_id = ?1 AND entity_type = ?2",
                    params![entity_id, entity_type],
                    |row| {
                        Ok(EmbeddingRow {
                            entity_id: row.get(0)?,
                            entity_type: row.get(1)?,
                            embedding: row.get(2)?,
                            content_hash: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn count_embeddings(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EntityRow;
    use crate::embeddings::vector_to_blob;

    fn seed_entity(db: &BrainDb, id: &str) {
        db.insert_entity(&EntityRow {
            id: id.into(),
            entity_type: "note".into(),
            content: "x".into(),
            content_hash: "h1".into(),
            metadata: "{}".into(),
            created: 1,
            updated: 1,
        })
        .unwrap();
    }

    fn embedding(id: &str, hash: &str) -> EmbeddingRow {
        EmbeddingRow {
            entity_id: id.into(),
            entity_type: "note".into(),
            embedding: vector_to_blob(&[1.0, 0.0]),
            content_hash: hash.into(),
        }
    }

    #[test]
    fn test_upsert_replaces_vector() {
        let db = BrainDb::open_in_memory().unwrap();
        seed_entity(&db, "n1");

        db.upsert_embedding(&embedding("n1", "h1")).unwrap();
        db.upsert_embedding(&embedding("n1", "h2")).unwrap();

        let row = db.get_embedding("note", "n1").unwrap().unwrap();
        assert_eq!(row.content_hash, "h2");
        assert_eq!(db.count_embeddings().unwrap(), 1);
    }

    #[test]
    fn test_delete_entity_cascades_to_embedding() {
        let db = BrainDb::open_in_memory().unwrap();
        seed_entity(&db, "n1");
        db.upsert_embedding(&embedding("n1", "h1")).unwrap();

        assert!(db.delete_entity_row("note", "n1").unwrap());
        assert!(db.get_embedding("note", "n1").unwrap().is_none());
    }

    #[test]
    fn test_embedding_requires_entity() {
        let db = BrainDb::open_in_memory().unwrap();
        // FK enforcement: no entity row, no embedding row.
        assert!(db.upsert_embedding(&embedding("ghost", "h1")).is_err());
    }
}
