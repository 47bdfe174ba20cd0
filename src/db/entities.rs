//! Entity table operations.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde_json::Value;

use super::{map_insert_error, BrainDb, EntityRow};
use crate::error::{BrainError, Result};
use crate::types::{ListOptions, SortKey};

impl BrainDb {
    /// Insert a fresh entity row. A primary-key collision maps to
    /// `Duplicate`.
    pub fn insert_entity(&self, row: &EntityRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO entities (id, entity_type, content, content_hash, metadata, created, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.entity_type,
                    row.content,
                    row.content_hash,
                    row.metadata,
                    row.created,
                    row.updated,
                ],
            )
            .map_err(|e| map_insert_error(e, &row.entity_type, &row.id))?;
            Ok(())
        })
    }

    /// Full replacement of an existing row. Returns false when the row
    /// does not exist.
    pub fn replace_entity(&self, row: &EntityRow) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE entities
                 SET content = ?3, content_hash = ?4, metadata = ?5, updated = ?6
                 WHERE id = ?1 AND entity_type = ?2",
                params![
                    row.id,
                    row.entity_type,
                    row.content,
                    row.content_hash,
                    row.metadata,
                    row.updated,
                ],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_entity_row(&self, entity_type: &str, id: &str) -> Result<Option<EntityRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, entity_type, content, content_hash, metadata, created, updated
                     FROM entities WHERE id = ?1 AND entity_type = ?2",
                    params![id, entity_type],
                    map_entity_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn entity_exists(&self, entity_type: &str, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT 1 FROM entities WHERE id = ?1 AND entity_type = ?2")?;
            Ok(stmt.exists(params![id, entity_type])?)
        })
    }

    /// Delete a row; the embeddings cascade fires inside the same
    /// transaction. Returns whether a row existed.
    pub fn delete_entity_row(&self, entity_type: &str, id: &str) -> Result<bool> {
        self.with_transaction(|conn| {
            let deleted = conn.execute(
                "DELETE FROM entities WHERE id = ?1 AND entity_type = ?2",
                params![id, entity_type],
            )?;
            Ok(deleted > 0)
        })
    }

    pub fn list_entity_rows(
        &self,
        entity_type: &str,
        opts: &ListOptions,
    ) -> Result<Vec<EntityRow>> {
        let (where_sql, mut bindings) = build_filter(entity_type, opts)?;
        let order_sql = build_order(opts)?;

        let sql = format!(
            "SELECT id, entity_type, content, content_hash, metadata, created, updated
             FROM entities WHERE {where_sql} ORDER BY {order_sql} LIMIT ? OFFSET ?"
        );
        bindings.push(SqlValue::Integer(
            opts.limit.map(|l| l as i64).unwrap_or(-1),
        ));
        bindings.push(SqlValue::Integer(opts.offset.unwrap_or(0) as i64));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(bindings.iter()), map_entity_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Exact count under the same filter as `list_entity_rows`.
    pub fn count_entity_rows(&self, entity_type: &str, opts: &ListOptions) -> Result<i64> {
        let (where_sql, bindings) = build_filter(entity_type, opts)?;
        let sql = format!("SELECT COUNT(*) FROM entities WHERE {where_sql}");

        self.with_conn(|conn| {
            let count = conn.query_row(&sql, params_from_iter(bindings.iter()), |row| row.get(0))?;
            Ok(count)
        })
    }

    /// Entity counts grouped by type (diagnostics surface).
    pub fn count_entities_by_type(&self) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type ORDER BY entity_type",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

fn map_entity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
    Ok(EntityRow {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        content: row.get(2)?,
        content_hash: row.get(3)?,
        metadata: row.get(4)?,
        created: row.get(5)?,
        updated: row.get(6)?,
    })
}

/// WHERE clause + bindings shared by list and count.
fn build_filter(entity_type: &str, opts: &ListOptions) -> Result<(String, Vec<SqlValue>)> {
    let mut clauses = vec!["entity_type = ?".to_string()];
    let mut bindings = vec![SqlValue::Text(entity_type.to_string())];

    for (path, value) in &opts.filter {
        clauses.push(format!("{} = ?", metadata_expr(path)?));
        bindings.push(bind_json_scalar(value)?);
    }

    if opts.published_only {
        clauses.push(
            "(json_extract(metadata, '$.status') IS NULL \
             OR json_extract(metadata, '$.status') = 'published')"
                .to_string(),
        );
    }

    Ok((clauses.join(" AND "), bindings))
}

fn build_order(opts: &ListOptions) -> Result<String> {
    let mut keys = Vec::new();
    if opts.sort.is_empty() {
        keys.push("updated DESC".to_string());
    } else {
        for field in &opts.sort {
            let expr = match &field.key {
                SortKey::Created => "created".to_string(),
                SortKey::Updated => "updated".to_string(),
                SortKey::Metadata(path) => metadata_expr(path)?,
            };
            keys.push(format!(
                "{} {}",
                expr,
                if field.descending { "DESC" } else { "ASC" }
            ));
        }
    }
    // Deterministic tail so pagination is stable.
    keys.push("id ASC".to_string());
    Ok(keys.join(", "))
}

/// `json_extract` expression for a dotted metadata path. Paths are
/// restricted to a safe character set because they are interpolated into
/// SQL text.
fn metadata_expr(path: &str) -> Result<String> {
    if path.is_empty()
        || !path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(BrainError::Validation(format!(
            "invalid metadata path `{path}`"
        )));
    }
    Ok(format!("json_extract(metadata, '$.{path}')"))
}

fn bind_json_scalar(value: &Value) -> Result<SqlValue> {
    match value {
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else {
                Ok(SqlValue::Real(n.as_f64().unwrap_or(0.0)))
            }
        }
        other => Err(BrainError::Validation(format!(
            "metadata filters must be scalar, got {other}"
        ))),
    }
}
