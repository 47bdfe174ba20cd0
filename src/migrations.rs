//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`
//! and tracked in the `schema_version` table; each runs exactly once,
//! inside a transaction. A hot backup of file-backed databases is taken
//! before any pending migration is applied.

use rusqlite::Connection;

use crate::error::{BrainError, Result};

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("migrations/001_baseline.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("migrations/002_job_provenance.sql"),
    },
];

fn ensure_schema_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(())
}

/// Highest applied migration version, or 0 for a fresh database.
fn current_version(conn: &Connection) -> Result<i32> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Hot copy to `<db>.pre-migration.bak` via the SQLite online backup API.
/// In-memory and temp databases are skipped.
fn backup_before_migration(conn: &Connection) -> Result<()> {
    let db_path: String = conn.query_row("PRAGMA database_list", [], |row| row.get(2))?;
    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = Connection::open(&backup_path)?;
    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)?;
    backup.step(-1)?;

    log::info!("Migrations: pre-migration backup at {}", backup_path);
    Ok(())
}

/// Apply all pending migrations. Returns how many ran.
///
/// Forward-compat guard: a database stamped with a higher version than
/// this build knows about refuses to open rather than risk silent
/// corruption by older code.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    ensure_schema_version_table(conn)?;

    let version = current_version(conn)?;
    let highest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if version > highest {
        return Err(BrainError::Validation(format!(
            "database schema version {} is newer than this build supports ({})",
            version, highest
        )));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > version).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    backup_before_migration(conn)?;

    let mut applied = 0usize;
    for migration in pending {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = conn.execute_batch(migration.sql).and_then(|_| {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )
            .map(|_| ())
        });
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                log::info!("Migrations: applied v{:03}", migration.version);
                applied += 1;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(BrainError::Storage(e));
            }
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_applies_all_migrations() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len());

        // All three tables exist
        for table in ["entities", "embeddings", "jobs"] {
            let exists: bool = conn
                .prepare(&format!("SELECT 1 FROM {} LIMIT 1", table))
                .map(|mut stmt| stmt.exists([]).unwrap_or(false))
                .is_ok();
            assert!(exists, "missing table {}", table);
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let second = run_migrations(&conn).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();
        assert!(run_migrations(&conn).is_err());
    }
}
