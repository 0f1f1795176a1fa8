use chrono::{DateTime, Utc};
use migrun_common::{Error, MigrationId, Result, quote_ident};
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::{debug, warn};

use crate::schema;
use crate::store::{map_sqlite, parse_datetime};

/// One applied migration as recorded in the history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub migration_id: MigrationId,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub applied_by: String,
    pub checksum: Option<String>,
    pub execution_ms: u64,
}

/// Durable record of applied migrations, stored in the target database so
/// it commits atomically with the schema changes it describes.
#[derive(Debug, Clone)]
pub struct MigrationHistory {
    table: String,
}

impl MigrationHistory {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ensure_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                migration_id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                applied_by TEXT NOT NULL,
                checksum TEXT,
                execution_ms INTEGER NOT NULL DEFAULT 0
            )",
            quote_ident(&self.table)
        ))
        .map_err(|e| map_sqlite("failed to create migration history table", e))
    }

    /// Applied migrations in ascending id order. Empty when the history
    /// table has never been created.
    pub fn list_applied(&self, conn: &Connection) -> Result<Vec<HistoryEntry>> {
        if !schema::table_exists(conn, &self.table)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT migration_id, name, applied_at, applied_by, checksum, execution_ms FROM {}",
                quote_ident(&self.table)
            ))
            .map_err(|e| map_sqlite("failed to prepare history query", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(|e| map_sqlite("failed to read migration history", e))?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, name, applied_at, applied_by, checksum, execution_ms) =
                row.map_err(|e| map_sqlite("failed to read history row", e))?;
            let migration_id = id.parse::<MigrationId>().map_err(|e| {
                Error::HistoryMismatch(format!("history row {id:?} has an invalid id: {e}"))
            })?;
            entries.push(HistoryEntry {
                migration_id,
                name,
                applied_at: parse_datetime(&applied_at).unwrap_or_else(|| {
                    warn!("history row {id} has unreadable applied_at {applied_at:?}");
                    DateTime::<Utc>::MIN_UTC
                }),
                applied_by,
                checksum,
                execution_ms: execution_ms.max(0) as u64,
            });
        }

        entries.sort_by(|a, b| a.migration_id.cmp(&b.migration_id));
        Ok(entries)
    }

    pub fn is_applied(&self, conn: &Connection, id: &MigrationId) -> Result<bool> {
        if !schema::table_exists(conn, &self.table)? {
            return Ok(false);
        }
        let count: i64 = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE migration_id = ?1",
                    quote_ident(&self.table)
                ),
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| map_sqlite("failed to look up migration history", e))?;
        Ok(count > 0)
    }

    pub fn record_applied(&self, conn: &Connection, entry: &HistoryEntry) -> Result<()> {
        if self.is_applied(conn, &entry.migration_id)? {
            return Err(Error::DuplicateMigration(entry.migration_id.to_string()));
        }

        conn.execute(
            &format!(
                "INSERT INTO {} (migration_id, name, applied_at, applied_by, checksum, execution_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                quote_ident(&self.table)
            ),
            params![
                entry.migration_id.to_string(),
                entry.name,
                entry.applied_at.to_rfc3339(),
                entry.applied_by,
                entry.checksum,
                entry.execution_ms as i64,
            ],
        )
        .map_err(|e| map_sqlite("failed to record migration", e))?;
        debug!("recorded migration {} as applied", entry.migration_id);
        Ok(())
    }

    pub fn remove_applied(&self, conn: &Connection, id: &MigrationId) -> Result<()> {
        let removed = if schema::table_exists(conn, &self.table)? {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE migration_id = ?1",
                    quote_ident(&self.table)
                ),
                params![id.to_string()],
            )
            .map_err(|e| map_sqlite("failed to remove migration from history", e))?
        } else {
            0
        };

        if removed == 0 {
            return Err(Error::NotFound(format!("migration {id} in history")));
        }
        debug!("removed migration {id} from history");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str) -> HistoryEntry {
        HistoryEntry {
            migration_id: id.parse().unwrap(),
            name: name.to_string(),
            applied_at: Utc::now(),
            applied_by: "tester".to_string(),
            checksum: Some("abc".to_string()),
            execution_ms: 12,
        }
    }

    #[test]
    fn missing_table_reads_as_empty() {
        let conn = Connection::open_in_memory().unwrap();
        let history = MigrationHistory::new("_migration_history");
        assert!(history.list_applied(&conn).unwrap().is_empty());
        assert!(!history.is_applied(&conn, &"20240101000000".parse().unwrap()).unwrap());
    }

    #[test]
    fn records_and_lists_in_id_order() {
        let conn = Connection::open_in_memory().unwrap();
        let history = MigrationHistory::new("_migration_history");
        history.ensure_table(&conn).unwrap();
        history.ensure_table(&conn).unwrap();

        history.record_applied(&conn, &entry("20240102000000", "second")).unwrap();
        history.record_applied(&conn, &entry("20240101000000-2", "first_b")).unwrap();
        history.record_applied(&conn, &entry("20240101000000", "first")).unwrap();

        let names: Vec<String> = history
            .list_applied(&conn)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["first", "first_b", "second"]);
    }

    #[test]
    fn duplicate_record_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let history = MigrationHistory::new("_migration_history");
        history.ensure_table(&conn).unwrap();
        history.record_applied(&conn, &entry("20240101000000", "first")).unwrap();

        let err = history
            .record_applied(&conn, &entry("20240101000000", "first"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMigration(ref id) if id == "20240101000000"));
    }

    #[test]
    fn remove_missing_is_not_found() {
        let conn = Connection::open_in_memory().unwrap();
        let history = MigrationHistory::new("_migration_history");
        let id: MigrationId = "20240101000000".parse().unwrap();
        assert!(matches!(
            history.remove_applied(&conn, &id).unwrap_err(),
            Error::NotFound(_)
        ));

        history.ensure_table(&conn).unwrap();
        history.record_applied(&conn, &entry("20240101000000", "first")).unwrap();
        history.remove_applied(&conn, &id).unwrap();
        assert!(history.list_applied(&conn).unwrap().is_empty());
    }

    #[test]
    fn corrupt_id_is_a_history_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        let history = MigrationHistory::new("_migration_history");
        history.ensure_table(&conn).unwrap();
        conn.execute(
            "INSERT INTO _migration_history (migration_id, name, applied_at, applied_by) VALUES ('v1', 'x', 'now', 'me')",
            [],
        )
        .unwrap();
        assert!(matches!(
            history.list_applied(&conn).unwrap_err(),
            Error::HistoryMismatch(_)
        ));
    }
}
