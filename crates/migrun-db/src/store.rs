use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use migrun_common::{Error, Result};
use migrun_config::DatabaseConfig;
use rusqlite::{Connection, ErrorCode};
use tracing::info;

use crate::schema::{self, SchemaSnapshot};

/// Handle to the target SQLite database that migrations are applied to.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        info!("opening migration target at {}", db_path.display());
        let conn = Connection::open(db_path).map_err(|e| {
            Error::StorageUnavailable(format!(
                "failed to open database {}: {e}",
                db_path.display()
            ))
        })?;

        conn.busy_timeout(busy_timeout)
            .map_err(|e| map_sqlite("failed to set busy timeout", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| map_sqlite("failed to set pragmas", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open(
            &config.path,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            Error::StorageUnavailable(format!("failed to open in-memory database: {e}"))
        })?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| map_sqlite("failed to set pragmas", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StorageUnavailable("migration store lock poisoned".into()))
    }

    /// Run a closure against the underlying connection.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.connection()?;
        f(&conn).map_err(|e| map_sqlite("query failed", e))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_connection(|conn| conn.execute_batch(sql))
    }

    /// Structural snapshot of every user table.
    pub fn schema_snapshot(&self) -> Result<SchemaSnapshot> {
        let conn = self.connection()?;
        schema::snapshot(&conn, &[])
    }
}

/// Classify a SQLite error into the migration error taxonomy.
pub(crate) fn map_sqlite(context: &str, e: rusqlite::Error) -> Error {
    let code = match &e {
        rusqlite::Error::SqliteFailure(err, _) => Some(err.code),
        _ => None,
    };
    match code {
        Some(ErrorCode::ConstraintViolation) => {
            Error::DataIntegrityViolation(format!("{context}: {e}"))
        }
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::NotADatabase,
        ) => Error::StorageUnavailable(format!("{context}: {e}")),
        Some(ErrorCode::OperationInterrupted) => {
            Error::Timeout(format!("{context}: statement interrupted after deadline"))
        }
        _ => Error::Database(format!("{context}: {e}")),
    }
}

/// Parse a stored timestamp: RFC 3339, or the `YYYY-MM-DD HH:MM:SS` text
/// SQLite's `datetime('now')` produces.
pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .ok()
}
