use std::time::Duration;

use chrono::{DateTime, Utc};
use migrun_common::{Error, Result, quote_ident};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::schema;
use crate::store::{map_sqlite, parse_datetime};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Single-row advisory lock that keeps two runners from migrating the same
/// database at once.
///
/// The row lives in the target database so every process that can reach the
/// schema also sees the lock.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
    stale_after: Option<Duration>,
}

impl MigrationLock {
    pub fn new(table: impl Into<String>, stale_after: Option<Duration>) -> Self {
        Self {
            table: table.into(),
            stale_after,
        }
    }

    pub fn ensure_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            )",
            quote_ident(&self.table)
        ))
        .map_err(|e| map_sqlite("failed to create migration lock table", e))
    }

    /// Take the lock for `holder`, or fail with `RunInProgress` naming the
    /// current holder. A lock older than the stale threshold is taken over.
    pub fn acquire(&self, conn: &Connection, holder: &str) -> Result<()> {
        self.ensure_table(conn)?;
        let now = Utc::now().to_rfc3339();

        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (id, holder, acquired_at) VALUES (1, ?1, ?2)",
                    quote_ident(&self.table)
                ),
                params![holder, now],
            )
            .map_err(|e| map_sqlite("failed to acquire migration lock", e))?;
        if inserted == 1 {
            debug!("migration lock acquired by {holder}");
            return Ok(());
        }

        let Some((current, raw_acquired_at)) = self.read(conn)? else {
            // Released between our insert and read; one more try.
            return self.acquire_once(conn, holder, &now);
        };

        if self.is_stale(&current) {
            let taken = conn
                .execute(
                    &format!(
                        "UPDATE {} SET holder = ?1, acquired_at = ?2
                         WHERE id = 1 AND holder = ?3 AND acquired_at = ?4",
                        quote_ident(&self.table)
                    ),
                    params![holder, now, current.holder, raw_acquired_at],
                )
                .map_err(|e| map_sqlite("failed to take over stale migration lock", e))?;
            if taken == 1 {
                warn!(
                    "took over stale migration lock held by {} since {}",
                    current.holder, current.acquired_at
                );
                return Ok(());
            }
        }

        Err(Error::RunInProgress {
            holder: current.holder,
        })
    }

    fn acquire_once(&self, conn: &Connection, holder: &str, now: &str) -> Result<()> {
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (id, holder, acquired_at) VALUES (1, ?1, ?2)",
                    quote_ident(&self.table)
                ),
                params![holder, now],
            )
            .map_err(|e| map_sqlite("failed to acquire migration lock", e))?;
        if inserted == 1 {
            return Ok(());
        }
        let holder = self
            .current(conn)?
            .map(|info| info.holder)
            .unwrap_or_else(|| "unknown".to_string());
        Err(Error::RunInProgress { holder })
    }

    /// Release the lock if `holder` still owns it. Returns whether a row was
    /// removed.
    pub fn release(&self, conn: &Connection, holder: &str) -> Result<bool> {
        if !schema::table_exists(conn, &self.table)? {
            return Ok(false);
        }
        let removed = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE id = 1 AND holder = ?1",
                    quote_ident(&self.table)
                ),
                params![holder],
            )
            .map_err(|e| map_sqlite("failed to release migration lock", e))?;
        if removed == 0 {
            warn!("migration lock was no longer held by {holder}");
        }
        Ok(removed > 0)
    }

    pub fn current(&self, conn: &Connection) -> Result<Option<LockInfo>> {
        Ok(self.read(conn)?.map(|(info, _)| info))
    }

    /// Current lock row together with its stored timestamp text.
    fn read(&self, conn: &Connection) -> Result<Option<(LockInfo, String)>> {
        if !schema::table_exists(conn, &self.table)? {
            return Ok(None);
        }
        let row: Option<(String, String)> = conn
            .query_row(
                &format!(
                    "SELECT holder, acquired_at FROM {} WHERE id = 1",
                    quote_ident(&self.table)
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| map_sqlite("failed to read migration lock", e))?;
        Ok(row.map(|(holder, acquired_at)| {
            // An unreadable timestamp counts as infinitely old, so a stale
            // limit can still reclaim the row.
            let info = LockInfo {
                holder,
                acquired_at: parse_datetime(&acquired_at).unwrap_or_else(|| {
                    warn!("migration lock has unreadable acquired_at {acquired_at:?}");
                    DateTime::<Utc>::MIN_UTC
                }),
            };
            (info, acquired_at)
        }))
    }

    /// Remove the lock regardless of holder. Returns the lock that was removed.
    pub fn force_release(&self, conn: &Connection) -> Result<Option<LockInfo>> {
        let Some(current) = self.current(conn)? else {
            return Ok(None);
        };
        conn.execute(
            &format!("DELETE FROM {} WHERE id = 1", quote_ident(&self.table)),
            [],
        )
        .map_err(|e| map_sqlite("failed to force-release migration lock", e))?;
        info!("force-released migration lock held by {}", current.holder);
        Ok(Some(current))
    }

    fn is_stale(&self, lock: &LockInfo) -> bool {
        let Some(limit) = self.stale_after else {
            return false;
        };
        let age = Utc::now().signed_duration_since(lock.acquired_at);
        age.to_std().map(|age| age > limit).unwrap_or(false)
    }
}
