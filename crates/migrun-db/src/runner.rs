use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use migrun_common::{ChangeOperation, Error, Migration, MigrationId, Result};
use migrun_config::RunnerConfig;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::{ChangeExecutor, Outcome, suspends_foreign_keys};
use crate::history::{HistoryEntry, MigrationHistory};
use crate::lock::{LockInfo, MigrationLock};
use crate::schema::{self, ForeignKeyViolation, SchemaSnapshot};
use crate::store::{SqliteStore, map_sqlite};

/// Shared flag a caller flips to stop a run before its next migration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// How far `down` reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownTarget {
    /// Only the most recently applied migration.
    Last,
    /// Every applied migration with an id greater than this one.
    To(MigrationId),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Pending,
    Applying,
    Applied,
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Pending => "pending",
            MigrationState::Applying => "applying",
            MigrationState::Applied => "applied",
            MigrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub direction: Direction,
    /// Ids completed in this run, in execution order.
    pub migrations: Vec<String>,
    pub skipped_operations: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub id: String,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    /// Recorded checksum differs from the current migration content.
    pub drifted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub migrations: Vec<StatusEntry>,
    /// Ids recorded in history that no known migration carries.
    pub unknown_applied: Vec<String>,
    pub lock: Option<LockInfo>,
}

impl MigrationStatus {
    pub fn applied_count(&self) -> usize {
        self.migrations
            .iter()
            .filter(|m| m.state == MigrationState::Applied)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.migrations
            .iter()
            .filter(|m| m.state == MigrationState::Pending)
            .count()
    }

    pub fn has_drift(&self) -> bool {
        self.migrations.iter().any(|m| m.drifted)
    }
}

struct Prepared {
    migration: Migration,
    checksum: String,
}

/// Applies and reverts an ordered set of migrations against a store.
pub struct Migrator {
    migrations: Vec<Prepared>,
    config: RunnerConfig,
    executor: ChangeExecutor,
    history: MigrationHistory,
    lock: MigrationLock,
}

impl Migrator {
    /// Validate and order the known migrations.
    pub fn load(records: Vec<Migration>, config: RunnerConfig) -> Result<Self> {
        config.validate()?;

        let mut records = records;
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let mut names = HashSet::new();
        let mut migrations: Vec<Prepared> = Vec::with_capacity(records.len());
        for migration in records {
            migration.validate()?;
            if let Some(prev) = migrations.last() {
                if prev.migration.id == migration.id {
                    return Err(Error::InvalidMigration(format!(
                        "migration id {} is used by both {} and {}",
                        migration.id, prev.migration.name, migration.name
                    )));
                }
            }
            if !names.insert(migration.name.clone()) {
                return Err(Error::InvalidMigration(format!(
                    "migration name {} is used more than once",
                    migration.name
                )));
            }
            let checksum = migration.checksum()?;
            migrations.push(Prepared {
                migration,
                checksum,
            });
        }

        let executor = ChangeExecutor::new(config.reapply_policy);
        let history = MigrationHistory::new(config.history_table.clone());
        let lock = MigrationLock::new(
            config.lock_table.clone(),
            config.lock_stale_after_secs.map(Duration::from_secs),
        );
        debug!("loaded {} migrations", migrations.len());

        Ok(Self {
            migrations,
            config,
            executor,
            history,
            lock,
        })
    }

    pub fn migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().map(|p| &p.migration)
    }

    pub fn status(&self, store: &SqliteStore) -> Result<MigrationStatus> {
        let conn = store.connection()?;
        let applied: BTreeMap<MigrationId, HistoryEntry> = self
            .history
            .list_applied(&conn)?
            .into_iter()
            .map(|entry| (entry.migration_id, entry))
            .collect();

        let migrations = self
            .migrations
            .iter()
            .map(|p| {
                let entry = applied.get(&p.migration.id);
                StatusEntry {
                    id: p.migration.id.to_string(),
                    name: p.migration.name.clone(),
                    state: if entry.is_some() {
                        MigrationState::Applied
                    } else {
                        MigrationState::Pending
                    },
                    applied_at: entry.map(|e| e.applied_at),
                    applied_by: entry.map(|e| e.applied_by.clone()),
                    drifted: entry
                        .and_then(|e| e.checksum.as_deref())
                        .is_some_and(|recorded| recorded != p.checksum),
                }
            })
            .collect();

        let unknown_applied = applied
            .keys()
            .filter(|id| self.find(id).is_none())
            .map(ToString::to_string)
            .collect();

        Ok(MigrationStatus {
            migrations,
            unknown_applied,
            lock: self.lock.current(&conn)?,
        })
    }

    /// Apply pending migrations in id order, up to and including `target`.
    pub fn up(
        &self,
        store: &SqliteStore,
        target: Option<MigrationId>,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        if let Some(target) = &target {
            if self.find(target).is_none() {
                return Err(Error::NotFound(format!("migration {target}")));
            }
        }

        self.run(store, Direction::Up, cancel, |conn| {
            self.history.ensure_table(conn)?;
            let applied = self.verified_history(conn)?;
            let applied: HashSet<MigrationId> =
                applied.into_iter().map(|e| e.migration_id).collect();

            Ok(self
                .migrations
                .iter()
                .filter(|p| !applied.contains(&p.migration.id))
                .filter(|p| target.is_none_or(|t| p.migration.id <= t))
                .collect())
        })
    }

    /// Revert applied migrations in descending id order.
    pub fn down(
        &self,
        store: &SqliteStore,
        target: DownTarget,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        if let DownTarget::To(target) = &target {
            if self.find(target).is_none() {
                return Err(Error::NotFound(format!("migration {target}")));
            }
        }

        self.run(store, Direction::Down, cancel, |conn| {
            let applied = self.verified_history(conn)?;
            let mut revert: Vec<&Prepared> = applied
                .iter()
                .rev()
                .filter_map(|entry| self.find(&entry.migration_id))
                .filter(|p| match target {
                    DownTarget::To(t) => p.migration.id > t,
                    DownTarget::Last | DownTarget::All => true,
                })
                .collect();
            if target == DownTarget::Last {
                revert.truncate(1);
            }
            Ok(revert)
        })
    }

    /// Remove the advisory lock left by a crashed run.
    pub fn force_unlock(&self, store: &SqliteStore) -> Result<Option<LockInfo>> {
        let conn = store.connection()?;
        self.lock.force_release(&conn)
    }

    /// User schema, without the runner's own bookkeeping tables.
    pub fn schema_snapshot(&self, store: &SqliteStore) -> Result<SchemaSnapshot> {
        let conn = store.connection()?;
        schema::snapshot(
            &conn,
            &[
                self.config.history_table.as_str(),
                self.config.lock_table.as_str(),
            ],
        )
    }

    fn find(&self, id: &MigrationId) -> Option<&Prepared> {
        self.migrations
            .binary_search_by(|p| p.migration.id.cmp(id))
            .ok()
            .map(|i| &self.migrations[i])
    }

    /// Applied history, checked against the known migrations.
    fn verified_history(&self, conn: &Connection) -> Result<Vec<HistoryEntry>> {
        let applied = self.history.list_applied(conn)?;

        for entry in &applied {
            let Some(known) = self.find(&entry.migration_id) else {
                return Err(Error::HistoryMismatch(format!(
                    "applied migration {} ({}) is not among the known migrations",
                    entry.migration_id, entry.name
                )));
            };
            if self.config.verify_checksums {
                if let Some(recorded) = &entry.checksum {
                    if *recorded != known.checksum {
                        return Err(Error::ChecksumMismatch {
                            id: entry.migration_id.to_string(),
                            recorded: recorded.clone(),
                            current: known.checksum.clone(),
                        });
                    }
                }
            }
        }

        if !self.config.allow_out_of_order {
            for (entry, known) in applied.iter().zip(&self.migrations) {
                if entry.migration_id != known.migration.id {
                    return Err(Error::HistoryMismatch(format!(
                        "migration {} ({}) is pending but older than applied migration {}",
                        known.migration.id, known.migration.name, entry.migration_id
                    )));
                }
            }
        }

        Ok(applied)
    }

    /// Take the lock, run the planned migrations one by one, then restore
    /// the connection's foreign key setting and release the lock.
    fn run<'a>(
        &'a self,
        store: &SqliteStore,
        direction: Direction,
        cancel: &CancelToken,
        plan: impl FnOnce(&Connection) -> Result<Vec<&'a Prepared>>,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let conn = store.connection()?;
        let holder = format!(
            "{}:{}:{}",
            self.config.applied_by(),
            std::process::id(),
            Uuid::new_v4()
        );

        self.lock.acquire(&conn, &holder)?;
        let foreign_keys_were_on = match schema::foreign_keys_enabled(&conn) {
            Ok(on) => on,
            Err(e) => {
                self.release_lock(&conn, &holder);
                return Err(e);
            }
        };

        let result = plan(&conn)
            .and_then(|pending| self.execute_plan(&conn, direction, &pending, cancel, started));

        if let Err(e) = schema::set_foreign_keys(&conn, foreign_keys_were_on) {
            warn!("failed to restore foreign key enforcement after migration run: {e}");
        }
        self.release_lock(&conn, &holder);
        result
    }

    fn execute_plan(
        &self,
        conn: &Connection,
        direction: Direction,
        plan: &[&Prepared],
        cancel: &CancelToken,
        started: Instant,
    ) -> Result<RunReport> {
        let mut report = RunReport {
            direction,
            migrations: Vec::new(),
            skipped_operations: 0,
            cancelled: false,
            elapsed_ms: 0,
        };

        if plan.is_empty() {
            info!("nothing to migrate {}", direction_label(direction));
        }

        for prepared in plan {
            if cancel.is_cancelled() {
                warn!(
                    "run cancelled before migration {}; {} of {} completed",
                    prepared.migration.id,
                    report.migrations.len(),
                    plan.len()
                );
                report.cancelled = true;
                break;
            }
            report.skipped_operations += self.apply_one(conn, prepared, direction)?;
            report.migrations.push(prepared.migration.id.to_string());
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "migrated {}: {} migrations in {}ms",
            direction_label(direction),
            report.migrations.len(),
            report.elapsed_ms
        );
        Ok(report)
    }

    /// Run one migration's operations and history update in a single
    /// transaction. Returns how many operations were skipped.
    fn apply_one(&self, conn: &Connection, prepared: &Prepared, direction: Direction) -> Result<usize> {
        let migration = &prepared.migration;
        let ops = match direction {
            Direction::Up => &migration.up,
            Direction::Down => &migration.down,
        };
        if direction == Direction::Down && ops.is_empty() && !migration.up.is_empty() {
            warn!(
                "migration {} ({}) has no down operations; only its history entry is removed",
                migration.id, migration.name
            );
        }

        // Rebuilds and drops need enforcement off; everything else runs with
        // it on so ON DELETE actions fire, deferred to the end of the migration.
        let suspend = ops.iter().any(suspends_foreign_keys);
        if suspend {
            debug!("migration {} runs with foreign key enforcement suspended", migration.id);
        }
        schema::set_foreign_keys(conn, !suspend).map_err(|e| failed(migration, "begin", None, e))?;

        let started = Instant::now();
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|e| failed(migration, "begin", None, map_sqlite("failed to begin transaction", e)))?;
        if !suspend {
            tx.execute_batch("PRAGMA defer_foreign_keys = ON").map_err(|e| {
                failed(migration, "begin", None, map_sqlite("failed to defer foreign keys", e))
            })?;
        }
        let baseline = schema::foreign_key_violations(&tx)
            .map_err(|e| failed(migration, "foreign key check", None, e))?;
        info!(
            "migration {} ({}): {} -> {} ({})",
            migration.id,
            migration.name,
            MigrationState::Pending,
            MigrationState::Applying,
            direction_label(direction)
        );

        self.arm_timeout(&tx);
        let outcome = self.apply_operations(&tx, prepared, ops, direction, &baseline, started);
        tx.progress_handler(0, None::<fn() -> bool>);

        match outcome {
            Ok(skipped) => {
                tx.commit()
                    .map_err(|e| failed(migration, "commit", None, map_sqlite("failed to commit", e)))?;
                info!(
                    "migration {} ({}): {} -> {} in {}ms",
                    migration.id,
                    migration.name,
                    MigrationState::Applying,
                    MigrationState::Applied,
                    started.elapsed().as_millis()
                );
                Ok(skipped)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!("rollback of migration {} failed: {rollback}", migration.id);
                }
                error!(
                    "migration {} ({}): {} -> {}: {e}",
                    migration.id,
                    migration.name,
                    MigrationState::Applying,
                    MigrationState::Failed
                );
                Err(e)
            }
        }
    }

    fn apply_operations(
        &self,
        conn: &Connection,
        prepared: &Prepared,
        ops: &[ChangeOperation],
        direction: Direction,
        baseline: &BTreeSet<ForeignKeyViolation>,
        started: Instant,
    ) -> Result<usize> {
        let migration = &prepared.migration;
        let mut skipped = 0;

        for (index, op) in ops.iter().enumerate() {
            debug!("migration {} operation {index}: {}", migration.id, op.kind());
            match self.executor.apply(conn, op) {
                Ok(Outcome::Applied) => {}
                Ok(Outcome::Skipped) => skipped += 1,
                Err(e) => {
                    let stage = format!("operation {index} ({})", op.kind());
                    return Err(failed(migration, &stage, Some(index), e));
                }
            }
        }

        // Orphans that predate this migration are not its fault.
        let introduced: Vec<String> = schema::foreign_key_violations(conn)
            .map_err(|e| failed(migration, "foreign key check", None, e))?
            .difference(baseline)
            .take(5)
            .map(ToString::to_string)
            .collect();
        if !introduced.is_empty() {
            return Err(failed(
                migration,
                "foreign key check",
                None,
                Error::DataIntegrityViolation(introduced.join("; ")),
            ));
        }

        let bookkeeping = match direction {
            Direction::Up => self.history.record_applied(
                conn,
                &HistoryEntry {
                    migration_id: migration.id,
                    name: migration.name.clone(),
                    applied_at: Utc::now(),
                    applied_by: self.config.applied_by(),
                    checksum: Some(prepared.checksum.clone()),
                    execution_ms: started.elapsed().as_millis() as u64,
                },
            ),
            Direction::Down => self.history.remove_applied(conn, &migration.id),
        };
        bookkeeping.map_err(|e| failed(migration, "history update", None, e))?;

        Ok(skipped)
    }

    fn arm_timeout(&self, conn: &Connection) {
        if let Some(secs) = self.config.migration_timeout_secs {
            let deadline = Instant::now() + Duration::from_secs(secs);
            conn.progress_handler(1000, Some(move || Instant::now() > deadline));
        }
    }

    fn release_lock(&self, conn: &Connection, holder: &str) {
        if let Err(e) = self.lock.release(conn, holder) {
            warn!("failed to release migration lock: {e}");
        }
    }
}

fn failed(migration: &Migration, stage: &str, operation: Option<usize>, source: Error) -> Error {
    Error::MigrationFailed {
        id: migration.id.to_string(),
        name: migration.name.clone(),
        stage: stage.to_string(),
        operation,
        source: Box::new(source),
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "up",
        Direction::Down => "down",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrun_common::{ColumnDef, OnDelete};
    use migrun_config::ReapplyPolicy;

    fn id(s: &str) -> MigrationId {
        s.parse().unwrap()
    }

    fn base_store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE campus (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 CREATE TABLE person (id INTEGER PRIMARY KEY, first_name TEXT);
                 INSERT INTO campus (id, name) VALUES (1, 'Main');
                 INSERT INTO person (id, first_name) VALUES (1, 'Ted');",
            )
            .unwrap();
        store
    }

    fn add_nick() -> Migration {
        Migration::new(
            id("20240101000000"),
            "add_nick",
            vec![ChangeOperation::AddColumn {
                table: "person".into(),
                column: ColumnDef::new("nick", "TEXT"),
            }],
            vec![ChangeOperation::DropColumn {
                table: "person".into(),
                column: "nick".into(),
            }],
        )
    }

    fn add_campus_fk() -> Migration {
        Migration::new(
            id("20240102000000"),
            "add_person_campus",
            vec![
                ChangeOperation::AddColumn {
                    table: "person".into(),
                    column: ColumnDef::new("campus_id", "INTEGER"),
                },
                ChangeOperation::AddForeignKey {
                    table: "person".into(),
                    column: "campus_id".into(),
                    ref_table: "campus".into(),
                    ref_column: "id".into(),
                    on_delete: OnDelete::SetNull,
                },
            ],
            vec![
                ChangeOperation::DropForeignKey {
                    table: "person".into(),
                    column: "campus_id".into(),
                    ref_table: "campus".into(),
                },
                ChangeOperation::DropColumn {
                    table: "person".into(),
                    column: "campus_id".into(),
                },
            ],
        )
    }

    fn migrator(records: Vec<Migration>) -> Migrator {
        Migrator::load(records, RunnerConfig::default()).unwrap()
    }

    #[test]
    fn load_rejects_duplicate_ids() {
        let mut twin = add_nick();
        twin.name = "add_nick_again".into();
        let result = Migrator::load(vec![add_nick(), twin], RunnerConfig::default());
        assert!(matches!(result, Err(Error::InvalidMigration(_))));
    }

    #[test]
    fn up_applies_in_order_and_records_history() {
        let store = base_store();
        let migrator = migrator(vec![add_campus_fk(), add_nick()]);

        let report = migrator.up(&store, None, &CancelToken::new()).unwrap();
        assert_eq!(report.migrations, vec!["20240101000000", "20240102000000"]);
        assert!(!report.cancelled);

        let status = migrator.status(&store).unwrap();
        assert_eq!(status.applied_count(), 2);
        assert_eq!(status.pending_count(), 0);
        assert!(status.lock.is_none());

        let again = migrator.up(&store, None, &CancelToken::new()).unwrap();
        assert!(again.migrations.is_empty());
    }

    #[test]
    fn foreign_keys_are_restored_after_run() {
        let store = base_store();
        let migrator = migrator(vec![add_nick()]);
        migrator.up(&store, None, &CancelToken::new()).unwrap();

        let enabled: i64 = store
            .with_connection(|c| c.query_row("PRAGMA foreign_keys", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn up_to_target_stops_there() {
        let store = base_store();
        let migrator = migrator(vec![add_nick(), add_campus_fk()]);

        let report = migrator
            .up(&store, Some(id("20240101000000")), &CancelToken::new())
            .unwrap();
        assert_eq!(report.migrations, vec!["20240101000000"]);

        let err = migrator
            .up(&store, Some(id("20990101000000")), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn down_targets() {
        let store = base_store();
        let migrator = migrator(vec![add_nick(), add_campus_fk()]);
        migrator.up(&store, None, &CancelToken::new()).unwrap();

        let report = migrator.down(&store, DownTarget::Last, &CancelToken::new()).unwrap();
        assert_eq!(report.migrations, vec!["20240102000000"]);
        assert_eq!(report.direction, Direction::Down);

        migrator.up(&store, None, &CancelToken::new()).unwrap();
        let report = migrator.down(&store, DownTarget::All, &CancelToken::new()).unwrap();
        assert_eq!(report.migrations, vec!["20240102000000", "20240101000000"]);

        let person = migrator.schema_snapshot(&store).unwrap()["person"].clone();
        assert_eq!(person.columns.len(), 2);
    }

    #[test]
    fn failure_names_migration_and_operation() {
        let store = base_store();
        let broken = Migration::new(
            id("20240101000000"),
            "broken",
            vec![
                ChangeOperation::AddColumn {
                    table: "person".into(),
                    column: ColumnDef::new("nick", "TEXT"),
                },
                ChangeOperation::DropColumn {
                    table: "person".into(),
                    column: "missing".into(),
                },
            ],
            vec![],
        );
        let migrator = migrator(vec![broken]);

        let err = migrator.up(&store, None, &CancelToken::new()).unwrap_err();
        match &err {
            Error::MigrationFailed {
                id, operation, source, ..
            } => {
                assert_eq!(id, "20240101000000");
                assert_eq!(*operation, Some(1));
                assert!(matches!(**source, Error::NotFound(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        let person = migrator.schema_snapshot(&store).unwrap()["person"].clone();
        assert!(person.column("nick").is_none());
        assert_eq!(migrator.status(&store).unwrap().applied_count(), 0);
        assert!(migrator.status(&store).unwrap().lock.is_none());
    }

    #[test]
    fn cancelled_token_stops_before_first_migration() {
        let store = base_store();
        let migrator = migrator(vec![add_nick()]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = migrator.up(&store, None, &cancel).unwrap();
        assert!(report.cancelled);
        assert!(report.migrations.is_empty());
        assert_eq!(migrator.status(&store).unwrap().pending_count(), 1);
    }

    #[test]
    fn cancel_during_migration_lets_it_commit() {
        let store = base_store();
        let slow = Migration::new(
            id("20240101000000"),
            "numbers",
            vec![ChangeOperation::raw(
                "CREATE TABLE numbers AS
                 WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 200000)
                 SELECT x FROM n",
            )],
            vec![],
        );
        let mut nick = add_nick();
        nick.id = id("20240102000000");
        let migrator = migrator(vec![slow, nick]);

        // Fires only inside the long statement of the first migration.
        let cancel = CancelToken::new();
        let on_progress = cancel.clone();
        store
            .with_connection(|c| {
                c.progress_handler(
                    50_000,
                    Some(move || {
                        on_progress.cancel();
                        false
                    }),
                );
                Ok(())
            })
            .unwrap();

        let report = migrator.up(&store, None, &cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.migrations, vec!["20240101000000"]);

        let status = migrator.status(&store).unwrap();
        assert_eq!(status.applied_count(), 1);
        assert_eq!(status.pending_count(), 1);
        let numbers: i64 = store
            .with_connection(|c| c.query_row("SELECT COUNT(*) FROM numbers", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(numbers, 200_000);
        let person = migrator.schema_snapshot(&store).unwrap()["person"].clone();
        assert!(person.column("nick").is_none());
    }

    #[test]
    fn deleting_a_parent_fires_on_delete_actions() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE campus (id INTEGER PRIMARY KEY, guid TEXT NOT NULL UNIQUE, name TEXT);
                 CREATE TABLE person (
                     id INTEGER PRIMARY KEY,
                     campus_id INTEGER REFERENCES campus (id) ON DELETE SET NULL
                 );
                 CREATE TABLE enrollment (
                     id INTEGER PRIMARY KEY,
                     person_id INTEGER REFERENCES person (id) ON DELETE CASCADE
                 );
                 CREATE TABLE badge (
                     id INTEGER PRIMARY KEY,
                     person_id INTEGER REFERENCES person (id)
                 );
                 INSERT INTO campus (id, guid, name) VALUES (1, 'G1', 'Main');
                 INSERT INTO person (id, campus_id) VALUES (1, 1), (2, 1), (3, NULL);
                 INSERT INTO enrollment (id, person_id) VALUES (1, 1), (2, 2), (3, 2);
                 INSERT INTO badge (id, person_id) VALUES (1, 3);",
            )
            .unwrap();

        let retire = Migration::new(
            id("20240101000000"),
            "retire_main_campus",
            vec![
                ChangeOperation::DeleteSeedRow {
                    table: "campus".into(),
                    key_column: "guid".into(),
                    key: "G1".into(),
                },
                ChangeOperation::raw("DELETE FROM person WHERE id = 2"),
            ],
            vec![],
        );
        let migrator = migrator(vec![retire]);
        migrator.up(&store, None, &CancelToken::new()).unwrap();

        let campus_ids: Vec<Option<i64>> = store
            .with_connection(|c| {
                let mut stmt = c.prepare("SELECT campus_id FROM person ORDER BY id")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect()
            })
            .unwrap();
        assert_eq!(campus_ids, vec![None, None]);
        let enrollments: Vec<i64> = store
            .with_connection(|c| {
                let mut stmt = c.prepare("SELECT id FROM enrollment ORDER BY id")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect()
            })
            .unwrap();
        assert_eq!(enrollments, vec![1]);

        // Without an ON DELETE action the orphaned badge is rejected.
        let orphaning = Migration::new(
            id("20240102000000"),
            "drop_badge_holder",
            vec![ChangeOperation::raw("DELETE FROM person WHERE id = 3")],
            vec![],
        );
        let migrator = Migrator::load(
            vec![migrator.migrations().next().unwrap().clone(), orphaning],
            RunnerConfig::default(),
        )
        .unwrap();
        let err = migrator.up(&store, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err.root_cause(), Error::DataIntegrityViolation(msg) if msg.contains("badge")));
        let people: i64 = store
            .with_connection(|c| c.query_row("SELECT COUNT(*) FROM person", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(people, 2);
    }

    #[test]
    fn existing_orphans_do_not_block_unrelated_migrations() {
        let store = base_store();
        store
            .execute_batch(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent (id));
                 CREATE TABLE note (id INTEGER PRIMARY KEY);
                 PRAGMA foreign_keys = OFF;
                 INSERT INTO child (id, parent_id) VALUES (1, 99);
                 PRAGMA foreign_keys = ON;",
            )
            .unwrap();

        let add_body = Migration::new(
            id("20240101000000"),
            "add_note_body",
            vec![ChangeOperation::AddColumn {
                table: "note".into(),
                column: ColumnDef::new("body", "TEXT"),
            }],
            vec![ChangeOperation::DropColumn {
                table: "note".into(),
                column: "body".into(),
            }],
        );
        let new_orphan = Migration::new(
            id("20240102000000"),
            "orphan_child",
            vec![ChangeOperation::raw(
                "INSERT INTO child (id, parent_id) VALUES (2, 77)",
            )],
            vec![],
        );
        let migrator = migrator(vec![add_body, new_orphan]);

        let err = migrator.up(&store, None, &CancelToken::new()).unwrap_err();
        assert_eq!(err.failed_migration(), Some("20240102000000"));
        match err.root_cause() {
            Error::DataIntegrityViolation(msg) => {
                assert!(msg.contains("child row 2"), "{msg}");
                assert!(!msg.contains("child row 1"), "{msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(migrator.status(&store).unwrap().applied_count(), 1);

        let report = migrator.down(&store, DownTarget::Last, &CancelToken::new()).unwrap();
        assert_eq!(report.migrations, vec!["20240101000000"]);
    }

    #[test]
    fn held_lock_reports_run_in_progress() {
        let store = base_store();
        let migrator = migrator(vec![add_nick()]);
        {
            let conn = store.connection().unwrap();
            MigrationLock::new("_migration_lock", None)
                .acquire(&conn, "other-host:42")
                .unwrap();
        }

        let err = migrator.up(&store, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::RunInProgress { ref holder } if holder == "other-host:42"));
        assert!(err.is_retryable());

        assert_eq!(
            migrator.force_unlock(&store).unwrap().unwrap().holder,
            "other-host:42"
        );
        migrator.up(&store, None, &CancelToken::new()).unwrap();
    }

    #[test]
    fn out_of_order_pending_is_a_history_mismatch() {
        let store = base_store();
        migrator(vec![add_campus_fk()])
            .up(&store, None, &CancelToken::new())
            .unwrap();

        let strict = migrator(vec![add_nick(), add_campus_fk()]);
        let err = strict.up(&store, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::HistoryMismatch(_)));

        let config = RunnerConfig {
            allow_out_of_order: true,
            ..RunnerConfig::default()
        };
        let relaxed = Migrator::load(vec![add_nick(), add_campus_fk()], config).unwrap();
        let report = relaxed.up(&store, None, &CancelToken::new()).unwrap();
        assert_eq!(report.migrations, vec!["20240101000000"]);
    }

    #[test]
    fn edited_migration_is_detected() {
        let store = base_store();
        migrator(vec![add_nick()])
            .up(&store, None, &CancelToken::new())
            .unwrap();

        let mut edited = add_nick();
        edited.up = vec![ChangeOperation::AddColumn {
            table: "person".into(),
            column: ColumnDef::new("nick", "VARCHAR(50)"),
        }];
        let migrator = migrator(vec![edited]);

        assert!(migrator.status(&store).unwrap().has_drift());
        let err = migrator.up(&store, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn strict_policy_rejects_identical_reapply() {
        let store = base_store();
        store.execute_batch("ALTER TABLE person ADD COLUMN nick TEXT").unwrap();

        let config = RunnerConfig {
            reapply_policy: ReapplyPolicy::Strict,
            ..RunnerConfig::default()
        };
        let strict = Migrator::load(vec![add_nick()], config).unwrap();
        let err = strict.up(&store, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err.root_cause(), Error::SchemaConflict(_)));

        let report = migrator(vec![add_nick()])
            .up(&store, None, &CancelToken::new())
            .unwrap();
        assert_eq!(report.skipped_operations, 1);
    }

    #[test]
    fn timeout_interrupts_long_statement() {
        let store = base_store();
        let slow = Migration::new(
            id("20240101000000"),
            "slow",
            vec![ChangeOperation::raw(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n)
                 SELECT COUNT(*) FROM n",
            )],
            vec![],
        );
        let config = RunnerConfig {
            migration_timeout_secs: Some(1),
            ..RunnerConfig::default()
        };
        let migrator = Migrator::load(vec![slow], config).unwrap();

        let err = migrator.up(&store, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err.root_cause(), Error::Timeout(_)));
        assert_eq!(migrator.status(&store).unwrap().applied_count(), 0);
    }
}
