pub mod executor;
pub mod history;
pub mod lock;
pub mod runner;
pub mod schema;
pub mod store;

pub use executor::{ChangeExecutor, Outcome, suspends_foreign_keys};
pub use history::{HistoryEntry, MigrationHistory};
pub use lock::{LockInfo, MigrationLock};
pub use runner::{
    CancelToken, Direction, DownTarget, MigrationState, MigrationStatus, Migrator, RunReport,
    StatusEntry,
};
pub use schema::{
    ColumnInfo, ForeignKeyInfo, ForeignKeyViolation, IndexInfo, SchemaSnapshot, TableSchema,
};
pub use store::SqliteStore;
