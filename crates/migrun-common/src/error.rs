use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("data integrity violation: {0}")]
    DataIntegrityViolation(String),

    #[error("duplicate migration: {0} is already recorded in history")]
    DuplicateMigration(String),

    #[error("migration run in progress (lock held by {holder})")]
    RunInProgress { holder: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    #[error("history mismatch: {0}")]
    HistoryMismatch(String),

    #[error("checksum mismatch for {id}: recorded {recorded}, current {current}")]
    ChecksumMismatch {
        id: String,
        recorded: String,
        current: String,
    },

    #[error("migration {id} ({name}) failed during {stage}: {source}")]
    MigrationFailed {
        id: String,
        name: String,
        stage: String,
        operation: Option<usize>,
        source: Box<Error>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// The innermost error, looking through `MigrationFailed` wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::MigrationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Id of the migration that failed, if this error came out of a migration.
    pub fn failed_migration(&self) -> Option<&str> {
        match self {
            Error::MigrationFailed { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Whether the caller may back off and retry the whole run later.
    ///
    /// Only errors raised before any migration started qualify; a failure
    /// inside a migration always needs operator attention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RunInProgress { .. } | Error::StorageUnavailable(_)
        )
    }
}
