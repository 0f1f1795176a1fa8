use std::path::PathBuf;

use migrun_common::{IdentifierValidator, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `migrun.yml` / `migrun.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("migrun.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub dir: PathBuf,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
        }
    }
}

/// How re-applying an identical structural addition is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapplyPolicy {
    /// An identical column/table/index/foreign key already present is a no-op.
    #[default]
    Tolerant,
    /// Any pre-existing object is a schema conflict.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub history_table: String,
    pub lock_table: String,
    pub reapply_policy: ReapplyPolicy,
    pub allow_out_of_order: bool,
    pub verify_checksums: bool,
    pub applied_by: Option<String>,
    pub lock_stale_after_secs: Option<u64>,
    pub migration_timeout_secs: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            history_table: "_migration_history".to_string(),
            lock_table: "_migration_lock".to_string(),
            reapply_policy: ReapplyPolicy::default(),
            allow_out_of_order: false,
            verify_checksums: true,
            applied_by: None,
            lock_stale_after_secs: None,
            migration_timeout_secs: None,
        }
    }
}

impl RunnerConfig {
    /// Identity recorded in history and in the advisory lock.
    pub fn applied_by(&self) -> String {
        self.applied_by.clone().unwrap_or_else(|| {
            let user = std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string());
            format!("{user}@migrun")
        })
    }

    pub fn validate(&self) -> Result<()> {
        IdentifierValidator::validate_identifier("history table", &self.history_table)
            .map_err(|e| migrun_common::Error::Config(e.to_string()))?;
        IdentifierValidator::validate_identifier("lock table", &self.lock_table)
            .map_err(|e| migrun_common::Error::Config(e.to_string()))?;
        if self.history_table == self.lock_table {
            return Err(migrun_common::Error::Config(
                "history_table and lock_table must differ".into(),
            ));
        }
        Ok(())
    }
}
