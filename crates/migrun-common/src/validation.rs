use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

static MIGRATION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").expect("name pattern"));

static COLUMN_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_ ]*(\(\s*\d+\s*(,\s*\d+\s*)?\))?$").expect("type pattern")
});

/// Validation for names and type declarations that end up spliced into SQL.
pub struct IdentifierValidator;

impl IdentifierValidator {
    /// Validate a table, column or index name.
    pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidMigration(format!("{kind} name cannot be empty")));
        }
        if name.len() > 128 {
            return Err(Error::InvalidMigration(format!(
                "{kind} name too long: {name}"
            )));
        }
        if !IDENTIFIER.is_match(name) {
            return Err(Error::InvalidMigration(format!(
                "{kind} name {name:?} is not a plain identifier"
            )));
        }
        if name.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(Error::InvalidMigration(format!(
                "{kind} name {name:?} uses the reserved sqlite_ prefix"
            )));
        }
        Ok(())
    }

    /// Validate a human-readable migration name such as `add_person_nickname`.
    pub fn validate_migration_name(name: &str) -> Result<()> {
        if MIGRATION_NAME.is_match(name) && name.len() <= 200 {
            Ok(())
        } else {
            Err(Error::InvalidMigration(format!(
                "migration name {name:?} must be alphanumeric with '_' or '-'"
            )))
        }
    }

    /// Validate a declared column type such as `TEXT` or `DECIMAL(18, 2)`.
    pub fn validate_column_type(column: &str, data_type: &str) -> Result<()> {
        if data_type.is_empty() || COLUMN_TYPE.is_match(data_type) {
            Ok(())
        } else {
            Err(Error::InvalidMigration(format!(
                "column {column} has an unsupported type declaration {data_type:?}"
            )))
        }
    }
}

/// Quote an identifier for SQLite, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
