use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::validation::IdentifierValidator;
use crate::Result;

/// What happens to referencing rows when a referenced row is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnDelete {
    #[serde(alias = "cascade")]
    Cascade,
    #[serde(alias = "set_null")]
    SetNull,
    #[default]
    #[serde(alias = "no_action")]
    NoAction,
    #[serde(alias = "restrict")]
    Restrict,
}

impl OnDelete {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::NoAction => "NO ACTION",
            OnDelete::Restrict => "RESTRICT",
        }
    }

    /// Parse the action text reported by `PRAGMA foreign_key_list`.
    pub fn from_sql(action: &str) -> Option<Self> {
        match action.trim().to_ascii_uppercase().as_str() {
            "CASCADE" => Some(OnDelete::Cascade),
            "SET NULL" => Some(OnDelete::SetNull),
            "NO ACTION" | "" => Some(OnDelete::NoAction),
            "RESTRICT" => Some(OnDelete::Restrict),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_key_column() -> String {
    "guid".to_string()
}

/// Structural description of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// SQL default expression, written as it would appear after `DEFAULT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub autoincrement: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            primary_key: false,
            autoincrement: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self.primary_key()
    }
}

/// A single-column foreign key declared inline with `CreateTable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub column: String,
    pub ref_table: String,
    #[serde(default = "default_ref_column")]
    pub ref_column: String,
    #[serde(default)]
    pub on_delete: OnDelete,
}

fn default_ref_column() -> String {
    "id".to_string()
}

/// A reference-data row identified by a stable external key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedRow {
    pub table: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    pub key: String,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    /// Left unset, inserts skip existing rows and updates overwrite them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_exists: Option<bool>,
}

impl SeedRow {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_column: default_key_column(),
            key: key.into(),
            values: BTreeMap::new(),
            skip_if_exists: None,
        }
    }

    pub fn value(mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn skip_if_exists(mut self, skip: bool) -> Self {
        self.skip_if_exists = Some(skip);
        self
    }
}

/// One atomic structural or data mutation within a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOperation {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        foreign_keys: Vec<ForeignKeyDef>,
    },
    DropTable {
        table: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
    AlterColumn {
        table: String,
        column: String,
        #[serde(rename = "type")]
        data_type: String,
        nullable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    AddForeignKey {
        table: String,
        column: String,
        ref_table: String,
        #[serde(default = "default_ref_column")]
        ref_column: String,
        #[serde(default)]
        on_delete: OnDelete,
    },
    DropForeignKey {
        table: String,
        column: String,
        ref_table: String,
    },
    CreateIndex {
        table: String,
        name: String,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
    },
    DropIndex {
        name: String,
    },
    RawStatement {
        sql: String,
    },
    InsertSeedRow(SeedRow),
    UpdateSeedRow(SeedRow),
    DeleteSeedRow {
        table: String,
        #[serde(default = "default_key_column")]
        key_column: String,
        key: String,
    },
}

impl ChangeOperation {
    pub fn raw(sql: impl Into<String>) -> Self {
        ChangeOperation::RawStatement { sql: sql.into() }
    }

    /// Short name used in logs and failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeOperation::CreateTable { .. } => "create_table",
            ChangeOperation::DropTable { .. } => "drop_table",
            ChangeOperation::AddColumn { .. } => "add_column",
            ChangeOperation::DropColumn { .. } => "drop_column",
            ChangeOperation::AlterColumn { .. } => "alter_column",
            ChangeOperation::AddForeignKey { .. } => "add_foreign_key",
            ChangeOperation::DropForeignKey { .. } => "drop_foreign_key",
            ChangeOperation::CreateIndex { .. } => "create_index",
            ChangeOperation::DropIndex { .. } => "drop_index",
            ChangeOperation::RawStatement { .. } => "raw_statement",
            ChangeOperation::InsertSeedRow(_) => "insert_seed_row",
            ChangeOperation::UpdateSeedRow(_) => "update_seed_row",
            ChangeOperation::DeleteSeedRow { .. } => "delete_seed_row",
        }
    }

    /// Effective skip-if-exists flag for seed upserts.
    pub fn skip_if_exists(&self) -> Option<bool> {
        match self {
            ChangeOperation::InsertSeedRow(row) => Some(row.skip_if_exists.unwrap_or(true)),
            ChangeOperation::UpdateSeedRow(row) => Some(row.skip_if_exists.unwrap_or(false)),
            _ => None,
        }
    }

    /// The structural inverse of this operation, when it can be derived
    /// from the operation alone.
    pub fn inverse(&self) -> Option<ChangeOperation> {
        match self {
            ChangeOperation::CreateTable { table, .. } => Some(ChangeOperation::DropTable {
                table: table.clone(),
            }),
            ChangeOperation::AddColumn { table, column } => Some(ChangeOperation::DropColumn {
                table: table.clone(),
                column: column.name.clone(),
            }),
            ChangeOperation::AddForeignKey {
                table,
                column,
                ref_table,
                ..
            } => Some(ChangeOperation::DropForeignKey {
                table: table.clone(),
                column: column.clone(),
                ref_table: ref_table.clone(),
            }),
            ChangeOperation::CreateIndex { name, .. } => {
                Some(ChangeOperation::DropIndex { name: name.clone() })
            }
            _ => None,
        }
    }

    /// Check every name this operation splices into SQL.
    pub fn validate(&self) -> Result<()> {
        use IdentifierValidator as V;

        match self {
            ChangeOperation::CreateTable {
                table,
                columns,
                foreign_keys,
            } => {
                V::validate_identifier("table", table)?;
                if columns.is_empty() {
                    return Err(crate::Error::InvalidMigration(format!(
                        "create_table {table} declares no columns"
                    )));
                }
                for column in columns {
                    validate_column(column)?;
                }
                for fk in foreign_keys {
                    V::validate_identifier("column", &fk.column)?;
                    V::validate_identifier("table", &fk.ref_table)?;
                    V::validate_identifier("column", &fk.ref_column)?;
                }
            }
            ChangeOperation::DropTable { table } => V::validate_identifier("table", table)?,
            ChangeOperation::AddColumn { table, column } => {
                V::validate_identifier("table", table)?;
                validate_column(column)?;
            }
            ChangeOperation::DropColumn { table, column } => {
                V::validate_identifier("table", table)?;
                V::validate_identifier("column", column)?;
            }
            ChangeOperation::AlterColumn {
                table,
                column,
                data_type,
                ..
            } => {
                V::validate_identifier("table", table)?;
                V::validate_identifier("column", column)?;
                V::validate_column_type(column, data_type)?;
            }
            ChangeOperation::AddForeignKey {
                table,
                column,
                ref_table,
                ref_column,
                ..
            } => {
                V::validate_identifier("table", table)?;
                V::validate_identifier("column", column)?;
                V::validate_identifier("table", ref_table)?;
                V::validate_identifier("column", ref_column)?;
            }
            ChangeOperation::DropForeignKey {
                table,
                column,
                ref_table,
            } => {
                V::validate_identifier("table", table)?;
                V::validate_identifier("column", column)?;
                V::validate_identifier("table", ref_table)?;
            }
            ChangeOperation::CreateIndex {
                table,
                name,
                columns,
                ..
            } => {
                V::validate_identifier("table", table)?;
                V::validate_identifier("index", name)?;
                if columns.is_empty() {
                    return Err(crate::Error::InvalidMigration(format!(
                        "index {name} has no columns"
                    )));
                }
                for column in columns {
                    V::validate_identifier("column", column)?;
                }
            }
            ChangeOperation::DropIndex { name } => V::validate_identifier("index", name)?,
            ChangeOperation::RawStatement { sql } => {
                if sql.trim().is_empty() {
                    return Err(crate::Error::InvalidMigration(
                        "raw statement is empty".into(),
                    ));
                }
            }
            ChangeOperation::InsertSeedRow(row) | ChangeOperation::UpdateSeedRow(row) => {
                V::validate_identifier("table", &row.table)?;
                V::validate_identifier("column", &row.key_column)?;
                for column in row.values.keys() {
                    V::validate_identifier("column", column)?;
                    if column == &row.key_column {
                        return Err(crate::Error::InvalidMigration(format!(
                            "seed row for {} sets its key column {column} in values",
                            row.table
                        )));
                    }
                }
                for value in row.values.values() {
                    if value.is_array() || value.is_object() {
                        return Err(crate::Error::InvalidMigration(format!(
                            "seed row {} in {} has a non-scalar value",
                            row.key, row.table
                        )));
                    }
                }
            }
            ChangeOperation::DeleteSeedRow {
                table, key_column, ..
            } => {
                V::validate_identifier("table", table)?;
                V::validate_identifier("column", key_column)?;
            }
        }
        Ok(())
    }
}

fn validate_column(column: &ColumnDef) -> Result<()> {
    IdentifierValidator::validate_identifier("column", &column.name)?;
    IdentifierValidator::validate_column_type(&column.name, &column.data_type)
}
