use migrun_common::{
    ChangeOperation, ColumnDef, Error, ForeignKeyDef, OnDelete, Result, SeedRow, quote_ident,
};
use migrun_config::ReapplyPolicy;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, warn};

use crate::schema::{self, ColumnInfo, ForeignKeyInfo, IndexInfo, TableSchema};
use crate::store::map_sqlite;

/// Result of applying one change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Nothing to do: the object was already present, or the seed row
    /// existed and was marked skip-if-exists.
    Skipped,
}

/// Translates change operations into SQLite statements.
///
/// The executor never opens transactions itself; callers hand it a
/// connection (usually a `Transaction`) so all operations of a migration
/// commit or roll back together.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeExecutor {
    policy: ReapplyPolicy,
}

impl ChangeExecutor {
    pub fn new(policy: ReapplyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ReapplyPolicy {
        self.policy
    }

    pub fn apply(&self, conn: &Connection, op: &ChangeOperation) -> Result<Outcome> {
        match op {
            ChangeOperation::CreateTable {
                table,
                columns,
                foreign_keys,
            } => self.create_table(conn, table, columns, foreign_keys),
            ChangeOperation::DropTable { table } => drop_table(conn, table),
            ChangeOperation::AddColumn { table, column } => self.add_column(conn, table, column),
            ChangeOperation::DropColumn { table, column } => drop_column(conn, table, column),
            ChangeOperation::AlterColumn {
                table,
                column,
                data_type,
                nullable,
                default,
            } => alter_column(conn, table, column, data_type, *nullable, default.as_deref()),
            ChangeOperation::AddForeignKey {
                table,
                column,
                ref_table,
                ref_column,
                on_delete,
            } => self.add_foreign_key(conn, table, column, ref_table, ref_column, *on_delete),
            ChangeOperation::DropForeignKey {
                table,
                column,
                ref_table,
            } => drop_foreign_key(conn, table, column, ref_table),
            ChangeOperation::CreateIndex {
                table,
                name,
                columns,
                unique,
            } => self.create_index(conn, table, name, columns, *unique),
            ChangeOperation::DropIndex { name } => drop_index(conn, name),
            ChangeOperation::RawStatement { sql } => {
                conn.execute_batch(sql)
                    .map_err(|e| map_sqlite("raw statement failed", e))?;
                Ok(Outcome::Applied)
            }
            ChangeOperation::InsertSeedRow(row) | ChangeOperation::UpdateSeedRow(row) => {
                let skip = op.skip_if_exists().unwrap_or(true);
                upsert_seed_row(conn, row, skip)
            }
            ChangeOperation::DeleteSeedRow {
                table,
                key_column,
                key,
            } => delete_seed_row(conn, table, key_column, key),
        }
    }

    /// An identical object already exists.
    fn already_present(&self, what: String) -> Result<Outcome> {
        match self.policy {
            ReapplyPolicy::Tolerant => {
                warn!("{what} already present, skipping");
                Ok(Outcome::Skipped)
            }
            ReapplyPolicy::Strict => Err(Error::SchemaConflict(format!("{what} already exists"))),
        }
    }

    fn create_table(
        &self,
        conn: &Connection,
        table: &str,
        columns: &[ColumnDef],
        foreign_keys: &[ForeignKeyDef],
    ) -> Result<Outcome> {
        let desired = table_from_defs(table, columns, foreign_keys)?;

        if let Some(existing) = schema::load_table(conn, table)? {
            if existing.same_structure(&desired) {
                return self.already_present(format!("table {table}"));
            }
            return Err(Error::SchemaConflict(format!(
                "table {table} already exists with a different definition"
            )));
        }

        for fk in foreign_keys {
            if !fk.ref_table.eq_ignore_ascii_case(table)
                && !schema::table_exists(conn, &fk.ref_table)?
            {
                return Err(Error::NotFound(format!(
                    "table {} referenced by {table}.{}",
                    fk.ref_table, fk.column
                )));
            }
        }

        conn.execute_batch(&schema::render_create(&desired, table))
            .map_err(|e| map_sqlite(&format!("failed to create table {table}"), e))?;
        debug!("created table {table}");
        Ok(Outcome::Applied)
    }

    fn add_column(&self, conn: &Connection, table: &str, column: &ColumnDef) -> Result<Outcome> {
        let current = require_table(conn, table)?;
        let desired = ColumnInfo::from_def(column, 0);

        if let Some(existing) = current.column(&column.name) {
            if existing.matches(&desired) {
                return self.already_present(format!("column {table}.{}", column.name));
            }
            return Err(Error::SchemaConflict(format!(
                "column {table}.{} already exists as {} {}",
                column.name,
                existing.data_type,
                if existing.not_null { "NOT NULL" } else { "NULL" }
            )));
        }
        if column.primary_key {
            return Err(Error::SchemaConflict(format!(
                "cannot add primary key column {table}.{} to an existing table",
                column.name
            )));
        }

        if adds_in_place(column) {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                schema::render_column(&desired)
            ))
            .map_err(|e| map_sqlite(&format!("failed to add column {table}.{}", column.name), e))?;
            return Ok(Outcome::Applied);
        }

        if column.default.is_none() {
            let rows = schema::row_count(conn, table)?;
            if rows > 0 {
                return Err(Error::DataIntegrityViolation(format!(
                    "cannot add NOT NULL column {table}.{} without a default: table has {rows} rows",
                    column.name
                )));
            }
        }

        let mut target = current.clone();
        target.columns.push(desired);
        schema::rebuild_table(conn, &current, &target)?;
        Ok(Outcome::Applied)
    }

    fn add_foreign_key(
        &self,
        conn: &Connection,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
        on_delete: OnDelete,
    ) -> Result<Outcome> {
        let current = require_table(conn, table)?;
        require_column(&current, column)?;
        let parent = if ref_table.eq_ignore_ascii_case(table) {
            current.clone()
        } else {
            require_table(conn, ref_table)?
        };
        require_column(&parent, ref_column)?;

        if let Some(existing) = current
            .foreign_keys
            .iter()
            .find(|fk| fk.is_on(column, ref_table))
        {
            let same_target = existing.ref_columns.is_empty()
                || (existing.ref_columns.len() == 1
                    && existing.ref_columns[0].eq_ignore_ascii_case(ref_column));
            if same_target && OnDelete::from_sql(&existing.on_delete) == Some(on_delete) {
                return self.already_present(format!("foreign key {table}.{column} -> {ref_table}"));
            }
            return Err(Error::SchemaConflict(format!(
                "foreign key {table}.{column} -> {ref_table} already exists with ON DELETE {}",
                existing.on_delete
            )));
        }

        let orphans: i64 = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {t} WHERE {c} IS NOT NULL AND {c} NOT IN (SELECT {rc} FROM {rt})",
                    t = quote_ident(table),
                    c = quote_ident(column),
                    rc = quote_ident(ref_column),
                    rt = quote_ident(ref_table),
                ),
                [],
                |row| row.get(0),
            )
            .map_err(|e| map_sqlite("failed to check existing references", e))?;
        if orphans > 0 {
            return Err(Error::DataIntegrityViolation(format!(
                "{orphans} rows in {table}.{column} reference missing {ref_table}.{ref_column}"
            )));
        }

        let mut target = current.clone();
        target.foreign_keys.push(ForeignKeyInfo::single(
            column,
            ref_table,
            ref_column,
            on_delete.as_sql(),
        ));
        schema::rebuild_table(conn, &current, &target)?;
        debug!(
            "added foreign key {table}.{column} -> {ref_table}.{ref_column} ON DELETE {}",
            on_delete.as_sql()
        );
        Ok(Outcome::Applied)
    }

    fn create_index(
        &self,
        conn: &Connection,
        table: &str,
        name: &str,
        columns: &[String],
        unique: bool,
    ) -> Result<Outcome> {
        let current = require_table(conn, table)?;
        for column in columns {
            require_column(&current, column)?;
        }

        if let Some((owner, existing)) = schema::find_index(conn, name)? {
            let same = owner.eq_ignore_ascii_case(table)
                && existing.unique == unique
                && existing.columns.len() == columns.len()
                && existing
                    .columns
                    .iter()
                    .zip(columns)
                    .all(|(a, b)| a.eq_ignore_ascii_case(b));
            if same {
                return self.already_present(format!("index {name}"));
            }
            return Err(Error::SchemaConflict(format!(
                "index {name} already exists on {owner} with a different definition"
            )));
        }

        let cols = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE {}INDEX {} ON {} ({cols})",
            if unique { "UNIQUE " } else { "" },
            quote_ident(name),
            quote_ident(table)
        ))
        .map_err(|e| map_sqlite(&format!("failed to create index {name}"), e))?;
        Ok(Outcome::Applied)
    }
}

fn table_from_defs(
    table: &str,
    columns: &[ColumnDef],
    foreign_keys: &[ForeignKeyDef],
) -> Result<TableSchema> {
    let mut pk_position = 0;
    let mut infos = Vec::with_capacity(columns.len());
    for column in columns {
        let pk = if column.primary_key {
            pk_position += 1;
            pk_position
        } else {
            0
        };
        infos.push(ColumnInfo::from_def(column, pk));
    }

    let autoincrement = columns.iter().any(|c| c.autoincrement);
    if autoincrement {
        let single_integer_pk = pk_position == 1
            && columns
                .iter()
                .any(|c| c.autoincrement && c.data_type.eq_ignore_ascii_case("INTEGER"));
        if !single_integer_pk {
            return Err(Error::SchemaConflict(format!(
                "table {table}: AUTOINCREMENT requires a single INTEGER primary key"
            )));
        }
    }

    Ok(TableSchema {
        name: table.to_string(),
        columns: infos,
        foreign_keys: foreign_keys.iter().map(ForeignKeyInfo::from_def).collect(),
        indexes: Vec::new(),
        autoincrement,
        triggers: Vec::new(),
    })
}

/// Whether `op` has to run with foreign key enforcement off. Rebuilds and
/// table drops would otherwise fire `ON DELETE` actions in referencing
/// tables while the parent is replaced or removed.
pub fn suspends_foreign_keys(op: &ChangeOperation) -> bool {
    match op {
        ChangeOperation::AddColumn { column, .. } => !adds_in_place(column),
        ChangeOperation::DropTable { .. }
        | ChangeOperation::DropColumn { .. }
        | ChangeOperation::AlterColumn { .. }
        | ChangeOperation::AddForeignKey { .. }
        | ChangeOperation::DropForeignKey { .. } => true,
        _ => false,
    }
}

/// `ALTER TABLE ... ADD COLUMN` can express the column without a rebuild.
fn adds_in_place(column: &ColumnDef) -> bool {
    match &column.default {
        Some(default) => schema::is_constant_default(default),
        None => column.nullable,
    }
}

fn require_table(conn: &Connection, table: &str) -> Result<TableSchema> {
    schema::load_table(conn, table)?.ok_or_else(|| Error::NotFound(format!("table {table}")))
}

fn require_column<'a>(table: &'a TableSchema, column: &str) -> Result<&'a ColumnInfo> {
    table
        .column(column)
        .ok_or_else(|| Error::NotFound(format!("column {}.{column}", table.name)))
}

fn drop_table(conn: &Connection, table: &str) -> Result<Outcome> {
    require_table(conn, table)?;
    conn.execute_batch(&format!("DROP TABLE {}", quote_ident(table)))
        .map_err(|e| map_sqlite(&format!("failed to drop table {table}"), e))?;
    Ok(Outcome::Applied)
}

fn drop_column(conn: &Connection, table: &str, column: &str) -> Result<Outcome> {
    let current = require_table(conn, table)?;
    let info = require_column(&current, column)?;
    if info.pk > 0 {
        return Err(Error::SchemaConflict(format!(
            "cannot drop primary key column {table}.{column}"
        )));
    }
    if current.columns.len() == 1 {
        return Err(Error::SchemaConflict(format!(
            "cannot drop {table}.{column}: it is the only column"
        )));
    }

    let referenced = current.indexes.iter().any(|idx| idx.covers(column))
        || current.foreign_keys.iter().any(|fk| fk.touches(column));
    if !referenced {
        conn.execute_batch(&format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(table),
            quote_ident(column)
        ))
        .map_err(|e| map_sqlite(&format!("failed to drop column {table}.{column}"), e))?;
        return Ok(Outcome::Applied);
    }

    let target = current.without_column(column);
    schema::rebuild_table(conn, &current, &target)?;
    Ok(Outcome::Applied)
}

fn alter_column(
    conn: &Connection,
    table: &str,
    column: &str,
    data_type: &str,
    nullable: bool,
    default: Option<&str>,
) -> Result<Outcome> {
    let current = require_table(conn, table)?;
    let existing = require_column(&current, column)?;
    let desired = ColumnInfo {
        name: existing.name.clone(),
        data_type: data_type.to_string(),
        not_null: !nullable,
        default: default.map(str::to_string),
        pk: existing.pk,
    };
    if existing.matches(&desired) {
        debug!("column {table}.{column} already has the requested definition");
        return Ok(Outcome::Skipped);
    }

    if !nullable {
        let nulls: i64 = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
                    quote_ident(table),
                    quote_ident(column)
                ),
                [],
                |row| row.get(0),
            )
            .map_err(|e| map_sqlite("failed to count NULLs", e))?;
        if nulls > 0 {
            return Err(Error::DataIntegrityViolation(format!(
                "{table}.{column} has {nulls} NULL values; backfill them before making it NOT NULL"
            )));
        }
    }

    let mut target = current.clone();
    for col in &mut target.columns {
        if col.name.eq_ignore_ascii_case(column) {
            *col = desired.clone();
        }
    }
    schema::rebuild_table(conn, &current, &target)?;
    Ok(Outcome::Applied)
}

fn drop_foreign_key(conn: &Connection, table: &str, column: &str, ref_table: &str) -> Result<Outcome> {
    let current = require_table(conn, table)?;
    if !current.foreign_keys.iter().any(|fk| fk.is_on(column, ref_table)) {
        return Err(Error::NotFound(format!(
            "foreign key {table}.{column} -> {ref_table}"
        )));
    }

    let mut target = current.clone();
    target.foreign_keys.retain(|fk| !fk.is_on(column, ref_table));
    schema::rebuild_table(conn, &current, &target)?;
    Ok(Outcome::Applied)
}

fn drop_index(conn: &Connection, name: &str) -> Result<Outcome> {
    let Some((_, IndexInfo { name, .. })) = schema::find_index(conn, name)? else {
        return Err(Error::NotFound(format!("index {name}")));
    };
    conn.execute_batch(&format!("DROP INDEX {}", quote_ident(&name)))
        .map_err(|e| map_sqlite(&format!("failed to drop index {name}"), e))?;
    Ok(Outcome::Applied)
}

/// Insert or update a reference-data row located by its external key.
fn upsert_seed_row(conn: &Connection, row: &SeedRow, skip_if_exists: bool) -> Result<Outcome> {
    require_table(conn, &row.table)?;
    let table = quote_ident(&row.table);
    let key_column = quote_ident(&row.key_column);

    let existing: Option<i64> = conn
        .query_row(
            &format!("SELECT rowid FROM {table} WHERE {key_column} = ?1"),
            params![row.key],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| map_sqlite(&format!("failed to look up seed row {}", row.key), e))?;

    let values = row
        .values
        .values()
        .map(json_to_sql)
        .collect::<Result<Vec<Value>>>()?;

    match existing {
        None => {
            let mut columns = vec![key_column];
            columns.extend(row.values.keys().map(|c| quote_ident(c)));
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut params = vec![Value::Text(row.key.clone())];
            params.extend(values);

            conn.execute(
                &format!(
                    "INSERT INTO {table} ({}) VALUES ({placeholders})",
                    columns.join(", ")
                ),
                params_from_iter(params),
            )
            .map_err(|e| map_sqlite(&format!("failed to insert seed row {}", row.key), e))?;
            debug!("inserted seed row {} into {}", row.key, row.table);
            Ok(Outcome::Applied)
        }
        Some(_) if skip_if_exists => {
            debug!("seed row {} already in {}, skipping", row.key, row.table);
            Ok(Outcome::Skipped)
        }
        Some(_) if row.values.is_empty() => Ok(Outcome::Skipped),
        Some(rowid) => {
            let assignments = row
                .values
                .keys()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let mut params = values;
            params.push(Value::Integer(rowid));

            conn.execute(
                &format!(
                    "UPDATE {table} SET {assignments} WHERE rowid = ?{}",
                    params.len()
                ),
                params_from_iter(params),
            )
            .map_err(|e| map_sqlite(&format!("failed to update seed row {}", row.key), e))?;
            debug!("updated seed row {} in {}", row.key, row.table);
            Ok(Outcome::Applied)
        }
    }
}

fn delete_seed_row(conn: &Connection, table: &str, key_column: &str, key: &str) -> Result<Outcome> {
    require_table(conn, table)?;
    let deleted = conn
        .execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(table),
                quote_ident(key_column)
            ),
            params![key],
        )
        .map_err(|e| map_sqlite(&format!("failed to delete seed row {key}"), e))?;
    if deleted == 0 {
        return Err(Error::NotFound(format!("seed row {key} in {table}")));
    }
    Ok(Outcome::Applied)
}

fn json_to_sql(value: &serde_json::Value) -> Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => {
            return Err(Error::InvalidMigration(format!(
                "seed values must be scalars, got {other}"
            )));
        }
    })
}
