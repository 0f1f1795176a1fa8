//! Table introspection and the create-copy-drop-rename rebuild SQLite needs
//! for changes `ALTER TABLE` cannot express.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use migrun_common::{ColumnDef, Error, ForeignKeyDef, Result, quote_ident};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::store::map_sqlite;

const REBUILD_PREFIX: &str = "_migrun_rebuild_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position in the primary key, 0 when not part of it.
    pub pk: u32,
}

impl ColumnInfo {
    pub fn from_def(def: &ColumnDef, pk: u32) -> Self {
        Self {
            name: def.name.clone(),
            data_type: def.data_type.clone(),
            not_null: !def.nullable,
            default: def.default.clone(),
            pk,
        }
    }

    /// Same name, type, nullability, default and key position, ignoring
    /// case and whitespace differences SQLite does not preserve.
    pub fn matches(&self, other: &ColumnInfo) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && normalize_type(&self.data_type) == normalize_type(&other.data_type)
            && self.not_null == other.not_null
            && self.pk == other.pk
            && self.default.as_deref().map(normalize_default)
                == other.default.as_deref().map(normalize_default)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    pub columns: Vec<String>,
    pub ref_table: String,
    /// Empty when the key references the parent's primary key implicitly.
    pub ref_columns: Vec<String>,
    pub on_delete: String,
    pub on_update: String,
}

impl ForeignKeyInfo {
    pub fn single(column: &str, ref_table: &str, ref_column: &str, on_delete: &str) -> Self {
        Self {
            columns: vec![column.to_string()],
            ref_table: ref_table.to_string(),
            ref_columns: vec![ref_column.to_string()],
            on_delete: on_delete.to_string(),
            on_update: "NO ACTION".to_string(),
        }
    }

    pub fn from_def(def: &ForeignKeyDef) -> Self {
        Self::single(
            &def.column,
            &def.ref_table,
            &def.ref_column,
            def.on_delete.as_sql(),
        )
    }

    pub fn is_on(&self, column: &str, ref_table: &str) -> bool {
        self.columns.len() == 1
            && self.columns[0].eq_ignore_ascii_case(column)
            && self.ref_table.eq_ignore_ascii_case(ref_table)
    }

    pub fn touches(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// `c` for CREATE INDEX, `u` for a UNIQUE table constraint.
    pub origin: String,
    #[serde(skip)]
    pub sql: Option<String>,
}

impl IndexInfo {
    pub fn covers(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub indexes: Vec<IndexInfo>,
    pub autoincrement: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Remove a column together with every index, unique constraint and
    /// foreign key that depends on it.
    pub fn without_column(&self, name: &str) -> TableSchema {
        let mut next = self.clone();
        next.columns.retain(|c| !c.name.eq_ignore_ascii_case(name));
        next.indexes.retain(|idx| {
            let keep = !idx.covers(name);
            if !keep {
                debug!("dropping index {} that depends on {}.{}", idx.name, self.name, name);
            }
            keep
        });
        next.foreign_keys.retain(|fk| !fk.touches(name));
        next
    }

    /// Structural equality used by the re-apply check for `CreateTable`.
    pub fn same_structure(&self, other: &TableSchema) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.matches(b))
            && sorted_fks(&self.foreign_keys) == sorted_fks(&other.foreign_keys)
    }
}

pub type SchemaSnapshot = BTreeMap<String, TableSchema>;

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![table],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| map_sqlite("failed to look up table", e))?;
    Ok(found.is_some())
}

/// Introspect one table. `None` when it does not exist.
pub fn load_table(conn: &Connection, table: &str) -> Result<Option<TableSchema>> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![table],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| map_sqlite("failed to look up table", e))?;
    let Some((name, create_sql)) = row else {
        return Ok(None);
    };

    let columns = load_columns(conn, &name)?;
    let foreign_keys = load_foreign_keys(conn, &name)?;
    let indexes = load_indexes(conn, &name)?;
    let triggers = query_strings(
        conn,
        "SELECT sql FROM sqlite_master
         WHERE type = 'trigger' AND tbl_name = ?1 COLLATE NOCASE AND sql IS NOT NULL
         ORDER BY name",
        params![name],
    )?;
    let autoincrement = create_sql
        .map(|sql| sql.to_ascii_uppercase().contains("AUTOINCREMENT"))
        .unwrap_or(false);

    Ok(Some(TableSchema {
        name,
        columns,
        foreign_keys,
        indexes,
        autoincrement,
        triggers,
    }))
}

/// Every user table except `exclude`, keyed by name.
pub fn snapshot(conn: &Connection, exclude: &[&str]) -> Result<SchemaSnapshot> {
    let names = query_strings(
        conn,
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
         ORDER BY name",
        [],
    )?;

    let mut out = SchemaSnapshot::new();
    for name in names {
        if exclude.iter().any(|x| x.eq_ignore_ascii_case(&name)) {
            continue;
        }
        if let Some(table) = load_table(conn, &name)? {
            out.insert(name, table);
        }
    }
    Ok(out)
}

/// Owning table and definition of a `CREATE INDEX` index.
pub fn find_index(conn: &Connection, name: &str) -> Result<Option<(String, IndexInfo)>> {
    let table: Option<String> = conn
        .query_row(
            "SELECT tbl_name FROM sqlite_master
             WHERE type = 'index' AND name = ?1 COLLATE NOCASE AND sql IS NOT NULL",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| map_sqlite("failed to look up index", e))?;
    let Some(table) = table else {
        return Ok(None);
    };
    let index = load_indexes(conn, &table)?
        .into_iter()
        .find(|idx| idx.name.eq_ignore_ascii_case(name));
    Ok(index.map(|idx| (table, idx)))
}

pub fn row_count(conn: &Connection, table: &str) -> Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )
    .map_err(|e| map_sqlite("failed to count rows", e))
}

/// One row reported by `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
}

impl fmt::Display for ForeignKeyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rowid {
            Some(rowid) => write!(f, "{} row {rowid} references missing {}", self.table, self.parent),
            None => write!(f, "{} references missing {}", self.table, self.parent),
        }
    }
}

/// Every row in the database violating a foreign key.
pub fn foreign_key_violations(conn: &Connection) -> Result<BTreeSet<ForeignKeyViolation>> {
    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check")
        .map_err(|e| map_sqlite("failed to prepare foreign key check", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
            })
        })
        .map_err(|e| map_sqlite("foreign key check failed", e))?;

    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(row.map_err(|e| map_sqlite("failed to read foreign key check row", e))?);
    }
    Ok(out)
}

pub fn foreign_keys_enabled(conn: &Connection) -> Result<bool> {
    conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i64>(0))
        .map(|v| v != 0)
        .map_err(|e| map_sqlite("failed to read foreign_keys pragma", e))
}

pub fn set_foreign_keys(conn: &Connection, enabled: bool) -> Result<()> {
    let value = if enabled { "ON" } else { "OFF" };
    conn.execute_batch(&format!("PRAGMA foreign_keys = {value}"))
        .map_err(|e| map_sqlite("failed to set foreign_keys pragma", e))
}

/// Render `CREATE TABLE` for `schema` under `name`.
pub fn render_create(schema: &TableSchema, name: &str) -> String {
    let mut pk: Vec<&ColumnInfo> = schema.columns.iter().filter(|c| c.pk > 0).collect();
    pk.sort_by_key(|c| c.pk);
    let inline_pk = pk.len() == 1;

    let mut parts = Vec::new();
    for col in &schema.columns {
        let mut def = render_column(col);
        if inline_pk && col.pk > 0 {
            let (head, tail) = def.split_at(column_head_len(col));
            def = format!(
                "{head} PRIMARY KEY{}{tail}",
                if schema.autoincrement { " AUTOINCREMENT" } else { "" }
            );
        }
        parts.push(def);
    }

    if pk.len() > 1 {
        parts.push(format!("PRIMARY KEY ({})", ident_list(pk.iter().map(|c| &c.name))));
    }
    for idx in schema.indexes.iter().filter(|idx| idx.origin == "u") {
        parts.push(format!("UNIQUE ({})", ident_list(&idx.columns)));
    }
    for fk in &schema.foreign_keys {
        let mut clause = format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            ident_list(&fk.columns),
            quote_ident(&fk.ref_table)
        );
        if !fk.ref_columns.is_empty() {
            clause.push_str(&format!(" ({})", ident_list(&fk.ref_columns)));
        }
        if fk.on_delete != "NO ACTION" {
            clause.push_str(&format!(" ON DELETE {}", fk.on_delete));
        }
        if fk.on_update != "NO ACTION" {
            clause.push_str(&format!(" ON UPDATE {}", fk.on_update));
        }
        parts.push(clause);
    }

    format!(
        "CREATE TABLE {} (\n    {}\n)",
        quote_ident(name),
        parts.join(",\n    ")
    )
}

/// Column definition as it appears in `CREATE TABLE` or `ADD COLUMN`,
/// without key clauses.
pub fn render_column(col: &ColumnInfo) -> String {
    let mut def = quote_ident(&col.name);
    if !col.data_type.is_empty() {
        def.push(' ');
        def.push_str(&col.data_type);
    }
    if col.not_null {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        def.push_str(" DEFAULT ");
        def.push_str(&render_default(default));
    }
    def
}

fn column_head_len(col: &ColumnInfo) -> usize {
    let name = quote_ident(&col.name).len();
    if col.data_type.is_empty() {
        name
    } else {
        name + 1 + col.data_type.len()
    }
}

/// Replace `current` with `target`: create under a temporary name, copy the
/// columns both share, drop the original, rename, then restore explicit
/// indexes and triggers.
///
/// Foreign key enforcement must be off, otherwise dropping the original
/// would fire `ON DELETE` actions in referencing tables. Tables whose
/// definition carries clauses `render_create` cannot reproduce are refused
/// with `SchemaConflict` instead of being silently changed.
pub fn rebuild_table(conn: &Connection, current: &TableSchema, target: &TableSchema) -> Result<()> {
    if foreign_keys_enabled(conn)? {
        return Err(Error::Database(format!(
            "rebuilding {} requires PRAGMA foreign_keys = OFF",
            current.name
        )));
    }
    let blockers = rebuild_blockers(conn, &current.name)?;
    if !blockers.is_empty() {
        return Err(Error::SchemaConflict(format!(
            "table {} uses {} which a rebuild would lose; change it with a raw statement",
            current.name,
            blockers.join(" and ")
        )));
    }

    let tmp = format!("{REBUILD_PREFIX}{}", current.name);
    let shared: Vec<&String> = target
        .columns
        .iter()
        .filter(|c| current.column(&c.name).is_some())
        .map(|c| &c.name)
        .collect();

    debug!("rebuilding table {} via {tmp}", current.name);
    conn.execute_batch("PRAGMA legacy_alter_table = ON")
        .map_err(|e| map_sqlite("failed to enable legacy_alter_table", e))?;

    let result: Result<()> = (|| {
        conn.execute_batch(&render_create(target, &tmp))
            .map_err(|e| map_sqlite(&format!("failed to create replacement for {}", current.name), e))?;
        if !shared.is_empty() {
            let cols = ident_list(shared.iter().copied());
            conn.execute(
                &format!(
                    "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
                    quote_ident(&tmp),
                    quote_ident(&current.name)
                ),
                [],
            )
            .map_err(|e| map_sqlite(&format!("failed to copy rows of {}", current.name), e))?;
        }
        conn.execute_batch(&format!("DROP TABLE {}", quote_ident(&current.name)))
            .map_err(|e| map_sqlite(&format!("failed to drop {}", current.name), e))?;
        conn.execute_batch(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&tmp),
            quote_ident(&current.name)
        ))
        .map_err(|e| map_sqlite(&format!("failed to rename rebuilt {}", current.name), e))?;

        for idx in target.indexes.iter().filter(|idx| idx.origin == "c") {
            if let Some(sql) = &idx.sql {
                conn.execute_batch(sql)
                    .map_err(|e| map_sqlite(&format!("failed to restore index {}", idx.name), e))?;
            }
        }
        for trigger in &target.triggers {
            conn.execute_batch(trigger)
                .map_err(|e| map_sqlite(&format!("failed to restore trigger on {}", current.name), e))?;
        }
        Ok(())
    })();

    let reset = conn
        .execute_batch("PRAGMA legacy_alter_table = OFF")
        .map_err(|e| map_sqlite("failed to reset legacy_alter_table", e));
    result.and(reset)
}

pub fn normalize_type(data_type: &str) -> String {
    data_type
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
        .replace(" (", "(")
        .replace("( ", "(")
        .replace(" )", ")")
        .replace(" ,", ",")
        .replace(", ", ",")
}

pub fn normalize_default(expr: &str) -> String {
    let mut s = expr.trim();
    while s.starts_with('(') && s.ends_with(')') && balanced(&s[1..s.len() - 1]) {
        s = s[1..s.len() - 1].trim();
    }
    s.to_string()
}

/// Whether SQLite accepts this default in `ALTER TABLE ... ADD COLUMN`.
pub fn is_constant_default(expr: &str) -> bool {
    let s = normalize_default(expr);
    let upper = s.to_ascii_uppercase();
    matches!(upper.as_str(), "NULL" | "TRUE" | "FALSE")
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
        || NUMERIC_LITERAL.is_match(&s)
        || ((upper.starts_with("X'")) && s.ends_with('\''))
}

static NUMERIC_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?|0[xX][0-9A-Fa-f]+)$")
        .expect("numeric literal pattern")
});

static LOSSY_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(CHECK|COLLATE)\b").expect("clause pattern"));

/// Parts of a table's definition that `render_create` does not carry over:
/// CHECK constraints, COLLATE clauses and generated columns.
fn rebuild_blockers(conn: &Connection, table: &str) -> Result<Vec<&'static str>> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![table],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| map_sqlite("failed to read table definition", e))?
        .flatten();

    let mut found = Vec::new();
    if let Some(sql) = sql {
        let bare = strip_quoted(&sql);
        for caps in LOSSY_CLAUSE.captures_iter(&bare) {
            let clause = if caps[1].eq_ignore_ascii_case("CHECK") {
                "CHECK constraints"
            } else {
                "COLLATE clauses"
            };
            if !found.contains(&clause) {
                found.push(clause);
            }
        }
    }

    let generated: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_xinfo(?1) WHERE hidden IN (2, 3)",
            params![table],
            |row| row.get(0),
        )
        .map_err(|e| map_sqlite("failed to read hidden columns", e))?;
    if generated > 0 {
        found.push("generated columns");
    }
    Ok(found)
}

/// `sql` with string literals, quoted identifiers and comments blanked out.
fn strip_quoted(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        let close = match ch {
            '\'' | '"' | '`' => ch,
            '[' => ']',
            '-' if chars.peek() == Some(&'-') => '\n',
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
                continue;
            }
            _ => {
                out.push(ch);
                continue;
            }
        };
        for c in chars.by_ref() {
            if c == close {
                break;
            }
        }
        out.push(' ');
    }
    out
}

fn render_default(expr: &str) -> String {
    let upper = expr.trim().to_ascii_uppercase();
    if expr.trim().starts_with('(')
        || is_constant_default(expr)
        || matches!(
            upper.as_str(),
            "CURRENT_TIME" | "CURRENT_DATE" | "CURRENT_TIMESTAMP"
        )
    {
        expr.trim().to_string()
    } else {
        format!("({})", expr.trim())
    }
}

fn balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for ch in s.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn ident_list<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> String {
    names
        .into_iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn sorted_fks(fks: &[ForeignKeyInfo]) -> Vec<ForeignKeyInfo> {
    let mut out: Vec<ForeignKeyInfo> = fks
        .iter()
        .map(|fk| ForeignKeyInfo {
            columns: fk.columns.iter().map(|c| c.to_ascii_lowercase()).collect(),
            ref_table: fk.ref_table.to_ascii_lowercase(),
            ref_columns: fk.ref_columns.iter().map(|c| c.to_ascii_lowercase()).collect(),
            on_delete: fk.on_delete.to_ascii_uppercase(),
            on_update: fk.on_update.to_ascii_uppercase(),
        })
        .collect();
    out.sort_by(|a, b| (&a.columns, &a.ref_table).cmp(&(&b.columns, &b.ref_table)));
    out
}

fn query_strings(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| map_sqlite("failed to prepare schema query", e))?;
    let rows = stmt
        .query_map(args, |row| row.get::<_, String>(0))
        .map_err(|e| map_sqlite("schema query failed", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| map_sqlite("failed to read schema row", e))
}

fn load_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare(r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#)
        .map_err(|e| map_sqlite("failed to prepare table_info", e))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                data_type: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                default: row.get(3)?,
                pk: row.get::<_, i64>(4)? as u32,
            })
        })
        .map_err(|e| map_sqlite("table_info failed", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| map_sqlite("failed to read column", e))
}

fn load_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKeyInfo>> {
    let mut stmt = conn
        .prepare(
            r#"SELECT id, "table", "from", "to", on_update, on_delete
               FROM pragma_foreign_key_list(?1) ORDER BY id, seq"#,
        )
        .map_err(|e| map_sqlite("failed to prepare foreign_key_list", e))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(|e| map_sqlite("foreign_key_list failed", e))?;

    let mut grouped: BTreeMap<i64, (ForeignKeyInfo, bool)> = BTreeMap::new();
    for row in rows {
        let (id, ref_table, from, to, on_update, on_delete) =
            row.map_err(|e| map_sqlite("failed to read foreign key", e))?;
        let (fk, implicit) = grouped.entry(id).or_insert_with(|| {
            (
                ForeignKeyInfo {
                    columns: Vec::new(),
                    ref_table,
                    ref_columns: Vec::new(),
                    on_delete,
                    on_update,
                },
                false,
            )
        });
        fk.columns.push(from);
        match to {
            Some(to) => fk.ref_columns.push(to),
            None => *implicit = true,
        }
    }

    let mut fks: Vec<ForeignKeyInfo> = grouped
        .into_values()
        .map(|(mut fk, implicit)| {
            if implicit {
                fk.ref_columns.clear();
            }
            fk
        })
        .collect();
    fks.sort_by(|a, b| (&a.columns, &a.ref_table).cmp(&(&b.columns, &b.ref_table)));
    Ok(fks)
}

fn load_indexes(conn: &Connection, table: &str) -> Result<Vec<IndexInfo>> {
    let mut stmt = conn
        .prepare(r#"SELECT name, "unique", origin FROM pragma_index_list(?1)"#)
        .map_err(|e| map_sqlite("failed to prepare index_list", e))?;
    let listed = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(|e| map_sqlite("index_list failed", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| map_sqlite("failed to read index", e))?;

    let mut indexes = Vec::new();
    for (name, unique, origin) in listed {
        if origin == "pk" {
            continue;
        }
        let columns = query_strings(
            conn,
            "SELECT name FROM pragma_index_info(?1) ORDER BY seqno",
            params![name],
        )?;
        let sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| map_sqlite("failed to read index sql", e))?
            .flatten();
        // Autoindex names follow the table name, which a rebuild changes.
        let name = if origin == "c" {
            name
        } else {
            format!("unique({})", columns.join(","))
        };
        indexes.push(IndexInfo {
            name,
            columns,
            unique,
            origin,
            sql,
        });
    }
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE campus (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE);
             CREATE TABLE person (
                 id INTEGER PRIMARY KEY,
                 email TEXT NOT NULL DEFAULT '',
                 campus_id INTEGER REFERENCES campus (id) ON DELETE SET NULL
             );
             CREATE INDEX ix_person_email ON person (email);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn loads_columns_keys_and_indexes() {
        let conn = conn();
        let person = load_table(&conn, "person").unwrap().unwrap();

        assert_eq!(person.columns.len(), 3);
        assert_eq!(person.columns[0].pk, 1);
        assert_eq!(person.columns[1].default.as_deref(), Some("''"));
        assert!(person.columns[1].not_null);
        assert_eq!(
            person.foreign_keys,
            vec![ForeignKeyInfo::single("campus_id", "campus", "id", "SET NULL")]
        );
        assert_eq!(person.indexes.len(), 1);
        assert_eq!(person.indexes[0].name, "ix_person_email");

        let campus = load_table(&conn, "CAMPUS").unwrap().unwrap();
        assert!(campus.autoincrement);
        assert_eq!(campus.indexes[0].origin, "u");
        assert!(load_table(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn rebuild_preserves_structure_and_rows() {
        let conn = conn();
        conn.execute_batch(
            "INSERT INTO campus (name) VALUES ('Main');
             INSERT INTO person (email, campus_id) VALUES ('a@example.com', 1);
             PRAGMA foreign_keys = OFF;",
        )
        .unwrap();

        let before = load_table(&conn, "person").unwrap().unwrap();
        rebuild_table(&conn, &before, &before).unwrap();
        let after = load_table(&conn, "person").unwrap().unwrap();
        assert_eq!(before, after);

        let campus = load_table(&conn, "campus").unwrap().unwrap();
        rebuild_table(&conn, &campus, &campus).unwrap();
        assert_eq!(load_table(&conn, "campus").unwrap().unwrap(), campus);

        let email: String = conn
            .query_row("SELECT email FROM person WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(email, "a@example.com");
    }

    #[test]
    fn rebuild_refuses_while_foreign_keys_enforced() {
        let conn = conn();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        let person = load_table(&conn, "person").unwrap().unwrap();
        assert!(rebuild_table(&conn, &person, &person).is_err());
    }

    #[test]
    fn without_column_drops_dependents() {
        let conn = conn();
        let person = load_table(&conn, "person").unwrap().unwrap();

        let trimmed = person.without_column("email");
        assert!(trimmed.column("email").is_none());
        assert!(trimmed.indexes.is_empty());

        let trimmed = person.without_column("campus_id");
        assert!(trimmed.foreign_keys.is_empty());
    }

    #[test]
    fn normalizes_types_and_defaults() {
        assert_eq!(normalize_type("decimal( 18 , 2 )"), "DECIMAL(18,2)");
        assert_eq!(normalize_type("varchar  (100)"), "VARCHAR(100)");
        assert_eq!(normalize_default("((0))"), "0");
        assert_eq!(normalize_default("(a) + (b)"), "(a) + (b)");
        assert!(is_constant_default("'active'"));
        assert!(is_constant_default("-1.5"));
        assert!(!is_constant_default("CURRENT_TIMESTAMP"));
        assert!(!is_constant_default("(datetime('now'))"));
    }

    #[test]
    fn reports_foreign_key_violations() {
        let conn = conn();
        conn.execute_batch(
            "PRAGMA foreign_keys = OFF;
             INSERT INTO person (email, campus_id) VALUES ('x', 99);",
        )
        .unwrap();
        let violations = foreign_key_violations(&conn).unwrap();
        assert_eq!(violations.len(), 1);
        let violation = violations.iter().next().unwrap();
        assert_eq!(violation.parent, "campus");
        assert!(violation.to_string().contains("references missing campus"));
    }

    #[test]
    fn rebuild_refuses_clauses_it_cannot_reproduce() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE member (
                 id INTEGER PRIMARY KEY,
                 age INTEGER CHECK (age >= 0),
                 name TEXT COLLATE NOCASE
             );
             CREATE TABLE badge (
                 id INTEGER PRIMARY KEY,
                 code TEXT,
                 upper_code TEXT GENERATED ALWAYS AS (upper(code)) VIRTUAL
             );
             CREATE TABLE note (id INTEGER PRIMARY KEY, \"check\" TEXT DEFAULT 'COLLATE');",
        )
        .unwrap();

        let member = load_table(&conn, "member").unwrap().unwrap();
        let err = rebuild_table(&conn, &member, &member.without_column("name")).unwrap_err();
        match err {
            Error::SchemaConflict(msg) => {
                assert!(msg.contains("CHECK constraints"), "{msg}");
                assert!(msg.contains("COLLATE clauses"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let sql: String = conn
            .query_row("SELECT sql FROM sqlite_master WHERE name = 'member'", [], |r| r.get(0))
            .unwrap();
        assert!(sql.contains("CHECK (age >= 0)"));

        let badge = load_table(&conn, "badge").unwrap().unwrap();
        let err = rebuild_table(&conn, &badge, &badge).unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(ref msg) if msg.contains("generated columns")));

        // Keywords inside identifiers and literals do not count.
        let note = load_table(&conn, "note").unwrap().unwrap();
        rebuild_table(&conn, &note, &note).unwrap();
    }

    #[test]
    fn only_numeric_literals_count_as_constant_defaults() {
        for ok in ["0", "42", "-1", "+3.", ".5", "1e10", "2.5E-3", "0x1F"] {
            assert!(is_constant_default(ok), "{ok}");
        }
        for bad in ["inf", "-infinity", "NaN", "1e", "0x", "1.2.3", "--1"] {
            assert!(!is_constant_default(bad), "{bad}");
        }
    }
}
