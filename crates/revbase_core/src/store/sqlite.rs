//! SQLite backend.
//!
//! # Responsibility
//! - Map collection, history and audit tables onto SQL tables.
//! - Translate filters to SQL (`json_extract` for dotted dict paths).
//! - Keep named sequences in `_sequences`, incremented inside the caller's
//!   `IMMEDIATE` transaction.
//!
//! # Invariants
//! - Every write runs inside `Backend::transaction`; the write lock taken by
//!   `BEGIN IMMEDIATE` serializes writers across connections and processes.
//! - Dict and list values are stored as canonical JSON text.
//! - Unique violations surface as `CoreError::AlreadyExists` with the
//!   offending row.

use crate::db::{open_db, open_db_in_memory};
use crate::error::{CoreError, CoreResult};
use crate::model::filter::{Condition, Filter, Query};
use crate::model::record::{Record, Value, UNBOUNDED, VALID_SINCE, VALID_UNTIL};
use crate::model::schema::{is_identifier, CollectionSchema, FieldKind};
use crate::store::{Backend, CatalogEntry, ColumnDef, RowOrder, StoreTx, TableDef, UniqueScope};
use log::debug;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::path::Path;

/// SQLite-backed storage for one database file (or private memory DB).
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens (and migrates) a database file.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> CoreResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wraps a connection returned by `open_db`/`open_db_in_memory`.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn ensure_table(&self, table: &TableDef) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(&create_table_sql(table))?;
        tx.commit()?;
        debug!(
            "event=table_ready module=store backend=sqlite table={}",
            table.name
        );
        Ok(())
    }

    fn register(&self, entry: &CatalogEntry) -> CoreResult<()> {
        let schema_json = entry.schema.to_json()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT schema_json, versioned FROM _collections WHERE name = ?1;",
                [entry.name()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        match existing {
            Some((stored_json, versioned)) => {
                let stored = CollectionSchema::from_json(&stored_json)?;
                if stored != entry.schema || (versioned != 0) != entry.versioned {
                    return Err(CoreError::Schema(format!(
                        "collection `{}` is already registered with a different layout",
                        entry.name()
                    )));
                }
                tx.execute(
                    "UPDATE _collections SET audited = ?2 WHERE name = ?1;",
                    params![entry.name(), bool_to_int(entry.audited)],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO _collections (name, versioned, audited, schema_json)
                     VALUES (?1, ?2, ?3, ?4);",
                    params![
                        entry.name(),
                        bool_to_int(entry.versioned),
                        bool_to_int(entry.audited),
                        schema_json,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn catalog(&self) -> CoreResult<Vec<CatalogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT schema_json, versioned, audited FROM _collections ORDER BY name ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let schema_json: String = row.get(0)?;
            entries.push(CatalogEntry {
                schema: CollectionSchema::from_json(&schema_json)?,
                versioned: row.get::<_, i64>(1)? != 0,
                audited: row.get::<_, i64>(2)? != 0,
            });
        }
        Ok(entries)
    }

    fn read(&self, table: &TableDef, query: &Query, order: RowOrder) -> CoreResult<Vec<Record>> {
        let conn = self.conn.lock();
        select_rows(&conn, table, &query.filter, order, query.limit, query.offset)
    }

    fn current_sequence(&self, name: &str) -> CoreResult<i64> {
        let conn = self.conn.lock();
        read_sequence(&conn, name)
    }

    fn transaction<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> CoreResult<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut store_tx = SqliteTx { conn: &tx };
        // Dropping `tx` on the error path rolls everything back.
        let value = work(&mut store_tx)?;
        tx.commit()?;
        Ok(value)
    }
}

struct SqliteTx<'c> {
    conn: &'c Connection,
}

impl StoreTx for SqliteTx<'_> {
    fn select(&self, table: &TableDef, filter: &Filter) -> CoreResult<Vec<Record>> {
        select_rows(self.conn, table, filter, RowOrder::Insertion, None, 0)
    }

    fn insert(&mut self, table: &TableDef, row: &Record) -> CoreResult<()> {
        let names = table
            .columns
            .iter()
            .map(|column| quote(&column.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; table.columns.len()].join(", ");
        let values = table
            .columns
            .iter()
            .map(|column| to_sql(row.get(&column.name).unwrap_or(&Value::Null)))
            .collect::<CoreResult<Vec<_>>>()?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} ({names}) VALUES ({placeholders});",
                    quote(&table.name)
                ),
                params_from_iter(values),
            )
            .map_err(|err| conflict_or(err, row))?;
        Ok(())
    }

    fn update(&mut self, table: &TableDef, filter: &Filter, changes: &Record) -> CoreResult<usize> {
        let mut assignments = Vec::new();
        let mut binds = Vec::new();
        for column in &table.columns {
            if let Some(value) = changes.get(&column.name) {
                assignments.push(format!("{} = ?", quote(&column.name)));
                binds.push(to_sql(value)?);
            }
        }
        if assignments.is_empty() {
            return Ok(self.select(table, filter)?.len());
        }

        let where_sql = where_clause(table, filter, &mut binds)?;
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET {} WHERE {where_sql};",
                    quote(&table.name),
                    assignments.join(", ")
                ),
                params_from_iter(binds),
            )
            .map_err(|err| conflict_or(err, changes))?;
        Ok(changed)
    }

    fn delete(&mut self, table: &TableDef, filter: &Filter) -> CoreResult<usize> {
        let mut binds = Vec::new();
        let where_sql = where_clause(table, filter, &mut binds)?;
        let removed = self.conn.execute(
            &format!("DELETE FROM {} WHERE {where_sql};", quote(&table.name)),
            params_from_iter(binds),
        )?;
        Ok(removed)
    }

    fn max_integer(&self, table: &TableDef, column: &str) -> CoreResult<Option<i64>> {
        if table.column(column).is_none() {
            return Err(unknown_column(table, column));
        }
        let max = self.conn.query_row(
            &format!("SELECT MAX({}) FROM {};", quote(column), quote(&table.name)),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(max)
    }

    fn next_sequence(&mut self, name: &str) -> CoreResult<i64> {
        let value = self.conn.query_row(
            "INSERT INTO _sequences (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value;",
            [name],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(value)
    }

    fn current_sequence(&self, name: &str) -> CoreResult<i64> {
        read_sequence(self.conn, name)
    }
}

fn read_sequence(conn: &Connection, name: &str) -> CoreResult<i64> {
    let value = conn
        .query_row(
            "SELECT value FROM _sequences WHERE name = ?1;",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0))
}

fn create_table_sql(table: &TableDef) -> String {
    let columns = table
        .columns
        .iter()
        .map(|column| format!("{} {}", quote(&column.name), sql_type(&column.kind)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({columns});",
        quote(&table.name)
    );

    let scope = match table.unique_scope {
        UniqueScope::AllRows => String::new(),
        UniqueScope::CurrentRows => format!(" WHERE {} = {UNBOUNDED}", quote(VALID_UNTIL)),
    };
    for (index, key) in table.unique_keys.iter().enumerate() {
        let key_columns = key
            .iter()
            .map(|column| quote(column))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({key_columns}){scope};",
            quote(&format!("ux_{}_{index}", table.name)),
            quote(&table.name),
        ));
    }
    if table.column(VALID_UNTIL).is_some() {
        sql.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({});",
            quote(&format!("ix_{}_current", table.name)),
            quote(&table.name),
            quote(VALID_UNTIL),
        ));
    }
    sql
}

fn sql_type(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Integer | FieldKind::Boolean => "INTEGER",
        FieldKind::Float => "REAL",
        FieldKind::Text
        | FieldKind::Enum { .. }
        | FieldKind::Dict { .. }
        | FieldKind::List { .. } => "TEXT",
    }
}

fn select_rows(
    conn: &Connection,
    table: &TableDef,
    filter: &Filter,
    order: RowOrder,
    limit: Option<u32>,
    offset: u32,
) -> CoreResult<Vec<Record>> {
    let mut binds = Vec::new();
    let where_sql = where_clause(table, filter, &mut binds)?;
    let columns = table
        .columns
        .iter()
        .map(|column| quote(&column.name))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "SELECT {columns} FROM {} WHERE {where_sql}",
        quote(&table.name)
    );

    match order {
        RowOrder::NewestRevisionFirst if table.column(VALID_SINCE).is_some() => {
            sql.push_str(&format!(" ORDER BY {} DESC, rowid ASC", quote(VALID_SINCE)));
        }
        _ => sql.push_str(" ORDER BY rowid ASC"),
    }

    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        binds.push(SqlValue::Integer(i64::from(limit)));
        if offset > 0 {
            sql.push_str(" OFFSET ?");
            binds.push(SqlValue::Integer(i64::from(offset)));
        }
    } else if offset > 0 {
        sql.push_str(" LIMIT -1 OFFSET ?");
        binds.push(SqlValue::Integer(i64::from(offset)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(binds))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(parse_row(table, row)?);
    }
    Ok(records)
}

fn where_clause(
    table: &TableDef,
    filter: &Filter,
    binds: &mut Vec<SqlValue>,
) -> CoreResult<String> {
    let mut clauses = vec!["1 = 1".to_string()];

    for (path, condition) in filter.conditions() {
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        if table.column(head).is_none() {
            return Err(unknown_column(table, path));
        }
        let expr = if rest.is_empty() {
            quote(head)
        } else {
            if !rest.split('.').all(is_identifier) {
                return Err(unknown_column(table, path));
            }
            format!("json_extract({}, '$.{rest}')", quote(head))
        };

        let values = condition.values();
        let has_null = values.iter().any(Value::is_null);
        let present: Vec<&Value> = values.iter().filter(|value| !value.is_null()).collect();
        let mut alternatives = Vec::new();
        match (condition, present.len()) {
            (_, 0) => {}
            (Condition::Eq(_), _) => alternatives.push(format!("{expr} = ?")),
            (Condition::AnyOf(_), count) => {
                alternatives.push(format!("{expr} IN ({})", vec!["?"; count].join(", ")));
            }
        }
        for value in present {
            binds.push(to_sql(value)?);
        }
        if has_null {
            alternatives.push(format!("{expr} IS NULL"));
        }

        if alternatives.is_empty() {
            clauses.push("0 = 1".to_string());
        } else {
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }
    }

    Ok(clauses.join(" AND "))
}

fn to_sql(value: &Value) -> CoreResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(bool_to_int(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(serde_json::to_string(value)?),
    })
}

fn parse_row(table: &TableDef, row: &Row<'_>) -> CoreResult<Record> {
    let mut record = Record::new();
    for (index, column) in table.columns.iter().enumerate() {
        let value = from_sql(table, column, row.get_ref(index)?)?;
        record.insert(column.name.clone(), value);
    }
    Ok(record)
}

fn from_sql(table: &TableDef, column: &ColumnDef, value: ValueRef<'_>) -> CoreResult<Value> {
    let invalid = || {
        CoreError::InvalidData(format!(
            "unexpected {:?} value in {}.{}",
            value.data_type(),
            table.name,
            column.name
        ))
    };

    Ok(match (&column.kind, value) {
        (_, ValueRef::Null) => Value::Null,
        (FieldKind::Integer, ValueRef::Integer(integer)) => Value::from(integer),
        (FieldKind::Float, ValueRef::Real(real)) => Value::from(real),
        (FieldKind::Float, ValueRef::Integer(integer)) => Value::from(integer as f64),
        (FieldKind::Boolean, ValueRef::Integer(integer)) => Value::Bool(integer != 0),
        (FieldKind::Text | FieldKind::Enum { .. }, ValueRef::Text(bytes)) => {
            Value::from(std::str::from_utf8(bytes).map_err(|_| invalid())?)
        }
        (FieldKind::Dict { .. } | FieldKind::List { .. }, ValueRef::Text(bytes)) => {
            serde_json::from_slice(bytes)?
        }
        _ => return Err(invalid()),
    })
}

fn conflict_or(err: rusqlite::Error, payload: &Record) -> CoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            CoreError::AlreadyExists {
                payload: payload.clone(),
            }
        }
        _ => err.into(),
    }
}

fn unknown_column(table: &TableDef, path: &str) -> CoreError {
    CoreError::Schema(format!("unknown column `{path}` in table `{}`", table.name))
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
