pub mod adapter;
pub mod gateway;
pub mod migrations;
pub mod migrator;
pub mod queries;
pub mod query;
pub mod schema;

use anyhow::{Context, Result, bail};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode, Transaction, params_from_iter};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub use gateway::Gateway;

/// One result row, keyed by column name in the order the engine declared them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|index| &self.values[index])
    }

    /// Value of the `occurrence`-th column (0-based) named `column`; joins repeat names.
    pub fn get_nth(&self, column: &str, occurrence: usize) -> Option<&Value> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, name)| *name == column)
            .nth(occurrence)
            .map(|(index, _)| &self.values[index])
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Wal,
    Delete,
    Truncate,
    Memory,
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
            Self::Truncate => "truncate",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

impl FromStr for JournalMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "wal" => Ok(Self::Wal),
            "delete" => Ok(Self::Delete),
            "truncate" => Ok(Self::Truncate),
            "memory" => Ok(Self::Memory),
            other => bail!("Unsupported journal mode: {other}. Expected wal|delete|truncate|memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub busy_timeout: Duration,
    pub journal_mode: JournalMode,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
            journal_mode: JournalMode::Wal,
        }
    }
}

/// Single owned handle to the embedded store.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path, options: &DatabaseOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create DB directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite DB: {}", path.display()))?;

        let database = Self { conn };
        database.configure(options, true)?;

        Ok(database)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory database")?;

        let database = Self { conn };
        database.configure(&DatabaseOptions::default(), false)?;

        Ok(database)
    }

    fn configure(&self, options: &DatabaseOptions, file_backed: bool) -> Result<()> {
        self.conn
            .busy_timeout(options.busy_timeout)
            .context("Failed to set busy timeout")?;

        if file_backed {
            let _: String = self
                .conn
                .query_row(
                    &format!("PRAGMA journal_mode={}", options.journal_mode),
                    [],
                    |row| row.get(0),
                )
                .context("Failed to set journal mode")?;
        }

        self.conn
            .execute_batch("PRAGMA foreign_keys=ON")
            .context("Failed to enable foreign keys")?;

        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Runs one statement in its own implicit transaction.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        query_rows(&self.conn, sql, params)
    }

    /// Runs `work` inside one explicit transaction. Any error rolls back everything `work` did.
    pub fn transaction<T>(&mut self, work: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let transaction = self
            .conn
            .transaction()
            .context("Failed to start transaction")?;

        let value = work(&transaction)?;

        transaction
            .commit()
            .context("Failed to commit transaction")?;
        Ok(value)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to check table existence: {table}"))?;

        Ok(count > 0)
    }

    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, error)| error)
            .context("Failed to close database")
    }
}

/// Executes `sql` on any connection (or transaction) and collects the rows it yields.
pub fn query_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
    let mut statement = conn
        .prepare(sql)
        .with_context(|| format!("Failed to prepare SQL: {sql}"))?;

    let columns = statement
        .column_names()
        .into_iter()
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();

    let mut rows = statement
        .query(params_from_iter(params.iter()))
        .with_context(|| format!("Failed to execute SQL: {sql}"))?;

    let mut collected = Vec::new();
    while let Some(row) = rows
        .next()
        .with_context(|| format!("Failed to execute SQL: {sql}"))?
    {
        let values = (0..columns.len())
            .map(|index| row.get_ref(index).map(sql_to_json))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        collected.push(Row::new(columns.clone(), values));
    }

    Ok(collected)
}

pub fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().copied().map(Value::from).collect()),
    }
}

pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

pub fn is_constraint_violation(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_keep_declaration_order() {
        let database = Database::open_in_memory().expect("open");
        database
            .query("CREATE TABLE t (b TEXT, a INTEGER)", &[])
            .expect("create");
        database
            .query(
                "INSERT INTO t (a, b) VALUES (?1, ?2)",
                &[SqlValue::Integer(7), SqlValue::Text("x".to_string())],
            )
            .expect("insert");

        let rows = database.query("SELECT * FROM t", &[]).expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns(), ["b", "a"]);
        assert_eq!(rows[0].clone().into_values(), vec![json!("x"), json!(7)]);
        assert_eq!(rows[0].get("a"), Some(&json!(7)));
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let mut database = Database::open_in_memory().expect("open");
        database
            .query("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .expect("create");

        let result = database.transaction(|tx| {
            query_rows(tx, "INSERT INTO t (id) VALUES (1)", &[])?;
            query_rows(tx, "INSERT INTO missing (id) VALUES (1)", &[])?;
            Ok(())
        });
        assert!(result.is_err());

        let rows = database.query("SELECT id FROM t", &[]).expect("select");
        assert!(rows.is_empty());
    }

    #[test]
    fn unique_failure_is_classified_as_constraint_violation() {
        let database = Database::open_in_memory().expect("open");
        database
            .query("CREATE TABLE t (email TEXT UNIQUE)", &[])
            .expect("create");
        database
            .query("INSERT INTO t (email) VALUES ('a@b.c')", &[])
            .expect("first insert");

        let error = database
            .query("INSERT INTO t (email) VALUES ('a@b.c')", &[])
            .expect_err("duplicate must fail");
        assert!(is_constraint_violation(&error));

        let other = database
            .query("SELECT nope FROM t", &[])
            .expect_err("bad column");
        assert!(!is_constraint_violation(&other));
    }

    #[test]
    fn json_params_bind_as_sql_values() {
        assert_eq!(json_to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(json_to_sql(&json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(
            json_to_sql(&json!(["mon", "wed"])),
            SqlValue::Text("[\"mon\",\"wed\"]".to_string())
        );
    }

    #[test]
    fn file_database_reports_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.db");
        let database = Database::open(&path, &DatabaseOptions::default()).expect("open");

        database
            .query("CREATE TABLE habits (id INTEGER PRIMARY KEY)", &[])
            .expect("create");
        assert!(database.table_exists("habits").expect("exists"));
        assert!(!database.table_exists("users").expect("exists"));
        database.close().expect("close");
        assert!(path.exists());
    }

    #[test]
    fn journal_mode_parses_case_insensitively() {
        assert_eq!("WAL".parse::<JournalMode>().expect("parse"), JournalMode::Wal);
        assert!("fast".parse::<JournalMode>().is_err());
    }
}
