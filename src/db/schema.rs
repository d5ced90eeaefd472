use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Integer,
    Real,
    Text,
    Boolean,
    /// Unix seconds.
    Timestamp,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultValue {
    Now,
    Bool(bool),
    Int(i64),
}

impl DefaultValue {
    pub fn produce(self) -> SqlValue {
        match self {
            Self::Now => SqlValue::Integer(Utc::now().timestamp()),
            Self::Bool(flag) => SqlValue::Integer(i64::from(flag)),
            Self::Int(number) => SqlValue::Integer(number),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: &'static str,
    pub column: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub storage: Storage,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub default: Option<DefaultValue>,
    pub references: Option<ForeignKey>,
}

impl ColumnDef {
    const fn new(name: &'static str, storage: Storage) -> Self {
        Self {
            name,
            storage,
            nullable: false,
            primary_key: false,
            unique: false,
            default: None,
            references: None,
        }
    }

    const fn id() -> Self {
        let mut column = Self::new("id", Storage::Integer);
        column.primary_key = true;
        column
    }

    const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    const fn default(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    const fn references(mut self, table: &'static str, column: &'static str) -> Self {
        self.references = Some(ForeignKey { table, column });
        self
    }

    pub fn decode(&self, raw: Value) -> Value {
        match (self.storage, raw) {
            (Storage::Boolean, Value::Number(number)) => {
                Value::Bool(number.as_i64().is_some_and(|value| value != 0))
            }
            (Storage::Json, Value::String(text)) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            (_, other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub unique_together: &'static [&'static [&'static str]],
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|column| column.name).collect()
    }

    pub fn decode_row(&self, columns: &[String], values: Vec<Value>) -> Map<String, Value> {
        columns
            .iter()
            .zip(values)
            .map(|(name, raw)| {
                let value = match self.column(name) {
                    Some(column) => column.decode(raw),
                    None => raw,
                };
                (name.clone(), value)
            })
            .collect()
    }
}

pub const USERS: TableDef = TableDef {
    name: "users",
    columns: &[
        ColumnDef::id(),
        ColumnDef::new("name", Storage::Text),
        ColumnDef::new("email", Storage::Text).unique(),
        ColumnDef::new("password", Storage::Text),
        ColumnDef::new("profile_image", Storage::Text).nullable(),
        ColumnDef::new("created_at", Storage::Timestamp).default(DefaultValue::Now),
        ColumnDef::new("updated_at", Storage::Timestamp).default(DefaultValue::Now),
    ],
    unique_together: &[],
};

pub const HABITS: TableDef = TableDef {
    name: "habits",
    columns: &[
        ColumnDef::id(),
        ColumnDef::new("user_id", Storage::Integer).references("users", "id"),
        ColumnDef::new("title", Storage::Text),
        ColumnDef::new("description", Storage::Text).nullable(),
        ColumnDef::new("habit_type", Storage::Text),
        ColumnDef::new("target_value", Storage::Integer).nullable(),
        ColumnDef::new("is_active", Storage::Boolean).default(DefaultValue::Bool(true)),
        ColumnDef::new("created_at", Storage::Timestamp).default(DefaultValue::Now),
        ColumnDef::new("updated_at", Storage::Timestamp).default(DefaultValue::Now),
    ],
    unique_together: &[],
};

pub const HABIT_SCHEDULES: TableDef = TableDef {
    name: "habit_schedules",
    columns: &[
        ColumnDef::id(),
        ColumnDef::new("habit_id", Storage::Integer).references("habits", "id"),
        ColumnDef::new("frequency", Storage::Text),
        ColumnDef::new("days", Storage::Json).nullable(),
        ColumnDef::new("start_date", Storage::Timestamp),
        ColumnDef::new("end_date", Storage::Timestamp).nullable(),
        ColumnDef::new("created_at", Storage::Timestamp).default(DefaultValue::Now),
    ],
    unique_together: &[],
};

pub const HABIT_LOGS: TableDef = TableDef {
    name: "habit_logs",
    columns: &[
        ColumnDef::id(),
        ColumnDef::new("habit_id", Storage::Integer).references("habits", "id"),
        ColumnDef::new("log_date", Storage::Timestamp),
        ColumnDef::new("value", Storage::Real).nullable(),
        ColumnDef::new("is_completed", Storage::Boolean).default(DefaultValue::Bool(false)),
        ColumnDef::new("created_at", Storage::Timestamp).default(DefaultValue::Now),
    ],
    unique_together: &[&["habit_id", "log_date"]],
};

pub const HABIT_STREAKS: TableDef = TableDef {
    name: "habit_streaks",
    columns: &[
        ColumnDef::id(),
        ColumnDef::new("habit_id", Storage::Integer)
            .unique()
            .references("habits", "id"),
        ColumnDef::new("current_streak", Storage::Integer).default(DefaultValue::Int(0)),
        ColumnDef::new("longest_streak", Storage::Integer).default(DefaultValue::Int(0)),
        ColumnDef::new("last_completed_date", Storage::Timestamp).nullable(),
        ColumnDef::new("updated_at", Storage::Timestamp).default(DefaultValue::Now),
    ],
    unique_together: &[],
};

// `name` and `hash` always hold the same key.
pub const MIGRATION_LEDGER: TableDef = TableDef {
    name: "__drizzle_migrations",
    columns: &[
        ColumnDef::id(),
        ColumnDef::new("name", Storage::Text).unique(),
        ColumnDef::new("hash", Storage::Text).unique(),
        ColumnDef::new("created_at", Storage::Integer),
    ],
    unique_together: &[],
};

pub const DOMAIN_TABLES: [TableDef; 5] = [USERS, HABITS, HABIT_SCHEDULES, HABIT_LOGS, HABIT_STREAKS];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDrift {
    pub table: &'static str,
    pub table_missing: bool,
    pub missing_columns: Vec<&'static str>,
    /// Composite unique constraints with no matching unique index.
    pub missing_unique: Vec<&'static [&'static str]>,
}

impl SchemaDrift {
    pub fn is_empty(&self) -> bool {
        self.missing_columns.is_empty() && self.missing_unique.is_empty()
    }
}

/// Lists every declared table, column or composite unique constraint the live store lacks.
pub fn verify(conn: &Connection) -> Result<Vec<SchemaDrift>> {
    let mut drift = Vec::new();

    for table in DOMAIN_TABLES.iter().chain(std::iter::once(&MIGRATION_LEDGER)) {
        let live = live_columns(conn, table.name)?;
        let missing_columns = table
            .columns
            .iter()
            .map(|column| column.name)
            .filter(|name| !live.iter().any(|live_name| live_name == name))
            .collect::<Vec<_>>();

        let unique_sets = live_unique_sets(conn, table.name)?;
        let missing_unique = table
            .unique_together
            .iter()
            .copied()
            .filter(|wanted| !unique_sets.iter().any(|live_set| live_set[..] == wanted[..]))
            .collect::<Vec<_>>();

        let entry = SchemaDrift {
            table: table.name,
            table_missing: live.is_empty(),
            missing_columns,
            missing_unique,
        };
        if !entry.is_empty() {
            drift.push(entry);
        }
    }

    Ok(drift)
}

fn live_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut statement = conn
        .prepare("SELECT name FROM pragma_table_info(?1)")
        .context("Failed to prepare table_info query")?;

    let columns = statement
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read columns of {table}"))?;

    Ok(columns)
}

/// Column lists of every unique index on `table`, in index order.
fn live_unique_sets(conn: &Connection, table: &str) -> Result<Vec<Vec<String>>> {
    let mut statement = conn
        .prepare("SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1")
        .context("Failed to prepare index_list query")?;
    let indexes = statement
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read indexes of {table}"))?;

    let mut columns = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
        .context("Failed to prepare index_info query")?;
    indexes
        .iter()
        .map(|index| {
            columns
                .query_map([index], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to read columns of index {index}"))
        })
        .collect()
}
