use crate::db::gateway::Gateway;
use crate::db::query::BuiltQuery;
use crate::db::{Row, json_to_sql};
use anyhow::{Result, bail};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::debug;

static SELECT_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bselect\s+(.*?)\s+from\b").expect("static select pattern"));
static RETURNING_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\breturning\s+(.*)$").expect("static returning pattern"));
static ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+as\s+").expect("static alias pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    All,
    Run,
    Get,
    Values,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::All => "all",
            Self::Run => "run",
            Self::Get => "get",
            Self::Values => "values",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "run" => Ok(Self::Run),
            "get" => Ok(Self::Get),
            "values" => Ok(Self::Values),
            other => bail!("Unsupported mode: {other}. Expected all|run|get|values"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProxyRows {
    Row(Vec<Value>),
    Rows(Vec<Vec<Value>>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyResult {
    pub rows: ProxyRows,
}

impl ProxyResult {
    pub fn into_rows(self) -> Vec<Vec<Value>> {
        match self.rows {
            ProxyRows::Row(row) if row.is_empty() => Vec::new(),
            ProxyRows::Row(row) => vec![row],
            ProxyRows::Rows(rows) => rows,
        }
    }
}

/// `select ... from` list, else the `returning` list; aliases win, quotes and table prefixes go.
pub fn column_names(sql: &str) -> Option<Vec<String>> {
    let list = SELECT_LIST
        .captures(sql)
        .or_else(|| RETURNING_LIST.captures(sql))
        .and_then(|captures| captures.get(1))?
        .as_str()
        .trim()
        .trim_end_matches(';');

    let names = split_top_level(list)
        .into_iter()
        .map(|entry| {
            let target = ALIAS.split(entry.trim()).last().unwrap_or_default();
            target
                .replace(['"', '`'], "")
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        })
        .collect::<Vec<_>>();

    (!names.is_empty() && names.iter().all(|name| !name.is_empty())).then_some(names)
}

fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_i32;
    let mut start = 0;

    for (index, character) in list.char_indices() {
        match character {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&list[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

/// Pairs each recovered name with its occurrence index, so repeated names (`a.id, b.id`)
/// map to successive columns.
fn occurrences(names: &[String]) -> Vec<(&str, usize)> {
    let mut seen = HashMap::new();
    names
        .iter()
        .map(|name| {
            let count = seen.entry(name.as_str()).or_insert(0);
            let occurrence = *count;
            *count += 1;
            (name.as_str(), occurrence)
        })
        .collect()
}

/// Without usable names (`*`, bare expressions) each row keeps its own column order.
pub fn shape(rows: Vec<Row>, columns: Option<&[String]>, mode: Mode) -> ProxyResult {
    let lookups = columns.map(occurrences).filter(|lookups| {
        rows.first().is_none_or(|row| {
            lookups
                .iter()
                .all(|(name, occurrence)| row.get_nth(name, *occurrence).is_some())
        })
    });

    if lookups.is_none() {
        debug!(mode = %mode, "column order not recoverable; using row order");
    }

    let data = rows
        .into_iter()
        .map(|row| match &lookups {
            Some(lookups) => lookups
                .iter()
                .map(|(name, occurrence)| {
                    row.get_nth(name, *occurrence)
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect(),
            None => row.into_values(),
        })
        .collect::<Vec<Vec<Value>>>();

    let rows = match mode {
        Mode::Get => ProxyRows::Row(data.into_iter().next().unwrap_or_default()),
        Mode::All | Mode::Run | Mode::Values => ProxyRows::Rows(data),
    };

    ProxyResult { rows }
}

#[derive(Clone)]
pub struct QueryAdapter {
    gateway: Gateway,
}

impl QueryAdapter {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub async fn execute(&self, sql: &str, params: &[Value], mode: Mode) -> Result<ProxyResult> {
        let bound = params.iter().map(json_to_sql).collect::<Vec<_>>();
        let rows = self.gateway.execute(sql, bound).await?;
        let columns = column_names(sql);

        Ok(shape(rows, columns.as_deref(), mode))
    }

    pub async fn execute_built(&self, query: BuiltQuery, mode: Mode) -> Result<ProxyResult> {
        let BuiltQuery {
            sql,
            params,
            columns,
        } = query;
        let rows = self.gateway.execute(sql, params).await?;
        let columns = (!columns.is_empty()).then_some(columns);

        Ok(shape(rows, columns.as_deref(), mode))
    }
}
