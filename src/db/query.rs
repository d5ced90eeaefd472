use crate::db::schema::TableDef;
use anyhow::{Result, bail};
use chrono::Utc;
use rusqlite::types::Value as SqlValue;

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Output column order; empty when the statement returns no rows.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn ensure_column(table: &TableDef, column: &str) -> Result<()> {
    if table.column(column).is_none() {
        bail!("Unknown column {}.{}", table.name, column);
    }
    Ok(())
}

fn where_clause(
    table: &TableDef,
    filters: &[(&'static str, SqlValue)],
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    if filters.is_empty() {
        return Ok(String::new());
    }

    let conditions = filters
        .iter()
        .map(|(column, value)| {
            ensure_column(table, column)?;
            params.push(value.clone());
            Ok(format!("{}.{} = ?", quote(table.name), quote(column)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(format!(" where {}", conditions.join(" and ")))
}

fn returning_all(table: &TableDef) -> (String, Vec<String>) {
    let columns = table
        .column_names()
        .into_iter()
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();
    let list = columns
        .iter()
        .map(|column| quote(column))
        .collect::<Vec<_>>()
        .join(", ");
    (format!(" returning {list}"), columns)
}

pub struct Select {
    table: TableDef,
    columns: Vec<&'static str>,
    filters: Vec<(&'static str, SqlValue)>,
    order: Option<(&'static str, Order)>,
    limit: Option<u32>,
}

impl Select {
    pub fn table(table: TableDef) -> Self {
        Self {
            table,
            columns: table.column_names(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &[&'static str]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    pub fn filter(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.filters.push((column, value.into()));
        self
    }

    pub fn order_by(mut self, column: &'static str, order: Order) -> Self {
        self.order = Some((column, order));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<BuiltQuery> {
        if self.columns.is_empty() {
            bail!("Select on {} has no columns", self.table.name);
        }

        let list = self
            .columns
            .iter()
            .map(|column| {
                ensure_column(&self.table, column)?;
                Ok(quote(column))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let mut params = Vec::new();
        let mut sql = format!("select {list} from {}", quote(self.table.name));
        sql.push_str(&where_clause(&self.table, &self.filters, &mut params)?);

        if let Some((column, order)) = self.order {
            ensure_column(&self.table, column)?;
            let direction = match order {
                Order::Asc => "asc",
                Order::Desc => "desc",
            };
            sql.push_str(&format!(" order by {} {direction}", quote(column)));
        }

        if let Some(limit) = self.limit {
            sql.push_str(" limit ?");
            params.push(SqlValue::Integer(i64::from(limit)));
        }

        Ok(BuiltQuery {
            sql,
            params,
            columns: self.columns.iter().map(|column| column.to_string()).collect(),
        })
    }
}

/// `insert ... returning *`, filling registry defaults for omitted columns.
pub struct Insert {
    table: TableDef,
    values: Vec<(&'static str, SqlValue)>,
}

impl Insert {
    pub fn table(table: TableDef) -> Self {
        Self {
            table,
            values: Vec::new(),
        }
    }

    pub fn value(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.values.push((column, value.into()));
        self
    }

    pub fn build(self) -> Result<BuiltQuery> {
        let mut values = self.values;
        for (column, _) in &values {
            ensure_column(&self.table, column)?;
        }

        for column in self.table.columns {
            let provided = values.iter().any(|(name, _)| *name == column.name);
            if let (false, Some(default)) = (provided, column.default) {
                values.push((column.name, default.produce()));
            }
        }

        if values.is_empty() {
            bail!("Insert into {} has no values", self.table.name);
        }

        let names = values
            .iter()
            .map(|(column, _)| quote(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; values.len()].join(", ");
        let (returning, columns) = returning_all(&self.table);

        Ok(BuiltQuery {
            sql: format!(
                "insert into {} ({names}) values ({placeholders}){returning}",
                quote(self.table.name)
            ),
            params: values.into_iter().map(|(_, value)| value).collect(),
            columns,
        })
    }
}

/// `update ... returning *`, refreshing `updated_at` unless the caller sets it.
pub struct Update {
    table: TableDef,
    assignments: Vec<(&'static str, SqlValue)>,
    filters: Vec<(&'static str, SqlValue)>,
}

impl Update {
    pub fn table(table: TableDef) -> Self {
        Self {
            table,
            assignments: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn set(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.assignments.push((column, value.into()));
        self
    }

    pub fn filter(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.filters.push((column, value.into()));
        self
    }

    pub fn build(self) -> Result<BuiltQuery> {
        if self.filters.is_empty() {
            bail!("Update on {} requires a filter", self.table.name);
        }

        let mut assignments = self.assignments;
        let touched = assignments.iter().any(|(column, _)| *column == "updated_at");
        if !touched && self.table.column("updated_at").is_some() {
            assignments.push(("updated_at", SqlValue::Integer(Utc::now().timestamp())));
        }

        if assignments.is_empty() {
            bail!("Update on {} has nothing to set", self.table.name);
        }

        let mut params = Vec::new();
        let set_list = assignments
            .into_iter()
            .map(|(column, value)| {
                ensure_column(&self.table, column)?;
                params.push(value);
                Ok(format!("{} = ?", quote(column)))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let mut sql = format!("update {} set {set_list}", quote(self.table.name));
        sql.push_str(&where_clause(&self.table, &self.filters, &mut params)?);
        let (returning, columns) = returning_all(&self.table);
        sql.push_str(&returning);

        Ok(BuiltQuery {
            sql,
            params,
            columns,
        })
    }
}

pub struct Delete {
    table: TableDef,
    filters: Vec<(&'static str, SqlValue)>,
}

impl Delete {
    pub fn table(table: TableDef) -> Self {
        Self {
            table,
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.filters.push((column, value.into()));
        self
    }

    pub fn build(self) -> Result<BuiltQuery> {
        if self.filters.is_empty() {
            bail!("Delete on {} requires a filter", self.table.name);
        }

        let mut params = Vec::new();
        let mut sql = format!("delete from {}", quote(self.table.name));
        sql.push_str(&where_clause(&self.table, &self.filters, &mut params)?);

        Ok(BuiltQuery {
            sql,
            params,
            columns: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{HABIT_LOGS, HABITS, USERS};

    #[test]
    fn select_tracks_column_order() {
        let query = Select::table(HABITS)
            .columns(&["title", "id"])
            .filter("user_id", 4_i64)
            .filter("is_active", true)
            .order_by("created_at", Order::Desc)
            .limit(1)
            .build()
            .expect("build");

        assert_eq!(
            query.sql,
            "select \"title\", \"id\" from \"habits\" where \"habits\".\"user_id\" = ? and \"habits\".\"is_active\" = ? order by \"created_at\" desc limit ?"
        );
        assert_eq!(query.columns, ["title", "id"]);
        assert_eq!(
            query.params,
            vec![SqlValue::Integer(4), SqlValue::Integer(1), SqlValue::Integer(1)]
        );
    }

    #[test]
    fn select_defaults_to_all_registry_columns() {
        let query = Select::table(USERS).build().expect("build");
        assert_eq!(query.columns, USERS.column_names());
    }

    #[test]
    fn unknown_columns_are_rejected() {
        assert!(Select::table(USERS).columns(&["nope"]).build().is_err());
        assert!(Insert::table(USERS).value("nope", 1_i64).build().is_err());
    }

    #[test]
    fn insert_fills_registry_defaults() {
        let query = Insert::table(HABIT_LOGS)
            .value("habit_id", 1_i64)
            .value("log_date", 1_700_000_000_i64)
            .build()
            .expect("build");

        assert!(query.sql.starts_with(
            "insert into \"habit_logs\" (\"habit_id\", \"log_date\", \"is_completed\", \"created_at\")"
        ));
        assert!(query.sql.ends_with(
            "returning \"id\", \"habit_id\", \"log_date\", \"value\", \"is_completed\", \"created_at\""
        ));
        assert_eq!(query.params[2], SqlValue::Integer(0));
        assert_eq!(query.columns.len(), HABIT_LOGS.columns.len());
    }

    #[test]
    fn update_refreshes_updated_at() {
        let query = Update::table(HABITS)
            .set("title", "Run".to_string())
            .filter("id", 9_i64)
            .build()
            .expect("build");

        assert!(query.sql.starts_with(
            "update \"habits\" set \"title\" = ?, \"updated_at\" = ? where \"habits\".\"id\" = ?"
        ));
        assert_eq!(query.params.len(), 3);
    }

    #[test]
    fn unfiltered_update_and_delete_are_rejected() {
        assert!(Update::table(HABITS).set("title", "x".to_string()).build().is_err());
        assert!(Delete::table(HABIT_LOGS).build().is_err());
    }
}
