use crate::db::{Database, DatabaseOptions, Row};
use anyhow::{Context, Result, anyhow, bail};
use rusqlite::{InterruptHandle, Transaction};
use rusqlite::types::Value as SqlValue;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Calls serialize on one connection and run on the blocking pool.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Mutex<Option<Database>>>,
    interrupt: Arc<InterruptHandle>,
    statement_timeout: Duration,
}

impl Gateway {
    pub fn new(database: Database, statement_timeout: Duration) -> Self {
        let interrupt = Arc::new(database.connection().get_interrupt_handle());
        Self {
            inner: Arc::new(Mutex::new(Some(database))),
            interrupt,
            statement_timeout,
        }
    }

    pub fn open(path: &Path, options: &DatabaseOptions, statement_timeout: Duration) -> Result<Self> {
        let database = Database::open(path, options)?;
        info!(path = %path.display(), "database opened");
        Ok(Self::new(database, statement_timeout))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?, DEFAULT_STATEMENT_TIMEOUT))
    }

    /// Executes one statement; it commits on its own.
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<SqlValue>) -> Result<Vec<Row>> {
        let sql = sql.into();
        debug!(sql = %sql, params = params.len(), "execute");
        self.with_database(move |database| database.query(&sql, &params))
            .await
    }

    /// Executes `work` inside one explicit transaction.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_database(move |database| database.transaction(work))
            .await
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let table = table.to_owned();
        self.with_database(move |database| database.table_exists(&table))
            .await
    }

    /// On timeout the running statement is interrupted and its transaction rolls back.
    /// Work that completed before the interrupt landed still succeeds.
    pub async fn with_database<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let mut call = task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| anyhow!("database handle lock poisoned"))?;
            let database = guard.as_mut().context("database handle is closed")?;
            work(database)
        });

        if let Ok(joined) = timeout(self.statement_timeout, &mut call).await {
            return joined.context("database task failed")?;
        }

        self.interrupt.interrupt();
        match call.await.context("database task failed")? {
            Ok(value) => {
                warn!(
                    timeout_secs = self.statement_timeout.as_secs_f64(),
                    "database call finished after its timeout"
                );
                Ok(value)
            }
            Err(error) => Err(error.context(format!(
                "database call timed out after {}s and was interrupted",
                self.statement_timeout.as_secs_f64()
            ))),
        }
    }

    /// Closes the underlying connection. Later calls on any clone fail.
    pub async fn close(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || {
            let database = inner
                .lock()
                .map_err(|_| anyhow!("database handle lock poisoned"))?
                .take();

            match database {
                Some(database) => database.close(),
                None => Ok(()),
            }
        })
        .await
        .context("database close task failed")??;

        info!("database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::query_rows;
    use serde_json::json;

    #[tokio::test]
    async fn executes_statements_in_order() {
        let gateway = Gateway::open_in_memory().expect("open");
        gateway
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", vec![])
            .await
            .expect("create");
        gateway
            .execute(
                "INSERT INTO t (name) VALUES (?1)",
                vec![SqlValue::Text("Alice".to_string())],
            )
            .await
            .expect("insert");

        let rows = gateway
            .execute("SELECT id, name FROM t", vec![])
            .await
            .expect("select");
        assert_eq!(rows[0].get("name"), Some(&json!("Alice")));
        assert!(gateway.table_exists("t").await.expect("exists"));
    }

    #[tokio::test]
    async fn failed_transaction_leaves_nothing_behind() {
        let gateway = Gateway::open_in_memory().expect("open");
        gateway
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
            .await
            .expect("create");

        let result = gateway
            .transaction(|tx| {
                query_rows(tx, "INSERT INTO t (id) VALUES (1)", &[])?;
                query_rows(tx, "INSERT INTO t (id) VALUES (1)", &[])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        let rows = gateway.execute("SELECT id FROM t", vec![]).await.expect("select");
        assert!(rows.is_empty());
    }

    const ENDLESS_COUNT: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 1000000000) SELECT count(*) FROM c";

    #[tokio::test]
    async fn slow_statements_are_interrupted() {
        let gateway = Gateway::new(
            Database::open_in_memory().expect("open"),
            Duration::from_millis(50),
        );

        let error = gateway
            .execute(ENDLESS_COUNT, vec![])
            .await
            .expect_err("must time out");
        assert!(error.to_string().contains("timed out"));

        let rows = gateway.execute("SELECT 1 AS one", vec![]).await.expect("usable afterwards");
        assert_eq!(rows[0].get("one"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn interrupted_transaction_rolls_back() {
        let gateway = Gateway::new(
            Database::open_in_memory().expect("open"),
            Duration::from_millis(50),
        );
        gateway
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
            .await
            .expect("create");

        let result = gateway
            .transaction(|tx| {
                query_rows(tx, "INSERT INTO t (id) VALUES (1)", &[])?;
                query_rows(tx, ENDLESS_COUNT, &[])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        let rows = gateway.execute("SELECT id FROM t", vec![]).await.expect("select");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn work_that_finishes_late_still_succeeds() {
        let gateway = Gateway::new(
            Database::open_in_memory().expect("open"),
            Duration::from_millis(20),
        );

        let value = gateway
            .with_database(|_| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(7)
            })
            .await
            .expect("completed work is not reported as failed");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn closed_gateway_rejects_calls() {
        let gateway = Gateway::open_in_memory().expect("open");
        gateway.close().await.expect("close");

        let error = gateway
            .execute("SELECT 1", vec![])
            .await
            .expect_err("closed");
        assert!(format!("{error:#}").contains("closed"));
        gateway.close().await.expect("second close is a no-op");
    }
}
