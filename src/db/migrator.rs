use crate::db::gateway::Gateway;
use crate::db::migrations::Manifest;
use crate::db::queries::{
    CREATE_MIGRATION_LEDGER, FIND_APPLIED_MIGRATION, LIST_APPLIED_MIGRATIONS, RECORD_MIGRATION,
};
use crate::db::query_rows;
use crate::db::schema::MIGRATION_LEDGER;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use rusqlite::types::Value as SqlValue;
use rusqlite::Transaction;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub name: String,
    pub hash: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<String>,
}

/// Brings the store up to the manifest. Each script and its ledger row commit together.
pub struct Migrator<'a> {
    gateway: &'a Gateway,
    manifest: &'a Manifest,
}

impl<'a> Migrator<'a> {
    pub fn new(gateway: &'a Gateway, manifest: &'a Manifest) -> Self {
        Self { gateway, manifest }
    }

    pub async fn run(&self) -> Result<MigrationReport> {
        self.ensure_ledger().await?;

        let mut report = MigrationReport::default();
        for script in self.manifest.scripts() {
            let key = script.key.clone();
            let statements = script.statements();

            let applied = self
                .gateway
                .transaction(move |tx| apply_script(tx, &key, &statements))
                .await
                .with_context(|| format!("Migration {} failed", script.key))?;

            if applied {
                info!(key = %script.key, "migration applied");
                report.applied.push(script.key.clone());
            } else {
                debug!(key = %script.key, "migration already applied");
                report.skipped.push(script.key.clone());
            }
        }

        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "migrations complete"
        );
        Ok(report)
    }

    /// Read-only view of the ledger against the manifest. Never creates the ledger.
    pub async fn status(&self) -> Result<MigrationStatus> {
        if !self.gateway.table_exists(MIGRATION_LEDGER.name).await? {
            return Ok(MigrationStatus {
                applied: Vec::new(),
                pending: self.manifest.keys().map(ToOwned::to_owned).collect(),
            });
        }

        let rows = self
            .gateway
            .execute(LIST_APPLIED_MIGRATIONS, Vec::new())
            .await
            .context("Failed to read migration ledger")?;

        let applied = rows
            .iter()
            .map(|row| {
                let text = |column: &str| {
                    row.get(column)
                        .and_then(|value| value.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                AppliedMigration {
                    name: text("name"),
                    hash: text("hash"),
                    created_at: row
                        .get("created_at")
                        .and_then(|value| value.as_i64())
                        .unwrap_or_default(),
                }
            })
            .collect::<Vec<_>>();

        let known = applied
            .iter()
            .flat_map(|entry| [entry.name.as_str(), entry.hash.as_str()])
            .collect::<HashSet<_>>();
        let pending = self
            .manifest
            .keys()
            .filter(|key| !known.contains(key))
            .map(ToOwned::to_owned)
            .collect();

        Ok(MigrationStatus { applied, pending })
    }

    async fn ensure_ledger(&self) -> Result<()> {
        self.gateway
            .execute(CREATE_MIGRATION_LEDGER, Vec::new())
            .await
            .context("Failed to create migration ledger")?;
        Ok(())
    }
}

/// Returns false when the ledger already lists `key` by name or hash.
fn apply_script(tx: &Transaction<'_>, key: &str, statements: &[String]) -> Result<bool> {
    let found = query_rows(
        tx,
        FIND_APPLIED_MIGRATION,
        &[SqlValue::Text(key.to_owned()), SqlValue::Text(key.to_owned())],
    )?;
    if !found.is_empty() {
        return Ok(false);
    }

    if statements.is_empty() {
        warn!(key = %key, "migration has no statements; recording as applied");
    }

    for (index, statement) in statements.iter().enumerate() {
        tx.execute_batch(statement)
            .with_context(|| format!("Statement {} of {key} failed", index + 1))?;
    }

    tx.execute(
        RECORD_MIGRATION,
        params![key, key, Utc::now().timestamp_millis()],
    )
    .with_context(|| format!("Failed to record migration {key}"))?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::db::{Database, DatabaseOptions};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    async fn scalar(gateway: &Gateway, sql: &str) -> serde_json::Value {
        let rows = gateway.execute(sql, Vec::new()).await.expect("query");
        rows[0].clone().into_values().remove(0)
    }

    #[tokio::test]
    async fn bundled_migrations_are_idempotent_and_match_registry() {
        let gateway = Gateway::open_in_memory().expect("open");
        let manifest = Manifest::bundled().expect("manifest");
        let migrator = Migrator::new(&gateway, &manifest);

        let first = migrator.run().await.expect("first run");
        assert_eq!(first.applied, ["m0000", "m0001", "m0002", "m0003"]);
        assert!(first.skipped.is_empty());

        let second = migrator.run().await.expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped.len(), 4);

        assert_eq!(
            scalar(&gateway, "SELECT COUNT(*) FROM __drizzle_migrations").await,
            json!(4)
        );

        let drift = gateway
            .with_database(|database| schema::verify(database.connection()))
            .await
            .expect("verify");
        assert!(drift.is_empty(), "{drift:?}");
    }

    #[tokio::test]
    async fn scripts_apply_in_key_order() {
        let gateway = Gateway::open_in_memory().expect("open");
        let manifest = Manifest::new(HashMap::from([
            ("m0002", "INSERT INTO trail (key) VALUES ('m0002');"),
            ("m0000", "CREATE TABLE trail (key TEXT NOT NULL);"),
            ("m0001", "INSERT INTO trail (key) VALUES ('m0001');"),
        ]))
        .expect("manifest");

        Migrator::new(&gateway, &manifest).run().await.expect("run");

        let rows = gateway
            .execute("SELECT key FROM trail ORDER BY rowid", Vec::new())
            .await
            .expect("select");
        let keys = rows
            .into_iter()
            .map(|row| row.into_values().remove(0))
            .collect::<Vec<_>>();
        assert_eq!(keys, vec![json!("m0001"), json!("m0002")]);
    }

    #[tokio::test]
    async fn applied_scripts_never_run_twice() {
        let gateway = Gateway::open_in_memory().expect("open");
        let manifest = Manifest::new([
            (
                "m0000",
                "CREATE TABLE counter (n INTEGER NOT NULL);--> statement-breakpoint\nINSERT INTO counter (n) VALUES (0);",
            ),
            ("m0001", "UPDATE counter SET n = n + 1;"),
        ])
        .expect("manifest");
        let migrator = Migrator::new(&gateway, &manifest);

        migrator.run().await.expect("first run");
        migrator.run().await.expect("second run");

        assert_eq!(scalar(&gateway, "SELECT n FROM counter").await, json!(1));
    }

    #[tokio::test]
    async fn ledger_match_by_name_or_hash_skips_script() {
        let gateway = Gateway::open_in_memory().expect("open");
        gateway
            .execute(CREATE_MIGRATION_LEDGER, Vec::new())
            .await
            .expect("ledger");
        gateway
            .execute(
                "INSERT INTO __drizzle_migrations (name, hash, created_at) VALUES ('renamed', 'm0001', 0)",
                Vec::new(),
            )
            .await
            .expect("seed ledger");

        let manifest = Manifest::new([
            ("m0000", "CREATE TABLE a (id INTEGER);"),
            ("m0001", "CREATE TABLE b (id INTEGER);"),
        ])
        .expect("manifest");
        let report = Migrator::new(&gateway, &manifest)
            .run()
            .await
            .expect("run");

        assert_eq!(report.applied, ["m0000"]);
        assert_eq!(report.skipped, ["m0001"]);
        assert!(gateway.table_exists("a").await.expect("exists"));
        assert!(!gateway.table_exists("b").await.expect("exists"));
    }

    #[tokio::test]
    async fn failing_statement_rolls_back_whole_script() {
        let gateway = Gateway::open_in_memory().expect("open");
        let broken = Manifest::new([(
            "m0000",
            "CREATE TABLE a (id INTEGER);--> statement-breakpoint\nINSERT INTO missing (id) VALUES (1);",
        )])
        .expect("manifest");

        let error = Migrator::new(&gateway, &broken)
            .run()
            .await
            .expect_err("broken script must fail");
        assert!(format!("{error:#}").contains("m0000"));
        assert!(!gateway.table_exists("a").await.expect("exists"));
        assert_eq!(
            scalar(&gateway, "SELECT COUNT(*) FROM __drizzle_migrations").await,
            json!(0)
        );

        let fixed = Manifest::new([(
            "m0000",
            "CREATE TABLE a (id INTEGER);--> statement-breakpoint\nINSERT INTO a (id) VALUES (1);",
        )])
        .expect("manifest");
        let report = Migrator::new(&gateway, &fixed).run().await.expect("retry");
        assert_eq!(report.applied, ["m0000"]);
        assert_eq!(scalar(&gateway, "SELECT COUNT(*) FROM a").await, json!(1));
    }

    #[tokio::test]
    async fn timed_out_script_leaves_no_ledger_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("habits.db");
        let manifest = Manifest::new([(
            "m0000",
            "CREATE TABLE bulk (n INTEGER NOT NULL);--> statement-breakpoint\nINSERT INTO bulk (n) WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 300000000) SELECT x FROM c;",
        )])
        .expect("manifest");

        let setup = Gateway::open(&path, &DatabaseOptions::default(), Duration::from_secs(5))
            .expect("open");
        setup
            .execute(CREATE_MIGRATION_LEDGER, Vec::new())
            .await
            .expect("ledger");
        setup.close().await.expect("close");

        let hasty = Gateway::new(
            Database::open(&path, &DatabaseOptions::default()).expect("open"),
            Duration::from_millis(20),
        );
        let error = Migrator::new(&hasty, &manifest)
            .run()
            .await
            .expect_err("script must time out");
        assert!(format!("{error:#}").contains("timed out"));
        hasty.close().await.expect("close");

        let gateway = Gateway::new(
            Database::open(&path, &DatabaseOptions::default()).expect("reopen"),
            Duration::from_secs(5),
        );
        assert_eq!(
            scalar(&gateway, "SELECT COUNT(*) FROM __drizzle_migrations").await,
            json!(0)
        );
        assert!(!gateway.table_exists("bulk").await.expect("exists"));
    }

    #[tokio::test]
    async fn empty_script_is_recorded_as_applied() {
        let gateway = Gateway::open_in_memory().expect("open");
        let manifest = Manifest::new([("m0000", "\n--> statement-breakpoint\n  ")]).expect("manifest");

        let report = Migrator::new(&gateway, &manifest).run().await.expect("run");
        assert_eq!(report.applied, ["m0000"]);
        assert_eq!(
            scalar(
                &gateway,
                "SELECT COUNT(*) FROM __drizzle_migrations WHERE name = 'm0000'"
            )
            .await,
            json!(1)
        );
    }

    #[tokio::test]
    async fn status_lists_pending_then_applied() {
        let gateway = Gateway::open_in_memory().expect("open");
        let manifest = Manifest::bundled().expect("manifest");
        let migrator = Migrator::new(&gateway, &manifest);

        let before = migrator.status().await.expect("status");
        assert!(before.applied.is_empty());
        assert_eq!(before.pending.len(), 4);
        assert!(!gateway.table_exists("__drizzle_migrations").await.expect("exists"));

        migrator.run().await.expect("run");
        let after = migrator.status().await.expect("status");
        assert!(after.pending.is_empty());
        assert_eq!(after.applied[0].name, "m0000");
        assert_eq!(after.applied[0].hash, "m0000");
        assert!(after.applied[0].created_at > 1_600_000_000_000);
    }

    #[tokio::test]
    async fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("habits.db");
        let manifest = Manifest::bundled().expect("manifest");

        let gateway = Gateway::open(&path, &DatabaseOptions::default(), Duration::from_secs(5))
            .expect("open");
        Migrator::new(&gateway, &manifest).run().await.expect("run");
        gateway.close().await.expect("close");

        let reopened = Gateway::new(
            Database::open(&path, &DatabaseOptions::default()).expect("reopen"),
            Duration::from_secs(5),
        );
        let report = Migrator::new(&reopened, &manifest).run().await.expect("rerun");
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped.len(), 4);
    }
}
