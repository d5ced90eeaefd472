mod cli;

use crate::cli::{Cli, Commands, ConfigCommands, HabitCommands, LogCommands, UserCommands};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDate, Utc};
use clap::Parser;
use habitstore::config::Config;
use habitstore::db::Gateway;
use habitstore::db::adapter::Mode;
use habitstore::db::migrations::Manifest;
use habitstore::db::migrator::{MigrationStatus, Migrator};
use habitstore::db::schema::{self, SchemaDrift};
use habitstore::store::HabitStore;
use habitstore::store::models::{HabitType, NewHabit, NewLog};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => handle_migrate().await,
        Commands::Status => handle_status().await,
        Commands::Doctor => handle_doctor().await,
        Commands::Config { command } => handle_config_command(command),
        Commands::Query { mode, sql, params } => handle_query(&mode, &sql, params.as_deref()).await,
        Commands::User { command } => handle_user_command(command).await,
        Commands::Habit { command } => handle_habit_command(command).await,
        Commands::Log { command } => handle_log_command(command).await,
    }
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Set { key, value } => {
            let mut config = load_or_default_config()?;
            config.set_value(&key, &value)?;
            config.save()?;

            println!("Config saved: {key} = {value}");
            Ok(())
        }
        ConfigCommands::Get { key } => {
            let config = load_or_default_config()?;
            let value = config
                .get_value(&key)
                .with_context(|| format!("Unsupported config key: {key}"))?;

            println!("{value}");
            Ok(())
        }
    }
}

async fn handle_migrate() -> Result<()> {
    let config = load_or_default_config()?;
    let gateway = open_gateway(&config)?;
    let manifest = Manifest::bundled()?;

    let result = Migrator::new(&gateway, &manifest).run().await;
    gateway.close().await?;

    print_json(&result?)
}

async fn handle_status() -> Result<()> {
    let config = load_or_default_config()?;
    let gateway = open_gateway(&config)?;
    let manifest = Manifest::bundled()?;

    let result = Migrator::new(&gateway, &manifest).status().await;
    gateway.close().await?;
    let status = result?;

    println!("HabitStore status");
    println!("- db_path: {}", config.db_path.display());
    println!("- journal_mode: {}", config.journal_mode);
    println!("- applied_migrations: {}", status.applied.len());
    println!(
        "- latest_applied: {}",
        status
            .applied
            .last()
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| "none".to_string())
    );
    println!(
        "- latest_bundled: {}",
        manifest.latest_key().unwrap_or("none")
    );
    println!(
        "- pending_migrations: {}",
        if status.pending.is_empty() {
            "none".to_string()
        } else {
            status.pending.join(", ")
        }
    );

    Ok(())
}

async fn handle_doctor() -> Result<()> {
    let config_path = Config::config_path()?;
    let mut issues = Vec::new();

    if config_path.exists() {
        println!("[OK] config.json found: {}", config_path.display());
    } else {
        println!("[WARN] config.json not found, using defaults: {}", config_path.display());
        issues.push("config missing".to_string());
    }

    let config = load_or_default_config()?;

    let manifest = match Manifest::bundled() {
        Ok(manifest) => {
            println!(
                "[OK] bundled migrations consistent with journal: {}",
                manifest.keys().collect::<Vec<_>>().join(", ")
            );
            if let Some(journal) = manifest.journal() {
                println!(
                    "[OK] journal dialect {} (version {})",
                    journal.dialect, journal.version
                );
            }
            Some(manifest)
        }
        Err(error) => {
            println!("[WARN] bundled migrations invalid: {error:#}");
            issues.push("manifest invalid".to_string());
            None
        }
    };

    let gateway = match open_gateway(&config) {
        Ok(gateway) => {
            println!("[OK] SQLite reachable: {}", config.db_path.display());
            gateway
        }
        Err(error) => {
            println!("[WARN] SQLite check failed: {error:#}");
            issues.push("db unreachable".to_string());
            return report_doctor(&issues);
        }
    };

    let (status, drift) = inspect_store(gateway, manifest.as_ref()).await?;

    if let Some(status) = status {
        if status.pending.is_empty() {
            println!("[OK] no pending migrations");
        } else {
            println!(
                "[WARN] pending migrations: {} (run `habitstore migrate`)",
                status.pending.join(", ")
            );
            issues.push("migrations pending".to_string());
        }
    }

    if drift.is_empty() {
        println!("[OK] live schema matches table declarations");
    } else {
        for entry in &drift {
            if entry.table_missing {
                println!("[WARN] table missing: {}", entry.table);
                continue;
            }
            if !entry.missing_columns.is_empty() {
                println!(
                    "[WARN] {} missing columns: {}",
                    entry.table,
                    entry.missing_columns.join(", ")
                );
            }
            for columns in &entry.missing_unique {
                println!(
                    "[WARN] {} missing unique index on ({})",
                    entry.table,
                    columns.join(", ")
                );
            }
        }
        issues.push("schema drift".to_string());
    }

    report_doctor(&issues)
}

/// Migration status and schema drift. The gateway is closed before any error propagates.
async fn inspect_store(
    gateway: Gateway,
    manifest: Option<&Manifest>,
) -> Result<(Option<MigrationStatus>, Vec<SchemaDrift>)> {
    let status = match manifest {
        Some(manifest) => Migrator::new(&gateway, manifest).status().await.map(Some),
        None => Ok(None),
    };
    let drift = gateway
        .with_database(|database| schema::verify(database.connection()))
        .await;
    gateway.close().await?;

    Ok((status?, drift?))
}

fn report_doctor(issues: &[String]) -> Result<()> {
    if issues.is_empty() {
        println!("doctor result: no issues");
    } else {
        println!("doctor result: {} warning(s)", issues.len());
    }

    Ok(())
}

async fn handle_query(mode: &str, sql: &str, params: Option<&str>) -> Result<()> {
    let mode = mode.parse::<Mode>()?;
    let params = match params {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("Failed to parse params JSON")? {
            Value::Array(values) => values,
            _ => bail!("params must be a JSON array, e.g. '[1, \"Alice\"]'"),
        },
        None => Vec::new(),
    };

    let store = open_store().await?;
    let result = store.adapter().execute(sql, &params, mode).await;
    close_store(&store).await?;

    print_json(&result?)
}

async fn handle_user_command(command: UserCommands) -> Result<()> {
    let store = open_store().await?;

    let result = match command {
        UserCommands::Register {
            name,
            email,
            password,
        } => store.register(&name, &email, &password).await,
        UserCommands::Login { email, password } => store.login(&email, &password).await,
    };
    close_store(&store).await?;

    print_json(&result?)
}

async fn handle_habit_command(command: HabitCommands) -> Result<()> {
    let store = open_store().await?;

    let result = match command {
        HabitCommands::Add {
            user,
            title,
            description,
            habit_type,
            target,
        } => match habit_type.parse::<HabitType>() {
            Ok(habit_type) => store
                .create_habit(
                    user,
                    NewHabit {
                        title,
                        description,
                        habit_type,
                        target_value: target,
                    },
                )
                .await
                .and_then(|habit| to_json(&habit)),
            Err(error) => Err(error),
        },
        HabitCommands::List { user } => store
            .list_active_habits(user)
            .await
            .and_then(|habits| to_json(&habits)),
        HabitCommands::Delete { id } => store
            .delete_habit(id)
            .await
            .map(|_| serde_json::json!({ "id": id, "is_active": false })),
    };
    close_store(&store).await?;

    print_json(&result?)
}

async fn handle_log_command(command: LogCommands) -> Result<()> {
    let store = open_store().await?;

    let result = match command {
        LogCommands::Add {
            habit,
            date,
            value,
            done,
        } => match parse_log_date(date.as_deref()) {
            Ok(log_date) => store
                .create_log(
                    habit,
                    NewLog {
                        log_date,
                        value,
                        is_completed: done,
                    },
                )
                .await
                .and_then(|log| to_json(&log)),
            Err(error) => Err(error),
        },
        LogCommands::List { habit } => store
            .list_logs(habit)
            .await
            .and_then(|logs| to_json(&logs)),
    };
    close_store(&store).await?;

    print_json(&result?)
}

/// Logs are keyed by calendar day at UTC midnight.
fn parse_log_date(raw: Option<&str>) -> Result<DateTime<Utc>> {
    let date = match raw {
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .with_context(|| format!("Invalid date format: {value}. Example: 2026-10-18"))?,
        None => Local::now().date_naive(),
    };

    date.and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .with_context(|| format!("Invalid log date: {date}"))
}

fn open_gateway(config: &Config) -> Result<Gateway> {
    Gateway::open(
        &config.db_path,
        &config.database_options()?,
        config.statement_timeout(),
    )
}

/// App startup: open the store and bring it to the bundled schema before any query runs.
async fn open_store() -> Result<HabitStore> {
    let config = load_or_default_config()?;
    let gateway = open_gateway(&config)?;
    let manifest = Manifest::bundled()?;

    let report = Migrator::new(&gateway, &manifest).run().await?;
    if !report.applied.is_empty() {
        info!(applied = %report.applied.join(","), "store migrated on startup");
    }

    Ok(HabitStore::new(gateway))
}

async fn close_store(store: &HabitStore) -> Result<()> {
    store.adapter().gateway().close().await
}

fn load_or_default_config() -> Result<Config> {
    if Config::config_path()?.exists() {
        Config::load()
    } else {
        Ok(Config::default())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("Failed to serialize output")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{content}");
    Ok(())
}
