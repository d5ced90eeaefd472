use crate::db::{DatabaseOptions, JournalMode};
use anyhow::{Context, Result, anyhow, bail};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = ".HabitStore";
const CONFIG_FILE: &str = "config.json";
const MIN_STATEMENT_TIMEOUT_SECONDS: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    pub statement_timeout_seconds: u64,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_root_dir().join("db").join("habits.db"),
            statement_timeout_seconds: 30,
            busy_timeout_ms: 5_000,
            journal_mode: JournalMode::Wal.to_string(),
        }
    }
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        Ok(default_root_dir().join(CONFIG_FILE))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.statement_timeout_seconds = config
            .statement_timeout_seconds
            .max(MIN_STATEMENT_TIMEOUT_SECONDS);

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;
        set_mode_600(config_path)?;

        Ok(())
    }

    pub fn database_options(&self) -> Result<DatabaseOptions> {
        Ok(DatabaseOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            journal_mode: self.journal_mode.parse()?,
        })
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(
            self.statement_timeout_seconds
                .max(MIN_STATEMENT_TIMEOUT_SECONDS),
        )
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match normalize_config_key(key) {
            "db_path" => {
                if value.trim().is_empty() {
                    bail!("db_path must not be empty");
                }
                self.db_path = expand_home(value.trim());
            }
            "statement_timeout_seconds" => {
                self.statement_timeout_seconds = value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("statement_timeout_seconds must be a number"))?
                    .max(MIN_STATEMENT_TIMEOUT_SECONDS);
            }
            "busy_timeout_ms" => {
                self.busy_timeout_ms = value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("busy_timeout_ms must be a number"))?;
            }
            "journal_mode" => {
                let mode = value.parse::<JournalMode>()?;
                self.journal_mode = mode.to_string();
            }
            _ => {
                bail!(
                    "Unsupported config key: {key}. Supported keys: db_path|db.path, statement_timeout_seconds|db.statement_timeout_seconds, busy_timeout_ms|db.busy_timeout_ms, journal_mode|db.journal_mode"
                );
            }
        }

        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        match normalize_config_key(key) {
            "db_path" => Some(self.db_path.display().to_string()),
            "statement_timeout_seconds" => Some(self.statement_timeout_seconds.to_string()),
            "busy_timeout_ms" => Some(self.busy_timeout_ms.to_string()),
            "journal_mode" => Some(self.journal_mode.clone()),
            _ => None,
        }
    }
}

fn normalize_config_key(key: &str) -> &str {
    match key {
        "db_path" | "db.path" => "db_path",
        "statement_timeout_seconds" | "db.statement_timeout_seconds" => {
            "statement_timeout_seconds"
        }
        "busy_timeout_ms" | "db.busy_timeout_ms" => "busy_timeout_ms",
        "journal_mode" | "db.journal_mode" => "journal_mode",
        _ => key,
    }
}

pub fn expand_home(raw: &str) -> PathBuf {
    raw.strip_prefix("~/")
        .and_then(|stripped| home_dir().map(|home| home.join(stripped)))
        .unwrap_or_else(|| PathBuf::from(raw))
}

fn default_root_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn set_mode_600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set file permissions: {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_keys_alias_flat_keys() {
        let mut config = Config::default();
        config.set_value("db.journal_mode", "DELETE").expect("set");
        assert_eq!(config.get_value("journal_mode").as_deref(), Some("delete"));

        config.set_value("db.statement_timeout_seconds", "0").expect("set");
        assert_eq!(config.statement_timeout(), Duration::from_secs(1));

        assert!(config.set_value("journal_mode", "fast").is_err());
        assert!(config.set_value("busy_timeout_ms", "soon").is_err());
        assert!(config.set_value("report_time", "23:30").is_err());
        assert_eq!(config.get_value("nope"), None);
    }

    #[test]
    fn saved_config_round_trips_with_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"busy_timeout_ms": 250}"#).expect("write");

        let mut config = Config::load_from(&path).expect("load");
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.statement_timeout_seconds, 30);

        config.set_value("db.path", "/tmp/other.db").expect("set");
        config.save_to(&path).expect("save");

        let reloaded = Config::load_from(&path).expect("reload");
        assert_eq!(reloaded.db_path, PathBuf::from("/tmp/other.db"));
        let options = reloaded.database_options().expect("options");
        assert_eq!(options.busy_timeout, Duration::from_millis(250));
        assert_eq!(options.journal_mode, JournalMode::Wal);

        #[cfg(unix)]
        {
            let mode = fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
