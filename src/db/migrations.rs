use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

pub const STATEMENT_BREAKPOINT: &str = "--> statement-breakpoint";

const JOURNAL_JSON: &str = include_str!("../../migrations/meta/_journal.json");

const BUNDLED_SCRIPTS: [(&str, &str); 4] = [
    ("m0000", include_str!("../../migrations/0000_create_users.sql")),
    ("m0001", include_str!("../../migrations/0001_create_habits.sql")),
    ("m0002", include_str!("../../migrations/0002_create_habit_addons.sql")),
    ("m0003", include_str!("../../migrations/0003_habit_lookup_indexes.sql")),
];

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^m\d{4}$").expect("static migration key pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    pub version: String,
    pub dialect: String,
    pub entries: Vec<JournalEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub idx: u32,
    pub version: String,
    pub when: i64,
    pub tag: String,
    pub breakpoints: bool,
}

impl JournalEntry {
    pub fn key(&self) -> String {
        format!("m{:04}", self.idx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub key: String,
    pub sql: String,
    /// When false the whole script runs as one batch instead of being split.
    pub breakpoints: bool,
}

impl MigrationScript {
    pub fn statements(&self) -> Vec<String> {
        if self.breakpoints {
            split_statements(&self.sql)
        } else {
            Some(self.sql.trim())
                .filter(|sql| !sql.is_empty())
                .map(ToOwned::to_owned)
                .into_iter()
                .collect()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    journal: Option<Journal>,
    scripts: Vec<MigrationScript>,
}

impl Manifest {
    /// Keys are sorted here; input order never decides application order.
    pub fn new<I, K, S>(scripts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, S)>,
        K: Into<String>,
        S: Into<String>,
    {
        let mut scripts = scripts
            .into_iter()
            .map(|(key, sql)| MigrationScript {
                key: key.into(),
                sql: sql.into(),
                breakpoints: true,
            })
            .collect::<Vec<_>>();

        if scripts.is_empty() {
            bail!("Migration manifest is empty; refusing to run an unconfigured migration set");
        }

        let mut seen = HashSet::new();
        for script in &scripts {
            if !KEY_PATTERN.is_match(&script.key) {
                bail!(
                    "Invalid migration key: {}. Expected 'm' followed by four digits (e.g. m0000)",
                    script.key
                );
            }
            if !seen.insert(script.key.clone()) {
                bail!("Duplicate migration key: {}", script.key);
            }
        }

        scripts.sort_by(|left, right| left.key.cmp(&right.key));

        Ok(Self {
            journal: None,
            scripts,
        })
    }

    /// Attaches a journal. It must list exactly the manifest's keys in the same order.
    pub fn with_journal(mut self, journal: Journal) -> Result<Self> {
        let mut entries = journal.entries.clone();
        entries.sort_by_key(|entry| entry.idx);

        let journal_keys = entries.iter().map(JournalEntry::key).collect::<Vec<_>>();
        let manifest_keys = self.keys().map(ToOwned::to_owned).collect::<Vec<_>>();

        if journal_keys != manifest_keys {
            bail!(
                "Migration journal does not match manifest. journal=[{}] manifest=[{}]",
                journal_keys.join(","),
                manifest_keys.join(",")
            );
        }

        for (script, entry) in self.scripts.iter_mut().zip(&entries) {
            script.breakpoints = entry.breakpoints;
        }

        self.journal = Some(Journal { entries, ..journal });
        Ok(self)
    }

    pub fn bundled() -> Result<Self> {
        let journal: Journal =
            serde_json::from_str(JOURNAL_JSON).context("Failed to parse bundled migration journal")?;

        Self::new(BUNDLED_SCRIPTS)?.with_journal(journal)
    }

    pub fn scripts(&self) -> &[MigrationScript] {
        &self.scripts
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.scripts.iter().map(|script| script.key.as_str())
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub fn latest_key(&self) -> Option<&str> {
        self.scripts.last().map(|script| script.key.as_str())
    }
}

/// Splits a script on the breakpoint marker, dropping blank fragments.
pub fn split_statements(sql: &str) -> Vec<String> {
    sql.split(STATEMENT_BREAKPOINT)
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
