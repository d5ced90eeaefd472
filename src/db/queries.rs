pub const CREATE_MIGRATION_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS __drizzle_migrations (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  name       TEXT UNIQUE,
  hash       TEXT UNIQUE,
  created_at INTEGER NOT NULL
);
"#;

pub const FIND_APPLIED_MIGRATION: &str =
    "SELECT id FROM __drizzle_migrations WHERE name = ?1 OR hash = ?2";

pub const RECORD_MIGRATION: &str =
    "INSERT INTO __drizzle_migrations (name, hash, created_at) VALUES (?1, ?2, ?3)";

pub const LIST_APPLIED_MIGRATIONS: &str =
    "SELECT name, hash, created_at FROM __drizzle_migrations ORDER BY id ASC";

pub const DELETE_USER_LOGS: &str =
    "DELETE FROM habit_logs WHERE habit_id IN (SELECT id FROM habits WHERE user_id = ?1)";

pub const DELETE_USER_SCHEDULES: &str =
    "DELETE FROM habit_schedules WHERE habit_id IN (SELECT id FROM habits WHERE user_id = ?1)";

pub const DELETE_USER_STREAKS: &str =
    "DELETE FROM habit_streaks WHERE habit_id IN (SELECT id FROM habits WHERE user_id = ?1)";

pub const DELETE_USER_HABITS: &str = "DELETE FROM habits WHERE user_id = ?1";

pub const DELETE_USER: &str = "DELETE FROM users WHERE id = ?1";

/// Children first; foreign keys are enforced.
pub fn delete_user_statements() -> Vec<&'static str> {
    vec![
        DELETE_USER_LOGS,
        DELETE_USER_SCHEDULES,
        DELETE_USER_STREAKS,
        DELETE_USER_HABITS,
        DELETE_USER,
    ]
}
