use anyhow::{Result, bail};
use chrono::serde::{ts_seconds, ts_seconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HabitType {
    Boolean,
    Count,
    Time,
}

impl HabitType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Count => "count",
            Self::Time => "time",
        }
    }
}

impl fmt::Display for HabitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HabitType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "boolean" => Ok(Self::Boolean),
            "count" => Ok(Self::Count),
            "time" => Ok(Self::Time),
            other => bail!("Unsupported habit type: {other}. Expected boolean|count|time"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Custom,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for Frequency {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "custom" => Ok(Self::Custom),
            other => bail!("Unsupported frequency: {other}. Expected daily|weekly|custom"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    /// argon2id PHC string; never serialized outward.
    #[serde(skip_serializing)]
    pub password: String,
    pub profile_image: Option<String>,
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub profile_image: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.profile_image.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Habit {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub habit_type: HabitType,
    pub target_value: Option<i64>,
    pub is_active: bool,
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHabit {
    pub title: String,
    pub description: Option<String>,
    pub habit_type: HabitType,
    pub target_value: Option<i64>,
}

impl NewHabit {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            habit_type: HabitType::Boolean,
            target_value: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HabitChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub habit_type: Option<HabitType>,
    pub target_value: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitSchedule {
    pub id: i64,
    pub habit_id: i64,
    pub frequency: Frequency,
    /// Weekday labels, e.g. `["mon", "thu"]`.
    pub days: Option<Vec<String>>,
    #[serde(with = "ts_seconds")]
    pub start_date: DateTime<Utc>,
    #[serde(with = "ts_seconds_option")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub frequency: Frequency,
    pub days: Option<Vec<String>>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitLog {
    pub id: i64,
    pub habit_id: i64,
    #[serde(with = "ts_seconds")]
    pub log_date: DateTime<Utc>,
    pub value: Option<f64>,
    pub is_completed: bool,
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLog {
    pub log_date: DateTime<Utc>,
    pub value: Option<f64>,
    pub is_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitStreak {
    pub id: i64,
    pub habit_id: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    #[serde(with = "ts_seconds_option")]
    pub last_completed_date: Option<DateTime<Utc>>,
    #[serde(with = "ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct StreakUpdate {
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_completed_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn password_is_not_serialized() {
        let user: User = serde_json::from_value(json!({
            "id": 1,
            "name": "Alice",
            "email": "a@example.com",
            "password": "$argon2id$secret",
            "profile_image": null,
            "created_at": 1_700_000_000,
            "updated_at": 1_700_000_000
        }))
        .expect("user");

        let out = serde_json::to_value(&user).expect("json");
        assert!(out.get("password").is_none());
        assert_eq!(out["created_at"], json!(1_700_000_000));
    }

    #[test]
    fn enums_parse_lowercase_labels() {
        assert_eq!("Count".parse::<HabitType>().expect("type"), HabitType::Count);
        assert_eq!("weekly".parse::<Frequency>().expect("freq"), Frequency::Weekly);
        assert!("hourly".parse::<Frequency>().is_err());
    }
}
