pub mod models;
pub mod password;

use crate::db::adapter::{Mode, QueryAdapter};
use crate::db::gateway::Gateway;
use crate::db::queries::delete_user_statements;
use crate::db::query::{BuiltQuery, Delete, Insert, Order, Select, Update};
use crate::db::schema::{HABIT_LOGS, HABIT_SCHEDULES, HABIT_STREAKS, HABITS, TableDef, USERS};
use anyhow::{Context, Result, bail};
use models::{
    Habit, HabitChanges, HabitLog, HabitSchedule, HabitStreak, NewHabit, NewLog, NewSchedule,
    ProfileUpdate, StreakUpdate, User,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

/// Rebuilds a typed record from a positional row using the column order the builder recorded.
fn decode<T: DeserializeOwned>(table: TableDef, columns: &[String], values: Vec<Value>) -> Result<T> {
    let object = table.decode_row(columns, values);
    serde_json::from_value(Value::Object(object))
        .with_context(|| format!("Failed to decode {} row", table.name))
}

/// Habit-tracking operations over the proxy adapter.
#[derive(Clone)]
pub struct HabitStore {
    adapter: QueryAdapter,
}

impl HabitStore {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            adapter: QueryAdapter::new(gateway),
        }
    }

    pub fn adapter(&self) -> &QueryAdapter {
        &self.adapter
    }

    async fn fetch_all<T: DeserializeOwned>(&self, table: TableDef, query: BuiltQuery) -> Result<Vec<T>> {
        let columns = query.columns.clone();
        let result = self.adapter.execute_built(query, Mode::All).await?;

        result
            .into_rows()
            .into_iter()
            .map(|values| decode(table, &columns, values))
            .collect()
    }

    async fn fetch_one<T: DeserializeOwned>(&self, table: TableDef, query: BuiltQuery) -> Result<Option<T>> {
        let columns = query.columns.clone();
        let result = self.adapter.execute_built(query, Mode::Get).await?;

        result
            .into_rows()
            .into_iter()
            .next()
            .map(|values| decode(table, &columns, values))
            .transpose()
    }

    async fn run(&self, query: BuiltQuery) -> Result<()> {
        self.adapter.execute_built(query, Mode::Run).await?;
        Ok(())
    }

    // Users

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<User> {
        let existing = Select::table(USERS)
            .columns(&["id"])
            .filter("email", email.to_string())
            .limit(1)
            .build()?;
        if !self
            .adapter
            .execute_built(existing, Mode::All)
            .await?
            .into_rows()
            .is_empty()
        {
            bail!("Email already registered: {email}");
        }

        let query = Insert::table(USERS)
            .value("name", name.to_string())
            .value("email", email.to_string())
            .value("password", password::hash_password(password)?)
            .build()?;
        let user: User = self
            .fetch_one(USERS, query)
            .await?
            .context("Insert into users returned no row")?;

        info!(user_id = user.id, "user registered");
        Ok(user)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User> {
        let query = Select::table(USERS)
            .filter("email", email.to_string())
            .limit(1)
            .build()?;
        let user: Option<User> = self.fetch_one(USERS, query).await?;

        match user {
            Some(user) if password::verify_password(password, &user.password)? => {
                debug!(user_id = user.id, "login verified");
                Ok(user)
            }
            _ => bail!("Invalid email or password"),
        }
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let query = Select::table(USERS).filter("id", user_id).build()?;
        self.fetch_one(USERS, query).await
    }

    /// Only `name` and `profile_image` are editable. Nothing to change yields `None`.
    pub async fn update_profile(&self, user_id: i64, update: ProfileUpdate) -> Result<Option<User>> {
        if update.is_empty() {
            return Ok(None);
        }

        let mut query = Update::table(USERS).filter("id", user_id);
        if let Some(name) = update.name {
            query = query.set("name", name);
        }
        if let Some(profile_image) = update.profile_image {
            query = query.set("profile_image", profile_image);
        }

        self.fetch_one(USERS, query.build()?).await
    }

    pub async fn change_password(&self, user_id: i64, old_password: &str, new_password: &str) -> Result<()> {
        let user = self.get_user(user_id).await?;
        match user {
            Some(user) if password::verify_password(old_password, &user.password)? => {}
            _ => bail!("Incorrect old password"),
        }

        let query = Update::table(USERS)
            .set("password", password::hash_password(new_password)?)
            .filter("id", user_id)
            .build()?;
        self.run(query).await?;

        info!(user_id, "password changed");
        Ok(())
    }

    /// Hard delete. The user's habits and their schedules, logs and streaks go with it.
    pub async fn delete_user(&self, user_id: i64) -> Result<()> {
        self.adapter
            .gateway()
            .transaction(move |tx| {
                for statement in delete_user_statements() {
                    tx.execute(statement, [user_id])
                        .with_context(|| format!("Failed to delete user {user_id}"))?;
                }
                Ok(())
            })
            .await?;

        info!(user_id, "user deleted");
        Ok(())
    }

    // Habits

    pub async fn create_habit(&self, user_id: i64, habit: NewHabit) -> Result<Habit> {
        let query = Insert::table(HABITS)
            .value("user_id", user_id)
            .value("title", habit.title)
            .value("description", habit.description)
            .value("habit_type", habit.habit_type.as_str().to_string())
            .value("target_value", habit.target_value)
            .value("is_active", true)
            .build()?;

        let created: Habit = self
            .fetch_one(HABITS, query)
            .await?
            .context("Insert into habits returned no row")?;
        debug!(habit_id = created.id, user_id, "habit created");
        Ok(created)
    }

    pub async fn list_active_habits(&self, user_id: i64) -> Result<Vec<Habit>> {
        let query = Select::table(HABITS)
            .filter("user_id", user_id)
            .filter("is_active", true)
            .order_by("id", Order::Asc)
            .build()?;
        self.fetch_all(HABITS, query).await
    }

    /// Includes soft-deleted habits.
    pub async fn get_habit(&self, habit_id: i64) -> Result<Option<Habit>> {
        let query = Select::table(HABITS).filter("id", habit_id).build()?;
        self.fetch_one(HABITS, query).await
    }

    pub async fn update_habit(&self, habit_id: i64, changes: HabitChanges) -> Result<Option<Habit>> {
        let mut query = Update::table(HABITS).filter("id", habit_id);
        if let Some(title) = changes.title {
            query = query.set("title", title);
        }
        if let Some(description) = changes.description {
            query = query.set("description", description);
        }
        if let Some(habit_type) = changes.habit_type {
            query = query.set("habit_type", habit_type.as_str().to_string());
        }
        if let Some(target_value) = changes.target_value {
            query = query.set("target_value", target_value);
        }
        if let Some(is_active) = changes.is_active {
            query = query.set("is_active", is_active);
        }

        self.fetch_one(HABITS, query.build()?).await
    }

    /// Soft delete: the row stays, `is_active` drops to false.
    pub async fn delete_habit(&self, habit_id: i64) -> Result<()> {
        let query = Update::table(HABITS)
            .set("is_active", false)
            .filter("id", habit_id)
            .build()?;
        self.run(query).await?;

        debug!(habit_id, "habit deactivated");
        Ok(())
    }

    // Schedules

    pub async fn create_schedule(&self, habit_id: i64, schedule: NewSchedule) -> Result<HabitSchedule> {
        let days = schedule
            .days
            .map(|days| serde_json::to_string(&days))
            .transpose()
            .context("Failed to encode schedule days")?;

        let query = Insert::table(HABIT_SCHEDULES)
            .value("habit_id", habit_id)
            .value("frequency", schedule.frequency.as_str().to_string())
            .value("days", days)
            .value("start_date", schedule.start_date.timestamp())
            .value("end_date", schedule.end_date.map(|date| date.timestamp()))
            .build()?;

        self.fetch_one(HABIT_SCHEDULES, query)
            .await?
            .context("Insert into habit_schedules returned no row")
    }

    pub async fn list_schedules(&self, habit_id: i64) -> Result<Vec<HabitSchedule>> {
        let query = Select::table(HABIT_SCHEDULES)
            .filter("habit_id", habit_id)
            .order_by("id", Order::Asc)
            .build()?;
        self.fetch_all(HABIT_SCHEDULES, query).await
    }

    pub async fn delete_schedule(&self, schedule_id: i64) -> Result<()> {
        let query = Delete::table(HABIT_SCHEDULES).filter("id", schedule_id).build()?;
        self.run(query).await
    }

    // Logs

    /// A second log for the same habit and `log_date` fails with a constraint violation.
    pub async fn create_log(&self, habit_id: i64, log: NewLog) -> Result<HabitLog> {
        let query = Insert::table(HABIT_LOGS)
            .value("habit_id", habit_id)
            .value("log_date", log.log_date.timestamp())
            .value("value", log.value)
            .value("is_completed", log.is_completed)
            .build()?;

        self.fetch_one(HABIT_LOGS, query)
            .await?
            .context("Insert into habit_logs returned no row")
    }

    /// Newest `log_date` first.
    pub async fn list_logs(&self, habit_id: i64) -> Result<Vec<HabitLog>> {
        let query = Select::table(HABIT_LOGS)
            .filter("habit_id", habit_id)
            .order_by("log_date", Order::Desc)
            .build()?;
        self.fetch_all(HABIT_LOGS, query).await
    }

    pub async fn delete_log(&self, log_id: i64) -> Result<()> {
        let query = Delete::table(HABIT_LOGS).filter("id", log_id).build()?;
        self.run(query).await
    }

    // Streaks

    pub async fn get_streak(&self, habit_id: i64) -> Result<Option<HabitStreak>> {
        let query = Select::table(HABIT_STREAKS)
            .filter("habit_id", habit_id)
            .limit(1)
            .build()?;
        self.fetch_one(HABIT_STREAKS, query).await
    }

    pub async fn upsert_streak(&self, habit_id: i64, streak: StreakUpdate) -> Result<HabitStreak> {
        let last_completed = streak.last_completed_date.map(|date| date.timestamp());

        let query = if self.get_streak(habit_id).await?.is_some() {
            Update::table(HABIT_STREAKS)
                .set("current_streak", streak.current_streak)
                .set("longest_streak", streak.longest_streak)
                .set("last_completed_date", last_completed)
                .filter("habit_id", habit_id)
                .build()?
        } else {
            Insert::table(HABIT_STREAKS)
                .value("habit_id", habit_id)
                .value("current_streak", streak.current_streak)
                .value("longest_streak", streak.longest_streak)
                .value("last_completed_date", last_completed)
                .build()?
        };

        self.fetch_one(HABIT_STREAKS, query)
            .await?
            .context("Streak upsert returned no row")
    }
}
