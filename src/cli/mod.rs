use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "habitstore",
    about = "Device-local habit tracking store with versioned migrations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Apply pending migrations.
    Migrate,
    Status,
    Doctor,
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Run raw SQL through the proxy adapter and print `{rows}` as JSON.
    Query {
        #[arg(long, default_value = "all")]
        mode: String,
        sql: String,
        /// JSON array of positional parameters.
        params: Option<String>,
    },
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    Habit {
        #[command(subcommand)]
        command: HabitCommands,
    },
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    Set { key: String, value: String },
    Get { key: String },
}

#[derive(Debug, Subcommand)]
pub enum UserCommands {
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum HabitCommands {
    Add {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "type", default_value = "boolean")]
        habit_type: String,
        #[arg(long)]
        target: Option<i64>,
    },
    List {
        #[arg(long)]
        user: i64,
    },
    /// Soft delete.
    Delete { id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum LogCommands {
    Add {
        #[arg(long)]
        habit: i64,
        /// YYYY-MM-DD; defaults to today (local time).
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        value: Option<f64>,
        #[arg(long, default_value_t = false)]
        done: bool,
    },
    List {
        #[arg(long)]
        habit: i64,
    },
}
