//! Device-local habit tracking store: table declarations, a versioned migration runner,
//! and a proxy-execution adapter over one embedded SQLite database.

pub mod config;
pub mod db;
pub mod store;
