pub mod db;
pub mod models;
pub mod repositories;

pub use sqlx;

/// Embedded migrator, shared with integration tests that run against
/// in-memory SQLite.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
