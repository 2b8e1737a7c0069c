//! Storage implementations.
//!
//! SQLite is the only backend: the outbox must live in the same database as
//! the business writes it records, and the platform's database is SQLite.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::StorageConfig;

pub mod helpers;
pub mod schema;
pub mod sqlite;

pub use sqlite::{
    Community, LaunchpadToken, LaunchpadTrade, ProjectionStore, SqliteBanLookup, SqliteOutboxStore,
    StakeDirection, StakeTransaction, UnhandledChainEvent,
};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid amount in {column}: {value} ({reason})")]
    InvalidAmount {
        column: String,
        value: String,
        reason: String,
    },

    #[error("Unknown outbox destination: {0}")]
    UnknownDestination(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open the SQLite pool described by `config` and apply the schema.
///
/// In-memory databases are per-connection, so the pool is pinned to a single
/// connection that is never recycled.
pub async fn init_storage(config: &StorageConfig) -> Result<SqlitePool> {
    info!(path = %config.path, "Storage: sqlite");

    if !config.is_in_memory() {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(&config.url())?.create_if_missing(true);

    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));
    if config.is_in_memory() {
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;
    sqlite::migrate(&pool).await?;
    Ok(pool)
}
