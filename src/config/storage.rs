//! Storage configuration types.

use serde::Deserialize;

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file. `:memory:` keeps everything in process.
    pub path: String,
    /// Maximum pooled connections. Forced to 1 for in-memory databases,
    /// since every SQLite memory connection is its own database.
    pub max_connections: u32,
    /// Seconds to wait for the database at startup before giving up.
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/chainrelay.db".to_string(),
            max_connections: 5,
            connect_timeout_secs: 30,
        }
    }
}

impl StorageConfig {
    /// In-memory database, used by tests and throwaway standalone runs.
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            max_connections: 1,
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }

    /// sqlx connection URL for this config.
    pub fn url(&self) -> String {
        if self.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", self.path)
        }
    }
}
