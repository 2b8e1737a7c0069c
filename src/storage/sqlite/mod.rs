//! SQLite implementations of storage interfaces.

mod bans;
mod outbox_store;
mod projections;

use sqlx::SqlitePool;
use tracing::info;

use crate::storage::schema::{CREATE_CONTEXT_TABLES, CREATE_OUTBOX_TABLE, CREATE_PROJECTION_TABLES};
use crate::storage::Result;

pub use bans::SqliteBanLookup;
pub(crate) use outbox_store::insert_event;
pub use outbox_store::SqliteOutboxStore;
pub use projections::{
    Community, LaunchpadToken, LaunchpadTrade, ProjectionStore, StakeDirection, StakeTransaction,
    UnhandledChainEvent,
};

/// Create every table the pipeline uses. Safe to run on each startup.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for ddl in [CREATE_OUTBOX_TABLE, CREATE_CONTEXT_TABLES, CREATE_PROJECTION_TABLES] {
        sqlx::raw_sql(ddl).execute(pool).await?;
    }
    info!("SQLite schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests;
