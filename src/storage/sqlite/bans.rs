//! SQLite BanLookup implementation.

use async_trait::async_trait;
use sea_query::{Expr, Func, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::cache::BanLookup;
use crate::storage::schema::CommunityBans;
use crate::storage::Result;

/// Reads `community_bans`, the platform's source of truth for bans.
#[derive(Clone)]
pub struct SqliteBanLookup {
    pool: SqlitePool,
}

impl SqliteBanLookup {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BanLookup for SqliteBanLookup {
    async fn is_banned(&self, community_id: &str, address: &str) -> Result<bool> {
        let query = Query::select()
            .expr(Expr::col(CommunityBans::Address).count())
            .from(CommunityBans::Table)
            .and_where(Expr::col(CommunityBans::CommunityId).eq(community_id))
            .and_where(
                Expr::expr(Func::lower(Expr::col(CommunityBans::Address)))
                    .eq(address.to_lowercase()),
            )
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }
}
