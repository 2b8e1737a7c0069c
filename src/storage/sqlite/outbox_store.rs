//! SQLite OutboxStore implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Cond, Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::outbox::{NewOutboxEvent, OutboxEvent, OutboxStore};
use crate::storage::helpers::{format_timestamp, parse_timestamp};
use crate::storage::schema::Outbox;
use crate::storage::Result;

const EVENT_COLUMNS: [Outbox; 8] = [
    Outbox::Id,
    Outbox::EventName,
    Outbox::EventPayload,
    Outbox::NaturalKey,
    Outbox::Destination,
    Outbox::CreatedAt,
    Outbox::Relayed,
    Outbox::RelayedAt,
];

/// Insert one outbox row on an open connection (normally a transaction).
///
/// Returns `None` when a row with the same destination and natural key
/// already exists.
pub(crate) async fn insert_event(
    conn: &mut SqliteConnection,
    event: &NewOutboxEvent,
) -> Result<Option<i64>> {
    let payload = serde_json::to_string(&event.event_payload)?;
    let created_at = format_timestamp(event.created_at.unwrap_or_else(Utc::now));

    let insert = Query::insert()
        .into_table(Outbox::Table)
        .columns([
            Outbox::EventName,
            Outbox::EventPayload,
            Outbox::NaturalKey,
            Outbox::Destination,
            Outbox::CreatedAt,
            Outbox::Relayed,
        ])
        .values_panic([
            event.event_name.clone().into(),
            payload.into(),
            event.natural_key.clone().into(),
            event.destination.clone().into(),
            created_at.into(),
            false.into(),
        ])
        .on_conflict(
            OnConflict::columns([Outbox::Destination, Outbox::NaturalKey])
                .do_nothing()
                .to_owned(),
        )
        .returning_col(Outbox::Id)
        .to_string(SqliteQueryBuilder);

    let row = sqlx::query(&insert).fetch_optional(&mut *conn).await?;
    Ok(row.map(|row| row.get::<i64, _>("id")))
}

fn row_to_event(row: &SqliteRow) -> Result<OutboxEvent> {
    let payload: String = row.get("event_payload");
    let created_at: String = row.get("created_at");
    let relayed_at: Option<String> = row.get("relayed_at");

    Ok(OutboxEvent {
        id: row.get("id"),
        event_name: row.get("event_name"),
        event_payload: serde_json::from_str(&payload)?,
        natural_key: row.get("natural_key"),
        destination: row.get("destination"),
        created_at: parse_timestamp(&created_at)?,
        relayed: row.get("relayed"),
        relayed_at: relayed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

/// SQLite implementation of OutboxStore.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    /// Create a new SQLite outbox store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn claim_in_tx(
        conn: &mut SqliteConnection,
        worker_id: &str,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>> {
        let now = Utc::now();
        let now_str = format_timestamp(now);
        let lease = chrono::Duration::milliseconds(lease.as_millis() as i64);
        let expires_at = format_timestamp(now + lease);

        let select = Query::select()
            .columns(EVENT_COLUMNS)
            .from(Outbox::Table)
            .cond_where(
                Cond::all()
                    .add(Expr::col(Outbox::Relayed).eq(false))
                    .add(Expr::col(Outbox::ParkedAt).is_null())
                    .add(
                        Cond::any()
                            .add(Expr::col(Outbox::ClaimedBy).is_null())
                            .add(Expr::col(Outbox::ClaimedBy).eq(worker_id))
                            .add(Expr::col(Outbox::ClaimExpiresAt).lt(now_str)),
                    ),
            )
            .order_by(Outbox::CreatedAt, Order::Asc)
            .order_by(Outbox::Id, Order::Asc)
            .limit(u64::from(limit))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&mut *conn).await?;
        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>>>()?;

        if events.is_empty() {
            return Ok(events);
        }

        let update = Query::update()
            .table(Outbox::Table)
            .value(Outbox::ClaimedBy, worker_id)
            .value(Outbox::ClaimExpiresAt, expires_at)
            .and_where(Expr::col(Outbox::Id).is_in(events.iter().map(|e| e.id)))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&update).execute(&mut *conn).await?;

        Ok(events)
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>> {
        // BEGIN IMMEDIATE takes the write lock before the SELECT, so two relays
        // can never read the same unclaimed rows.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::claim_in_tx(&mut conn, worker_id, limit, lease).await {
            Ok(events) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(events)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn mark_relayed(&self, id: i64, worker_id: &str) -> Result<bool> {
        let update = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Relayed, true)
            .value(Outbox::RelayedAt, format_timestamp(Utc::now()))
            .value(Outbox::ClaimedBy, Option::<String>::None)
            .value(Outbox::ClaimExpiresAt, Option::<String>::None)
            .and_where(Expr::col(Outbox::Id).eq(id))
            .and_where(Expr::col(Outbox::Relayed).eq(false))
            .and_where(Expr::col(Outbox::ClaimedBy).eq(worker_id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn park(&self, id: i64, worker_id: &str, reason: &str) -> Result<bool> {
        let update = Query::update()
            .table(Outbox::Table)
            .value(Outbox::ParkedAt, format_timestamp(Utc::now()))
            .value(Outbox::ParkReason, reason)
            .value(Outbox::ClaimedBy, Option::<String>::None)
            .value(Outbox::ClaimExpiresAt, Option::<String>::None)
            .and_where(Expr::col(Outbox::Id).eq(id))
            .and_where(Expr::col(Outbox::Relayed).eq(false))
            .and_where(Expr::col(Outbox::ClaimedBy).eq(worker_id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_claims(&self, worker_id: &str) -> Result<u64> {
        let update = Query::update()
            .table(Outbox::Table)
            .value(Outbox::ClaimedBy, Option::<String>::None)
            .value(Outbox::ClaimExpiresAt, Option::<String>::None)
            .and_where(Expr::col(Outbox::ClaimedBy).eq(worker_id))
            .and_where(Expr::col(Outbox::Relayed).eq(false))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(Outbox::Id).count())
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Relayed).eq(false))
            .and_where(Expr::col(Outbox::ParkedAt).is_null())
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn parked_count(&self) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(Outbox::Id).count())
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::ParkedAt).is_not_null())
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn prune_relayed(&self, older_than: chrono::DateTime<Utc>) -> Result<u64> {
        let delete = Query::delete()
            .from_table(Outbox::Table)
            .and_where(Expr::col(Outbox::Relayed).eq(true))
            .and_where(Expr::col(Outbox::RelayedAt).lt(format_timestamp(older_than)))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&delete).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn fetch(&self, id: i64) -> Result<Option<OutboxEvent>> {
        let query = Query::select()
            .columns(EVENT_COLUMNS)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_event).transpose()
    }
}
