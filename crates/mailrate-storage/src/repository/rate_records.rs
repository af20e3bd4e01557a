//! Rate record repository
//!
//! Evaluation of one sender runs inside a [`RateLedger`] session. Sessions
//! for the same sender are serialized across processes, so the
//! count-then-insert sequence of the rate engine cannot interleave with a
//! concurrent evaluation of that sender.

use crate::db::DatabasePool;
use crate::models::RateRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailrate_common::{Error, Result};
use sqlx::{Postgres, Transaction};
use tracing::debug;

/// Rate record store
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Open a ledger session holding the per-sender lock
    async fn begin(&self, sender: &str) -> Result<Box<dyn RateLedger>>;

    /// Delete records created before `before`, returning how many were removed
    async fn prune(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Reads and writes of rate records within one serialized session.
///
/// Dropping a ledger without calling [`RateLedger::commit`] discards its
/// writes where the backend supports it.
#[async_trait]
pub trait RateLedger: Send {
    async fn query_rate_records(
        &mut self,
        sender: &str,
        fingerprint: Option<&str>,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RateRecord>>;

    async fn count_rate_records(&mut self, sender: &str, created_after: DateTime<Utc>)
        -> Result<i64>;

    async fn sum_recipient_counts(
        &mut self,
        sender: &str,
        created_after: DateTime<Utc>,
    ) -> Result<i64>;

    async fn insert(&mut self, record: &RateRecord) -> Result<()>;

    /// Persist a changed `created` timestamp of an existing record
    async fn update(&mut self, record: &RateRecord) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Database rate record store
pub struct DbRateStore {
    pool: DatabasePool,
}

impl DbRateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateStore for DbRateStore {
    async fn begin(&self, sender: &str) -> Result<Box<dyn RateLedger>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // Held until commit or rollback
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(sender)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        debug!(sender, "Acquired sender lock");

        Ok(Box::new(DbRateLedger { tx }))
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_records WHERE created < $1")
            .bind(before)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

/// Ledger backed by a database transaction
pub struct DbRateLedger {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RateLedger for DbRateLedger {
    async fn query_rate_records(
        &mut self,
        sender: &str,
        fingerprint: Option<&str>,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RateRecord>> {
        sqlx::query_as::<_, RateRecord>(
            r#"
            SELECT id, sender, message_id, count, created FROM rate_records
            WHERE sender = $1
              AND ($2::TEXT IS NULL OR message_id = $2)
              AND ($3::TIMESTAMPTZ IS NULL OR created > $3)
            ORDER BY created DESC
            "#,
        )
        .bind(sender)
        .bind(fingerprint)
        .bind(created_after)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn count_rate_records(
        &mut self,
        sender: &str,
        created_after: DateTime<Utc>,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM rate_records WHERE sender = $1 AND created > $2",
        )
        .bind(sender)
        .bind(created_after)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count)
    }

    async fn sum_recipient_counts(
        &mut self,
        sender: &str,
        created_after: DateTime<Utc>,
    ) -> Result<i64> {
        let (sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(count), 0)::BIGINT FROM rate_records
            WHERE sender = $1 AND created > $2
            "#,
        )
        .bind(sender)
        .bind(created_after)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(sum)
    }

    async fn insert(&mut self, record: &RateRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_records (id, sender, message_id, count, created)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(&record.sender)
        .bind(&record.message_id)
        .bind(record.count)
        .bind(record.created)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn update(&mut self, record: &RateRecord) -> Result<()> {
        sqlx::query("UPDATE rate_records SET created = $2 WHERE id = $1")
            .bind(record.id)
            .bind(record.created)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
