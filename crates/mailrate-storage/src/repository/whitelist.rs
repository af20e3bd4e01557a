//! Whitelist repository

use crate::db::DatabasePool;
use crate::models::{WhitelistEntry, WhitelistRow, WhitelistScope, WhitelistScopes};
use async_trait::async_trait;
use mailrate_common::{Error, Result};

/// Whitelist repository trait
#[async_trait]
pub trait WhitelistRepository: Send + Sync {
    /// Whether `address` has an entry carrying the rate exemption
    async fn exists(&self, address: &str) -> Result<bool>;

    /// Add an entry, merging scopes into an existing entry for the same address
    async fn add(&self, address: &str, scopes: WhitelistScopes) -> Result<WhitelistEntry>;

    /// Remove entries matching `address` exactly
    async fn remove(&self, address: &str) -> Result<u64>;

    async fn list(&self) -> Result<Vec<WhitelistEntry>>;
}

/// Database whitelist repository
pub struct DbWhitelistRepository {
    pool: DatabasePool,
}

impl DbWhitelistRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WhitelistRepository for DbWhitelistRepository {
    async fn exists(&self, address: &str) -> Result<bool> {
        let (found,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM whitelist WHERE address = $1 AND (type & $2) <> 0)",
        )
        .bind(address)
        .bind(WhitelistScope::RateExemption.bit())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(found)
    }

    async fn add(&self, address: &str, scopes: WhitelistScopes) -> Result<WhitelistEntry> {
        let now = chrono::Utc::now();

        let row = sqlx::query_as::<_, WhitelistRow>(
            r#"
            INSERT INTO whitelist (address, type, last_changed)
            VALUES ($1, $2, $3)
            ON CONFLICT (address) DO UPDATE SET
                type = whitelist.type | EXCLUDED.type,
                last_changed = EXCLUDED.last_changed
            RETURNING address, type, last_changed
            "#,
        )
        .bind(address)
        .bind(scopes.to_bits())
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.into())
    }

    async fn remove(&self, address: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM whitelist WHERE address = $1")
            .bind(address)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn list(&self) -> Result<Vec<WhitelistEntry>> {
        let rows = sqlx::query_as::<_, WhitelistRow>(
            "SELECT address, type, last_changed FROM whitelist ORDER BY address ASC",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(WhitelistEntry::from).collect())
    }
}
