//! In-process store
//!
//! Implements the rate and whitelist contracts over plain collections with
//! the same semantics as the database repositories. A ledger session holds
//! the store lock for its whole lifetime, which serializes evaluations the
//! way the advisory lock does in PostgreSQL.

use crate::models::{RateRecord, WhitelistEntry, WhitelistScope, WhitelistScopes};
use crate::repository::{RateLedger, RateStore, WhitelistRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailrate_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Memory-backed rate and whitelist store
#[derive(Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<RateRecord>>>,
    whitelist: Mutex<BTreeMap<String, WhitelistEntry>>,
    accesses: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rate or whitelist lookups served so far
    pub fn accesses(&self) -> usize {
        self.accesses.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail as if the database were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of all rate records
    pub async fn records(&self) -> Vec<RateRecord> {
        self.records.lock().await.clone()
    }

    /// Insert a record directly, bypassing evaluation
    pub async fn seed(&self, record: RateRecord) {
        self.records.lock().await.push(record);
    }

    fn check(&self) -> Result<()> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Database("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RateStore for MemoryStore {
    async fn begin(&self, _sender: &str) -> Result<Box<dyn RateLedger>> {
        self.check()?;
        let records = self.records.clone().lock_owned().await;
        Ok(Box::new(MemoryLedger { records }))
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut records = self.records.lock().await;
        let len = records.len();
        records.retain(|r| r.created >= before);
        Ok((len - records.len()) as u64)
    }
}

/// Ledger holding the store lock
pub struct MemoryLedger {
    records: OwnedMutexGuard<Vec<RateRecord>>,
}

impl MemoryLedger {
    fn window<'a>(
        &'a self,
        sender: &'a str,
        created_after: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a RateRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.sender == sender && r.created > created_after)
    }
}

#[async_trait]
impl RateLedger for MemoryLedger {
    async fn query_rate_records(
        &mut self,
        sender: &str,
        fingerprint: Option<&str>,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RateRecord>> {
        let mut found: Vec<RateRecord> = self
            .records
            .iter()
            .filter(|r| r.sender == sender)
            .filter(|r| fingerprint.map_or(true, |f| r.message_id == f))
            .filter(|r| created_after.map_or(true, |t| r.created > t))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(found)
    }

    async fn count_rate_records(
        &mut self,
        sender: &str,
        created_after: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self.window(sender, created_after).count() as i64)
    }

    async fn sum_recipient_counts(
        &mut self,
        sender: &str,
        created_after: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self
            .window(sender, created_after)
            .map(|r| i64::from(r.count))
            .sum())
    }

    async fn insert(&mut self, record: &RateRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    async fn update(&mut self, record: &RateRecord) -> Result<()> {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                existing.created = record.created;
                Ok(())
            }
            None => Err(Error::Database(format!("rate record {} not found", record.id))),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl WhitelistRepository for MemoryStore {
    async fn exists(&self, address: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .whitelist
            .lock()
            .await
            .get(address)
            .is_some_and(|e| e.scopes.contains(WhitelistScope::RateExemption)))
    }

    async fn add(&self, address: &str, scopes: WhitelistScopes) -> Result<WhitelistEntry> {
        self.check()?;
        let mut whitelist = self.whitelist.lock().await;
        let scopes = match whitelist.get(address) {
            Some(existing) => existing.scopes.union(&scopes),
            None => scopes,
        };
        let entry = WhitelistEntry {
            address: address.to_string(),
            scopes,
            last_changed: Utc::now(),
        };
        whitelist.insert(address.to_string(), entry.clone());
        Ok(entry)
    }

    async fn remove(&self, address: &str) -> Result<u64> {
        self.check()?;
        Ok(self.whitelist.lock().await.remove(address).map_or(0, |_| 1))
    }

    async fn list(&self) -> Result<Vec<WhitelistEntry>> {
        self.check()?;
        Ok(self.whitelist.lock().await.values().cloned().collect())
    }
}
