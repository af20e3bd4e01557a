//! Per-transaction request aggregation
//!
//! The mail server issues one request per recipient, all sharing the
//! transaction's `instance` attribute. The table collects the sender and
//! recipients until the DATA stage finishes the transaction.

use super::protocol::AttributeBlock;
use mailrate_common::types::normalize_address;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Sender and recipients of one mail delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    sender: Option<String>,
    recipients: Vec<String>,
    last_seen: Instant,
}

impl Transaction {
    fn new(now: Instant) -> Self {
        Self {
            sender: None,
            recipients: Vec::new(),
            last_seen: now,
        }
    }

    /// Build a transaction from already normalized addresses
    pub fn with_parts(sender: Option<String>, recipients: Vec<String>) -> Self {
        Self {
            sender,
            recipients,
            last_seen: Instant::now(),
        }
    }

    /// Normalized sender, if a valid one has been seen
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Normalized recipients in arrival order, duplicates included
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }
}

/// Transactions in flight, keyed by instance identifier
pub struct TransactionTable {
    entries: HashMap<String, Transaction>,
    delimiter: char,
    ttl: Duration,
    capacity: usize,
}

impl TransactionTable {
    pub fn new(delimiter: char, ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            delimiter,
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, instance: &str) -> Option<&Transaction> {
        self.entries.get(instance)
    }

    /// Fold a request block into its transaction.
    ///
    /// Returns `None` for blocks without an instance identifier. The sender
    /// is taken only from the block that creates the transaction; each
    /// block's recipient is appended.
    pub fn observe(&mut self, block: &AttributeBlock) -> Option<&Transaction> {
        let instance = block.instance()?;
        let now = Instant::now();

        self.evict_stale(now);
        let created = !self.entries.contains_key(instance);
        if created && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        let delimiter = self.delimiter;
        let transaction = self
            .entries
            .entry(instance.to_string())
            .or_insert_with(|| Transaction::new(now));
        transaction.last_seen = now;

        if created {
            if let Some(raw) = block.sender() {
                match normalize_address(raw, delimiter) {
                    Some(sender) => transaction.sender = Some(sender),
                    None if !raw.trim().is_empty() => {
                        warn!(instance, sender = raw, "Ignoring malformed sender")
                    }
                    None => {}
                }
            }
        }

        if let Some(raw) = block.recipient() {
            match normalize_address(raw, delimiter) {
                Some(recipient) => transaction.recipients.push(recipient),
                None if !raw.trim().is_empty() => {
                    warn!(instance, recipient = raw, "Ignoring malformed recipient")
                }
                None => {}
            }
        }

        Some(&*transaction)
    }

    /// Remove and return a finished transaction
    pub fn finish(&mut self, instance: &str) -> Option<Transaction> {
        self.entries.remove(instance)
    }

    fn evict_stale(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, t| now.saturating_duration_since(t.last_seen) <= ttl);

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted stale transactions");
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, t)| t.last_seen)
            .map(|(id, _)| id.clone());

        if let Some(id) = oldest {
            debug!(instance = %id, "Transaction table full, evicting oldest");
            self.entries.remove(&id);
        }
    }
}
