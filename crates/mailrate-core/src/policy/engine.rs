//! Rate/Dedup Engine - Evaluates a finished transaction against hourly limits
//!
//! Every accepted delivery attempt leaves a rate record keyed by sender and
//! recipient fingerprint. The engine counts the sender's records in the
//! trailing window and defers once the configured limits are exceeded.
//! Mail servers retry deferred and failed deliveries, so an attempt whose
//! fingerprint was already recorded within the queue lifetime only refreshes
//! that record instead of being counted again.

use super::aggregator::Transaction;
use super::verdict::{DeferReason, Verdict};
use super::whitelist::WhitelistCheck;
use chrono::{DateTime, Duration, Utc};
use mailrate_common::config::LimitsConfig;
use mailrate_common::{Error, Result};
use mailrate_storage::{RateRecord, RateStore, WhitelistRepository};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Fingerprint of a recipient set.
///
/// Independent of recipient order and of duplicates.
pub fn fingerprint(recipients: &[String]) -> String {
    let unique: BTreeSet<&str> = recipients.iter().map(String::as_str).collect();

    let mut hasher = Sha256::new();
    for recipient in unique {
        hasher.update(recipient.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Thresholds and windows used by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits {
    pub messages_per_window: i64,
    pub recipients_per_window: i64,
    pub window: Duration,
    pub queue_lifetime: Duration,
}

impl RateLimits {
    pub fn from_config(config: &LimitsConfig) -> Result<Self> {
        let to_chrono = |d: std::time::Duration| {
            Duration::from_std(d).map_err(|e| Error::Config(format!("Invalid duration: {}", e)))
        };

        Ok(Self {
            messages_per_window: config.messages_per_hour,
            recipients_per_window: config.recipients_per_hour,
            window: to_chrono(config.window())?,
            queue_lifetime: to_chrono(config.queue_lifetime())?,
        })
    }

    /// Apply the thresholds to the counts observed before this attempt
    pub fn check(&self, messages: i64, recipients: i64) -> Verdict {
        if messages > self.messages_per_window {
            Verdict::Defer(DeferReason::TooManyMessages)
        } else if recipients > self.recipients_per_window {
            Verdict::Defer(DeferReason::TooManyRecipients)
        } else {
            Verdict::FinalAllow
        }
    }
}

/// Rate/dedup engine
pub struct RateEngine {
    store: Arc<dyn RateStore>,
    whitelist: WhitelistCheck,
    limits: RateLimits,
}

impl RateEngine {
    pub fn new(
        store: Arc<dyn RateStore>,
        whitelist: Arc<dyn WhitelistRepository>,
        limits: RateLimits,
    ) -> Self {
        Self {
            store,
            whitelist: WhitelistCheck::new(whitelist),
            limits,
        }
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Evaluate a transaction that reached the DATA stage
    pub async fn evaluate(&self, transaction: &Transaction) -> Result<Verdict> {
        self.evaluate_at(transaction, Utc::now()).await
    }

    /// Evaluate as of `now`
    pub async fn evaluate_at(
        &self,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        let Some(sender) = transaction.sender() else {
            info!("No usable sender, transaction not counted");
            return Ok(Verdict::FinalAllow);
        };

        let recipients = transaction.recipients();
        if recipients.is_empty() {
            info!(sender, "No usable recipients, transaction not counted");
            return Ok(Verdict::FinalAllow);
        }

        if self.whitelist.is_exempt(sender).await? {
            info!(sender, "Sender whitelisted, skipping rate check");
            return Ok(Verdict::FinalAllow);
        }

        let message_id = fingerprint(recipients);

        // Counting and inserting must see a consistent view for this sender
        let mut ledger = self.store.begin(sender).await?;

        let previous = ledger
            .query_rate_records(
                sender,
                Some(&message_id),
                Some(now - self.limits.queue_lifetime),
            )
            .await?;

        let resubmission = match previous.into_iter().next() {
            Some(mut record) => {
                debug!(sender, message_id = %record.message_id, "Resubmission, refreshing record");
                record.created = now;
                ledger.update(&record).await?;
                true
            }
            None => false,
        };

        let window_start = now - self.limits.window;
        let messages = ledger.count_rate_records(sender, window_start).await?;
        let recipient_total = ledger.sum_recipient_counts(sender, window_start).await?;

        let verdict = self.limits.check(messages, recipient_total);

        if !resubmission && verdict == Verdict::FinalAllow {
            let count = i32::try_from(recipients.len()).unwrap_or(i32::MAX);
            ledger
                .insert(&RateRecord::new(sender, message_id.as_str(), count, now))
                .await?;
        }

        ledger.commit().await?;

        info!(
            sender,
            messages,
            recipients = recipient_total,
            resubmission,
            verdict = %verdict,
            "Rate evaluation complete"
        );

        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailrate_storage::{MemoryStore, WhitelistScopes};
    use pretty_assertions::assert_eq;

    fn limits() -> RateLimits {
        RateLimits {
            messages_per_window: 10,
            recipients_per_window: 100,
            window: Duration::hours(1),
            queue_lifetime: Duration::days(5),
        }
    }

    fn engine(store: &Arc<MemoryStore>) -> RateEngine {
        RateEngine::new(store.clone(), store.clone(), limits())
    }

    fn transaction(sender: &str, recipients: &[&str]) -> Transaction {
        Transaction::with_parts(
            Some(sender.to_string()),
            recipients.iter().map(|r| r.to_string()).collect(),
        )
    }

    async fn seed_messages(store: &MemoryStore, sender: &str, n: usize, count: i32, at: DateTime<Utc>) {
        for i in 0..n {
            store
                .seed(RateRecord::new(sender, format!("seed-{}", i), count, at))
                .await;
        }
    }

    #[test]
    fn test_fingerprint_ignores_order_and_duplicates() {
        let a = vec!["x@a.com".to_string(), "y@b.com".to_string()];
        let b = vec![
            "y@b.com".to_string(),
            "x@a.com".to_string(),
            "y@b.com".to_string(),
        ];
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);

        let c = vec!["x@a.com".to_string()];
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_fingerprint_separates_addresses() {
        let joined = vec!["ab@c.com".to_string()];
        let split = vec!["a".to_string(), "b@c.com".to_string()];
        assert_ne!(fingerprint(&joined), fingerprint(&split));
    }

    #[test]
    fn test_limits_from_config() {
        let limits = RateLimits::from_config(&LimitsConfig::default()).unwrap();
        assert_eq!(limits, self::limits());
    }

    #[test]
    fn test_check_prefers_message_limit() {
        let limits = limits();
        assert_eq!(limits.check(10, 100), Verdict::FinalAllow);
        assert_eq!(
            limits.check(11, 500),
            Verdict::Defer(DeferReason::TooManyMessages)
        );
        assert_eq!(
            limits.check(1, 101),
            Verdict::Defer(DeferReason::TooManyRecipients)
        );
    }

    #[tokio::test]
    async fn test_first_message_is_recorded() {
        let store = Arc::new(MemoryStore::new());
        let verdict = engine(&store)
            .evaluate(&transaction("a@b.com", &["c@d.com"]))
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::FinalAllow);
        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sender, "a@b.com");
        assert_eq!(records[0].count, 1);
        assert_eq!(records[0].message_id, fingerprint(&["c@d.com".to_string()]));
    }

    #[tokio::test]
    async fn test_count_uses_raw_recipient_list() {
        let store = Arc::new(MemoryStore::new());
        engine(&store)
            .evaluate(&transaction("a@b.com", &["c@d.com", "c@d.com", "e@f.com"]))
            .await
            .unwrap();

        assert_eq!(store.records().await[0].count, 3);
    }

    #[tokio::test]
    async fn test_resubmission_refreshes_without_counting() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let now = Utc::now();
        let tx = transaction("a@b.com", &["c@d.com", "e@f.com"]);

        engine.evaluate_at(&tx, now - Duration::minutes(30)).await.unwrap();
        let reordered = transaction("a@b.com", &["e@f.com", "c@d.com"]);
        let verdict = engine.evaluate_at(&reordered, now).await.unwrap();
        assert_eq!(verdict, Verdict::FinalAllow);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].created, now);

        // An unrelated message afterwards sees only the one recorded message
        engine
            .evaluate_at(&transaction("a@b.com", &["z@y.com"]), now)
            .await
            .unwrap();
        let mut ledger = store.begin("a@b.com").await.unwrap();
        let messages = ledger
            .count_rate_records("a@b.com", now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(messages, 2);
    }

    #[tokio::test]
    async fn test_resubmission_after_queue_lifetime_is_new() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let now = Utc::now();
        let tx = transaction("a@b.com", &["c@d.com"]);

        engine.evaluate_at(&tx, now - Duration::days(6)).await.unwrap();
        engine.evaluate_at(&tx, now).await.unwrap();

        assert_eq!(store.records().await.len(), 2);
    }

    #[tokio::test]
    async fn test_message_threshold() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_messages(&store, "a@b.com", 11, 1, now - Duration::minutes(5)).await;

        let verdict = engine(&store)
            .evaluate_at(&transaction("a@b.com", &["new@d.com"]), now)
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::Defer(DeferReason::TooManyMessages));
        assert_eq!(store.records().await.len(), 11);
    }

    #[tokio::test]
    async fn test_message_limit_is_inclusive() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_messages(&store, "a@b.com", 10, 1, now - Duration::minutes(5)).await;

        let verdict = engine(&store)
            .evaluate_at(&transaction("a@b.com", &["new@d.com"]), now)
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::FinalAllow);
        assert_eq!(store.records().await.len(), 11);
    }

    #[tokio::test]
    async fn test_recipient_threshold() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .seed(RateRecord::new("a@b.com", "big", 60, now - Duration::minutes(20)))
            .await;
        store
            .seed(RateRecord::new("a@b.com", "bigger", 41, now - Duration::minutes(10)))
            .await;

        let verdict = engine(&store)
            .evaluate_at(&transaction("a@b.com", &["new@d.com"]), now)
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::Defer(DeferReason::TooManyRecipients));
        assert_eq!(store.records().await.len(), 2);
    }

    #[tokio::test]
    async fn test_old_records_fall_out_of_window() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_messages(&store, "a@b.com", 20, 50, now - Duration::minutes(61)).await;

        let verdict = engine(&store)
            .evaluate_at(&transaction("a@b.com", &["new@d.com"]), now)
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::FinalAllow);
    }

    #[tokio::test]
    async fn test_limits_are_per_sender() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_messages(&store, "noisy@b.com", 50, 1, now).await;

        let verdict = engine(&store)
            .evaluate_at(&transaction("quiet@b.com", &["c@d.com"]), now)
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::FinalAllow);
    }

    #[tokio::test]
    async fn test_whitelisted_sender_bypasses_limits() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_messages(&store, "vip@b.com", 50, 10, now).await;
        store
            .add("vip@b.com", WhitelistScopes::for_address("vip@b.com"))
            .await
            .unwrap();

        let verdict = engine(&store)
            .evaluate_at(&transaction("vip@b.com", &["c@d.com"]), now)
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::FinalAllow);
        assert_eq!(store.records().await.len(), 50);
    }

    #[tokio::test]
    async fn test_whitelisted_domain_bypasses_limits() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_messages(&store, "bulk@b.com", 50, 10, now).await;
        store
            .add("b.com", WhitelistScopes::for_address("b.com"))
            .await
            .unwrap();

        let verdict = engine(&store)
            .evaluate_at(&transaction("bulk@b.com", &["c@d.com"]), now)
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::FinalAllow);
    }

    #[tokio::test]
    async fn test_missing_sender_is_not_counted() {
        let store = Arc::new(MemoryStore::new());
        let tx = Transaction::with_parts(None, vec!["c@d.com".to_string()]);

        let verdict = engine(&store).evaluate(&tx).await.unwrap();

        assert_eq!(verdict, Verdict::FinalAllow);
        assert_eq!(store.accesses(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let result = engine(&store)
            .evaluate(&transaction("a@b.com", &["c@d.com"]))
            .await;

        assert_eq!(result.unwrap_err().code(), "DATABASE_ERROR");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_evaluations_are_serialized() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        seed_messages(&store, "a@b.com", 10, 1, now - Duration::minutes(5)).await;

        let first = engine(&store);
        let second = engine(&store);
        let tx_one = transaction("a@b.com", &["one@d.com"]);
        let tx_two = transaction("a@b.com", &["two@d.com"]);

        let (one, two) = tokio::join!(
            first.evaluate_at(&tx_one, now),
            second.evaluate_at(&tx_two, now)
        );
        let mut verdicts = vec![one.unwrap(), two.unwrap()];
        verdicts.sort_by_key(|v| matches!(v, Verdict::Defer(_)));

        assert_eq!(
            verdicts,
            vec![
                Verdict::FinalAllow,
                Verdict::Defer(DeferReason::TooManyMessages)
            ]
        );
        assert_eq!(store.records().await.len(), 11);
    }
}
