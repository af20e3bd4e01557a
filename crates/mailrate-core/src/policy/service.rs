//! Policy service loop
//!
//! Answers every request block with a verdict. Non-terminal stages are
//! allowed without consulting the store; the DATA stage finishes the
//! transaction, runs the rate engine and ends the loop.

use super::aggregator::TransactionTable;
use super::engine::RateEngine;
use super::protocol::{AttributeBlock, ProtocolError, ProtocolReader};
use super::verdict::{Responder, Verdict};
use mailrate_common::config::ProtocolConfig;
use mailrate_common::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, info, warn};

/// How the service loop ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// A terminal verdict was sent
    Decided(Verdict),
    /// No complete request arrived in time; nothing was sent
    TimedOut,
    /// The mail server closed the connection
    InputClosed,
}

/// Reads requests, aggregates them and writes verdicts
pub struct PolicyService<R, W> {
    reader: ProtocolReader<R>,
    responder: Responder<W>,
    transactions: TransactionTable,
    engine: RateEngine,
}

impl<R, W> PolicyService<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, engine: RateEngine, config: &ProtocolConfig) -> Result<Self> {
        Ok(Self {
            reader: ProtocolReader::new(reader, config.read_timeout()),
            responder: Responder::new(writer),
            transactions: TransactionTable::new(
                config.delimiter()?,
                config.transaction_ttl(),
                config.max_transactions,
            ),
            engine,
        })
    }

    /// Serve requests until a terminal verdict, a timeout or end of input.
    ///
    /// Store and I/O failures are returned as errors without writing a
    /// verdict, leaving the mail server to apply its own timeout.
    pub async fn run(&mut self) -> Result<ServiceOutcome> {
        loop {
            let block = match self.reader.read_block().await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    debug!("Input closed");
                    return Ok(ServiceOutcome::InputClosed);
                }
                Err(ProtocolError::Timeout(timeout)) => {
                    info!(?timeout, "Timed out waiting for request");
                    return Ok(ServiceOutcome::TimedOut);
                }
                Err(e @ ProtocolError::Io(_)) => return Err(Error::Protocol(e.to_string())),
            };

            let verdict = self.handle(&block).await?;

            self.responder
                .send(&verdict)
                .await
                .map_err(|e| Error::Protocol(format!("Failed to write response: {}", e)))?;

            if verdict.is_terminal() {
                return Ok(ServiceOutcome::Decided(verdict));
            }
        }
    }

    async fn handle(&mut self, block: &AttributeBlock) -> Result<Verdict> {
        let state = block.protocol_state();

        let Some(instance) = block.instance() else {
            warn!(?state, "Request without instance, skipping");
            return Ok(Verdict::Allow);
        };

        self.transactions.observe(block);
        debug!(instance, ?state, "Request aggregated");

        if !state.is_terminal() {
            return Ok(Verdict::Allow);
        }

        match self.transactions.finish(instance) {
            Some(transaction) => self.engine.evaluate(&transaction).await,
            None => Err(Error::Internal(format!(
                "transaction {} vanished before evaluation",
                instance
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::engine::RateLimits;
    use crate::policy::verdict::DeferReason;
    use chrono::{Duration, Utc};
    use mailrate_common::config::LimitsConfig;
    use mailrate_storage::{MemoryStore, RateRecord};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn serve(store: &Arc<MemoryStore>, input: &str) -> (Result<ServiceOutcome>, String) {
        serve_bytes(store, input.as_bytes()).await
    }

    async fn serve_bytes(
        store: &Arc<MemoryStore>,
        input: &[u8],
    ) -> (Result<ServiceOutcome>, String) {
        let limits = RateLimits::from_config(&LimitsConfig::default()).unwrap();
        let engine = RateEngine::new(store.clone(), store.clone(), limits);
        let mut out = Vec::new();
        let outcome = {
            let mut service =
                PolicyService::new(input, &mut out, engine, &ProtocolConfig::default())
                    .unwrap();
            service.run().await
        };
        (outcome, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_end_to_end_first_message() {
        let store = Arc::new(MemoryStore::new());
        let input = "instance=ABC\nprotocol_state=rcpt\nsender=a@b.com\nrecipient=c@d.com\n\n\
                     instance=ABC\nprotocol_state=data\n\n";

        let (outcome, output) = serve(&store, input).await;

        assert_eq!(outcome.unwrap(), ServiceOutcome::Decided(Verdict::FinalAllow));
        assert_eq!(output, "action=DUNNO\n\naction=DUNNO\n\n");

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sender, "a@b.com");
        assert_eq!(records[0].count, 1);
    }

    #[tokio::test]
    async fn test_non_terminal_stage_never_touches_store() {
        let store = Arc::new(MemoryStore::new());
        let input = "instance=X\nprotocol_state=RCPT\nsender=a@b.com\nrecipient=c@d.com\n\n\
                     instance=X\nprotocol_state=RCPT\nsender=a@b.com\nrecipient=e@d.com\n\n";

        let (outcome, output) = serve(&store, input).await;

        assert_eq!(outcome.unwrap(), ServiceOutcome::InputClosed);
        assert_eq!(output, "action=DUNNO\n\naction=DUNNO\n\n");
        assert_eq!(store.accesses(), 0);
    }

    #[tokio::test]
    async fn test_defer_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..11 {
            store
                .seed(RateRecord::new(
                    "a@b.com",
                    format!("m{}", i),
                    1,
                    Utc::now() - Duration::minutes(1),
                ))
                .await;
        }
        let input = "instance=X\nprotocol_state=RCPT\nsender=a@b.com\nrecipient=c@d.com\n\n\
                     instance=X\nprotocol_state=DATA\nsender=a@b.com\n\n\
                     instance=Y\nprotocol_state=RCPT\n\n";

        let (outcome, output) = serve(&store, input).await;

        assert_eq!(
            outcome.unwrap(),
            ServiceOutcome::Decided(Verdict::Defer(DeferReason::TooManyMessages))
        );
        // The third block is never read
        assert_eq!(output, "action=DUNNO\n\naction=DEFER too many messages\n\n");
    }

    #[tokio::test]
    async fn test_block_without_instance_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let input = "protocol_state=DATA\nsender=a@b.com\nrecipient=c@d.com\n\n";

        let (outcome, output) = serve(&store, input).await;

        assert_eq!(outcome.unwrap(), ServiceOutcome::InputClosed);
        assert_eq!(output, "action=DUNNO\n\n");
        assert_eq!(store.accesses(), 0);
    }

    #[tokio::test]
    async fn test_bounce_with_null_sender() {
        let store = Arc::new(MemoryStore::new());
        let input = "instance=B\nprotocol_state=RCPT\nsender=\nrecipient=c@d.com\n\n\
                     instance=B\nprotocol_state=DATA\nsender=\n\n";

        let (outcome, output) = serve(&store, input).await;

        assert_eq!(outcome.unwrap(), ServiceOutcome::Decided(Verdict::FinalAllow));
        assert_eq!(output, "action=DUNNO\n\naction=DUNNO\n\n");
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_sends_no_verdict() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let input = "instance=X\nprotocol_state=RCPT\nsender=a@b.com\nrecipient=c@d.com\n\n\
                     instance=X\nprotocol_state=DATA\n\n";

        let (outcome, output) = serve(&store, input).await;

        assert!(outcome.is_err());
        assert_eq!(output, "action=DUNNO\n\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_quiet() {
        let store = Arc::new(MemoryStore::new());
        let limits = RateLimits::from_config(&LimitsConfig::default()).unwrap();
        let engine = RateEngine::new(store.clone(), store.clone(), limits);
        let (client, _server) = tokio::io::duplex(64);
        let mut out = Vec::new();

        let outcome = {
            let mut service = PolicyService::new(
                tokio::io::BufReader::new(client),
                &mut out,
                engine,
                &ProtocolConfig::default(),
            )
            .unwrap();
            service.run().await.unwrap()
        };

        assert_eq!(outcome, ServiceOutcome::TimedOut);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_whitelisted_sender_end_to_end() {
        use mailrate_storage::{WhitelistRepository, WhitelistScopes};

        let store = Arc::new(MemoryStore::new());
        store
            .add("b.com", WhitelistScopes::for_address("b.com"))
            .await
            .unwrap();
        for i in 0..20 {
            store
                .seed(RateRecord::new("a@b.com", format!("m{}", i), 10, Utc::now()))
                .await;
        }
        let input = "instance=W\nprotocol_state=RCPT\nsender=A+promo@B.com\nrecipient=c@d.com\n\n\
                     instance=W\nprotocol_state=DATA\n\n";

        let (outcome, output) = serve(&store, input).await;

        assert_eq!(outcome.unwrap(), ServiceOutcome::Decided(Verdict::FinalAllow));
        assert_eq!(output, "action=DUNNO\n\naction=DUNNO\n\n");
    }

    #[tokio::test]
    async fn test_undecodable_attribute_still_answered() {
        let store = Arc::new(MemoryStore::new());
        let input: &[u8] = b"instance=A\nprotocol_state=RCPT\nhelo_name=\xff\xfe\n\
                             sender=a@b.com\nrecipient=c@d.com\n\n\
                             instance=A\nprotocol_state=DATA\n\n";

        let (outcome, output) = serve_bytes(&store, input).await;

        assert_eq!(outcome.unwrap(), ServiceOutcome::Decided(Verdict::FinalAllow));
        assert_eq!(output, "action=DUNNO\n\naction=DUNNO\n\n");
        assert_eq!(store.records().await.len(), 1);
    }
}
