//! Policy delegation module
//!
//! Protocol reader, per-transaction aggregation, whitelist exemption, the
//! rate/dedup engine and the verdict responder, tied together by
//! [`PolicyService`].

mod aggregator;
mod engine;
mod protocol;
mod service;
mod verdict;
mod whitelist;

pub use aggregator::{Transaction, TransactionTable};
pub use engine::{fingerprint, RateEngine, RateLimits};
pub use protocol::{AttributeBlock, ProtocolError, ProtocolReader, ProtocolState};
pub use service::{PolicyService, ServiceOutcome};
pub use verdict::{DeferReason, Responder, Verdict};
pub use whitelist::WhitelistCheck;
