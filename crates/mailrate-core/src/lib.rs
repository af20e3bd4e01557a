//! mailrate Core - Policy decision engine
//!
//! This crate implements the policy delegation side of mailrate: reading
//! request blocks from the mail server, aggregating them per transaction,
//! and deciding whether a sender is within its hourly limits.

pub mod policy;

pub use policy::{
    fingerprint, AttributeBlock, DeferReason, PolicyService, ProtocolError, ProtocolReader,
    ProtocolState, RateEngine, RateLimits, Responder, ServiceOutcome, Transaction,
    TransactionTable, Verdict, WhitelistCheck,
};
