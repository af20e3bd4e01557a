//! Repository layer for data access

pub mod rate_records;
pub mod whitelist;

// Re-export concrete repository implementations with simple names
pub use rate_records::DbRateStore;
pub use whitelist::DbWhitelistRepository;

// Re-export repository traits
pub use rate_records::{RateLedger, RateStore};
pub use whitelist::WhitelistRepository;
