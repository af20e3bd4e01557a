//! mailrate Storage - Rate record and whitelist persistence
//!
//! This crate provides the PostgreSQL-backed store consumed by the policy
//! engine, plus an in-process store with the same semantics.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
