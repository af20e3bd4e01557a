//! mailrate Common - Shared types and utilities
//!
//! This crate provides the error type, configuration and address handling
//! shared across all mailrate components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::EmailAddress;
