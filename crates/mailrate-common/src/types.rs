//! Common types for mailrate

use serde::{Deserialize, Serialize};

/// Default recipient delimiter used by address normalization
pub const DEFAULT_RECIPIENT_DELIMITER: char = '+';

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string, tolerating angle brackets
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>').trim();
        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }

    /// Parse and canonicalize an address for comparison.
    ///
    /// The whole address is lower-cased and any sub-address introduced by
    /// `delimiter` is dropped from the local part, so `User+tag@Example.COM`
    /// becomes `user@example.com`. Returns `None` when there is no `@` or
    /// either side of it is empty.
    pub fn normalize(raw: &str, delimiter: char) -> Option<Self> {
        let address = Self::parse(raw)?;
        let local = address.local.to_lowercase();
        let domain = address.domain.to_lowercase();

        let local = match local.split_once(delimiter) {
            Some((base, _)) if !base.is_empty() => base.to_string(),
            _ => local,
        };

        Some(Self::new(local, domain))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Normalize a raw address into its canonical string form
pub fn normalize_address(raw: &str, delimiter: char) -> Option<String> {
    EmailAddress::normalize(raw, delimiter).map(|a| a.to_string())
}

/// Canonical key for a whitelist entry: a normalized address or a bare domain
pub fn whitelist_key(raw: &str, delimiter: char) -> crate::Result<String> {
    let raw = raw.trim();
    if raw.contains('@') {
        return normalize_address(raw, delimiter)
            .ok_or_else(|| crate::Error::Validation(format!("Invalid email address: {}", raw)));
    }

    if raw.is_empty() || raw.chars().any(char::is_whitespace) {
        return Err(crate::Error::Validation(format!("Invalid domain: {:?}", raw)));
    }
    Ok(raw.to_lowercase())
}
