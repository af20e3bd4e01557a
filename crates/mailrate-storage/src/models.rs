//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use uuid::Uuid;

/// One delivery attempt of a sender, identified by its recipient fingerprint
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RateRecord {
    pub id: Uuid,
    /// Normalized sender address
    pub sender: String,
    /// Fingerprint of the deduplicated, sorted recipient set
    pub message_id: String,
    /// Number of recipients of the attempt that created the record
    pub count: i32,
    pub created: DateTime<Utc>,
}

impl RateRecord {
    /// Create a new record stamped at `created`
    pub fn new(
        sender: impl Into<String>,
        message_id: impl Into<String>,
        count: i32,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            sender: sender.into(),
            message_id: message_id.into(),
            count,
            created,
        }
    }
}

/// Capability carried by a whitelist entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitelistScope {
    /// The entry names a whole domain rather than one address
    Domain,
    /// Matching senders skip rate evaluation
    RateExemption,
}

impl WhitelistScope {
    const ALL: [WhitelistScope; 2] = [WhitelistScope::Domain, WhitelistScope::RateExemption];

    /// Bit used for this scope in the `type` column
    pub(crate) const fn bit(self) -> i32 {
        match self {
            WhitelistScope::Domain => 1,
            WhitelistScope::RateExemption => 2,
        }
    }
}

impl std::fmt::Display for WhitelistScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WhitelistScope::Domain => write!(f, "domain"),
            WhitelistScope::RateExemption => write!(f, "rate_exemption"),
        }
    }
}

/// Set of scopes attached to a whitelist entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistScopes(BTreeSet<WhitelistScope>);

impl WhitelistScopes {
    /// Scopes for a new entry: rate exemption, plus domain scope for a bare domain
    pub fn for_address(address: &str) -> Self {
        let mut scopes = Self::default();
        scopes.insert(WhitelistScope::RateExemption);
        if !address.contains('@') {
            scopes.insert(WhitelistScope::Domain);
        }
        scopes
    }

    pub fn insert(&mut self, scope: WhitelistScope) {
        self.0.insert(scope);
    }

    pub fn contains(&self, scope: WhitelistScope) -> bool {
        self.0.contains(&scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = WhitelistScope> + '_ {
        self.0.iter().copied()
    }

    /// Merge another set into this one
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Encode for the `type` column
    pub(crate) fn to_bits(&self) -> i32 {
        self.0.iter().fold(0, |bits, scope| bits | scope.bit())
    }

    /// Decode the `type` column; unknown bits are ignored
    pub(crate) fn from_bits(bits: i32) -> Self {
        Self(
            WhitelistScope::ALL
                .into_iter()
                .filter(|scope| bits & scope.bit() != 0)
                .collect(),
        )
    }
}

impl FromIterator<WhitelistScope> for WhitelistScopes {
    fn from_iter<I: IntoIterator<Item = WhitelistScope>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for WhitelistScopes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// Whitelist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    /// Normalized address or bare domain
    pub address: String,
    pub scopes: WhitelistScopes,
    pub last_changed: DateTime<Utc>,
}

/// Row shape of the `whitelist` table
#[derive(Debug, FromRow)]
pub(crate) struct WhitelistRow {
    pub address: String,
    #[sqlx(rename = "type")]
    pub kind: i32,
    pub last_changed: DateTime<Utc>,
}

impl From<WhitelistRow> for WhitelistEntry {
    fn from(row: WhitelistRow) -> Self {
        Self {
            address: row.address,
            scopes: WhitelistScopes::from_bits(row.kind),
            last_changed: row.last_changed,
        }
    }
}
