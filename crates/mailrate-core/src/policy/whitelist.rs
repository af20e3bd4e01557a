//! Whitelist exemption check

use mailrate_common::Result;
use mailrate_storage::WhitelistRepository;
use std::sync::Arc;
use tracing::debug;

/// Decides whether a sender skips rate evaluation
#[derive(Clone)]
pub struct WhitelistCheck {
    repo: Arc<dyn WhitelistRepository>,
}

impl WhitelistCheck {
    pub fn new(repo: Arc<dyn WhitelistRepository>) -> Self {
        Self { repo }
    }

    /// True if the full address or its domain is whitelisted.
    ///
    /// `sender` must already be normalized. The address is looked up first
    /// and the domain only if that fails.
    pub async fn is_exempt(&self, sender: &str) -> Result<bool> {
        if self.repo.exists(sender).await? {
            debug!(sender, "Sender address whitelisted");
            return Ok(true);
        }

        match sender.rsplit_once('@') {
            Some((_, domain)) if !domain.is_empty() => {
                let exempt = self.repo.exists(domain).await?;
                if exempt {
                    debug!(sender, domain, "Sender domain whitelisted");
                }
                Ok(exempt)
            }
            _ => Ok(false),
        }
    }
}
