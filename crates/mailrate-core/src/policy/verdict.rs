//! Verdicts and the response writer

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Why a transaction was deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    TooManyMessages,
    TooManyRecipients,
}

impl std::fmt::Display for DeferReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferReason::TooManyMessages => write!(f, "too many messages"),
            DeferReason::TooManyRecipients => write!(f, "too many recipients"),
        }
    }
}

/// Decision returned to the mail server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue; more requests for the transaction will follow
    Allow,
    /// Accept the transaction; the decision is final
    FinalAllow,
    /// Temporary failure; the mail server retries later
    Defer(DeferReason),
}

impl Verdict {
    /// Terminal verdicts end the policy process
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Allow)
    }
}

/// Renders the `action=` value
impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Allow | Verdict::FinalAllow => write!(f, "DUNNO"),
            Verdict::Defer(reason) => write!(f, "DEFER {}", reason),
        }
    }
}

/// Writes verdicts in the policy protocol format
pub struct Responder<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> Responder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one `action=` line and the terminating blank line, then flush
    pub async fn send(&mut self, verdict: &Verdict) -> std::io::Result<()> {
        let response = format!("action={}\n\n", verdict);
        self.writer.write_all(response.as_bytes()).await?;
        self.writer.flush().await
    }
}
