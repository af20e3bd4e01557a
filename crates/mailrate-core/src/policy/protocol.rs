//! Policy delegation protocol reader
//!
//! The mail server sends one request per SMTP stage as a block of
//! `key=value` lines terminated by an empty line.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, trace, warn};

/// Longest request line kept, excluding the line terminator
pub const MAX_LINE_LEN: usize = 8192;

/// Errors raised while reading a request block
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("no complete request within {0:?}")]
    Timeout(Duration),

    #[error("failed to read request: {0}")]
    Io(#[from] std::io::Error),
}

/// SMTP stage a request was issued at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolState {
    Connect,
    Helo,
    Mail,
    Rcpt,
    Data,
    EndOfMessage,
    Vrfy,
    Etrn,
    Other(String),
}

impl ProtocolState {
    /// Only the DATA stage triggers rate evaluation
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolState::Data)
    }
}

impl From<&str> for ProtocolState {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONNECT" => ProtocolState::Connect,
            "HELO" | "EHLO" => ProtocolState::Helo,
            "MAIL" => ProtocolState::Mail,
            "RCPT" => ProtocolState::Rcpt,
            "DATA" => ProtocolState::Data,
            "END-OF-MESSAGE" => ProtocolState::EndOfMessage,
            "VRFY" => ProtocolState::Vrfy,
            "ETRN" => ProtocolState::Etrn,
            _ => ProtocolState::Other(s.to_string()),
        }
    }
}

/// One request: the attributes of a single block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeBlock {
    attributes: HashMap<String, String>,
}

impl AttributeBlock {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Transaction identifier, `None` when absent or blank
    pub fn instance(&self) -> Option<&str> {
        self.get("instance").filter(|v| !v.trim().is_empty())
    }

    pub fn protocol_state(&self) -> ProtocolState {
        self.get("protocol_state")
            .map(ProtocolState::from)
            .unwrap_or_else(|| ProtocolState::Other(String::new()))
    }

    pub fn sender(&self) -> Option<&str> {
        self.get("sender")
    }

    pub fn recipient(&self) -> Option<&str> {
        self.get("recipient")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AttributeBlock {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut block = Self::default();
        for (k, v) in iter {
            block.insert(k, v);
        }
        block
    }
}

/// Reads request blocks from a line-oriented stream
pub struct ProtocolReader<R> {
    reader: R,
    timeout: Duration,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> ProtocolReader<R> {
    pub fn new(reader: R, timeout: Duration) -> Self {
        Self {
            reader,
            timeout,
            line: Vec::new(),
        }
    }

    /// Read the next block.
    ///
    /// Returns `Ok(None)` when the input ends before any attribute of a new
    /// block was seen. The whole block must arrive within the configured
    /// timeout.
    pub async fn read_block(&mut self) -> Result<Option<AttributeBlock>, ProtocolError> {
        match tokio::time::timeout(self.timeout, self.read_block_inner()).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(self.timeout)),
        }
    }

    async fn read_block_inner(&mut self) -> Result<Option<AttributeBlock>, ProtocolError> {
        let mut block = AttributeBlock::default();

        loop {
            self.line.clear();
            let bytes_read = (&mut self.reader)
                .take(MAX_LINE_LEN as u64 + 1)
                .read_until(b'\n', &mut self.line)
                .await?;

            if bytes_read == 0 {
                if block.is_empty() {
                    return Ok(None);
                }
                debug!(attributes = block.len(), "Input ended inside a block");
                return Ok(Some(block));
            }

            if !self.line.ends_with(b"\n") && self.line.len() > MAX_LINE_LEN {
                let skipped = self.line.len() + self.skip_line().await?;
                warn!(skipped, "Ignoring overlong request line");
                continue;
            }

            // Values the service never reads may carry arbitrary bytes
            let decoded = String::from_utf8_lossy(&self.line);
            let line = decoded.trim_end_matches(&['\r', '\n'][..]);

            if line.is_empty() {
                // Stray blank lines before the first attribute are not a block
                if block.is_empty() {
                    continue;
                }
                return Ok(Some(block));
            }

            match line.split_once('=') {
                Some((key, value)) => {
                    trace!(key, value, "Attribute");
                    block.insert(key, value);
                }
                None => debug!(line, "Ignoring line without '='"),
            }
        }
    }

    /// Discard input up to and including the next newline
    async fn skip_line(&mut self) -> Result<usize, ProtocolError> {
        let mut skipped = 0;
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(skipped);
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.reader.consume(i + 1);
                    return Ok(skipped + i + 1);
                }
                None => {
                    let n = buf.len();
                    self.reader.consume(n);
                    skipped += n;
                }
            }
        }
    }
}
