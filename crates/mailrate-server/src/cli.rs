//! Command-line interface for the mailrate binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Rate-limiting policy service for Postfix.
///
/// Without a subcommand the policy service reads requests from stdin.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "mailrate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./mailrate.toml, then /etc/mailrate/mailrate.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Answer policy requests on stdin (default).
    Serve,
    /// Manage senders and domains exempt from rate limits.
    Whitelist {
        #[command(subcommand)]
        action: WhitelistAction,
    },
    /// Delete rate records older than the queue lifetime.
    Prune,
    /// Apply database migrations.
    Migrate,
}

/// Whitelist operations.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum WhitelistAction {
    /// Exempt an address or a whole domain.
    Add { address: String },
    /// Remove the entry for an address or domain.
    Remove { address: String },
    /// Show all entries.
    List,
}
