//! mailrate - Policy service entry point
//!
//! Postfix spawns one process per policy connection. The process answers
//! requests on stdin/stdout until it has made a final decision for a
//! transaction, then exits so the next transaction gets a fresh process.

mod cli;

use clap::Parser;
use cli::{Cli, Command, WhitelistAction};
use mailrate_common::config::{Config, LoggingConfig};
use mailrate_common::types::whitelist_key;
use mailrate_common::Result;
use mailrate_core::{PolicyService, RateEngine, RateLimits, ServiceOutcome};
use mailrate_storage::{
    DatabasePool, DbRateStore, DbWhitelistRepository, RateStore, WhitelistRepository,
    WhitelistScopes,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(cli));

    // A stdin read may still be parked on a blocking thread after a
    // timeout; do not wait for it
    runtime.shutdown_background();
    code
}

async fn run(cli: Cli) -> ExitCode {
    let config = Config::load(cli.config.as_deref());

    // stdout carries the policy protocol, so logs go to stderr
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_logging(&logging);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(code = e.code(), "{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::Whitelist { action } => whitelist(&config, action).await,
        Command::Prune => prune(&config).await,
        Command::Migrate => migrate(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.code(), "{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Answer policy requests until a decision, timeout or end of input
async fn serve(config: &Config) -> Result<()> {
    // Non-final stages never reach the store, so connect on first use
    let db_pool = DatabasePool::lazy(&config.database)?;
    let limits = RateLimits::from_config(&config.limits)?;
    let engine = RateEngine::new(
        Arc::new(DbRateStore::new(db_pool.clone())),
        Arc::new(DbWhitelistRepository::new(db_pool)),
        limits,
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let mut service = PolicyService::new(stdin, stdout, engine, &config.protocol)?;

    match service.run().await? {
        ServiceOutcome::Decided(verdict) => info!(%verdict, "Decision sent"),
        ServiceOutcome::TimedOut => info!("No request within deadline, exiting"),
        ServiceOutcome::InputClosed => info!("Mail server closed the connection"),
    }

    Ok(())
}

async fn whitelist(config: &Config, action: WhitelistAction) -> Result<()> {
    let delimiter = config.protocol.delimiter()?;
    let db_pool = DatabasePool::new(&config.database).await?;
    let repo = DbWhitelistRepository::new(db_pool);

    match action {
        WhitelistAction::Add { address } => {
            let key = whitelist_key(&address, delimiter)?;
            let entry = repo.add(&key, WhitelistScopes::for_address(&key)).await?;
            info!(address = %entry.address, scopes = %entry.scopes, "Whitelist entry added");
            println!("added {} ({})", entry.address, entry.scopes);
        }
        WhitelistAction::Remove { address } => {
            let key = whitelist_key(&address, delimiter)?;
            let removed = repo.remove(&key).await?;
            info!(address = %key, removed, "Whitelist entry removed");
            if removed == 0 {
                println!("no entry for {}", key);
            } else {
                println!("removed {}", key);
            }
        }
        WhitelistAction::List => {
            for entry in repo.list().await? {
                println!(
                    "{}\t{}\t{}",
                    entry.address,
                    entry.scopes,
                    entry.last_changed.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

/// Delete records no longer needed for deduplication or counting
async fn prune(config: &Config) -> Result<()> {
    let limits = RateLimits::from_config(&config.limits)?;
    let db_pool = DatabasePool::new(&config.database).await?;
    let store = DbRateStore::new(db_pool);

    let horizon = limits.queue_lifetime.max(limits.window);
    let removed = store.prune(chrono::Utc::now() - horizon).await?;

    info!(removed, "Pruned rate records");
    println!("pruned {} rate records", removed);
    Ok(())
}

async fn migrate(config: &Config) -> Result<()> {
    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.level)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
