// ABOUTME: Entry point for the marquee binary.
// ABOUTME: Loads config, initializes tracing, opens the catalog store, and runs the stdin console.

mod config;
mod console;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use marquee_core::{AppState, CatalogEvent, CatalogHandle, Intent, Outcome, RunnerOptions};
use marquee_store::{MigrationChainError, RecordStore, SchemaChain, movie_schema_chain};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::config::MarqueeConfig;
use crate::console::Command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marquee=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = MarqueeConfig::from_env().context("failed to load configuration")?;
    tracing::info!("marquee starting up, catalog at {}", config.db_path.display());

    let store = Arc::new(open_catalog(&config.db_path, movie_schema_chain())?);

    let options = RunnerOptions {
        save_retries: config.save_retries,
        ..RunnerOptions::default()
    };
    let handle = marquee_core::spawn(store, AppState::new(), options);
    log_events(&handle);

    handle.dispatch(Intent::Appeared).await?;
    print!("{}", console::render(&handle.read_state()));
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match console::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(Command::Help) => println!("{}", console::HELP),
            Ok(Command::List) => print!("{}", console::render(&handle.read_state())),
            Ok(Command::Dispatch(intent)) => {
                match handle.dispatch(intent).await? {
                    Outcome::Completed => {}
                    Outcome::NotFound(id) => println!("no record {id}"),
                    Outcome::Failed(reason) => println!("failed: {reason}"),
                }
                print!("{}", console::render(&handle.read_state()));
            }
            Err(e) => println!("{e}"),
        }
    }

    tracing::info!("marquee shutting down");
    Ok(())
}

/// Validate the schema chain, then open and migrate the catalog at `path`.
fn open_catalog(
    path: &Path,
    chain: Result<SchemaChain, MigrationChainError>,
) -> anyhow::Result<RecordStore> {
    let chain = chain.context("invalid schema chain")?;
    match RecordStore::open(path, &chain) {
        Ok(store) => Ok(store),
        Err(e) => {
            tracing::error!("failed to open catalog {}: {}", path.display(), e);
            Err(e).context("failed to open catalog store")
        }
    }
}

/// Forward runner failures to the log for as long as the runner lives.
fn log_events(handle: &CatalogHandle) {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CatalogEvent::EffectFailed { effect, error }) => {
                    tracing::warn!("effect {:?} failed: {}", effect, error);
                }
                Ok(CatalogEvent::QueryFailed { error }) => {
                    tracing::warn!("live query failed: {}", error);
                }
                Ok(CatalogEvent::Transition { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("event log lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
