//! # fcpboard Daemon Entry Point
//!
//! Runs one update pass over every configured board and exits.
//!
//! ## Startup Sequence
//! 1. Initialize tracing (logging)
//! 2. Load configuration (`fcpboard [CONFIG_PATH]`)
//! 3. Build the node client (TCP connector, single-shot transfers)
//! 4. Assemble `BoardSyncService` over in-memory stores
//! 5. Start today/backlog scans, wait for them, shut down

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use fcpboard_core::MemoryStore;
use fcpboard_fcp::{IdGenerator, SingleShotClient, TcpConnector};
use fcpboard_sync::{
    BoardSyncConfig, BoardSyncService, LogNotifier, RandomPacer, SyncContext, SystemClock,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = BoardSyncConfig::load(config_path).context("failed to load configuration")?;
    if config.boards.is_empty() {
        warn!("No boards configured, nothing to update");
        return Ok(());
    }

    let address = config.node.address();
    info!(
        host = %config.node.host,
        port = config.node.port,
        dda = config.node.use_dda,
        boards = config.boards.len(),
        "Configuration loaded"
    );

    let transfer = SingleShotClient::new(
        Arc::new(TcpConnector::new(address)),
        Arc::new(IdGenerator::new()),
    )
    .with_dda(config.node.use_dda);

    let store = Arc::new(MemoryStore::new());
    let ctx = SyncContext::from_store(
        Arc::new(transfer),
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(RandomPacer::new(config.pacing.clone())),
    );
    let service = BoardSyncService::new(config, ctx, store.clone(), Arc::new(LogNotifier))
        .context("failed to start board sync")?;

    let handles = service.update_all().context("failed to start board scans")?;
    info!(scans = handles.len(), "Board scans started");

    let mut failed = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                error!(error = %err, "Board scan failed");
                failed += 1;
            }
            Err(_) => {
                error!("Board scan thread panicked");
                failed += 1;
            }
        }
    }

    service.shutdown();
    info!(
        received = store.received().map(|r| r.len()).unwrap_or_default(),
        failed,
        "Update pass complete"
    );
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=fcpboard_sync=trace` - Show trace for the scheduler only
/// - Default: INFO level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(true)
        .init();
}
