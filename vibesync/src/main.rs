//! VibeSync, a change replication engine between PostgreSQL
//! and embedded client replicas.

use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::runtime::Builder;
use tokio::select;
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vibesync::backend::cursors::PostgresCursors;
use vibesync::backend::history::{PostgresHistory, Purger};
use vibesync::backend::replication::{Ingestor, IngestorOptions, ReplicationSlot};
use vibesync::backend::tracker::ChangeTracker;
use vibesync::backend::Database;
use vibesync::cli::{self, Cli, Commands};
use vibesync::config::{self, config};
use vibesync::frontend::listener::AppState;
use vibesync::frontend::{Context, Dispatcher, DispatcherOptions, Listener};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    vibesync::logger();

    let mut overrides = config::Overrides {
        database_url: args.database_url.clone(),
        slot: None,
    };

    match args.command {
        Some(Commands::Configcheck { config }) => {
            if let Err(e) = cli::config_check(config.or(Some(args.config))) {
                eprintln!("Configuration error: {}", e);
                exit(1);
            }

            println!("Configuration valid");
            exit(0);
        }

        Some(Commands::Run { ref slot }) => {
            overrides.slot = slot.clone();
        }

        None => (),
    }

    info!("VibeSync v{}", env!("CARGO_PKG_VERSION"));

    config::load(&args.config)?;
    config::overrides(overrides);

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(vibesync())?;

    Ok(())
}

async fn vibesync() -> Result<(), Box<dyn std::error::Error>> {
    let config = config();

    let database = Arc::new(Database::connect(&config.general.database_url).await?);
    let history = Arc::new(PostgresHistory::new(database.clone()));
    let cursors = Arc::new(PostgresCursors::new(database.clone()));
    let tracker = Arc::new(ChangeTracker::new());
    let shutdown = CancellationToken::new();

    let dispatcher = Dispatcher::new(
        cursors.clone(),
        tracker.clone(),
        DispatcherOptions::from_config(),
        shutdown.clone(),
    );

    let context = Context {
        history: history.clone(),
        cursors: cursors.clone(),
        tracker: tracker.clone(),
        dispatcher: dispatcher.clone(),
        shutdown: shutdown.clone(),
    };

    context.history.init().await?;
    context.cursors.init().await?;

    let slot = Arc::new(ReplicationSlot::new(
        database.clone(),
        &config.replication.slot_name,
    ));

    let ingestor = Ingestor::new(
        database.clone(),
        slot.clone(),
        context.history.clone(),
        tracker.clone(),
        dispatcher.clone(),
        shutdown.clone(),
        IngestorOptions::from_config(),
    );
    let mut ingestor = tokio::spawn(ingestor.run());

    Purger::new(
        context.history.clone(),
        context.cursors.clone(),
        config.replication.history_retention(),
        shutdown.clone(),
    )
    .spawn();

    tracker
        .reservations()
        .spawn_sweeper(Duration::from_secs(1), shutdown.clone());

    let listener = Listener::new(format!("{}:{}", config.general.host, config.general.port));
    let state = AppState {
        context: context.clone(),
        database,
        slot,
    };

    let mut failure = None;
    let mut ingestor_done = false;

    select! {
        result = listener.listen(state) => {
            if let Err(err) = result {
                error!("listener error: {}", err);
                failure = Some(err.to_string());
            }
        }

        // A fatal ingestor error halts the process, but sessions
        // drain first so cursors are persisted cleanly.
        result = &mut ingestor => {
            ingestor_done = true;
            if let Ok(Err(err)) = result {
                error!("wal ingestor error: {}", err);
                failure = Some(err.to_string());
            }
        }

        _ = ctrl_c() => (),
    }

    info!("VibeSync is shutting down");

    dispatcher.shutdown_sessions();
    shutdown.cancel();
    if !ingestor_done {
        let _ = ingestor.await;
    }

    if let Some(failure) = failure {
        return Err(failure.into());
    }

    Ok(())
}
