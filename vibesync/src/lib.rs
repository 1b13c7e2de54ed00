//! VibeSync, a change replication engine between PostgreSQL
//! and embedded client replicas.

pub mod admin;
pub mod backend;
pub mod cli;
pub mod config;
pub mod frontend;
pub mod net;
pub mod util;

use tracing_subscriber::{fmt, EnvFilter};

/// Setup the logger, using the `RUST_LOG` environment variable
/// to configure log level, defaulting to INFO.
pub fn logger() {
    let format = fmt::layer().with_ansi(true).with_file(false);
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(format)
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vibesync=info")),
        )
        .init();
}
