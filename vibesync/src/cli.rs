use std::fs::read_to_string;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::Config;

/// VibeSync replicates changes from PostgreSQL
/// to embedded client replicas.
#[derive(Parser, Debug)]
#[command(name = "", version = concat!("VibeSync v", env!("CARGO_PKG_VERSION")))]
pub struct Cli {
    /// Path to the configuration file. Default: "vibesync.toml"
    #[arg(short, long, default_value = "vibesync.toml")]
    pub config: PathBuf,
    /// Connection URL for the authoritative database.
    #[arg(short, long)]
    pub database_url: Option<String>,
    /// Subcommand.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the replication server.
    Run {
        /// Name of the logical replication slot.
        #[arg(short, long)]
        slot: Option<String>,
    },

    /// Check configuration.
    Configcheck {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
pub enum ConfigCheckError {
    #[error("need --config")]
    MissingInput,

    #[error("I/O error on `{0}`: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("TOML parse error in `{0}`: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

/// Confirm that the configuration file is valid.
pub fn config_check(config_path: Option<PathBuf>) -> Result<(), ConfigCheckError> {
    let path = config_path.ok_or(ConfigCheckError::MissingInput)?;

    match read_to_string(&path) {
        Ok(s) => {
            if let Err(e) = toml::from_str::<Config>(&s) {
                return Err(ConfigCheckError::Parse(path, e));
            }
        }
        Err(e) => return Err(ConfigCheckError::Io(path, e)),
    }

    Ok(())
}
