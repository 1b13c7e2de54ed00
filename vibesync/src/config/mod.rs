//! Configuration.

pub mod error;
pub mod overrides;

use error::Error;
pub use overrides::Overrides;

use std::fs::read_to_string;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Get the current configuration.
pub fn config() -> Arc<Config> {
    CONFIG.load().clone()
}

/// Load the configuration file from disk.
pub fn load(path: &PathBuf) -> Result<Config, Error> {
    let config = Config::load(path)?;
    CONFIG.store(Arc::new(config.clone()));
    Ok(config)
}

/// Override some settings from the command line.
pub fn overrides(overrides: Overrides) {
    let mut config = (*config()).clone();
    let Overrides { database_url, slot } = overrides;

    if let Some(database_url) = database_url {
        config.general.database_url = database_url;
    }

    if let Some(slot) = slot {
        config.replication.slot_name = slot;
    }

    CONFIG.store(Arc::new(config));
}

/// vibesync.toml.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub replication: Replication,
}

impl Config {
    /// Load configuration from disk or use defaults.
    pub fn load(path: &PathBuf) -> Result<Self, Error> {
        if let Ok(config) = read_to_string(path) {
            let config = match toml::from_str(&config) {
                Ok(config) => config,
                Err(err) => return Err(Error::config(&config, err)),
            };
            info!("loaded \"{}\"", path.display());
            Ok(config)
        } else {
            warn!(
                "\"{}\" doesn't exist, loading defaults instead",
                path.display()
            );
            Ok(Config::default())
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct General {
    /// Address to listen on for client and admin connections.
    #[serde(default = "General::default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "General::default_port")]
    pub port: u16,
    /// Connection string for the authoritative database.
    #[serde(default = "General::default_database_url")]
    pub database_url: String,
}

impl General {
    fn default_host() -> String {
        "0.0.0.0".into()
    }

    fn default_port() -> u16 {
        8070
    }

    fn default_database_url() -> String {
        "postgres://postgres@localhost:5432/postgres".into()
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            database_url: Self::default_database_url(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Replication {
    /// Name of the logical replication slot.
    #[serde(default = "Replication::default_slot_name")]
    pub slot_name: String,
    /// Poll interval when the slot is drained.
    #[serde(default = "Replication::default_poll_idle_ms")]
    pub poll_idle_ms: u64,
    /// Poll interval while the slot has a backlog.
    #[serde(default = "Replication::default_poll_active_ms")]
    pub poll_active_ms: u64,
    /// Maximum number of change records requested per poll.
    #[serde(default = "Replication::default_poll_batch_size")]
    pub poll_batch_size: i64,
    /// Maximum number of records per delivered batch.
    #[serde(default = "Replication::default_batch_max_records")]
    pub batch_max_records: usize,
    /// Maximum payload bytes per delivered batch.
    #[serde(default = "Replication::default_batch_max_bytes")]
    pub batch_max_bytes: usize,
    /// Records buffered per session before fan-out blocks for it.
    #[serde(default = "Replication::default_session_queue_depth")]
    pub session_queue_depth: usize,
    /// How long a session is allowed to stall before it's drained.
    #[serde(default = "Replication::default_session_stall_ms")]
    pub session_stall_ms: u64,
    /// Expected client heartbeat interval.
    #[serde(default = "Replication::default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// How long change history is retained past the global minimum cursor.
    #[serde(default = "Replication::default_history_retention_ms")]
    pub history_retention_ms: u64,
}

impl Replication {
    fn default_slot_name() -> String {
        "vibestack".into()
    }

    fn default_poll_idle_ms() -> u64 {
        250
    }

    fn default_poll_active_ms() -> u64 {
        10
    }

    fn default_poll_batch_size() -> i64 {
        500
    }

    fn default_batch_max_records() -> usize {
        500
    }

    fn default_batch_max_bytes() -> usize {
        512 * 1024
    }

    fn default_session_queue_depth() -> usize {
        1024
    }

    fn default_session_stall_ms() -> u64 {
        30_000
    }

    fn default_heartbeat_ms() -> u64 {
        10_000
    }

    fn default_history_retention_ms() -> u64 {
        24 * 3600 * 1000
    }

    pub fn poll_idle(&self) -> Duration {
        Duration::from_millis(self.poll_idle_ms)
    }

    pub fn poll_active(&self) -> Duration {
        Duration::from_millis(self.poll_active_ms)
    }

    pub fn session_stall(&self) -> Duration {
        Duration::from_millis(self.session_stall_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Heartbeats missing for twice the interval fail the session.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms * 2)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_millis(self.history_retention_ms)
    }
}

impl Default for Replication {
    fn default() -> Self {
        Self {
            slot_name: Self::default_slot_name(),
            poll_idle_ms: Self::default_poll_idle_ms(),
            poll_active_ms: Self::default_poll_active_ms(),
            poll_batch_size: Self::default_poll_batch_size(),
            batch_max_records: Self::default_batch_max_records(),
            batch_max_bytes: Self::default_batch_max_bytes(),
            session_queue_depth: Self::default_session_queue_depth(),
            session_stall_ms: Self::default_session_stall_ms(),
            heartbeat_ms: Self::default_heartbeat_ms(),
            history_retention_ms: Self::default_history_retention_ms(),
        }
    }
}
