//! Durable ordered store of decoded changes.
//!
//! Single writer (the ingestor), many readers. Readers use
//! snapshot reads and never block the writer.

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use memory::MemoryHistory;
pub use postgres::PostgresHistory;

use super::cursors::CursorStore;
use super::replication::Lsn;
use super::Error;
use crate::net::ChangeRecord;

#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Create the history table if it doesn't exist. Idempotent.
    async fn init(&self) -> Result<(), Error>;

    /// Append a decoded batch in one transaction. Records whose
    /// LSN is already present are skipped; returns the number of
    /// rows actually written.
    async fn append(&self, records: &[ChangeRecord]) -> Result<u64, Error>;

    /// Records in `(start, end]`, LSN ascending, up to `limit`.
    async fn by_lsn_range(
        &self,
        start_exclusive: Lsn,
        end_inclusive: Option<Lsn>,
        limit: i64,
    ) -> Result<Vec<ChangeRecord>, Error>;

    /// Highest LSN in history, if any.
    async fn max_lsn(&self) -> Result<Option<Lsn>, Error>;

    /// Delete records below `lsn` that are also older than
    /// `older_than`. Returns rows removed.
    async fn purge(&self, lsn: Lsn, older_than: DateTime<Utc>) -> Result<u64, Error>;
}

/// Background purger. Deletes history the global minimum cursor
/// has advanced past, once it ages out of the retention window.
pub struct Purger {
    history: Arc<dyn ChangeStore>,
    cursors: Arc<dyn CursorStore>,
    retention: Duration,
    shutdown: CancellationToken,
}

impl Purger {
    pub fn new(
        history: Arc<dyn ChangeStore>,
        cursors: Arc<dyn CursorStore>,
        retention: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            history,
            cursors,
            retention,
            shutdown,
        }
    }

    /// Launch the purge loop. Failures are retried on the next
    /// tick, never fatal.
    pub fn spawn(self) {
        tokio::spawn(async move {
            let tick = (self.retention / 10)
                .max(Duration::from_secs(30))
                .min(Duration::from_secs(3600));

            loop {
                select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = sleep(tick) => (),
                }

                if let Err(err) = self.purge_once().await {
                    warn!("history purge failed: {}", err);
                }
            }

            debug!("history purger is shut down");
        });
    }

    async fn purge_once(&self) -> Result<(), Error> {
        let min_cursor = match self.cursors.min_cursor().await? {
            Some(lsn) => lsn,
            None => return Ok(()),
        };

        let older_than = Utc::now()
            - chrono::Duration::milliseconds(self.retention.as_millis() as i64);
        let removed = self.history.purge(min_cursor, older_than).await?;

        if removed > 0 {
            debug!("purged {} history rows below {}", removed, min_cursor);
        }

        Ok(())
    }
}
