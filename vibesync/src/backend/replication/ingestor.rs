//! The WAL ingestor. One dedicated task for the process lifetime.
//!
//! Polls the slot, decodes, appends to history, hands the batch
//! to the dispatcher, and advances the slot's confirmed-flush LSN
//! to the minimum cursor across durable subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{decode, Error, Lsn, ReplicationSlot};
use crate::backend::history::ChangeStore;
use crate::backend::relationships::Relationships;
use crate::backend::tracker::ChangeTracker;
use crate::backend::Database;
use crate::config::config;
use crate::frontend::Dispatcher;
use crate::net::Operation;
use crate::util::jitter;

// Slot-busy retries before giving up.
const MAX_BUSY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct IngestorOptions {
    pub poll_idle: Duration,
    pub poll_active: Duration,
    pub poll_batch_size: i64,
}

impl IngestorOptions {
    pub fn from_config() -> Self {
        let replication = &config().replication;
        Self {
            poll_idle: replication.poll_idle(),
            poll_active: replication.poll_active(),
            poll_batch_size: replication.poll_batch_size,
        }
    }
}

/// Capped exponential backoff with jitter, 100ms through 5s.
struct Backoff {
    attempt: u32,
}

impl Backoff {
    const BASE: Duration = Duration::from_millis(100);
    const CAP: Duration = Duration::from_secs(5);

    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn next(&mut self) -> Duration {
        let exp = Self::BASE
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(Self::CAP);
        self.attempt += 1;
        jitter(exp)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct Ingestor {
    database: Arc<Database>,
    slot: Arc<ReplicationSlot>,
    history: Arc<dyn ChangeStore>,
    tracker: Arc<ChangeTracker>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    options: IngestorOptions,
    // Highest LSN handed to the dispatcher; polls only surface
    // records strictly after this.
    last_published: Lsn,
    // Slot confirmation high-water mark; never moves backwards.
    confirmed: Lsn,
    // Last server position idle sessions were told about.
    last_notified: Lsn,
    relationships: Relationships,
}

impl Ingestor {
    pub fn new(
        database: Arc<Database>,
        slot: Arc<ReplicationSlot>,
        history: Arc<dyn ChangeStore>,
        tracker: Arc<ChangeTracker>,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
        options: IngestorOptions,
    ) -> Self {
        Self {
            database,
            slot,
            history,
            tracker,
            dispatcher,
            shutdown,
            options,
            last_published: Lsn::ZERO,
            confirmed: Lsn::ZERO,
            last_notified: Lsn::ZERO,
            relationships: Relationships::new(),
        }
    }

    /// Run until shutdown or a fatal error. Transient errors are
    /// retried with backoff and never surface past this loop.
    pub async fn run(mut self) -> Result<(), Error> {
        self.slot.ensure().await?;

        let confirmed = self
            .slot
            .status()
            .await?
            .and_then(|status| status.confirmed_flush_lsn)
            .unwrap_or(Lsn::ZERO);
        let history_max = self.history.max_lsn().await?.unwrap_or(Lsn::ZERO);

        self.confirmed = confirmed;
        self.last_published = confirmed.max(history_max);

        info!(
            "wal ingestor started at {} (slot \"{}\")",
            self.last_published,
            self.slot.name()
        );

        let mut backoff = Backoff::new();
        let mut busy_attempts = 0;
        let mut delay = self.options.poll_idle;

        loop {
            select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(delay) => (),
            }

            match self.poll_once().await {
                Ok(polled) => {
                    backoff.reset();
                    busy_attempts = 0;
                    // Drop to the active cadence while the slot
                    // keeps filling our requested batch.
                    delay = if polled >= self.options.poll_batch_size as usize {
                        self.options.poll_active
                    } else {
                        self.options.poll_idle
                    };
                }

                Err(err) if err.slot_busy() => {
                    busy_attempts += 1;
                    if busy_attempts >= MAX_BUSY_ATTEMPTS {
                        error!("replication slot still busy, giving up: {}", err);
                        return Err(err);
                    }
                    warn!("replication slot busy, retrying: {}", err);
                    delay = backoff.next();
                }

                Err(err) if err.transient() => {
                    warn!("wal poll failed, retrying: {}", err);
                    if !self.database.online() {
                        if let Err(err) = self.database.reconnect().await {
                            warn!("database reconnect failed: {}", err);
                        }
                    }
                    delay = backoff.next();
                }

                Err(err) => {
                    error!("wal ingestor fatal: {}", err);
                    return Err(err);
                }
            }
        }

        info!("wal ingestor is shut down");
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<usize, Error> {
        let changes = self.slot.peek(self.options.poll_batch_size).await?;

        if changes.is_empty() {
            self.notify_position().await?;
            return Ok(0);
        }

        let polled = changes.len();
        let max_lsn = changes
            .last()
            .map(|change| change.lsn)
            .unwrap_or(self.last_published);

        // A partial decode rejects the batch whole; the same rows
        // reappear on the next poll.
        let records = decode::decode_batch(&changes)?;
        let records: Vec<_> = records
            .into_iter()
            .filter(|record| record.lsn > self.last_published)
            .collect();

        if !records.is_empty() {
            let appended = self.history.append(&records).await?;
            debug!(
                "ingested {} records through {} ({} new)",
                records.len(),
                max_lsn,
                appended
            );

            for record in &records {
                if record.operation == Operation::Delete {
                    let descendants = self.relationships.cascades_into(&record.table);
                    if !descendants.is_empty() {
                        debug!(
                            "delete on \"{}\" at {} may cascade into {:?}",
                            record.table, record.lsn, descendants
                        );
                    }
                }
            }

            self.tracker.record(&records);
            self.tracker
                .batches()
                .assign(records.iter().filter_map(|record| record.key()).collect());

            self.dispatcher.publish(records).await;
        }

        // History has the batch; the slot may let go of anything
        // every durable subscriber has acknowledged.
        self.last_published = self.last_published.max(max_lsn);
        self.advance_slot(max_lsn).await?;

        Ok(polled)
    }

    async fn advance_slot(&mut self, ingested: Lsn) -> Result<(), Error> {
        let min_cursor = self.dispatcher.min_cursor().await?;

        // With no durable subscribers on record, history alone
        // holds the replay window.
        let confirm = min_cursor.unwrap_or(ingested).min(ingested);

        if confirm > self.confirmed {
            self.slot.advance(confirm).await?;
            self.confirmed = confirm;
        }

        Ok(())
    }

    // Surface WAL movement that produced no records for us, so
    // idle sessions still learn the server position.
    async fn notify_position(&mut self) -> Result<(), Error> {
        let current = self.slot.current_lsn().await?;

        if current > self.last_notified && current > self.last_published {
            self.dispatcher.publish_lsn(current).await;
            self.last_notified = current;
        }

        Ok(())
    }
}
