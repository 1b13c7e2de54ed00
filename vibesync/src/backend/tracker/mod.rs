//! In-memory accelerator layered over change history.
//!
//! Four sub-registries, each behind its own lock: the composite
//! key index, duplicate classification, batch bookkeeping, and
//! the ID reservation registry. Locks are never held across
//! suspension points.

pub mod batches;
pub mod keys;
pub mod reservations;

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub use batches::BatchLog;
pub use keys::{Classification, KeyIndex};
pub use reservations::Reservations;

use super::replication::Lsn;
use crate::net::ChangeRecord;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("{0} \"{1}\" is already reserved")]
    AlreadyReserved(String, String),
}

/// Observed LSN bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsnRange {
    pub low: Option<Lsn>,
    pub high: Option<Lsn>,
}

#[derive(Default)]
pub struct ChangeTracker {
    keys: KeyIndex,
    batches: BatchLog,
    reservations: Arc<Reservations>,
    range: Mutex<LsnRange>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a freshly ingested batch.
    pub fn record(&self, records: &[ChangeRecord]) {
        self.keys.record(records);

        let mut range = self.range.lock();
        for record in records {
            range.low = Some(range.low.map_or(record.lsn, |low| low.min(record.lsn)));
            range.high = Some(range.high.map_or(record.lsn, |high| high.max(record.lsn)));
        }
    }

    /// Observed LSN bounds since startup (minus pruning).
    pub fn lsn_range(&self) -> LsnRange {
        *self.range.lock()
    }

    pub fn keys(&self) -> &KeyIndex {
        &self.keys
    }

    pub fn batches(&self) -> &BatchLog {
        &self.batches
    }

    pub fn reservations(&self) -> &Arc<Reservations> {
        &self.reservations
    }

    /// Classify records for the dispatcher's coalescing decision.
    pub fn classify(&self, records: &[ChangeRecord]) -> Vec<Classification> {
        self.keys.classify(records)
    }

    /// Drop index entries the purger no longer retains.
    pub fn prune(&self, below: Lsn) {
        self.keys.prune(below);

        let mut range = self.range.lock();
        if let Some(low) = range.low {
            if low < below {
                range.low = Some(below);
            }
        }
    }
}
