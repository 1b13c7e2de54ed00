//! Index of changes by (table, primary key).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::backend::replication::Lsn;
use crate::net::ChangeRecord;

/// How a record relates to others for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// First (or only) pending occurrence of its key.
    First,
    /// A later record for the same key supersedes this one; it
    /// can be coalesced away if the earlier one wasn't consumed.
    Superseded,
    /// Marked by the producer; always delivered.
    Intentional,
}

#[derive(Default)]
pub struct KeyIndex {
    // Per key, the LSNs at which it changed, ascending.
    by_key: Mutex<HashMap<(String, String), Vec<Lsn>>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where each key changed.
    pub fn record(&self, records: &[ChangeRecord]) {
        let mut guard = self.by_key.lock();

        for record in records {
            let key = match record.key() {
                Some(key) => key,
                None => continue,
            };

            let lsns = guard.entry(key).or_default();
            match lsns.binary_search(&record.lsn) {
                Ok(_) => (),
                Err(position) => lsns.insert(position, record.lsn),
            }
        }
    }

    /// Did this key change after the given LSN?
    pub fn changed_since(&self, table: &str, primary_key: &str, lsn: Lsn) -> bool {
        let guard = self.by_key.lock();

        match guard.get(&(table.to_string(), primary_key.to_string())) {
            Some(lsns) => match lsns.binary_search(&lsn) {
                // Present at exactly `lsn`: changed since only if
                // something comes after it.
                Ok(position) => position + 1 < lsns.len(),
                Err(position) => position < lsns.len(),
            },
            None => false,
        }
    }

    /// Unique keys that changed in `[low, high]`.
    pub fn keys_in_range(&self, low: Lsn, high: Lsn) -> Vec<(String, String)> {
        let guard = self.by_key.lock();

        let mut keys: Vec<_> = guard
            .iter()
            .filter(|(_, lsns)| {
                let start = lsns.partition_point(|lsn| *lsn < low);
                start < lsns.len() && lsns[start] <= high
            })
            .map(|(key, _)| key.clone())
            .collect();

        keys.sort();
        keys
    }

    /// Classify each record against the others in the set.
    pub fn classify(&self, records: &[ChangeRecord]) -> Vec<Classification> {
        // Highest pending LSN per key decides who supersedes whom.
        let mut latest: HashMap<(String, String), Lsn> = HashMap::new();
        for record in records {
            if let Some(key) = record.key() {
                let entry = latest.entry(key).or_insert(record.lsn);
                *entry = (*entry).max(record.lsn);
            }
        }

        records
            .iter()
            .map(|record| {
                if record.intentional_duplicate() {
                    return Classification::Intentional;
                }

                match record.key().and_then(|key| latest.get(&key)) {
                    Some(newest) if *newest > record.lsn => Classification::Superseded,
                    _ => Classification::First,
                }
            })
            .collect()
    }

    /// Drop positions below `below`; keys with nothing left are
    /// removed entirely.
    pub fn prune(&self, below: Lsn) {
        let mut guard = self.by_key.lock();

        guard.retain(|_, lsns| {
            let keep_from = lsns.partition_point(|lsn| *lsn < below);
            lsns.drain(..keep_from);
            !lsns.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.by_key.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.lock().is_empty()
    }
}
