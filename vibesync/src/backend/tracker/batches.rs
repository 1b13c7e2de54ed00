//! Delivered-batch bookkeeping. Generators and tests use this to
//! find out when a stable ID is safe to reuse.

use std::collections::VecDeque;

use parking_lot::Mutex;

#[derive(Default)]
struct Inner {
    next: u64,
    // Oldest first.
    batches: VecDeque<(u64, Vec<(String, String)>)>,
}

#[derive(Default)]
pub struct BatchLog {
    inner: Mutex<Inner>,
}

impl BatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next batch number to a set of delivered keys.
    pub fn assign(&self, keys: Vec<(String, String)>) -> u64 {
        let mut guard = self.inner.lock();
        guard.next += 1;
        let number = guard.next;
        guard.batches.push_back((number, keys));
        number
    }

    /// Keys recorded for a batch, if it's still tracked.
    pub fn keys_in_batch(&self, number: u64) -> Option<Vec<(String, String)>> {
        self.inner
            .lock()
            .batches
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, keys)| keys.clone())
    }

    /// Forget all but the newest `keep` batches, returning the
    /// keys that are no longer pinned.
    pub fn release_older_than(&self, keep: usize) -> Vec<(String, String)> {
        let mut guard = self.inner.lock();
        let mut released = vec![];

        while guard.batches.len() > keep {
            if let Some((_, keys)) = guard.batches.pop_front() {
                released.extend(keys);
            }
        }

        released.sort();
        released.dedup();
        released
    }

    pub fn len(&self) -> usize {
        self.inner.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().batches.is_empty()
    }
}
