//! Short-lived ID reservations. Two producers can't generate the
//! same key before either has committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::select;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::TrackerError;

#[derive(Debug, Clone)]
pub struct Reservation {
    pub intent: String,
    pub expires_at: Option<Instant>,
}

impl Reservation {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Default)]
pub struct Reservations {
    inner: Mutex<HashMap<(String, String), Reservation>>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an ID for an entity type. Generates one when the
    /// caller doesn't supply it. TTL of `None` never expires.
    pub fn reserve(
        &self,
        entity_type: &str,
        id: Option<String>,
        intent: &str,
        ttl: Option<Duration>,
    ) -> Result<String, TrackerError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = (entity_type.to_string(), id.clone());
        let now = Instant::now();

        let mut guard = self.inner.lock();

        if let Some(existing) = guard.get(&key) {
            if !existing.expired(now) {
                return Err(TrackerError::AlreadyReserved(entity_type.into(), id));
            }
        }

        guard.insert(
            key,
            Reservation {
                intent: intent.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );

        Ok(id)
    }

    pub fn is_reserved(&self, entity_type: &str, id: &str) -> bool {
        let guard = self.inner.lock();
        match guard.get(&(entity_type.to_string(), id.to_string())) {
            Some(reservation) => !reservation.expired(Instant::now()),
            None => false,
        }
    }

    /// Release a reservation. Returns whether it existed.
    pub fn release(&self, entity_type: &str, id: &str) -> bool {
        self.inner
            .lock()
            .remove(&(entity_type.to_string(), id.to_string()))
            .is_some()
    }

    /// Drop expired reservations. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let before = guard.len();
        guard.retain(|_, reservation| !reservation.expired(now));
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Launch the background sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let reservations = self.clone();

        tokio::spawn(async move {
            let mut tick = interval(every);

            loop {
                select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => (),
                }

                let swept = reservations.sweep();
                if swept > 0 {
                    debug!("swept {} expired reservations", swept);
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let reservations = Reservations::new();

        let id = reservations
            .reserve("task", Some("T1".into()), "seed", None)
            .unwrap();
        assert_eq!(id, "T1");
        assert!(reservations.is_reserved("task", "T1"));
        assert!(!reservations.is_reserved("project", "T1"));

        // Double reservation fails.
        assert!(reservations
            .reserve("task", Some("T1".into()), "seed", None)
            .is_err());

        assert!(reservations.release("task", "T1"));
        assert!(!reservations.is_reserved("task", "T1"));
        assert!(!reservations.release("task", "T1"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let reservations = Reservations::new();
        let a = reservations.reserve("task", None, "gen", None).unwrap();
        let b = reservations.reserve("task", None, "gen", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_expiry() {
        let reservations = Reservations::new();
        reservations
            .reserve("task", Some("T1".into()), "seed", Some(Duration::ZERO))
            .unwrap();

        // TTL of zero is expired on arrival.
        assert!(!reservations.is_reserved("task", "T1"));

        // An expired reservation can be taken over.
        reservations
            .reserve("task", Some("T1".into()), "seed", None)
            .unwrap();
        assert!(reservations.is_reserved("task", "T1"));

        assert_eq!(reservations.sweep(), 0);
    }

    #[test]
    fn test_sweep() {
        let reservations = Reservations::new();
        reservations
            .reserve("task", Some("T1".into()), "seed", Some(Duration::ZERO))
            .unwrap();
        reservations
            .reserve("task", Some("T2".into()), "seed", None)
            .unwrap();

        assert_eq!(reservations.sweep(), 1);
        assert_eq!(reservations.len(), 1);
        assert!(reservations.is_reserved("task", "T2"));
    }
}
