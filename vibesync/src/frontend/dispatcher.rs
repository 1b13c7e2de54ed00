//! Process-wide session registry and fan-out.
//!
//! Newly ingested ranges go into every live session's inbound
//! buffer. A slow session blocks only its own relay; once it
//! stalls past the threshold it's forcibly drained. The ingestor
//! is never blocked by any session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::State;
use crate::backend::cursors::CursorStore;
use crate::backend::replication::Lsn;
use crate::backend::tracker::{ChangeTracker, Classification};
use crate::backend::Error;
use crate::config::config;
use crate::net::{ChangeRecord, CloseCode};
use crate::util::human_duration;

// Published ranges buffered per session ahead of the record queue.
const FEED_DEPTH: usize = 64;

#[derive(Debug, Clone)]
enum Fanout {
    Records(Arc<Vec<ChangeRecord>>),
    Lsn(Lsn),
}

/// What a session's relay delivers into its inbound queue.
#[derive(Debug, Clone)]
pub enum SessionInbound {
    Record(ChangeRecord),
    Lsn(Lsn),
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    /// Records buffered per session.
    pub queue_depth: usize,
    /// How long a session may stall before it's drained.
    pub stall: Duration,
}

impl DispatcherOptions {
    pub fn from_config() -> Self {
        let replication = &config().replication;
        Self {
            queue_depth: replication.session_queue_depth,
            stall: replication.session_stall(),
        }
    }
}

/// Shared between the dispatcher and one session task. The
/// dispatcher owns the cursor; the session observes it.
pub struct SessionHandle {
    pub client_id: String,
    pub connected_since: DateTime<Utc>,
    state: Mutex<State>,
    last_ack: AtomicU64,
    wants_feed: AtomicBool,
    cancel: CancellationToken,
    drain_reason: Mutex<Option<CloseCode>>,
}

impl SessionHandle {
    fn new(client_id: &str, start: Lsn) -> Self {
        Self {
            client_id: client_id.to_string(),
            connected_since: Utc::now(),
            state: Mutex::new(State::Connecting),
            last_ack: AtomicU64::new(start.as_u64()),
            wants_feed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            drain_reason: Mutex::new(None),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn set_state(&self, to: State) {
        let mut state = self.state.lock();
        if state.can_transition(to) {
            debug!("session {} -> {} [{}]", state, to, self.client_id);
            *state = to;
        }
    }

    pub fn last_ack(&self) -> Lsn {
        Lsn::from_u64(self.last_ack.load(Ordering::Acquire))
    }

    pub fn set_last_ack(&self, lsn: Lsn) {
        self.last_ack.fetch_max(lsn.as_u64(), Ordering::AcqRel);
    }

    /// Start receiving fan-out. Called by the session right
    /// before its final history check, so nothing falls between
    /// catchup and live.
    pub fn enable_feed(&self) {
        self.wants_feed.store(true, Ordering::Release);
    }

    pub fn feed_enabled(&self) -> bool {
        self.wants_feed.load(Ordering::Acquire)
    }

    /// Force the session into draining.
    pub fn drain(&self, reason: Option<CloseCode>) {
        if let Some(reason) = reason {
            self.drain_reason.lock().get_or_insert(reason);
        }
        self.cancel.cancel();
    }

    pub fn drain_reason(&self) -> Option<CloseCode> {
        *self.drain_reason.lock()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct SessionEntry {
    handle: Arc<SessionHandle>,
    feed: mpsc::Sender<Fanout>,
    stalled_since: Mutex<Option<Instant>>,
}

struct Inner {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    // Highest LSN every session's input has been notified at.
    fanout_cursor: AtomicU64,
    cursors: Arc<dyn CursorStore>,
    tracker: Arc<ChangeTracker>,
    options: DispatcherOptions,
}

/// Process-wide singleton routing ingested changes to sessions.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    tx: mpsc::Sender<Fanout>,
}

impl Dispatcher {
    pub fn new(
        cursors: Arc<dyn CursorStore>,
        tracker: Arc<ChangeTracker>,
        options: DispatcherOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(FEED_DEPTH);

        let inner = Arc::new(Inner {
            sessions: RwLock::new(HashMap::new()),
            fanout_cursor: AtomicU64::new(0),
            cursors,
            tracker,
            options,
        });

        let dispatcher = Self {
            inner: inner.clone(),
            tx,
        };

        tokio::spawn(Self::fan_out(inner, rx, shutdown));

        dispatcher
    }

    /// Register a session, stealing the identity from any session
    /// already connected with the same client id.
    pub fn register(
        &self,
        client_id: &str,
        start: Lsn,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<SessionInbound>) {
        let handle = Arc::new(SessionHandle::new(client_id, start));
        let (feed_tx, feed_rx) = mpsc::channel(FEED_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inner.options.queue_depth);

        let entry = Arc::new(SessionEntry {
            handle: handle.clone(),
            feed: feed_tx,
            stalled_since: Mutex::new(None),
        });

        let old = self
            .inner
            .sessions
            .write()
            .insert(client_id.to_string(), entry);

        if let Some(old) = old {
            debug!("session replaced by reconnect [{}]", client_id);
            old.handle.drain(None);
        }

        tokio::spawn(Self::relay(handle.clone(), feed_rx, inbound_tx));

        (handle, inbound_rx)
    }

    /// Remove a session, unless a reconnect already replaced it.
    pub fn deregister(&self, handle: &Arc<SessionHandle>) {
        let mut sessions = self.inner.sessions.write();
        if let Some(entry) = sessions.get(&handle.client_id) {
            if Arc::ptr_eq(&entry.handle, handle) {
                sessions.remove(&handle.client_id);
            }
        }
    }

    /// Record an acknowledgment: advance the in-memory cursor and
    /// persist it, so reconnects resume from here.
    pub async fn ack(&self, handle: &SessionHandle, lsn: Lsn) -> Result<(), Error> {
        handle.set_last_ack(lsn);
        self.inner.cursors.save(&handle.client_id, lsn).await
    }

    /// Minimum persisted cursor across durable subscribers. The
    /// ingestor never advances the slot past this.
    pub async fn min_cursor(&self) -> Result<Option<Lsn>, Error> {
        self.inner.cursors.min_cursor().await
    }

    pub fn cursors(&self) -> &Arc<dyn CursorStore> {
        &self.inner.cursors
    }

    /// Highest LSN handed to session inputs.
    pub fn fanout_cursor(&self) -> Lsn {
        Lsn::from_u64(self.inner.fanout_cursor.load(Ordering::Acquire))
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Move every session into draining. Process shutdown: the
    /// ingestor halts but sessions persist their cursors cleanly.
    pub fn shutdown_sessions(&self) {
        let entries: Vec<Arc<SessionEntry>> =
            self.inner.sessions.read().values().cloned().collect();

        for entry in entries {
            entry.handle.drain(Some(CloseCode::ServerShutdown));
        }
    }

    /// Publish a freshly ingested range `(prevMax, newMax]`.
    pub async fn publish(&self, records: Vec<ChangeRecord>) {
        if records.is_empty() {
            return;
        }
        let _ = self.tx.send(Fanout::Records(Arc::new(records))).await;
    }

    /// Publish a bare LSN advance; idle sessions pass it on as
    /// `srv_lsn_update`.
    pub async fn publish_lsn(&self, lsn: Lsn) {
        let _ = self.tx.send(Fanout::Lsn(lsn)).await;
    }

    // Per-session relay: unpacks published ranges into the
    // session's bounded record queue. Blocks only this session.
    async fn relay(
        handle: Arc<SessionHandle>,
        mut feed: mpsc::Receiver<Fanout>,
        inbound: mpsc::Sender<SessionInbound>,
    ) {
        loop {
            let item = select! {
                _ = handle.cancelled() => break,
                item = feed.recv() => item,
            };

            let range = match item {
                Some(Fanout::Records(range)) => range,
                Some(Fanout::Lsn(lsn)) => {
                    select! {
                        _ = handle.cancelled() => break,
                        result = inbound.send(SessionInbound::Lsn(lsn)) => {
                            if result.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                None => break,
            };

            for record in range.iter() {
                select! {
                    _ = handle.cancelled() => return,
                    result = inbound.send(SessionInbound::Record(record.clone())) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    // The fan-out task. Never blocks on any one session.
    async fn fan_out(inner: Arc<Inner>, mut rx: mpsc::Receiver<Fanout>, shutdown: CancellationToken) {
        let mut scan = interval(Duration::from_secs(1));

        loop {
            select! {
                _ = shutdown.cancelled() => break,

                item = rx.recv() => {
                    let item = match item {
                        Some(item) => item,
                        None => break,
                    };

                    let item = match item {
                        Fanout::Records(range) => {
                            let coalesced = Self::coalesce(&inner.tracker, range);
                            if let Some(last) = coalesced.last() {
                                inner.fanout_cursor.fetch_max(last.lsn.as_u64(), Ordering::AcqRel);
                            }
                            Fanout::Records(coalesced)
                        }
                        Fanout::Lsn(lsn) => {
                            inner.fanout_cursor.fetch_max(lsn.as_u64(), Ordering::AcqRel);
                            Fanout::Lsn(lsn)
                        }
                    };

                    Self::route(&inner, item);
                }

                _ = scan.tick() => Self::check_stalled(&inner),
            }
        }

        debug!("dispatcher fan-out is shut down");
    }

    // Drop records superseded by a later change to the same key
    // in the same pending range. Intentional duplicates survive.
    fn coalesce(tracker: &ChangeTracker, range: Arc<Vec<ChangeRecord>>) -> Arc<Vec<ChangeRecord>> {
        let classified = tracker.classify(&range);

        if classified
            .iter()
            .all(|class| *class != Classification::Superseded)
        {
            return range;
        }

        Arc::new(
            range
                .iter()
                .zip(classified)
                .filter(|(_, class)| *class != Classification::Superseded)
                .map(|(record, _)| record.clone())
                .collect(),
        )
    }

    fn route(inner: &Arc<Inner>, item: Fanout) {
        let entries: Vec<Arc<SessionEntry>> =
            inner.sessions.read().values().cloned().collect();

        for entry in entries {
            if !entry.handle.feed_enabled() || entry.handle.is_cancelled() {
                continue;
            }

            match entry.feed.try_send(item.clone()) {
                Ok(()) => {
                    *entry.stalled_since.lock() = None;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let mut stalled = entry.stalled_since.lock();
                    let since = *stalled.get_or_insert_with(Instant::now);

                    if since.elapsed() > inner.options.stall {
                        drop(stalled);
                        Self::force_drain(&entry, since.elapsed());
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => (),
            }
        }
    }

    // Re-check stalled sessions between publishes: a session that
    // caught up is cleared, one past the threshold is drained.
    fn check_stalled(inner: &Arc<Inner>) {
        let entries: Vec<Arc<SessionEntry>> =
            inner.sessions.read().values().cloned().collect();

        for entry in entries {
            let mut stalled = entry.stalled_since.lock();

            let since = match *stalled {
                Some(since) => since,
                None => continue,
            };

            if entry.feed.capacity() > 0 {
                *stalled = None;
            } else if since.elapsed() > inner.options.stall {
                drop(stalled);
                Self::force_drain(&entry, since.elapsed());
            }
        }
    }

    fn force_drain(entry: &SessionEntry, stalled_for: Duration) {
        warn!(
            "session stalled for {}, draining [{}]",
            human_duration(stalled_for),
            entry.handle.client_id
        );
        entry.handle.drain(Some(CloseCode::Backpressure));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::cursors::MemoryCursors;
    use crate::net::Operation;
    use chrono::Utc;
    use serde_json::json;
    use std::str::FromStr;
    use tokio::time::{sleep, timeout};

    fn record(lsn: u64, id: &str) -> ChangeRecord {
        ChangeRecord {
            table: "tasks".into(),
            operation: Operation::Insert,
            data: json!({"id": id}),
            updated_at: Utc::now(),
            lsn: Lsn::from_u64(lsn),
            xid: None,
        }
    }

    fn dispatcher(queue_depth: usize, stall: Duration) -> Dispatcher {
        Dispatcher::new(
            Arc::new(MemoryCursors::new()),
            Arc::new(ChangeTracker::new()),
            DispatcherOptions { queue_depth, stall },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_fanout_reaches_live_sessions() {
        let dispatcher = dispatcher(16, Duration::from_secs(30));

        let (h1, mut rx1) = dispatcher.register("c1", Lsn::ZERO);
        let (h2, mut rx2) = dispatcher.register("c2", Lsn::ZERO);
        h1.enable_feed();
        h2.enable_feed();

        dispatcher.publish(vec![record(0x30, "T2")]).await;

        for rx in [&mut rx1, &mut rx2] {
            let inbound = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match inbound {
                SessionInbound::Record(record) => assert_eq!(record.lsn, Lsn::from_u64(0x30)),
                _ => panic!("expected a record"),
            }
        }

        assert_eq!(dispatcher.fanout_cursor(), Lsn::from_u64(0x30));
    }

    #[tokio::test]
    async fn test_feed_disabled_until_enabled() {
        let dispatcher = dispatcher(16, Duration::from_secs(30));
        let (_handle, mut rx) = dispatcher.register("c1", Lsn::ZERO);

        dispatcher.publish(vec![record(0x10, "T1")]).await;
        sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_steals_session() {
        let dispatcher = dispatcher(16, Duration::from_secs(30));

        let (old, _old_rx) = dispatcher.register("c1", Lsn::ZERO);
        let (new, _new_rx) = dispatcher.register("c1", Lsn::ZERO);

        assert!(old.is_cancelled());
        assert!(!new.is_cancelled());
        assert_eq!(dispatcher.session_count(), 1);

        // The old session deregistering doesn't evict the new one.
        dispatcher.deregister(&old);
        assert_eq!(dispatcher.session_count(), 1);
        dispatcher.deregister(&new);
        assert_eq!(dispatcher.session_count(), 0);
    }

    #[tokio::test]
    async fn test_coalescing_keeps_latest_and_intentional() {
        let dispatcher = dispatcher(16, Duration::from_secs(30));
        let (handle, mut rx) = dispatcher.register("c1", Lsn::ZERO);
        handle.enable_feed();

        let mut intentional = record(0x15, "T1");
        intentional.data["__intentionalDuplicate"] = json!(true);

        dispatcher
            .publish(vec![record(0x10, "T1"), intentional, record(0x20, "T1")])
            .await;

        let mut lsns = vec![];
        for _ in 0..2 {
            match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
                Some(SessionInbound::Record(record)) => lsns.push(record.lsn.as_u64()),
                other => panic!("unexpected {:?}", other),
            }
        }

        // 0x10 was superseded by 0x20; the intentional duplicate survives.
        assert_eq!(lsns, vec![0x15, 0x20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_session_drained_others_healthy() {
        let dispatcher = dispatcher(4, Duration::from_millis(500));

        let (slow, _slow_rx) = dispatcher.register("slow", Lsn::ZERO);
        let (fast, mut fast_rx) = dispatcher.register("fast", Lsn::ZERO);
        slow.enable_feed();
        fast.enable_feed();

        // Saturate the slow session: its queue holds 4 records and
        // FEED_DEPTH ranges; everything past that marks it stalled.
        for i in 0..(FEED_DEPTH as u64 + 16) {
            dispatcher.publish(vec![record(0x100 + i, "T1")]).await;
        }

        // The fast session keeps receiving.
        let mut received = 0;
        while timeout(Duration::from_millis(100), fast_rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            received += 1;
            if received > 8 {
                break;
            }
        }
        assert!(received > 8);

        // Past the stall threshold the slow session is drained.
        sleep(Duration::from_secs(3)).await;
        assert!(slow.is_cancelled());
        assert_eq!(slow.drain_reason(), Some(CloseCode::Backpressure));
        assert!(!fast.is_cancelled());
    }

    #[tokio::test]
    async fn test_ack_persists_cursor() {
        let cursors = Arc::new(MemoryCursors::new());
        let dispatcher = Dispatcher::new(
            cursors.clone(),
            Arc::new(ChangeTracker::new()),
            DispatcherOptions {
                queue_depth: 16,
                stall: Duration::from_secs(30),
            },
            CancellationToken::new(),
        );

        let (handle, _rx) = dispatcher.register("c1", Lsn::ZERO);
        dispatcher
            .ack(&handle, Lsn::from_str("0/30").unwrap())
            .await
            .unwrap();

        assert_eq!(handle.last_ack(), Lsn::from_str("0/30").unwrap());
        assert_eq!(
            cursors.load("c1").await.unwrap(),
            Some(Lsn::from_str("0/30").unwrap())
        );
        assert_eq!(
            dispatcher.min_cursor().await.unwrap(),
            Some(Lsn::from_str("0/30").unwrap())
        );
    }
}
