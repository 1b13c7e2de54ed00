//! End-to-end session scenarios over in-memory stores and a
//! channel transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use vibesync::backend::cursors::{CursorStore, MemoryCursors};
use vibesync::backend::history::{ChangeStore, MemoryHistory};
use vibesync::backend::replication::Lsn;
use vibesync::backend::tracker::ChangeTracker;
use vibesync::frontend::session::{Session, SessionOptions};
use vibesync::frontend::{Context, Dispatcher, DispatcherOptions};
use vibesync::net::transport::{ChannelClient, ChannelTransport};
use vibesync::net::{ChangeRecord, ClientMessage, CloseCode, Operation, Sequence, ServerMessage};

fn lsn(s: &str) -> Lsn {
    s.parse().unwrap()
}

fn record(at: &str, table: &str, operation: Operation, data: serde_json::Value) -> ChangeRecord {
    ChangeRecord {
        table: table.into(),
        operation,
        data,
        updated_at: Utc::now(),
        lsn: lsn(at),
        xid: None,
    }
}

fn tx_record(at: u64, xid: &str) -> ChangeRecord {
    ChangeRecord {
        table: "tasks".into(),
        operation: Operation::Insert,
        data: json!({"id": format!("T{}", at)}),
        updated_at: Utc::now(),
        lsn: Lsn::from_u64(at),
        xid: Some(xid.into()),
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        batch_max_records: 500,
        batch_max_bytes: 512 * 1024,
        heartbeat_timeout: Duration::from_secs(20),
        ack_stall: Duration::from_secs(30),
        catchup_page: 2000,
    }
}

struct Harness {
    context: Context,
    history: Arc<MemoryHistory>,
    cursors: Arc<MemoryCursors>,
}

fn harness() -> Harness {
    let history = Arc::new(MemoryHistory::new());
    let cursors = Arc::new(MemoryCursors::new());
    let tracker = Arc::new(ChangeTracker::new());
    let shutdown = CancellationToken::new();

    let history_store: Arc<dyn ChangeStore> = history.clone();
    let cursor_store: Arc<dyn CursorStore> = cursors.clone();

    let dispatcher = Dispatcher::new(
        cursor_store.clone(),
        tracker.clone(),
        DispatcherOptions {
            queue_depth: 1024,
            stall: Duration::from_secs(30),
        },
        shutdown.clone(),
    );

    Harness {
        context: Context {
            history: history_store,
            cursors: cursor_store,
            tracker,
            dispatcher,
            shutdown,
        },
        history,
        cursors,
    }
}

fn connect(harness: &Harness, client_id: &str, last_known: &str, opts: SessionOptions) -> ChannelClient {
    let (transport, client) = ChannelTransport::pair(64);
    let context = harness.context.clone();
    let client_id = client_id.to_string();
    let requested = lsn(last_known);

    tokio::spawn(async move {
        Session::spawn(Box::new(transport), &client_id, requested, context, opts).await;
    });

    client
}

async fn recv(client: &mut ChannelClient) -> ServerMessage {
    timeout(Duration::from_secs(2), client.rx.recv())
        .await
        .expect("timed out waiting for a server message")
        .expect("transport closed unexpectedly")
}

async fn assert_silent(client: &mut ChannelClient) {
    let quiet = timeout(Duration::from_millis(200), client.rx.recv()).await;
    assert!(quiet.is_err(), "expected silence, got {:?}", quiet);
}

async fn catchup_ack(client: &mut ChannelClient, client_id: &str, chunk: u32, at: Lsn) {
    client
        .tx
        .send(ClientMessage::CatchupReceived {
            client_id: client_id.into(),
            chunk,
            lsn: at,
        })
        .await
        .unwrap();
}

async fn changes_ack(client: &mut ChannelClient, client_id: &str, at: Lsn) {
    client
        .tx
        .send(ClientMessage::ChangesAck {
            client_id: client_id.into(),
            last_lsn: at,
            timestamp: None,
        })
        .await
        .unwrap();
}

fn seed_tasks() -> Vec<ChangeRecord> {
    vec![
        record("0/10", "tasks", Operation::Insert, json!({"id": "T1"})),
        record(
            "0/20",
            "tasks",
            Operation::Update,
            json!({"id": "T1", "status": "done"}),
        ),
    ]
}

// S1: fresh client replays the full history in one chunk, gets a
// completion marker, then sits live in silence.
#[tokio::test]
async fn test_fresh_client_catchup() {
    let harness = harness();
    harness.history.append(&seed_tasks()).await.unwrap();

    let mut client = connect(&harness, "c1", "0/0", options());

    match recv(&mut client).await {
        ServerMessage::CatchupChanges {
            changes,
            sequence,
            last_lsn,
            ..
        } => {
            assert_eq!(changes.len(), 2);
            assert_eq!(changes[0].lsn, lsn("0/10"));
            assert_eq!(changes[1].lsn, lsn("0/20"));
            assert_eq!(changes[1].data["status"], "done");
            assert_eq!(sequence, Sequence { chunk: 1, total: 1 });
            assert_eq!(last_lsn, lsn("0/20"));
        }
        other => panic!("expected catchup changes, got {:?}", other),
    }

    catchup_ack(&mut client, "c1", 1, lsn("0/20")).await;

    match recv(&mut client).await {
        ServerMessage::CatchupCompleted {
            final_lsn,
            start_lsn,
            change_count,
            success,
            ..
        } => {
            assert!(success);
            assert_eq!(change_count, 2);
            assert_eq!(start_lsn, lsn("0/0"));
            assert_eq!(final_lsn, lsn("0/20"));
        }
        other => panic!("expected catchup completion, got {:?}", other),
    }

    assert_silent(&mut client).await;
    assert_eq!(harness.cursors.load("c1").await.unwrap(), Some(lsn("0/20")));
}

// S2: reconnecting with partial history replays only the tail.
#[tokio::test]
async fn test_reconnect_partial_history() {
    let harness = harness();
    harness.history.append(&seed_tasks()).await.unwrap();

    let mut client = connect(&harness, "c1", "0/10", options());

    match recv(&mut client).await {
        ServerMessage::CatchupChanges { changes, last_lsn, .. } => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].lsn, lsn("0/20"));
            assert_eq!(last_lsn, lsn("0/20"));
        }
        other => panic!("expected catchup changes, got {:?}", other),
    }

    catchup_ack(&mut client, "c1", 1, lsn("0/20")).await;

    match recv(&mut client).await {
        ServerMessage::CatchupCompleted { final_lsn, .. } => {
            assert_eq!(final_lsn, lsn("0/20"));
        }
        other => panic!("expected catchup completion, got {:?}", other),
    }
}

// S3: a live insert reaches every connected session and the
// minimum durable cursor advances once both acknowledge.
#[tokio::test]
async fn test_live_insert_fans_out() {
    let harness = harness();
    harness.history.append(&seed_tasks()).await.unwrap();

    // Both clients are already at the tip: no catchup traffic.
    let mut c1 = connect(&harness, "c1", "0/20", options());
    let mut c2 = connect(&harness, "c2", "0/20", options());
    sleep(Duration::from_millis(100)).await;

    let inserted = record("0/30", "tasks", Operation::Insert, json!({"id": "T2"}));
    harness.history.append(&[inserted.clone()]).await.unwrap();
    harness.context.dispatcher.publish(vec![inserted]).await;

    for (name, client) in [("c1", &mut c1), ("c2", &mut c2)] {
        match recv(client).await {
            ServerMessage::LiveChanges {
                changes, last_lsn, ..
            } => {
                assert_eq!(changes.len(), 1, "{}", name);
                assert_eq!(changes[0].lsn, lsn("0/30"));
                assert_eq!(changes[0].data["id"], "T2");
                assert_eq!(last_lsn, lsn("0/30"));
            }
            other => panic!("{} expected live changes, got {:?}", name, other),
        }

        changes_ack(client, name, lsn("0/30")).await;
    }

    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.cursors.min_cursor().await.unwrap(),
        Some(lsn("0/30"))
    );
}

// S5: one oversized transaction splits into tagged chunks; the
// cursor crosses the transaction only on the final ack.
#[tokio::test]
async fn test_chunked_transaction() {
    let harness = harness();
    let mut client = connect(&harness, "c1", "0/0", options());
    sleep(Duration::from_millis(50)).await;

    // Occupy the session with a single in-flight record, so the
    // big transaction is fully buffered before it's drained.
    let first = record("0/50", "tasks", Operation::Insert, json!({"id": "T0"}));
    harness.context.dispatcher.publish(vec![first]).await;

    match recv(&mut client).await {
        ServerMessage::LiveChanges { last_lsn, .. } => assert_eq!(last_lsn, lsn("0/50")),
        other => panic!("expected live changes, got {:?}", other),
    }

    let transaction: Vec<ChangeRecord> =
        (0x100..0x100 + 900).map(|at| tx_record(at, "tx900")).collect();
    let final_lsn = transaction.last().unwrap().lsn;
    harness.context.dispatcher.publish(transaction).await;
    sleep(Duration::from_millis(100)).await;

    // Release the session.
    changes_ack(&mut client, "c1", lsn("0/50")).await;

    let chunk1 = match recv(&mut client).await {
        ServerMessage::LiveChanges {
            changes,
            sequence,
            last_lsn,
            ..
        } => {
            assert_eq!(changes.len(), 500);
            assert_eq!(sequence, Some(Sequence { chunk: 1, total: 2 }));
            last_lsn
        }
        other => panic!("expected chunk 1, got {:?}", other),
    };

    match recv(&mut client).await {
        ServerMessage::LiveChanges {
            changes,
            sequence,
            last_lsn,
            ..
        } => {
            assert_eq!(changes.len(), 400);
            assert_eq!(sequence, Some(Sequence { chunk: 2, total: 2 }));
            assert_eq!(last_lsn, final_lsn);
        }
        other => panic!("expected chunk 2, got {:?}", other),
    }

    // Acking chunk 1 advances within the transaction, not past it.
    changes_ack(&mut client, "c1", chunk1).await;
    sleep(Duration::from_millis(100)).await;
    let cursor = harness.cursors.load("c1").await.unwrap().unwrap();
    assert_eq!(cursor, chunk1);
    assert!(cursor < final_lsn);

    changes_ack(&mut client, "c1", final_lsn).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.cursors.load("c1").await.unwrap(),
        Some(final_lsn)
    );
}

// Records ingested during catchup arrive exactly once: replayed
// if the session saw them in history, filtered from the live
// stream below the completion LSN otherwise.
#[tokio::test]
async fn test_catchup_live_continuity() {
    let harness = harness();
    harness.history.append(&seed_tasks()).await.unwrap();

    let mut client = connect(&harness, "c1", "0/0", options());

    match recv(&mut client).await {
        ServerMessage::CatchupChanges { changes, .. } => assert_eq!(changes.len(), 2),
        other => panic!("expected catchup changes, got {:?}", other),
    }

    // New WAL lands mid-catchup: appended and fanned out.
    let late = record("0/30", "tasks", Operation::Insert, json!({"id": "T2"}));
    harness.history.append(&[late.clone()]).await.unwrap();
    harness.context.dispatcher.publish(vec![late]).await;

    catchup_ack(&mut client, "c1", 1, lsn("0/20")).await;

    // The session notices the tail grew and replays it too.
    match recv(&mut client).await {
        ServerMessage::CatchupChanges { changes, .. } => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].lsn, lsn("0/30"));
        }
        other => panic!("expected second catchup round, got {:?}", other),
    }
    catchup_ack(&mut client, "c1", 1, lsn("0/30")).await;

    match recv(&mut client).await {
        ServerMessage::CatchupCompleted { final_lsn, .. } => {
            assert_eq!(final_lsn, lsn("0/30"));
        }
        other => panic!("expected catchup completion, got {:?}", other),
    }

    // The fanned-out copy of 0/30 never shows up again.
    assert_silent(&mut client).await;
}

// A reconnect with the same client id closes the old session and
// restarts catchup from the lower LSN.
#[tokio::test]
async fn test_reconnect_steals_identity() {
    let harness = harness();
    harness.history.append(&seed_tasks()).await.unwrap();

    let mut first = connect(&harness, "c1", "0/0", options());
    match recv(&mut first).await {
        ServerMessage::CatchupChanges { .. } => (),
        other => panic!("expected catchup changes, got {:?}", other),
    }

    // Reconnect without acking anything.
    let mut second = connect(&harness, "c1", "0/0", options());

    match recv(&mut second).await {
        ServerMessage::CatchupChanges { changes, .. } => {
            assert_eq!(changes.len(), 2);
            assert_eq!(changes[0].lsn, lsn("0/10"));
        }
        other => panic!("expected catchup restart, got {:?}", other),
    }

    // The old transport is closed out from under the old session.
    let gone = timeout(Duration::from_secs(2), async {
        loop {
            if first.rx.recv().await.is_none() {
                break;
            }
        }
    })
    .await;
    assert!(gone.is_ok(), "old session never went away");
}

// No heartbeat for twice the interval fails the session with a
// timeout close code.
#[tokio::test]
async fn test_heartbeat_timeout() {
    let harness = harness();
    let mut opts = options();
    opts.heartbeat_timeout = Duration::from_millis(200);

    let mut client = connect(&harness, "c1", "0/0", opts);

    match recv(&mut client).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, CloseCode::Timeout),
        other => panic!("expected a timeout error, got {:?}", other),
    }

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            if client.rx.recv().await.is_none() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

// An unacknowledged batch past the stall threshold fails the
// session with a backpressure close code, and the cursor stays
// at the last acknowledged position.
#[tokio::test]
async fn test_ack_stall_backpressure() {
    let harness = harness();
    let mut opts = options();
    opts.ack_stall = Duration::from_millis(200);

    let mut client = connect(&harness, "c1", "0/0", opts);
    sleep(Duration::from_millis(50)).await;

    let inserted = record("0/30", "tasks", Operation::Insert, json!({"id": "T2"}));
    harness.context.dispatcher.publish(vec![inserted]).await;

    match recv(&mut client).await {
        ServerMessage::LiveChanges { .. } => (),
        other => panic!("expected live changes, got {:?}", other),
    }

    // Heartbeats keep flowing; the ack never comes.
    client
        .tx
        .send(ClientMessage::Heartbeat {
            client_id: "c1".into(),
            timestamp: None,
        })
        .await
        .unwrap();

    match recv(&mut client).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, CloseCode::Backpressure),
        other => panic!("expected a backpressure error, got {:?}", other),
    }

    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.cursors.load("c1").await.unwrap(), Some(lsn("0/0")));
}

// A protocol violation is answered with an error and a close.
#[tokio::test]
async fn test_protocol_error() {
    let harness = harness();
    let mut client = connect(&harness, "c1", "0/0", options());
    sleep(Duration::from_millis(50)).await;

    // A catchup ack while the session is live.
    catchup_ack(&mut client, "c1", 1, lsn("0/10")).await;

    match recv(&mut client).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, CloseCode::Protocol),
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

// Replaying a range into a fresh session yields exactly the
// records in (A, B] in LSN order.
#[tokio::test]
async fn test_replay_is_exact() {
    let harness = harness();
    let records: Vec<ChangeRecord> = (1..=20)
        .map(|i| {
            record(
                &format!("0/{:x}", i * 16),
                "tasks",
                Operation::Insert,
                json!({"id": format!("T{}", i)}),
            )
        })
        .collect();
    harness.history.append(&records).await.unwrap();

    let start = records[4].lsn; // replay (records[4].lsn, max]
    let mut client = connect(&harness, "c1", &start.to_string(), options());

    match recv(&mut client).await {
        ServerMessage::CatchupChanges { changes, .. } => {
            let expected: Vec<Lsn> = records[5..].iter().map(|r| r.lsn).collect();
            let got: Vec<Lsn> = changes.iter().map(|r| r.lsn).collect();
            assert_eq!(got, expected);
        }
        other => panic!("expected catchup changes, got {:?}", other),
    }
}
