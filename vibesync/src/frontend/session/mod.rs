//! Per-client streaming session.
//!
//! A session exists only while a transport connection does. It
//! replays history after the client's cursor (catchup), then
//! streams newly ingested changes (live), advancing the cursor
//! only on acknowledgment. Redelivery after reconnect is the
//! correctness mechanism; clients are idempotent keyed by LSN.

pub mod state;

pub use state::State;

use std::collections::VecDeque;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::batch;
use super::dispatcher::{SessionHandle, SessionInbound};
use super::{Context, Error};
use crate::backend::replication::Lsn;
use crate::config::config;
use crate::net::{ChangeRecord, ClientMessage, CloseCode, Sequence, ServerMessage, Transport};

use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    pub heartbeat_timeout: Duration,
    pub ack_stall: Duration,
    /// History page size while replaying.
    pub catchup_page: i64,
}

impl SessionOptions {
    pub fn from_config() -> Self {
        let replication = &config().replication;
        Self {
            batch_max_records: replication.batch_max_records,
            batch_max_bytes: replication.batch_max_bytes,
            heartbeat_timeout: replication.heartbeat_timeout(),
            ack_stall: replication.session_stall(),
            catchup_page: (replication.batch_max_records * 4) as i64,
        }
    }
}

enum Event {
    Cancelled,
    Message(Option<ClientMessage>),
    Inbound(Option<SessionInbound>),
    IdleTimeout,
    AckTimeout,
}

pub struct Session {
    client_id: String,
    transport: Box<dyn Transport>,
    context: Context,
    options: SessionOptions,
    handle: Arc<SessionHandle>,
    inbound: mpsc::Receiver<SessionInbound>,
    // Last acknowledged LSN. Durable advances go through the
    // dispatcher, which owns the persisted cursor.
    cursor: Lsn,
    idle_deadline: Instant,
}

impl Session {
    /// Run a session over an accepted transport. Identity is
    /// verified externally; the handshake supplies the client id
    /// and its last known LSN.
    pub async fn spawn(
        transport: Box<dyn Transport>,
        client_id: &str,
        requested: Lsn,
        context: Context,
        options: SessionOptions,
    ) {
        info!("client connected [{}]", client_id);

        match Self::run(transport, client_id, requested, context, options).await {
            Ok(()) | Err(Error::Disconnected) => info!("client disconnected [{}]", client_id),
            Err(Error::Net(crate::net::Error::ConnectionClosed)) => {
                info!("client disconnected [{}]", client_id)
            }
            Err(Error::Cancelled) => debug!("session drained [{}]", client_id),
            Err(err) => warn!("session failed: {} [{}]", err, client_id),
        }
    }

    async fn run(
        transport: Box<dyn Transport>,
        client_id: &str,
        requested: Lsn,
        context: Context,
        options: SessionOptions,
    ) -> Result<(), Error> {
        // Identity ok; load the durable cursor. Replay starts at
        // whichever of the two positions is further along.
        let persisted = context.cursors.load(client_id).await?.unwrap_or(Lsn::ZERO);
        let start = persisted.max(requested);

        let (handle, inbound) = context.dispatcher.register(client_id, start);
        handle.set_state(State::Authenticated);

        let mut session = Session {
            client_id: client_id.to_string(),
            transport,
            context,
            options,
            handle: handle.clone(),
            inbound,
            cursor: start,
            idle_deadline: Instant::now() + options.heartbeat_timeout,
        };

        let result = session.stream().await;

        handle.set_state(State::Draining);
        session.send_close_code(&result).await;

        // Unacked LSNs are simply not advanced; the cursor we
        // persist is what redelivery resumes from.
        if let Err(err) = session.context.dispatcher.ack(&handle, session.cursor).await {
            warn!("failed to persist cursor: {} [{}]", err, session.client_id);
        }

        session.context.dispatcher.deregister(&handle);
        session.transport.close().await;
        handle.set_state(State::Closed);

        match result {
            Ok(()) | Err(Error::Disconnected) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn stream(&mut self) -> Result<(), Error> {
        self.catchup().await?;
        self.live().await
    }

    // Tell the client why it's going away, best effort.
    async fn send_close_code(&mut self, result: &Result<(), Error>) {
        let close = match result {
            Err(Error::HeartbeatTimeout) => Some((CloseCode::Timeout, "heartbeat timeout".into())),
            Err(Error::AckStalled) => {
                Some((CloseCode::Backpressure, "acknowledgment stalled".into()))
            }
            Err(Error::Protocol(message)) => Some((CloseCode::Protocol, message.clone())),
            Err(Error::Net(crate::net::Error::Json(_))) => {
                Some((CloseCode::Protocol, "undecodable message".into()))
            }
            Err(Error::Cancelled) => self
                .handle
                .drain_reason()
                .map(|code| (code, code.to_string())),
            _ => None,
        };

        if let Some((code, message)) = close {
            let error = ServerMessage::error(&self.client_id, code, &message);
            let _ = self.transport.send(error).await;
        }
    }

    /// Replay history strictly after the cursor, one acked chunk
    /// at a time, then hand over to the live stream.
    async fn catchup(&mut self) -> Result<(), Error> {
        // Buffer live fan-out from here on: anything the ingestor
        // appends during replay lands either in our remaining
        // history reads or in the inbound queue, never in a gap.
        self.handle.enable_feed();

        let start = self.cursor;
        let mut total = 0;
        let mut replayed = false;

        loop {
            if self.handle.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let pending = self.read_pending().await?;
            if pending.is_empty() {
                break;
            }

            if !replayed {
                replayed = true;
                self.handle.set_state(State::Catchup);
            }

            let chunks = batch::chunk(
                &pending,
                self.options.batch_max_records,
                self.options.batch_max_bytes,
            );
            let total_chunks = chunks.len() as u32;

            for (i, chunk) in chunks.into_iter().enumerate() {
                let sequence = Sequence {
                    chunk: i as u32 + 1,
                    total: total_chunks,
                };

                total += chunk.records.len();
                let message = ServerMessage::catchup_changes(
                    &self.client_id,
                    chunk.records,
                    sequence,
                    chunk.last_lsn,
                );
                self.transport.send(message).await?;

                // Sliding window of one.
                self.await_catchup_ack(sequence.chunk).await?;
                self.cursor = chunk.last_lsn;
                self.context.dispatcher.ack(&self.handle, self.cursor).await?;
            }
        }

        if replayed {
            debug!(
                "catchup replayed {} records through {} [{}]",
                total, self.cursor, self.client_id
            );
            let completed =
                ServerMessage::catchup_completed(&self.client_id, total, start, self.cursor);
            self.transport.send(completed).await?;
        }

        self.handle.set_state(State::Live);
        Ok(())
    }

    // All history past the cursor at this instant, paged.
    async fn read_pending(&mut self) -> Result<Vec<ChangeRecord>, Error> {
        let mut pending = vec![];
        let mut position = self.cursor;

        loop {
            let page = self
                .context
                .history
                .by_lsn_range(position, None, self.options.catchup_page)
                .await?;

            let full = page.len() as i64 >= self.options.catchup_page;
            if let Some(last) = page.last() {
                position = last.lsn;
            }
            pending.extend(page);

            if !full {
                break;
            }
        }

        Ok(pending)
    }

    async fn await_catchup_ack(&mut self, chunk: u32) -> Result<(), Error> {
        let ack_deadline = Instant::now() + self.options.ack_stall;

        loop {
            let event = select! {
                _ = self.handle.cancelled() => Event::Cancelled,
                message = self.transport.recv() => Event::Message(message?),
                _ = sleep_until(self.idle_deadline) => Event::IdleTimeout,
                _ = sleep_until(ack_deadline) => Event::AckTimeout,
            };

            match event {
                Event::Cancelled => return Err(Error::Cancelled),
                Event::IdleTimeout => return Err(Error::HeartbeatTimeout),
                Event::AckTimeout => return Err(Error::AckStalled),
                Event::Inbound(_) => (),
                Event::Message(message) => {
                    self.touch();
                    match message {
                        Some(ClientMessage::CatchupReceived { chunk: acked, .. }) => {
                            if acked != chunk {
                                return Err(Error::Protocol(format!(
                                    "catchup ack for chunk {} while waiting for {}",
                                    acked, chunk
                                )));
                            }
                            return Ok(());
                        }
                        Some(ClientMessage::Heartbeat { .. }) => (),
                        Some(ClientMessage::ChangesAck { .. }) => {
                            return Err(Error::Protocol(
                                "live acknowledgment during catchup".into(),
                            ));
                        }
                        None => return Err(Error::Disconnected),
                    }
                }
            }
        }
    }

    /// The live loop: flush fan-out as batches, advance on acks,
    /// time out on silence.
    async fn live(&mut self) -> Result<(), Error> {
        // Highest sent, unacknowledged LSN. While set, the
        // inbound queue is left alone and back-pressure builds.
        let mut in_flight: Option<Lsn> = None;
        let mut ack_deadline = far_future();

        loop {
            let event = select! {
                _ = self.handle.cancelled() => Event::Cancelled,
                message = self.transport.recv() => Event::Message(message?),
                inbound = self.inbound.recv(), if in_flight.is_none() => Event::Inbound(inbound),
                _ = sleep_until(self.idle_deadline) => Event::IdleTimeout,
                _ = sleep_until(ack_deadline), if in_flight.is_some() => Event::AckTimeout,
            };

            match event {
                Event::Cancelled => return Err(Error::Cancelled),
                Event::IdleTimeout => return Err(Error::HeartbeatTimeout),
                Event::AckTimeout => return Err(Error::AckStalled),

                Event::Message(message) => {
                    self.touch();
                    match message {
                        Some(ClientMessage::ChangesAck { last_lsn, .. }) => {
                            if last_lsn > self.cursor {
                                self.cursor = last_lsn;
                                self.context
                                    .dispatcher
                                    .ack(&self.handle, last_lsn)
                                    .await?;
                            }

                            if matches!(in_flight, Some(sent) if last_lsn >= sent) {
                                in_flight = None;
                                ack_deadline = far_future();
                            } else if in_flight.is_some() {
                                // Partial ack of a chunked send:
                                // progress, so the clock restarts.
                                ack_deadline = Instant::now() + self.options.ack_stall;
                            }
                        }
                        Some(ClientMessage::Heartbeat { .. }) => (),
                        Some(ClientMessage::CatchupReceived { .. }) => {
                            return Err(Error::Protocol(
                                "catchup acknowledgment while live".into(),
                            ));
                        }
                        None => return Err(Error::Disconnected),
                    }
                }

                Event::Inbound(inbound) => {
                    let first = match inbound {
                        Some(first) => first,
                        // Relay gone: the dispatcher cancelled us.
                        None => return Err(Error::Cancelled),
                    };

                    let (records, lsn_update) = self.drain_inbound(first);

                    if !records.is_empty() {
                        let sent = self.flush(records).await?;
                        in_flight = Some(sent);
                        ack_deadline = Instant::now() + self.options.ack_stall;
                    } else if let Some(lsn) = lsn_update {
                        if lsn > self.cursor {
                            let update = ServerMessage::lsn_update(&self.client_id, lsn);
                            self.transport.send(update).await?;
                        }
                    }
                }
            }
        }
    }

    // Pull everything already buffered, in order. Records at or
    // below the cursor were already delivered during catchup.
    fn drain_inbound(&mut self, first: SessionInbound) -> (Vec<ChangeRecord>, Option<Lsn>) {
        let mut records = vec![];
        let mut lsn_update = None;
        let mut queue = VecDeque::from([first]);

        loop {
            match queue.pop_front() {
                Some(SessionInbound::Record(record)) => {
                    if record.lsn > self.cursor {
                        records.push(record);
                    }
                }
                Some(SessionInbound::Lsn(lsn)) => {
                    lsn_update = Some(lsn_update.map_or(lsn, |known: Lsn| known.max(lsn)));
                }
                None => match self.inbound.try_recv() {
                    Ok(inbound) => queue.push_back(inbound),
                    Err(_) => break,
                },
            }

            if records.len() >= self.options.batch_max_records * 4 {
                break;
            }
        }

        (records, lsn_update)
    }

    // Send one logical delivery, chunked under the caps. Returns
    // the highest LSN sent; the cursor advances only on ack.
    async fn flush(&mut self, records: Vec<ChangeRecord>) -> Result<Lsn, Error> {
        let chunks = batch::chunk(
            &records,
            self.options.batch_max_records,
            self.options.batch_max_bytes,
        );

        let mut sent = self.cursor;
        for chunk in chunks {
            sent = sent.max(chunk.last_lsn);
            let message = ServerMessage::live_changes(
                &self.client_id,
                chunk.records,
                chunk.split,
                chunk.last_lsn,
            );
            self.transport.send(message).await?;
        }

        Ok(sent)
    }

    fn touch(&mut self) {
        self.idle_deadline = Instant::now() + self.options.heartbeat_timeout;
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 30)
}
