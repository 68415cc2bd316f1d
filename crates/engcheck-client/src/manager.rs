// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Live-link lifecycle: connect, handshake, snapshot sync, gap repair, backoff.
//!
//! ```text
//! Disconnected ─▶ Connecting ─(snapshot)─▶ Synced ─(gap)─▶ Degraded
//!      ▲               │                     │  ▲            │
//!      └──(transport failure, any state)─────┘  └(snapshot)──┘
//! any ─(shutdown)─▶ Closed
//! ```
//!
//! The manager is the only caller of the [`Reconciler`]; frames are handled
//! one at a time in delivery order. While a snapshot is pending (Connecting
//! or Degraded) incremental events are parked in a [`ResyncBuffer`] and
//! replayed in sequence order once the snapshot lands.

use engcheck_core::{normalize, ComplianceEvent, Reconciler, View};
use engcheck_proto::{
    AckStatus, HandshakePayload, Message, Notification, Sequence, SnapshotPayload,
    SnapshotRequestPayload, SubscribePayload, Value,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::buffer::ResyncBuffer;
use crate::transport::{Connection, Transport, TransportError};

/// Implementation version sent in the handshake.
pub const CLIENT_VERSION: u32 = 1;

const NOTIFY_CAPACITY: usize = 64;

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No transport; waiting out a backoff delay.
    #[default]
    Disconnected,
    /// Connected or connecting; initial snapshot not yet applied.
    Connecting,
    /// Store reflects every event up to the last seen sequence.
    Synced,
    /// A sequence gap was seen; a resync snapshot is pending.
    Degraded,
    /// Explicit shutdown. Terminal.
    Closed,
}

impl ConnectionState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Synced => "synced",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published link status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Consecutive failed connection attempts.
    pub attempt: u32,
    /// Most recent transport failure.
    pub last_error: Option<String>,
    /// Persistent-disconnection notice, set once retries are exhausted.
    pub notice: Option<String>,
    /// Session id from the last accepted handshake.
    pub session_id: Option<String>,
    /// Last stream sequence reflected in the store.
    pub last_sequence: Option<Sequence>,
    /// Events parked for replay.
    pub buffered: usize,
    /// Parked events dropped because the buffer was full.
    pub evicted: u64,
    /// Snapshot requests sent.
    pub snapshot_requests: u64,
}

/// Received sequence skipped past `expected`; events are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence gap: expected {expected}, received {received}")]
pub struct SequenceGapError {
    /// Next sequence that would have been contiguous.
    pub expected: Sequence,
    /// Sequence actually received.
    pub received: Sequence,
}

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Categories to subscribe to (empty = all).
    pub categories: Vec<String>,
    /// Deadline for connect + handshake acknowledgement.
    pub handshake_timeout: Duration,
    /// Deadline for a snapshot response.
    pub resync_timeout: Duration,
    /// Reconnect (and snapshot re-request) backoff.
    pub backoff: BackoffPolicy,
    /// Consecutive failures before the persistent notice.
    pub max_retries: u32,
    /// Resync buffer capacity.
    pub buffer_capacity: usize,
    /// Agent id announced in the handshake.
    pub agent_id: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            handshake_timeout: Duration::from_secs(5),
            resync_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_retries: 8,
            buffer_capacity: 4096,
            agent_id: None,
        }
    }
}

/// Requests an orderly stop from any task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Move the manager to `Closed` and release its transport.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

enum Exit {
    Shutdown,
    Failed(TransportError),
}

/// Owns the link and the reconciler it feeds.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    reconciler: Reconciler,
    config: ManagerConfig,
    backoff: Backoff,
    resync_backoff: Backoff,
    buffer: ResyncBuffer,
    last_seen: Option<Sequence>,
    snapshot_deadline: Option<Instant>,
    status: LinkStatus,
    status_tx: watch::Sender<LinkStatus>,
    notify_tx: broadcast::Sender<Notification>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Manager over `transport`, feeding `reconciler`.
    pub fn new(transport: T, reconciler: Reconciler, config: ManagerConfig) -> Self {
        let (status_tx, _) = watch::channel(LinkStatus::default());
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            transport,
            reconciler,
            backoff: Backoff::new(config.backoff),
            resync_backoff: Backoff::new(config.backoff),
            buffer: ResyncBuffer::new(config.buffer_capacity),
            config,
            last_seen: None,
            snapshot_deadline: None,
            status: LinkStatus::default(),
            status_tx,
            notify_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Handle that stops [`run`](Self::run).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Link status updates.
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    /// Published store views.
    pub fn views(&self) -> watch::Receiver<Arc<View>> {
        self.reconciler.subscribe()
    }

    /// Producer notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    /// Drive the link until shutdown; hands the reconciler back.
    ///
    /// Reconnects are strictly sequential: a new attempt starts only after the
    /// previous one failed and its backoff delay elapsed.
    pub async fn run(mut self) -> Reconciler {
        while !self.is_shutdown() {
            self.set_state(ConnectionState::Connecting);
            match self.session().await {
                Exit::Shutdown => break,
                Exit::Failed(err) => {
                    self.snapshot_deadline = None;
                    self.status.attempt = self.status.attempt.saturating_add(1);
                    self.status.last_error = Some(err.to_string());
                    warn!(%err, attempt = self.status.attempt, "link failed");
                    if self.status.attempt >= self.config.max_retries && self.status.notice.is_none() {
                        error!(attempts = self.status.attempt, "compliance stream unreachable");
                        self.status.notice = Some(format!(
                            "compliance stream unreachable after {} attempts; still retrying",
                            self.status.attempt
                        ));
                    }
                    self.set_state(ConnectionState::Disconnected);
                    let delay = self.backoff.next_delay();
                    debug!(?delay, "reconnect scheduled");
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Closed);
        info!("connection manager closed");
        self.reconciler
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleep unless shutdown arrives first. Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            biased;
            () = wait_shutdown(&mut shutdown) => false,
            () = sleep(delay) => true,
        }
    }

    async fn session(&mut self) -> Exit {
        let mut shutdown = self.shutdown_rx.clone();
        let handshake = timeout(
            self.config.handshake_timeout,
            open(&mut self.transport, &self.config),
        );
        let (mut conn, session_id) = tokio::select! {
            biased;
            () = wait_shutdown(&mut shutdown) => return Exit::Shutdown,
            res = handshake => match res {
                Ok(Ok(opened)) => opened,
                Ok(Err(err)) => return Exit::Failed(err),
                Err(_) => return Exit::Failed(TransportError::HandshakeTimeout),
            },
        };
        info!(%session_id, "handshake accepted");
        self.status.session_id = Some(session_id);
        self.buffer.clear();
        self.resync_backoff.reset();

        let subscribe = SubscribePayload {
            categories: self.config.categories.clone(),
        };
        if let Err(err) = conn.send(&Message::Subscribe(subscribe)).await {
            return Exit::Failed(err);
        }
        if let Err(err) = self.request_snapshot(&mut conn).await {
            return Exit::Failed(err);
        }

        loop {
            let deadline = self.snapshot_deadline;
            let step = tokio::select! {
                biased;
                () = wait_shutdown(&mut shutdown) => return Exit::Shutdown,
                msg = conn.recv() => match msg {
                    Ok(Some(msg)) => self.handle(&mut conn, msg).await,
                    Ok(None) => Err(TransportError::Closed),
                    Err(err) => Err(err),
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let delay = self.resync_backoff.next_delay();
                    warn!(?delay, "snapshot request expired");
                    if !self.pause(delay).await {
                        return Exit::Shutdown;
                    }
                    self.request_snapshot(&mut conn).await
                }
            };
            if let Err(err) = step {
                return Exit::Failed(err);
            }
        }
    }

    async fn handle(&mut self, conn: &mut T::Conn, msg: Message) -> Result<(), TransportError> {
        match msg {
            Message::Event(raw) => self.on_event(conn, &raw).await,
            Message::Snapshot(snapshot) => self.on_snapshot(conn, &snapshot).await,
            Message::Notification(note) => {
                info!(kind = ?note.kind, title = %note.title, "producer notification");
                let _ = self.notify_tx.send(note);
                Ok(())
            }
            Message::Error(err) => {
                warn!(code = err.code, name = %err.name, message = %err.message, "producer error");
                Ok(())
            }
            other => {
                debug!(op = other.op_name(), "ignoring unexpected message");
                Ok(())
            }
        }
    }

    async fn on_event(&mut self, conn: &mut T::Conn, raw: &Value) -> Result<(), TransportError> {
        let event = match normalize(raw) {
            Ok(event) => event,
            Err(err) => {
                self.reconciler.record_malformed(&err);
                return Ok(());
            }
        };

        if self.snapshot_deadline.is_some() {
            self.park(event);
            self.publish_status();
            return Ok(());
        }

        if let Some(last) = self.last_seen {
            let expected = last.saturating_add(1);
            if event.sequence > expected {
                let gap = SequenceGapError {
                    expected,
                    received: event.sequence,
                };
                warn!(%gap, "events missing; resyncing");
                self.park(event);
                self.set_state(ConnectionState::Degraded);
                return self.request_snapshot(conn).await;
            }
        }
        self.accept(&event);
        self.publish_status();
        Ok(())
    }

    async fn on_snapshot(&mut self, conn: &mut T::Conn, snapshot: &SnapshotPayload) -> Result<(), TransportError> {
        if self.snapshot_deadline.is_none() && self.last_seen.is_some_and(|last| snapshot.sequence <= last) {
            debug!(sequence = snapshot.sequence, "ignoring unsolicited older snapshot");
            return Ok(());
        }
        match snapshot.verify() {
            Ok(true) => {}
            Ok(false) => {
                warn!(sequence = snapshot.sequence, "snapshot state hash mismatch");
                return self.request_snapshot(conn).await;
            }
            Err(err) => {
                warn!(%err, sequence = snapshot.sequence, "snapshot hash could not be computed");
                return self.request_snapshot(conn).await;
            }
        }

        let load = self.reconciler.load_snapshot(snapshot);
        info!(
            sequence = snapshot.sequence,
            items = load.items,
            malformed = load.malformed,
            "snapshot applied"
        );
        self.last_seen = Some(snapshot.sequence);
        self.snapshot_deadline = None;
        self.replay(conn).await
    }

    /// Apply parked events newer than the snapshot, stopping at the first gap.
    async fn replay(&mut self, conn: &mut T::Conn) -> Result<(), TransportError> {
        let floor = self.last_seen.unwrap_or(0);
        let mut pending = self.buffer.drain_after(floor).into_iter();
        let mut contiguous = Vec::new();
        let mut gap = None;
        let mut cursor = floor;
        for event in pending.by_ref() {
            let expected = cursor.saturating_add(1);
            if event.sequence > expected {
                gap = Some((
                    SequenceGapError {
                        expected,
                        received: event.sequence,
                    },
                    event,
                ));
                break;
            }
            cursor = event.sequence;
            contiguous.push(event);
        }

        if !contiguous.is_empty() {
            let applied = self.reconciler.apply_batch(&contiguous);
            debug!(replayed = contiguous.len(), applied, "buffered events replayed");
            self.last_seen = Some(cursor);
        }

        if let Some((gap, first)) = gap {
            warn!(%gap, "gap inside replay; staying degraded");
            self.buffer.restore(std::iter::once(first).chain(pending));
            self.set_state(ConnectionState::Degraded);
            return self.request_snapshot(conn).await;
        }

        self.backoff.reset();
        self.resync_backoff.reset();
        self.status.attempt = 0;
        self.status.last_error = None;
        self.status.notice = None;
        self.set_state(ConnectionState::Synced);
        Ok(())
    }

    async fn request_snapshot(&mut self, conn: &mut T::Conn) -> Result<(), TransportError> {
        let request = SnapshotRequestPayload {
            last_known_sequence: self.last_seen,
        };
        conn.send(&Message::RequestSnapshot(request)).await?;
        self.snapshot_deadline = Some(Instant::now() + self.config.resync_timeout);
        self.status.snapshot_requests += 1;
        debug!(last_known = ?self.last_seen, "snapshot requested");
        self.publish_status();
        Ok(())
    }

    fn park(&mut self, event: ComplianceEvent) {
        if let Some(evicted) = self.buffer.push(event) {
            debug!(sequence = evicted.sequence, "resync buffer full; evicted oldest");
        }
    }

    fn accept(&mut self, event: &ComplianceEvent) {
        // Stale redeliveries are logged and counted by the reconciler.
        let _ = self.reconciler.apply(event);
        self.last_seen = self.last_seen.max(Some(event.sequence));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.status.state != state {
            info!(from = %self.status.state, to = %state, "link state");
        }
        self.status.state = state;
        self.publish_status();
    }

    fn publish_status(&mut self) {
        self.status.last_sequence = self.last_seen;
        self.status.buffered = self.buffer.len();
        self.status.evicted = self.buffer.evicted();
        self.status_tx.send_replace(self.status.clone());
    }
}

/// Connect and complete the handshake.
async fn open<T: Transport>(
    transport: &mut T,
    config: &ManagerConfig,
) -> Result<(T::Conn, String), TransportError> {
    let mut conn = transport.connect().await?;
    let hello = HandshakePayload {
        agent_id: config.agent_id.clone(),
        capabilities: vec!["snapshot".into(), "subscribe".into()],
        client_version: CLIENT_VERSION,
    };
    conn.send(&Message::Handshake(hello)).await?;
    loop {
        match conn.recv().await? {
            Some(Message::HandshakeAck(ack)) if ack.status == AckStatus::Ok => {
                return Ok((conn, ack.session_id));
            }
            Some(Message::HandshakeAck(ack)) => {
                let reason = ack.error.map_or_else(
                    || "unspecified".to_string(),
                    |e| format!("{}: {}", e.name, e.message),
                );
                return Err(TransportError::Rejected(reason));
            }
            Some(other) => debug!(op = other.op_name(), "ignoring message before handshake ack"),
            None => return Err(TransportError::Closed),
        }
    }
}

/// Resolves once shutdown is requested; never resolves otherwise.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}
