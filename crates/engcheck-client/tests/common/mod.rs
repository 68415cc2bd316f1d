// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use engcheck_client::{BackoffPolicy, Connection, LinkStatus, ManagerConfig, Transport, TransportError};
use engcheck_proto::{
    AckStatus, ErrorPayload, HandshakeAckPayload, HandshakePayload, Message, Sequence, SnapshotPayload,
    SubscribePayload, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

/// Upper bound on any single wait in a test.
pub const PATIENCE: Duration = Duration::from_secs(30);

/// Outcome of one `connect` call.
pub enum Dial {
    Refuse,
    Accept(ScriptedConn),
}

/// Transport whose connect results are fed by the test.
///
/// With no dial queued, `connect` blocks, so the handshake deadline fires.
pub struct ScriptedTransport {
    dials: mpsc::UnboundedReceiver<Dial>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Test-side view of a [`ScriptedTransport`].
#[derive(Clone)]
pub struct Dialer {
    tx: mpsc::UnboundedSender<Dial>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    peak: Arc<AtomicUsize>,
}

impl Dialer {
    pub fn push(&self, dial: Dial) {
        assert!(self.tx.send(dial).is_ok(), "transport dropped");
    }

    /// Instants at which `connect` was entered.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    /// Most connects ever in progress at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub fn scripted() -> (ScriptedTransport, Dialer) {
    let (tx, dials) = mpsc::unbounded_channel();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let peak = Arc::new(AtomicUsize::new(0));
    let transport = ScriptedTransport {
        dials,
        attempts: Arc::clone(&attempts),
        in_flight: Arc::new(AtomicUsize::new(0)),
        peak: Arc::clone(&peak),
    };
    (transport, Dialer { tx, attempts, peak })
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Conn = ScriptedConn;

    async fn connect(&mut self) -> Result<ScriptedConn, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(Arc::clone(&self.in_flight));
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(Instant::now());
        match self.dials.recv().await {
            Some(Dial::Accept(conn)) => Ok(conn),
            Some(Dial::Refuse) => Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()),
            None => std::future::pending().await,
        }
    }
}

/// Client half of an in-memory link.
pub struct ScriptedConn {
    inbound: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl Connection for ScriptedConn {
    async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        self.outbound.send(msg.clone()).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.inbound.recv().await)
    }
}

/// Producer half of an in-memory link.
pub struct Peer {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

pub fn link() -> (ScriptedConn, Peer) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    (
        ScriptedConn { inbound, outbound },
        Peer {
            tx: to_client,
            rx: from_client,
        },
    )
}

impl Peer {
    pub fn send(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    /// Next message from the client.
    pub async fn next(&mut self) -> Message {
        match timeout(PATIENCE, self.rx.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => panic!("client closed the link"),
            Err(_) => panic!("client sent nothing"),
        }
    }

    pub async fn expect_handshake(&mut self) -> HandshakePayload {
        match self.next().await {
            Message::Handshake(hello) => hello,
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    /// Read the handshake and acknowledge it.
    pub async fn accept_handshake(&mut self, session: &str) -> HandshakePayload {
        let hello = self.expect_handshake().await;
        self.send(Message::HandshakeAck(HandshakeAckPayload {
            status: AckStatus::Ok,
            server_version: 1,
            session_id: session.to_string(),
            error: None,
        }));
        hello
    }

    /// Read the handshake and refuse it.
    pub async fn reject_handshake(&mut self, message: &str) {
        self.expect_handshake().await;
        self.send(Message::HandshakeAck(HandshakeAckPayload {
            status: AckStatus::Error,
            server_version: 1,
            session_id: String::new(),
            error: Some(ErrorPayload {
                code: 3,
                name: "E_AUTH".to_string(),
                details: None,
                message: message.to_string(),
            }),
        }));
    }

    pub async fn expect_subscribe(&mut self) -> SubscribePayload {
        match self.next().await {
            Message::Subscribe(sub) => sub,
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    /// `last_known_sequence` of the next snapshot request.
    pub async fn expect_snapshot_request(&mut self) -> Option<Sequence> {
        match self.next().await {
            Message::RequestSnapshot(req) => req.last_known_sequence,
            other => panic!("expected snapshot request, got {other:?}"),
        }
    }

    /// Handshake, subscribe and the opening snapshot request.
    pub async fn open_session(&mut self, session: &str) -> Option<Sequence> {
        self.accept_handshake(session).await;
        self.expect_subscribe().await;
        self.expect_snapshot_request().await
    }

    /// True once the client dropped its half, draining anything pending.
    pub async fn closed(&mut self) -> bool {
        loop {
            match timeout(PATIENCE, self.rx.recv()).await {
                Ok(Some(_)) => {}
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

/// Raw event frame, timestamped from its sequence.
pub fn frame(id: &str, seq: u64, status: &str) -> Value {
    let offset = i64::try_from(seq).unwrap_or(0);
    let ts = Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap().to_rfc3339();
    Value::Map(vec![
        (Value::Text("id".into()), Value::Text(id.into())),
        (Value::Text("status".into()), Value::Text(status.into())),
        (Value::Text("timestamp".into()), Value::Text(ts)),
        (Value::Text("sequence".into()), Value::Integer(seq.into())),
        (Value::Text("revision".into()), Value::Text(format!("r{seq}"))),
        (Value::Text("category".into()), Value::Text("electrical".into())),
    ])
}

/// Hashed snapshot at `seq` holding `items` as `(id, item sequence, status)`.
pub fn snapshot(seq: Sequence, items: &[(&str, u64, &str)]) -> SnapshotPayload {
    let frames = items.iter().map(|(id, s, status)| frame(id, *s, status)).collect();
    SnapshotPayload::new(seq, format!("rev-{seq}"), frames).unwrap()
}

/// Fast, deterministic tuning.
pub fn config() -> ManagerConfig {
    ManagerConfig {
        categories: vec!["electrical".to_string()],
        handshake_timeout: Duration::from_secs(1),
        resync_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(80),
            multiplier: 2.0,
            jitter: 0.0,
        },
        max_retries: 3,
        buffer_capacity: 64,
        agent_id: Some("engcheck-test".to_string()),
    }
}

/// Wait until the published status satisfies `pred`.
pub async fn wait_for(status: &mut watch::Receiver<LinkStatus>, pred: impl FnMut(&LinkStatus) -> bool) -> LinkStatus {
    let outcome = timeout(PATIENCE, status.wait_for(pred))
        .await
        .map(|res| res.map(|s| s.clone()));
    match outcome {
        Ok(Ok(s)) => s,
        Ok(Err(_)) => panic!("manager dropped its status channel"),
        Err(_) => panic!("status never matched; last: {:?}", *status.borrow()),
    }
}
