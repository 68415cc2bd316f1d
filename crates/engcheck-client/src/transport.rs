// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Transport seam between the connection manager and the socket.
//!
//! The manager only sees whole [`Message`]s; framing, checksums and the
//! socket type live behind these traits so tests can script a peer.

use async_trait::async_trait;
use engcheck_proto::{wire::WireError, Message};
use thiserror::Error;

/// Link-level failure. Always answered with reconnect backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket connect/read/write failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Peer sent bytes that do not frame or decode.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// Peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// No handshake acknowledgement within the deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// Peer refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),
}

/// One established, bidirectional message channel.
#[async_trait]
pub trait Connection: Send {
    /// Send one message.
    async fn send(&mut self, msg: &Message) -> Result<(), TransportError>;

    /// Next inbound message; `Ok(None)` on orderly close.
    ///
    /// Must be cancel-safe: dropping the future loses no buffered bytes.
    async fn recv(&mut self) -> Result<Option<Message>, TransportError>;
}

/// Factory for connections (one per attempt).
#[async_trait]
pub trait Transport: Send {
    /// Connection type produced by [`connect`](Self::connect).
    type Conn: Connection;

    /// Open a fresh connection.
    async fn connect(&mut self) -> Result<Self::Conn, TransportError>;
}
