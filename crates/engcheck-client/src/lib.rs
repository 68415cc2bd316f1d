// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Live-link client for the EngCheck compliance stream over Unix sockets
//! (CBOR-framed), plus the connection manager that keeps a
//! [`Reconciler`](engcheck_core::Reconciler) in sync across gaps and drops.

use async_trait::async_trait;
use engcheck_proto::wire::{decode_message, encode_message, frame_len};
use engcheck_proto::Message;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub mod backoff;
pub mod buffer;
pub mod manager;
pub mod transport;

pub use backoff::{Backoff, BackoffPolicy};
pub use buffer::ResyncBuffer;
pub use manager::{ConnectionManager, ConnectionState, LinkStatus, ManagerConfig, SequenceGapError, ShutdownHandle};
pub use transport::{Connection, Transport, TransportError};

/// Connects to the stream producer's Unix socket.
#[derive(Debug, Clone)]
pub struct UnixTransport {
    path: PathBuf,
}

impl UnixTransport {
    /// Transport for the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    type Conn = UnixConnection;

    async fn connect(&mut self) -> Result<UnixConnection, TransportError> {
        let stream = UnixStream::connect(&self.path).await?;
        Ok(UnixConnection::new(stream))
    }
}

/// Packet-framed connection over a Unix stream.
#[derive(Debug)]
pub struct UnixConnection {
    stream: UnixStream,
    inbox: Vec<u8>,
    ts: u64,
}

impl UnixConnection {
    /// Wrap a connected stream.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbox: Vec::with_capacity(4096),
            ts: 0,
        }
    }

    /// Decode one complete packet from the inbox, if buffered.
    fn take_buffered(&mut self) -> Result<Option<Message>, TransportError> {
        let Some(len) = frame_len(&self.inbox)? else {
            return Ok(None);
        };
        if self.inbox.len() < len {
            return Ok(None);
        }
        let (msg, _ts, used) = decode_message(&self.inbox[..len])?;
        self.inbox.drain(..used);
        Ok(Some(msg))
    }
}

#[async_trait]
impl Connection for UnixConnection {
    async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        self.ts += 1;
        let pkt = encode_message(msg, self.ts)?;
        self.stream.write_all(&pkt).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            if let Some(msg) = self.take_buffered()? {
                return Ok(Some(msg));
            }
            // `read_buf` only appends on completion, so cancellation is lossless.
            let n = self.stream.read_buf(&mut self.inbox).await?;
            if n == 0 {
                if self.inbox.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("truncated frame: {} buffered bytes", self.inbox.len()),
                )
                .into());
            }
        }
    }
}
