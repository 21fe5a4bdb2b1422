//! Boundary types between the service and the SSH library that performs
//! the handshake, encryption and channel multiplexing.
//!
//! A binding for a concrete SSH implementation produces a [`Session`] from a
//! raw TCP stream. Callback-style libraries can push new channels and
//! requests into `tokio::sync::mpsc` queues and expose them through
//! [`receiver_stream`].

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel open failed: {0}")]
    ChannelOpen(String),

    #[error("channel request failed: {0}")]
    Request(String),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Channel open failure reasons (RFC 4254 section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RejectReason {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl RejectReason {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Identity of an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user: String,
    pub remote_addr: SocketAddr,
    pub client_version: String,
}

/// An established session and its two inbound streams
pub struct Session {
    pub info: SessionInfo,
    pub channels: NewChannels,
    pub requests: Requests,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("info", &self.info).finish_non_exhaustive()
    }
}

/// A session-level or channel-level request from the peer
#[derive(Debug)]
pub struct Request {
    kind: String,
    want_reply: bool,
    payload: Vec<u8>,
    reply: Option<oneshot::Sender<bool>>,
}

impl Request {
    /// A request the peer does not expect an answer to
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            want_reply: false,
            payload,
            reply: None,
        }
    }

    /// A request awaiting a reply, delivered through the returned receiver.
    /// A request dropped without a reply shows up as a closed receiver.
    pub fn with_reply(kind: impl Into<String>, payload: Vec<u8>) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            want_reply: true,
            payload,
            reply: Some(tx),
        };
        (request, rx)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Answer the request; a no-op when no reply was asked for
    pub fn reply(mut self, ok: bool) {
        if let Some(tx) = self.reply.take() {
            // The peer may have gone away already
            let _ = tx.send(ok);
        }
    }
}

/// One accepted logical channel: a byte stream plus out-of-band requests
#[async_trait]
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {
    /// Send a channel request to the peer; returns the peer's answer, or
    /// `true` when no reply was requested
    async fn send_request(
        &mut self,
        kind: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<bool, TransportError>;

    /// Close both directions of the channel
    async fn close(&mut self) -> Result<(), TransportError>;
}

pub type BoxChannel = Box<dyn Channel>;

/// A channel the peer asked to open, not yet accepted or rejected
#[async_trait]
pub trait PendingChannel: Send {
    fn channel_type(&self) -> &str;

    async fn accept(self: Box<Self>) -> Result<(BoxChannel, Requests), TransportError>;

    async fn reject(self: Box<Self>, reason: RejectReason, message: &str) -> Result<(), TransportError>;
}

pub type NewChannel = Box<dyn PendingChannel>;
pub type NewChannels = BoxStream<'static, NewChannel>;
pub type Requests = BoxStream<'static, Request>;

/// Adapt an mpsc receiver into the boxed streams used by [`Session`]
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}
