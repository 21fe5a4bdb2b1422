//! In-memory secure transport for tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use super::transport::{
    receiver_stream, BoxChannel, Channel, NewChannel, PendingChannel, RejectReason, Request,
    Requests, Session, SessionInfo, TransportError,
};
use super::Handshake;

const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) fn session_info() -> SessionInfo {
    SessionInfo {
        user: "alice".to_string(),
        remote_addr: "192.0.2.10:50022".parse().unwrap(),
        client_version: "SSH-2.0-OpenSSH_9.6".to_string(),
    }
}

/// Peer side of a mock session
pub(crate) struct MockPeer {
    pub channels: mpsc::Sender<NewChannel>,
    pub requests: mpsc::Sender<Request>,
}

pub(crate) fn session() -> (Session, MockPeer) {
    let (channel_tx, channel_rx) = mpsc::channel(8);
    let (request_tx, request_rx) = mpsc::channel(8);
    let session = Session {
        info: session_info(),
        channels: receiver_stream(channel_rx),
        requests: receiver_stream(request_rx),
    };
    (
        session,
        MockPeer {
            channels: channel_tx,
            requests: request_tx,
        },
    )
}

/// What the server did with a channel, as seen from the peer
#[derive(Default)]
pub(crate) struct ChannelLog {
    pub rejected: Option<(RejectReason, String)>,
    pub sent: Vec<(String, Vec<u8>)>,
    pub closed: bool,
}

/// Peer side of a mock channel
pub(crate) struct PeerChannel {
    pub io: DuplexStream,
    pub requests: mpsc::Sender<Request>,
    pub log: Arc<Mutex<ChannelLog>>,
    pub accepted: Arc<AtomicBool>,
}

impl PeerChannel {
    /// Send a request and wait for the server's answer; None if the server
    /// dropped it unanswered
    pub async fn request(&self, kind: &str, payload: Vec<u8>) -> Option<bool> {
        let (request, reply) = Request::with_reply(kind, payload);
        self.requests.send(request).await.ok()?;
        reply.await.ok()
    }

    pub async fn exec(&self, command: &str) -> Option<bool> {
        self.request("exec", crate::scp::protocol::encode_exec_command(command))
            .await
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, ChannelLog> {
        self.log.lock().unwrap()
    }
}

/// Create a pending channel of `channel_type` and its peer handle
pub(crate) fn channel(channel_type: &str) -> (NewChannel, PeerChannel) {
    let (server_io, peer_io) = tokio::io::duplex(PIPE_CAPACITY);
    let (request_tx, request_rx) = mpsc::channel(8);
    let log = Arc::new(Mutex::new(ChannelLog::default()));
    let accepted = Arc::new(AtomicBool::new(false));

    let pending = MockPendingChannel {
        channel_type: channel_type.to_string(),
        io: server_io,
        requests: request_rx,
        log: log.clone(),
        accepted: accepted.clone(),
    };
    let peer = PeerChannel {
        io: peer_io,
        requests: request_tx,
        log,
        accepted,
    };
    (Box::new(pending), peer)
}

struct MockPendingChannel {
    channel_type: String,
    io: DuplexStream,
    requests: mpsc::Receiver<Request>,
    log: Arc<Mutex<ChannelLog>>,
    accepted: Arc<AtomicBool>,
}

#[async_trait]
impl PendingChannel for MockPendingChannel {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn accept(self: Box<Self>) -> Result<(BoxChannel, Requests), TransportError> {
        let this = *self;
        this.accepted.store(true, Ordering::SeqCst);

        // Requests stop flowing once the server closes or drops the channel
        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        let requests = receiver_stream(this.requests)
            .take_until(closed_rx)
            .boxed();
        let channel = MockChannel {
            io: this.io,
            log: this.log,
            closed: Some(closed_tx),
        };
        Ok((Box::new(channel), requests))
    }

    async fn reject(self: Box<Self>, reason: RejectReason, message: &str) -> Result<(), TransportError> {
        self.log.lock().unwrap().rejected = Some((reason, message.to_string()));
        Ok(())
    }
}

struct MockChannel {
    io: DuplexStream,
    log: Arc<Mutex<ChannelLog>>,
    closed: Option<oneshot::Sender<()>>,
}

impl AsyncRead for MockChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn send_request(
        &mut self,
        kind: &str,
        _want_reply: bool,
        payload: &[u8],
    ) -> Result<bool, TransportError> {
        if self.closed.is_none() {
            return Err(TransportError::Closed);
        }
        self.log
            .lock()
            .unwrap()
            .sent
            .push((kind.to_string(), payload.to_vec()));
        Ok(true)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Flag first so the peer sees it by the time it reads EOF
        self.log.lock().unwrap().closed = true;
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Hands out pre-built sessions, one per accepted connection
pub(crate) struct QueuedHandshake {
    sessions: Mutex<VecDeque<Session>>,
}

impl QueuedHandshake {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
        }
    }
}

#[async_trait]
impl Handshake for QueuedHandshake {
    async fn handshake(&self, _stream: TcpStream, _peer: SocketAddr) -> Result<Session, TransportError> {
        self.sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Handshake("no session queued".to_string()))
    }
}
