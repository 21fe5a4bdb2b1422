pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::service::{Lifecycle, Servicer};
use crate::tcp::{ConnectionHandler, TcpService};

pub use transport::{
    receiver_stream, BoxChannel, Channel, NewChannel, NewChannels, PendingChannel, RejectReason,
    Request, Requests, Session, SessionInfo, TransportError,
};

/// Server side of the secure transport handshake.
///
/// Implementations own the server configuration (host keys, accepted
/// authentication methods) and return once the peer is authenticated.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    async fn handshake(&self, stream: TcpStream, peer: SocketAddr) -> Result<Session, TransportError>;
}

#[async_trait]
impl<T: Handshake> Handshake for Arc<T> {
    async fn handshake(&self, stream: TcpStream, peer: SocketAddr) -> Result<Session, TransportError> {
        (**self).handshake(stream, peer).await
    }
}

/// Work run for every established session
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle_session(&self, session: Session, lifecycle: Lifecycle);
}

/// Connection handler that upgrades raw TCP to a secure session
pub struct HandshakeHandler<T, S> {
    transport: T,
    handler: S,
}

#[async_trait]
impl<T: Handshake, S: SessionHandler> ConnectionHandler for HandshakeHandler<T, S> {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr, lifecycle: Lifecycle) {
        let session = match self.transport.handshake(stream, peer).await {
            Ok(session) => session,
            Err(e) => {
                warn!("SSH handshake failed: {}", e);
                return;
            }
        };

        debug!(
            "Session established for {} ({})",
            session.info.user, session.info.client_version
        );
        self.handler.handle_session(session, lifecycle).await;
    }
}

/// Secure-session layer over the TCP acceptor
pub struct SshService<T, S> {
    tcp: TcpService<HandshakeHandler<T, S>>,
}

impl<T: Handshake, S: SessionHandler> SshService<T, S> {
    pub fn new(transport: T, handler: S, poll_interval: Duration) -> Self {
        Self {
            tcp: TcpService::new(HandshakeHandler { transport, handler }, poll_interval),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        self.tcp.lifecycle()
    }

    pub fn session_handler(&self) -> &S {
        &self.tcp.handler().handler
    }
}

#[async_trait]
impl<T: Handshake, S: SessionHandler> Servicer for SshService<T, S> {
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.tcp.serve(listener).await
    }

    async fn stop(&self) {
        self.tcp.stop().await;
    }
}
