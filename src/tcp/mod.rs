use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::service::{Lifecycle, Servicer};

/// Per-connection work run by the acceptor
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr, lifecycle: Lifecycle);
}

/// Accept loop that hands every connection to its own task
pub struct TcpService<H> {
    lifecycle: Lifecycle,
    handler: Arc<H>,
    poll_interval: Duration,
}

impl<H: ConnectionHandler> TcpService<H> {
    pub fn new(handler: H, poll_interval: Duration) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            handler: Arc::new(handler),
            poll_interval,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(guard) = self.lifecycle.try_register() else {
            debug!("[{}] Dropping connection accepted during shutdown", peer);
            return;
        };

        let handler = self.handler.clone();
        let lifecycle = self.lifecycle.clone();
        let span = info_span!("connection", %peer);
        self.lifecycle.spawn(
            guard,
            async move {
                debug!("New connection");
                handler.handle(stream, peer, lifecycle).await;
                debug!("Connection finished");
            }
            .instrument(span),
        );
    }
}

/// Source of incoming connections; the listener in production
#[async_trait]
trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

impl<H: ConnectionHandler> TcpService<H> {
    async fn accept_loop<L: Acceptor>(&self, listener: L) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.lifecycle.stopped() => None,
                accepted = timeout(self.poll_interval, listener.accept()) => Some(accepted),
            };
            let Some(accepted) = accepted else {
                drop(listener);
                info!("No longer accepting new connections");
                return Ok(());
            };

            match accepted {
                // Poll interval elapsed, check the stop signal again
                Err(_) => continue,
                Ok(Err(e)) if is_transient(&e) => {
                    debug!("Transient accept error: {}", e);
                    continue;
                }
                Ok(Err(e)) if is_resource_exhaustion(&e) => {
                    warn!("Accept failed, retrying in {:?}: {}", self.poll_interval, e);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Ok(Err(e)) => {
                    error!("Accept failed: {}", e);
                    return Err(e.into());
                }
                Ok(Ok((stream, peer))) => self.spawn_connection(stream, peer),
            }
        }
    }
}

#[async_trait]
impl<H: ConnectionHandler> Servicer for TcpService<H> {
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Listening on {}", addr);
        }
        self.accept_loop(listener).await
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Out of descriptors or buffers; clears up once connections close
#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Semaphore;

    /// Echoes one message back, then holds the connection until released
    struct GatedEcho {
        served: AtomicUsize,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ConnectionHandler for GatedEcho {
        async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr, _lifecycle: Lifecycle) {
            let mut buf = [0u8; 4];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(&buf).await;
            }
            self.served.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.acquire().await;
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_connections() {
        let gate = Arc::new(Semaphore::new(0));
        let service = Arc::new(TcpService::new(
            GatedEcho {
                served: AtomicUsize::new(0),
                gate: gate.clone(),
            },
            Duration::from_millis(50),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = {
            let service = service.clone();
            tokio::spawn(async move { service.serve(listener).await })
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        assert_eq!(service.lifecycle().in_flight(), 1);

        let stop = {
            let service = service.clone();
            tokio::spawn(async move { service.stop().await })
        };

        // The acceptor quits promptly but stop keeps waiting on the handler
        timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stop.is_finished());

        assert!(TcpStream::connect(addr).await.is_err());

        gate.add_permits(1);
        timeout(Duration::from_secs(2), stop).await.unwrap().unwrap();
        assert_eq!(service.handler().served.load(Ordering::SeqCst), 1);
        assert_eq!(service.lifecycle().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_serve_returns_when_stopped_idle() {
        let service = TcpService::new(
            GatedEcho {
                served: AtomicUsize::new(0),
                gate: Arc::new(Semaphore::new(0)),
            },
            Duration::from_millis(20),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        service.lifecycle().signal_stop();
        timeout(Duration::from_secs(1), service.serve(listener))
            .await
            .unwrap()
            .unwrap();
    }

    /// Real listener whose accepts fail in a scripted order; `None` accepts
    struct ScriptedListener {
        inner: TcpListener,
        script: Mutex<VecDeque<Option<io::Error>>>,
    }

    #[async_trait]
    impl Acceptor for ScriptedListener {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            let next = self.script.lock().unwrap().pop_front().flatten();
            match next {
                Some(e) => Err(e),
                None => self.inner.accept().await,
            }
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_resource_exhaustion(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_is_retried() {
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let e = io::Error::from_raw_os_error(code);
            assert!(!is_transient(&e), "{code}");
            assert!(is_resource_exhaustion(&e), "{code}");
        }
    }

    #[tokio::test]
    async fn test_fatal_accept_error_keeps_connections() {
        let gate = Arc::new(Semaphore::new(0));
        let service = TcpService::new(
            GatedEcho {
                served: AtomicUsize::new(0),
                gate: gate.clone(),
            },
            Duration::from_millis(20),
        );

        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut script = VecDeque::new();
        script.push_back(None);
        #[cfg(unix)]
        script.push_back(Some(io::Error::from_raw_os_error(libc::EMFILE)));
        script.push_back(Some(io::Error::from(io::ErrorKind::ConnectionReset)));
        script.push_back(Some(io::Error::from(io::ErrorKind::PermissionDenied)));
        let listener = ScriptedListener {
            inner,
            script: Mutex::new(script),
        };

        let result = timeout(Duration::from_secs(2), service.accept_loop(listener))
            .await
            .unwrap();
        assert!(result.is_err());

        // The connection accepted before the failure is still served
        client.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(service.lifecycle().in_flight(), 1);

        gate.add_permits(1);
        timeout(Duration::from_secs(2), service.stop()).await.unwrap();
        assert_eq!(service.handler().served.load(Ordering::SeqCst), 1);
    }
}
