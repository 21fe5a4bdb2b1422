use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Uniform start/stop contract shared by every service layer
#[async_trait]
pub trait Servicer: Send + Sync {
    /// Accept and handle connections until `stop` is called
    async fn serve(&self, listener: TcpListener) -> Result<()>;

    /// Signal shutdown, then wait for in-flight work to finish
    async fn stop(&self);
}

/// Stop signal plus in-flight work counter.
///
/// Cloning is cheap and every clone observes the same state, so a wrapping
/// layer shares the lifecycle of the layer it wraps instead of making its own.
#[derive(Clone)]
pub struct Lifecycle {
    shared: Arc<Shared>,
}

struct Shared {
    stopping: AtomicBool,
    stop_tx: watch::Sender<bool>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Registration of one unit of work; released on drop
#[must_use = "work is deregistered as soon as the guard is dropped"]
pub struct WorkGuard {
    shared: Arc<Shared>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                stopping: AtomicBool::new(false),
                stop_tx,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Broadcast the stop signal. Calling it again has no effect.
    pub fn signal_stop(&self) {
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            self.shared.stop_tx.send_replace(true);
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    /// Resolves once the stop signal has been broadcast
    pub async fn stopped(&self) {
        let mut rx = self.shared.stop_tx.subscribe();
        // The sender lives in `shared`, so the channel cannot close under us
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Register child work of an already running unit
    pub fn register(&self) -> WorkGuard {
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            shared: self.shared.clone(),
        }
    }

    /// Register new top-level work, refused once stop has been signalled
    pub fn try_register(&self) -> Option<WorkGuard> {
        let guard = self.register();
        if self.is_stopping() {
            // Dropping the guard undoes the increment
            return None;
        }
        Some(guard)
    }

    /// Run `fut` on the runtime for as long as `guard` stays registered
    pub fn spawn<F>(&self, guard: WorkGuard, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Number of registered units that have not completed yet
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no registered work remains
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Signal shutdown and block until in-flight work has drained
    pub async fn stop(&self) {
        self.signal_stop();
        self.wait_idle().await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}
