//! Per-channel negotiation: a request-reading task decides whether the
//! channel will carry a sink transfer while the channel's main flow waits
//! for that decision.

use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::command::{parse_command, TransferRequest};
use super::handler::SinkHandler;
use super::protocol::decode_exec_command;
use crate::ssh::{Request, Requests, SessionInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Waiting,
    Ready,
    Refused,
}

/// Monitor guarding one channel's negotiation state
#[derive(Debug)]
pub struct Negotiation {
    inner: Mutex<Inner>,
    decided: Notify,
}

#[derive(Debug)]
struct Inner {
    state: NegotiationState,
    transfer: Option<TransferRequest>,
}

impl Negotiation {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: NegotiationState::Waiting,
                transfer: None,
            }),
            decided: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is only ever replaced wholesale, so a poisoned lock is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> NegotiationState {
        self.lock().state
    }

    /// Settle on Ready with the accepted transfer. Returns false if the
    /// negotiation was already decided.
    pub fn ready(&self, transfer: TransferRequest) -> bool {
        self.decide(NegotiationState::Ready, Some(transfer))
    }

    /// Settle on Refused. Returns false if the negotiation was already decided.
    pub fn refuse(&self) -> bool {
        self.decide(NegotiationState::Refused, None)
    }

    fn decide(&self, state: NegotiationState, transfer: Option<TransferRequest>) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != NegotiationState::Waiting {
                return false;
            }
            inner.state = state;
            inner.transfer = transfer;
        }
        // Stores a permit if the waiter is not parked yet
        self.decided.notify_one();
        true
    }

    /// Block until a decision is made; yields the transfer when Ready
    pub async fn wait(&self) -> Option<TransferRequest> {
        loop {
            {
                let mut inner = self.lock();
                match inner.state {
                    NegotiationState::Waiting => {}
                    NegotiationState::Ready => return inner.transfer.take(),
                    NegotiationState::Refused => return None,
                }
            }
            self.decided.notified().await;
        }
    }
}

impl Default for Negotiation {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes a channel's requests in arrival order and drives the negotiation
pub struct RequestReader<K> {
    negotiation: Arc<Negotiation>,
    sink: Arc<K>,
    session: SessionInfo,
    deadline: Instant,
    exec_received: bool,
}

impl<K: SinkHandler> RequestReader<K> {
    pub fn new(
        negotiation: Arc<Negotiation>,
        sink: Arc<K>,
        session: SessionInfo,
        deadline: Instant,
    ) -> Self {
        Self {
            negotiation,
            sink,
            session,
            deadline,
            exec_received: false,
        }
    }

    /// Run until the request stream ends. The deadline only applies while
    /// the negotiation is still waiting.
    pub async fn run(mut self, mut requests: Requests) {
        loop {
            let next = if self.negotiation.state() == NegotiationState::Waiting {
                tokio::select! {
                    request = requests.next() => request,
                    _ = sleep_until(self.deadline) => {
                        if self.negotiation.refuse() {
                            warn!("Timed out while waiting for transfer request");
                        }
                        continue;
                    }
                }
            } else {
                requests.next().await
            };

            let Some(request) = next else {
                if self.negotiation.refuse() {
                    debug!("Channel closed before a transfer was negotiated");
                }
                return;
            };

            let ok = self.handle(&request).await;
            request.reply(ok);
        }
    }

    async fn handle(&mut self, request: &Request) -> bool {
        match request.kind() {
            // Rejecting env makes some clients give up
            "env" => true,
            "exec" => self.handle_exec(request.payload()).await,
            other => {
                debug!("Refusing {} request", other);
                false
            }
        }
    }

    async fn handle_exec(&mut self, payload: &[u8]) -> bool {
        if self.exec_received || self.negotiation.state() != NegotiationState::Waiting {
            debug!("Refusing exec request, transfer already negotiated");
            return false;
        }

        let command = match decode_exec_command(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("Malformed exec request: {}", e);
                return false;
            }
        };

        let transfer = match parse_command(&command) {
            Ok(transfer) => transfer,
            Err(e) if !e.is_terminal() => {
                warn!("Unexpected exec command: {}", command);
                return false;
            }
            Err(e) => {
                warn!("{}: {}", e, command);
                self.exec_received = true;
                self.negotiation.refuse();
                return false;
            }
        };
        self.exec_received = true;

        if transfer.is_source() {
            // TODO: serve downloads once a source handler contract exists
            warn!("Refusing source request, not implemented: {}", command);
            self.negotiation.refuse();
            return false;
        }

        let accepted = self
            .sink
            .sink_request(&self.session, transfer.parameters, &transfer.pattern)
            .await;
        if !accepted {
            info!("Refusing sink request for {}", transfer.pattern);
            self.negotiation.refuse();
            return false;
        }

        debug!("Accepting sink request [{}] for {}", transfer.parameters, transfer.pattern);
        self.negotiation.ready(transfer)
    }
}
