//! Server-side SCP: accept TCP connections, run a secure-session handshake,
//! negotiate `scp -t` on each session channel and hand received files to a
//! [`SinkHandler`].

pub mod config;
pub mod logging;
pub mod scp;
pub mod service;
pub mod sink;
pub mod ssh;
pub mod tcp;

pub use config::{Config, ConfigError};
pub use scp::{ScpService, SinkHandler, Status, TransferContext};
pub use service::{Lifecycle, Servicer, WorkGuard};
pub use sink::DirectorySink;
pub use ssh::{Handshake, Session, SessionInfo, TransportError};
