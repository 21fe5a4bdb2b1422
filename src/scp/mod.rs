//! SCP sink protocol on top of secure-session channels.

pub mod command;
pub mod handler;
pub mod negotiation;
pub mod protocol;
pub mod service;

pub use command::{parse_command, CommandError, TransferRequest};
pub use handler::{FileReader, SinkHandler, TransferContext};
pub use negotiation::{Negotiation, NegotiationState, RequestReader};
pub use protocol::{
    ControlRecord, CopyDirective, DirectoryDirective, Parameters, ProtocolError, Status,
    StatusCode,
};
pub use service::{ScpService, ScpSessionHandler};
