use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::protocol::{CopyDirective, DirectoryDirective, Parameters, Status};
use crate::ssh::SessionInfo;

/// Everything negotiated for one sink channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferContext {
    pub session: SessionInfo,
    pub parameters: Parameters,
    pub pattern: String,
}

/// Reader handed to [`SinkHandler::file_copy`], bounded to the file length
pub type FileReader<'a> = dyn AsyncRead + Send + Unpin + 'a;

/// Receives files uploaded by scp clients.
///
/// One handler instance serves every channel of every connection, so
/// implementations must be safe to call concurrently. Calls for a single
/// channel always happen one after another.
#[async_trait]
pub trait SinkHandler: Send + Sync + 'static {
    /// Decide whether to accept an upload into `pattern`
    async fn sink_request(&self, session: &SessionInfo, parameters: Parameters, pattern: &str) -> bool;

    /// Called for every `C` record. Anything but OK skips the file body.
    async fn file_request(&self, transfer: &TransferContext, file: &CopyDirective) -> Status;

    /// Consume the file body; `reader` yields exactly `file.length` bytes
    async fn file_copy(
        &self,
        transfer: &TransferContext,
        file: &CopyDirective,
        reader: &mut FileReader<'_>,
    ) -> Status;

    /// Reserved for recursive transfers, not invoked yet
    async fn dir_request(&self, _transfer: &TransferContext, _dir: &DirectoryDirective) -> Status {
        Status::ok()
    }

    /// Reserved for recursive transfers, not invoked yet
    async fn dir_end_request(&self, _transfer: &TransferContext) -> Status {
        Status::ok()
    }
}
