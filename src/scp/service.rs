use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::handler::{SinkHandler, TransferContext};
use super::negotiation::{Negotiation, RequestReader};
use super::protocol::{
    discard, exit_status_payload, read_control_line, ControlRecord, CopyDirective, Status,
    EXIT_STATUS, GO_AHEAD, SESSION_CHANNEL,
};
use crate::config::Config;
use crate::service::{Lifecycle, Servicer};
use crate::ssh::{
    BoxChannel, Handshake, RejectReason, Requests, Session, SessionHandler, SessionInfo, SshService,
};

/// Exit code reported to the peer after every completed channel
const EXIT_SUCCESS: u32 = 0;

/// SCP sink server: TCP acceptor, secure session, then the SCP protocol
pub struct ScpService<T, K> {
    ssh: SshService<T, ScpSessionHandler<K>>,
}

impl<T: Handshake, K: SinkHandler> ScpService<T, K> {
    pub fn new(config: Config, transport: T, sink: K) -> Self {
        let poll_interval = config.accept_poll_interval;
        let handler = ScpSessionHandler::new(config, sink);
        Self {
            ssh: SshService::new(transport, handler, poll_interval),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        self.ssh.lifecycle()
    }

    pub fn sink(&self) -> &K {
        &self.ssh.session_handler().sink
    }
}

#[async_trait]
impl<T: Handshake, K: SinkHandler> Servicer for ScpService<T, K> {
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.ssh.serve(listener).await
    }

    async fn stop(&self) {
        self.ssh.stop().await;
    }
}

/// Runs negotiation and the transfer for every channel of a session
pub struct ScpSessionHandler<K> {
    config: Config,
    sink: Arc<K>,
}

impl<K: SinkHandler> ScpSessionHandler<K> {
    pub fn new(config: Config, sink: K) -> Self {
        Self {
            config,
            sink: Arc::new(sink),
        }
    }

    async fn handle_channel(
        &self,
        info: &SessionInfo,
        mut channel: BoxChannel,
        requests: Requests,
        lifecycle: &Lifecycle,
    ) {
        let deadline = Instant::now() + self.config.negotiation_timeout;
        let negotiation = Arc::new(Negotiation::new());
        let reader = RequestReader::new(negotiation.clone(), self.sink.clone(), info.clone(), deadline);
        lifecycle.spawn(
            lifecycle.register(),
            reader.run(requests).instrument(tracing::Span::current()),
        );

        let Some(transfer) = negotiation.wait().await else {
            debug!("No transfer negotiated, closing channel");
            close(&mut channel).await;
            return;
        };

        let context = TransferContext {
            session: info.clone(),
            parameters: transfer.parameters,
            pattern: transfer.pattern,
        };

        match self.transfer(&mut channel, &context).await {
            Ok(()) => {
                let payload = exit_status_payload(EXIT_SUCCESS);
                if let Err(e) = channel.send_request(EXIT_STATUS, false, &payload).await {
                    warn!("Failed to send exit status: {}", e);
                }
            }
            Err(e) => warn!("Abandoning transfer: {:#}", e),
        }
        close(&mut channel).await;
    }

    /// Signal the peer, then read and act on one control record
    async fn transfer(&self, channel: &mut BoxChannel, context: &TransferContext) -> Result<()> {
        channel
            .write_all(&[GO_AHEAD])
            .await
            .context("Failed to start transfer")?;
        channel.flush().await?;

        let mut stream = BufReader::new(channel);
        let line = read_control_line(&mut stream, self.config.max_line_length)
            .await
            .context("Failed to read control record")?;

        match ControlRecord::parse(&line) {
            Ok(ControlRecord::File(file)) => self.receive_file(&mut stream, context, &file).await?,
            Ok(ControlRecord::Directory(dir)) => {
                debug!("Ignoring directory record for {}, not supported", dir.name);
            }
            Ok(ControlRecord::EndDirectory) => debug!("Ignoring end of directory record"),
            Err(e) if line.starts_with('C') => {
                return Err(e).context("Failed to parse SCP copy record");
            }
            Err(e) => debug!("Ignoring control record: {}", e),
        }
        Ok(())
    }

    async fn receive_file(
        &self,
        stream: &mut BufReader<&mut BoxChannel>,
        context: &TransferContext,
        file: &CopyDirective,
    ) -> Result<()> {
        let status = self.sink.file_request(context, file).await;
        write_status(stream, &status).await?;
        if !status.is_ok() {
            info!("File {} refused: {}", file.filename, status.message);
            return Ok(());
        }

        let mut body = (&mut *stream).take(file.length);
        let status = self.sink.file_copy(context, file, &mut body).await;
        // Keep the stream aligned even if the handler stopped reading early
        discard(&mut body).await?;
        write_status(stream, &status).await?;

        if status.is_ok() {
            info!(
                "Received {} ({} bytes) from {}",
                file.filename, file.length, context.session.remote_addr
            );
        } else {
            warn!("Transfer of {} failed: {}", file.filename, status.message);
        }
        Ok(())
    }
}

#[async_trait]
impl<K: SinkHandler> SessionHandler for ScpSessionHandler<K> {
    async fn handle_session(&self, session: Session, lifecycle: Lifecycle) {
        let Session {
            info,
            mut channels,
            requests,
        } = session;

        lifecycle.spawn(
            lifecycle.register(),
            discard_requests(requests).instrument(tracing::Span::current()),
        );

        while let Some(new_channel) = channels.next().await {
            let channel_type = new_channel.channel_type().to_string();
            if channel_type != SESSION_CHANNEL {
                warn!("Rejecting channel of type {}", channel_type);
                if let Err(e) = new_channel
                    .reject(RejectReason::UnknownChannelType, "unknown channel type")
                    .await
                {
                    debug!("Failed to reject channel: {}", e);
                }
                continue;
            }

            let (channel, requests) = match new_channel.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept session channel: {}", e);
                    continue;
                }
            };

            let span = debug_span!("channel", channel_type = %channel_type);
            self.handle_channel(&info, channel, requests, &lifecycle)
                .instrument(span)
                .await;
        }
        debug!("Session closed");
    }
}

/// Session-level requests are answered with failure and otherwise ignored
async fn discard_requests(mut requests: Requests) {
    while let Some(request) = requests.next().await {
        debug!("Discarding session request {}", request.kind());
        request.reply(false);
    }
}

async fn write_status<W: AsyncWrite + Unpin>(writer: &mut W, status: &Status) -> Result<()> {
    writer
        .write_all(&status.encode())
        .await
        .context("Failed to send status")?;
    writer.flush().await?;
    Ok(())
}

async fn close(channel: &mut BoxChannel) {
    if let Err(e) = channel.close().await {
        debug!("Failed to close channel: {}", e);
    }
}
