//! Newline-delimited JSON over the host's stdio.
//!
//! The UI process writes one [`IpcRequest`] per line to our stdin and reads
//! [`OutboundMessage`]s, one per line, from our stdout.

use std::sync::Arc;

use async_trait::async_trait;
use glint_update::{
    InstallOutcome, IpcBridge, IpcReply, IpcRequest, OutboundMessage, TransportError, UiTransport,
};
use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::AppError;

/// Serializes writers so concurrent status relays and replies never
/// interleave within a line.
pub struct LineTransport<W> {
    writer: Mutex<W>,
}

impl<W> LineTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl LineTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> UiTransport for LineTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|source| TransportError::Io {
                context: "failed to write message",
                source,
            })?;
        writer.flush().await.map_err(|source| TransportError::Io {
            context: "failed to flush message",
            source,
        })
    }
}

/// Why the command loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The UI closed its end of the pipe.
    InputClosed,
    /// An installer took over; the host must quit or relaunch.
    Installed(InstallOutcome),
}

/// Read requests until the input closes or an install hands off.
///
/// Lines that do not decode are answered with a rejection carrying no id.
pub async fn run_command_loop<R>(
    reader: R,
    bridge: &IpcBridge,
    transport: Arc<dyn UiTransport>,
) -> Result<LoopExit, AppError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();

    loop {
        let line = lines.next_line().await.map_err(|error| {
            AppError::transport_failed("read", format!("stdin read failed: {error}"))
        })?;
        let Some(line) = line else {
            info!("UI input closed");
            return Ok(LoopExit::InputClosed);
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (id, reply) = match serde_json::from_str::<IpcRequest>(line) {
            Ok(request) => (request.id, bridge.handle(request.command).await),
            Err(error) => {
                warn!("Rejecting malformed request: {error}");
                (
                    None,
                    IpcReply::Rejected {
                        reason: format!("malformed request: {error}"),
                    },
                )
            }
        };

        let installed = match &reply {
            IpcReply::Installing { outcome } => Some(*outcome),
            _ => None,
        };

        debug!("IPC reply: {reply:?}");
        transport
            .send(&OutboundMessage::Reply { id, reply })
            .await
            .map_err(|error| AppError::transport_failed("write", error.to_string()))?;

        if let Some(outcome) = installed {
            return Ok(LoopExit::Installed(outcome));
        }
    }
}
