//! Bridge between the update lifecycle and the UI process.
//!
//! Outbound, every [`UpdateStatus`] is relayed to the attached transport,
//! applied to the [`NotificationRegistry`], and followed by the resulting
//! badge list. Inbound, [`IpcCommand`]s are dispatched to the lifecycle.
//! Commands that touch the network are spawned; their results arrive as
//! status events rather than in the reply.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, UpdateError};
use crate::install::InstallOutcome;
use crate::lifecycle::UpdateLifecycle;
use crate::notifications::{NotificationRegistry, RedDot};
use crate::settings::UpdateSettings;
use crate::status::{StatusSubscription, UpdateStatus};
use crate::version::Channel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum IpcCommand {
    CheckForUpdates {
        #[serde(default)]
        silent: bool,
    },
    EnableAutoUpdate {
        enabled: bool,
    },
    SetUpdateChannel {
        channel: Channel,
    },
    GetUpdateSettings,
    GetAppVersion,
    DownloadUpdate,
    CancelDownload,
    QuitAndInstall,
    Retry,
    MarkAsSeen,
    GetRedDots,
    GetStatus,
}

/// One inbound line: a command plus an optional correlation id echoed in the
/// reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub command: IpcCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum IpcReply {
    Ack,
    Settings { settings: UpdateSettings },
    AppVersion { version: String, channel: Channel },
    Status { status: UpdateStatus },
    RedDots { dots: Vec<RedDot> },
    Installing { outcome: InstallOutcome },
    Rejected { reason: String },
    Failed { message: String, kind: ErrorKind },
}

impl IpcReply {
    fn failed(error: &UpdateError) -> Self {
        Self::Failed {
            message: error.to_string(),
            kind: error.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    UpdateStatus(UpdateStatus),
    RedDots {
        dots: Vec<RedDot>,
    },
    Reply {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        reply: IpcReply,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("UI transport closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait UiTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

struct Forwarder {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct IpcBridge {
    lifecycle: Arc<UpdateLifecycle>,
    registry: Arc<NotificationRegistry>,
    forwarder: Mutex<Option<Forwarder>>,
}

impl IpcBridge {
    #[must_use]
    pub fn new(lifecycle: Arc<UpdateLifecycle>, registry: Arc<NotificationRegistry>) -> Self {
        registry.set_seen_version(lifecycle.settings().seen_version);
        Self {
            lifecycle,
            registry,
            forwarder: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<UpdateLifecycle> {
        &self.lifecycle
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<NotificationRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.forwarder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(|forwarder| !forwarder.task.is_finished())
    }

    /// Start relaying statuses to `transport`. Returns `false` without
    /// subscribing again when a transport is already attached.
    pub fn attach(&self, transport: Arc<dyn UiTransport>) -> bool {
        let mut slot = self
            .forwarder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|forwarder| !forwarder.task.is_finished())
        {
            debug!("UI transport already attached");
            return false;
        }

        let subscription = self.lifecycle.subscribe();
        let stop = CancellationToken::new();
        let task = tokio::spawn(forward(
            subscription,
            transport,
            Arc::clone(&self.registry),
            stop.clone(),
        ));
        *slot = Some(Forwarder { stop, task });
        info!("UI transport attached");
        true
    }

    /// Stop relaying and drop the subscription. Completes once the
    /// forwarding task has ended.
    pub async fn detach(&self) {
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(forwarder) = forwarder else {
            return;
        };

        forwarder.stop.cancel();
        if let Err(error) = forwarder.task.await {
            warn!("Status forwarder ended abnormally: {error}");
        }
        info!("UI transport detached");
    }

    pub async fn handle(&self, command: IpcCommand) -> IpcReply {
        debug!("IPC command: {command:?}");
        match command {
            IpcCommand::CheckForUpdates { silent } => {
                let lifecycle = Arc::clone(&self.lifecycle);
                tokio::spawn(async move {
                    lifecycle.check_for_updates(silent).await;
                });
                IpcReply::Ack
            }
            IpcCommand::EnableAutoUpdate { enabled } => {
                match self.lifecycle.set_auto_update(enabled) {
                    Ok(()) => IpcReply::Ack,
                    Err(error) => IpcReply::failed(&error),
                }
            }
            IpcCommand::SetUpdateChannel { channel } => {
                if let Err(error) = self.lifecycle.store_channel(channel) {
                    return IpcReply::failed(&error);
                }
                let lifecycle = Arc::clone(&self.lifecycle);
                tokio::spawn(async move {
                    lifecycle.check_for_updates(true).await;
                });
                IpcReply::Ack
            }
            IpcCommand::GetUpdateSettings => IpcReply::Settings {
                settings: self.lifecycle.settings(),
            },
            IpcCommand::GetAppVersion => {
                let version = self.lifecycle.current_version();
                IpcReply::AppVersion {
                    version: version.to_string(),
                    channel: version.channel(),
                }
            }
            IpcCommand::DownloadUpdate => {
                let status = self.lifecycle.status();
                if !matches!(status, UpdateStatus::Available { .. }) {
                    return IpcReply::Rejected {
                        reason: format!("no update to download while {}", status.label()),
                    };
                }
                let lifecycle = Arc::clone(&self.lifecycle);
                tokio::spawn(async move {
                    lifecycle.download().await;
                });
                IpcReply::Ack
            }
            IpcCommand::CancelDownload => {
                if self.lifecycle.cancel_download() {
                    IpcReply::Ack
                } else {
                    IpcReply::Rejected {
                        reason: "no download in progress".to_string(),
                    }
                }
            }
            IpcCommand::QuitAndInstall => match self.lifecycle.install().await {
                Some(outcome) => IpcReply::Installing { outcome },
                None => match self.lifecycle.status() {
                    UpdateStatus::Error { message, kind } => IpcReply::Failed { message, kind },
                    other => IpcReply::Rejected {
                        reason: format!("nothing to install while {}", other.label()),
                    },
                },
            },
            IpcCommand::Retry => IpcReply::Status {
                status: self.lifecycle.retry(),
            },
            IpcCommand::MarkAsSeen => {
                if let Some(version) = self.registry.offered_version()
                    && let Err(error) = self.lifecycle.mark_seen(&version)
                {
                    return IpcReply::failed(&error);
                }
                self.registry.mark_as_seen();
                IpcReply::RedDots {
                    dots: self.registry.visible(),
                }
            }
            IpcCommand::GetRedDots => IpcReply::RedDots {
                dots: self.registry.visible(),
            },
            IpcCommand::GetStatus => IpcReply::Status {
                status: self.lifecycle.status(),
            },
        }
    }
}

impl std::fmt::Debug for IpcBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcBridge")
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

async fn forward(
    mut subscription: StatusSubscription,
    transport: Arc<dyn UiTransport>,
    registry: Arc<NotificationRegistry>,
    stop: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            next = subscription.recv() => next,
        };
        let Some(status) = next else {
            break;
        };

        if let Err(error) = transport
            .send(&OutboundMessage::UpdateStatus(status.clone()))
            .await
        {
            warn!("Dropping UI transport: {error}");
            break;
        }

        registry.apply_status(&status);
        let dots = OutboundMessage::RedDots {
            dots: registry.visible(),
        };
        if let Err(error) = transport.send(&dots).await {
            warn!("Dropping UI transport: {error}");
            break;
        }
    }
    debug!("Status forwarding stopped");
}
