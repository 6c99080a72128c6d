use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::manifest::UpdateInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    /// 0.0 to 100.0; stays at 0.0 while the total is unknown.
    pub percent: f64,
    pub transferred: u64,
    pub total: Option<u64>,
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    #[must_use]
    pub fn new(transferred: u64, total: Option<u64>, bytes_per_second: u64) -> Self {
        let percent = match total {
            Some(total) if total > 0 => {
                #[allow(clippy::cast_precision_loss)]
                let ratio = transferred.min(total) as f64 / total as f64;
                ratio * 100.0
            }
            _ => 0.0,
        };
        Self {
            percent,
            transferred,
            total,
            bytes_per_second,
        }
    }
}

/// The single current state of the updater, as observed by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum UpdateStatus {
    Idle,
    Checking,
    Available { info: UpdateInfo, silent: bool },
    NotAvailable { silent: bool },
    Downloading { progress: DownloadProgress },
    Downloaded { info: UpdateInfo },
    Error { message: String, kind: ErrorKind },
    Installing,
}

impl UpdateStatus {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Available { .. } => "available",
            Self::NotAvailable { .. } => "not-available",
            Self::Downloading { .. } => "downloading",
            Self::Downloaded { .. } => "downloaded",
            Self::Error { .. } => "error",
            Self::Installing => "installing",
        }
    }

    /// A check or download is running, an installer is staged, or an error
    /// is waiting to be cleared with `retry`.
    #[must_use]
    pub fn blocks_new_check(&self) -> bool {
        matches!(
            self,
            Self::Checking
                | Self::Downloading { .. }
                | Self::Downloaded { .. }
                | Self::Error { .. }
                | Self::Installing
        )
    }
}

#[derive(Default)]
pub(crate) struct StatusHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<UpdateStatus>>>,
}

impl StatusHub {
    pub(crate) fn subscribe(self: &Arc<Self>) -> StatusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, sender);

        StatusSubscription {
            id,
            receiver,
            hub: Arc::downgrade(self),
        }
    }

    pub(crate) fn publish(&self, status: &UpdateStatus) {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|_, sender| sender.send(status.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
    }
}

/// Receives every status emitted after it was created. Dropping it
/// deregisters the subscriber.
pub struct StatusSubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<UpdateStatus>,
    hub: Weak<StatusHub>,
}

impl StatusSubscription {
    /// Waits for the next status. `None` once the lifecycle is gone.
    pub async fn recv(&mut self) -> Option<UpdateStatus> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<UpdateStatus> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

impl std::fmt::Debug for StatusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{DownloadProgress, StatusHub, UpdateStatus};
    use crate::error::ErrorKind;

    #[test]
    fn status_serializes_with_kebab_case_tag() {
        let value = serde_json::to_value(UpdateStatus::NotAvailable { silent: true })
            .expect("status should serialize");
        assert_eq!(
            value,
            serde_json::json!({"status": "not-available", "silent": true})
        );

        let value = serde_json::to_value(UpdateStatus::Error {
            message: "checksum mismatch".to_string(),
            kind: ErrorKind::IntegrityFailure,
        })
        .expect("status should serialize");
        assert_eq!(value["status"], "error");
        assert_eq!(value["kind"], "integrityFailure");
    }

    #[test]
    fn progress_serializes_camel_case() {
        let value = serde_json::to_value(UpdateStatus::Downloading {
            progress: DownloadProgress::new(50, Some(200), 10),
        })
        .expect("status should serialize");

        assert_eq!(value["status"], "downloading");
        assert_eq!(value["progress"]["percent"], serde_json::json!(25.0));
        assert_eq!(value["progress"]["bytesPerSecond"], serde_json::json!(10));
    }

    #[test]
    fn progress_without_total_reports_zero_percent() {
        let progress = DownloadProgress::new(1024, None, 0);
        assert!(progress.percent.abs() < f64::EPSILON);
        let progress = DownloadProgress::new(10, Some(0), 0);
        assert!(progress.percent.abs() < f64::EPSILON);
    }

    #[test]
    fn busy_states_block_new_checks() {
        assert!(UpdateStatus::Checking.blocks_new_check());
        assert!(UpdateStatus::Installing.blocks_new_check());
        assert!(
            UpdateStatus::Error {
                message: "offline".to_string(),
                kind: ErrorKind::Network,
            }
            .blocks_new_check()
        );
        assert!(!UpdateStatus::Idle.blocks_new_check());
        assert!(!UpdateStatus::NotAvailable { silent: false }.blocks_new_check());
    }

    #[test]
    fn subscribers_receive_in_order_and_deregister_on_drop() {
        let hub = Arc::new(StatusHub::default());
        let mut first = hub.subscribe();
        let second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(&UpdateStatus::Checking);
        hub.publish(&UpdateStatus::Idle);

        assert_eq!(first.try_recv(), Some(UpdateStatus::Checking));
        assert_eq!(first.try_recv(), Some(UpdateStatus::Idle));
        assert_eq!(first.try_recv(), None);

        drop(second);
        assert_eq!(hub.subscriber_count(), 1);
        first.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn late_subscriber_sees_only_later_statuses() {
        let hub = Arc::new(StatusHub::default());
        hub.publish(&UpdateStatus::Checking);
        let mut late = hub.subscribe();
        hub.publish(&UpdateStatus::Idle);

        assert_eq!(late.try_recv(), Some(UpdateStatus::Idle));
        assert_eq!(late.try_recv(), None);
    }
}
