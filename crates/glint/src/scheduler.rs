use std::sync::Arc;
use std::time::Duration;

use glint_update::{NotificationRegistry, OutboundMessage, UiTransport, UpdateLifecycle};
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay before the first background check after start-up.
pub const STARTUP_CHECK_DELAY: Duration = Duration::from_secs(10);

/// Run a silent check after `initial_delay` and then every `interval`, while
/// auto update is enabled. Ticks landing during a check, a download, a
/// pending install, or an uncleared error are skipped.
pub fn spawn_auto_check(
    lifecycle: Arc<UpdateLifecycle>,
    initial_delay: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = initial_delay;
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = interval;

            if !lifecycle.auto_update_enabled() {
                debug!("Auto update disabled, skipping scheduled check");
                continue;
            }
            let status = lifecycle.status();
            if status.blocks_new_check() {
                debug!("Skipping scheduled check while {}", status.label());
                continue;
            }

            info!("Running scheduled update check");
            let status = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                status = lifecycle.check_for_updates(true) => status,
            };
            debug!("Scheduled check finished: {}", status.label());
        }
        debug!("Auto check scheduler stopped");
    })
}

/// Periodically drop expired badges. When something was cleared and a UI is
/// connected, the new badge list is pushed to it.
pub fn spawn_red_dot_sweep(
    registry: Arc<NotificationRegistry>,
    transport: Option<Arc<dyn UiTransport>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }

            if registry.clear_expired_red_dots() == 0 {
                continue;
            }
            if let Some(transport) = &transport {
                let message = OutboundMessage::RedDots {
                    dots: registry.visible(),
                };
                if let Err(error) = transport.send(&message).await {
                    warn!("Failed to push swept red dots: {error}");
                }
            }
        }
        debug!("Red dot sweep stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use glint_update::notifications::UPDATE_ERROR;
    use glint_update::{
        Channel, InstallOutcome, Installer, MemorySettingsStore, NotificationRegistry,
        OutboundMessage, ProgressFn, RedDotOptions, ReleaseFeed, TransportError, UiTransport,
        UpdateError, UpdateFile, UpdateInfo, UpdateLifecycle, UpdateSettings, Version,
    };
    use tokio_util::sync::CancellationToken;

    use super::{spawn_auto_check, spawn_red_dot_sweep};

    #[derive(Default)]
    struct CountingFeed {
        fetches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReleaseFeed for CountingFeed {
        async fn fetch_manifest(&self, _channel: Channel) -> Result<UpdateInfo, UpdateError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UpdateError::Timeout {
                    operation: "manifest fetch",
                    seconds: 10,
                });
            }
            Ok(UpdateInfo {
                version: Version::new(1, 0, 0),
                release_date: None,
                release_notes: None,
                files: Vec::new(),
                update_size: None,
                minimum_system_version: None,
                staging_percentage: None,
            })
        }

        async fn download_artifact(
            &self,
            _file: &UpdateFile,
            _dest: &Path,
            _progress: ProgressFn<'_>,
            _cancel: &CancellationToken,
        ) -> Result<u64, UpdateError> {
            Err(UpdateError::Cancelled)
        }
    }

    struct NoopInstaller;

    #[async_trait]
    impl Installer for NoopInstaller {
        async fn install(
            &self,
            _artifact: &Path,
            _info: &UpdateInfo,
        ) -> Result<InstallOutcome, UpdateError> {
            Ok(InstallOutcome::ExitForInstaller)
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl UiTransport for RecordingTransport {
        async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
            self.sent
                .lock()
                .expect("sent log should lock")
                .push(message.clone());
            Ok(())
        }
    }

    fn lifecycle(feed: Arc<CountingFeed>, auto_update: bool, root: &Path) -> Arc<UpdateLifecycle> {
        let store = MemorySettingsStore::new(UpdateSettings {
            auto_update,
            ..UpdateSettings::default()
        });
        Arc::new(
            UpdateLifecycle::new(
                Version::new(1, 0, 0),
                feed,
                Arc::new(NoopInstaller),
                Arc::new(store),
                root.join("pending-update"),
            )
            .expect("lifecycle should build"),
        )
    }

    #[tokio::test]
    async fn auto_check_runs_repeatedly_until_shutdown() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let feed = Arc::new(CountingFeed::default());
        let shutdown = CancellationToken::new();
        let handle = spawn_auto_check(
            lifecycle(Arc::clone(&feed), true, temp.path()),
            Duration::from_millis(5),
            Duration::from_millis(10),
            shutdown.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while feed.fetches.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("two scheduled checks should run");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop")
            .expect("scheduler task should not panic");
    }

    #[tokio::test]
    async fn auto_check_is_skipped_when_disabled() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let feed = Arc::new(CountingFeed::default());
        let shutdown = CancellationToken::new();
        let handle = spawn_auto_check(
            lifecycle(Arc::clone(&feed), false, temp.path()),
            Duration::from_millis(1),
            Duration::from_millis(5),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.expect("scheduler task should not panic");

        assert_eq!(feed.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_check_waits_for_retry_after_an_error() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let feed = Arc::new(CountingFeed {
            fail: true,
            ..CountingFeed::default()
        });
        let lifecycle = lifecycle(Arc::clone(&feed), true, temp.path());
        let shutdown = CancellationToken::new();
        let handle = spawn_auto_check(
            Arc::clone(&lifecycle),
            Duration::from_millis(1),
            Duration::from_millis(5),
            shutdown.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while feed.fetches.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first scheduled check should run");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 1);

        assert_eq!(lifecycle.retry(), glint_update::UpdateStatus::Idle);
        tokio::time::timeout(Duration::from_secs(5), async {
            while feed.fetches.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("checks should resume after retry");

        shutdown.cancel();
        handle.await.expect("scheduler task should not panic");
    }

    #[tokio::test]
    async fn sweep_clears_expired_dots_and_pushes_update() {
        let registry = Arc::new(NotificationRegistry::new());
        registry.show_red_dot(
            UPDATE_ERROR,
            "update",
            RedDotOptions {
                priority: 6,
                expires_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
                ..RedDotOptions::default()
            },
        );
        registry.show_red_dot("library_scan", "library", RedDotOptions::with_priority(1));

        let transport = Arc::new(RecordingTransport::default());
        let shutdown = CancellationToken::new();
        let handle = spawn_red_dot_sweep(
            Arc::clone(&registry),
            Some(transport.clone() as Arc<dyn UiTransport>),
            Duration::from_millis(5),
            shutdown.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get(UPDATE_ERROR).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expired dot should be swept");
        shutdown.cancel();
        handle.await.expect("sweep task should not panic");

        assert!(registry.get("library_scan").is_some());
        let sent = transport.sent.lock().expect("sent log should lock").clone();
        let Some(OutboundMessage::RedDots { dots }) = sent.first() else {
            panic!("expected a red dots push, got {sent:?}");
        };
        assert_eq!(dots.len(), 1);
        assert_eq!(dots[0].id, "library_scan");
    }
}
