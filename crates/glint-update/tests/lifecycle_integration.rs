use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use glint_update::{
    Channel, ErrorKind, InstallOutcome, Installer, IpcBridge, IpcCommand, IpcReply,
    JsonSettingsStore, NotificationRegistry, OutboundMessage, ProgressFn, ReleaseFeed,
    SettingsStore, TransportError, UiTransport, UpdateError, UpdateFile, UpdateInfo,
    UpdateLifecycle, UpdateStatus, Version, parse_manifest,
};
use reqwest::Url;
use sha2::{Digest, Sha512};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Serves one manifest document and one artifact body from memory.
struct StaticFeed {
    manifest: String,
    artifact: Vec<u8>,
}

#[async_trait]
impl ReleaseFeed for StaticFeed {
    async fn fetch_manifest(&self, channel: Channel) -> Result<UpdateInfo, UpdateError> {
        let url = Url::parse(&format!(
            "https://updates.example.com/{channel}/latest.yml"
        ))
        .expect("manifest url should parse");
        parse_manifest(&self.manifest, &url)
    }

    async fn download_artifact(
        &self,
        file: &UpdateFile,
        dest: &Path,
        progress: ProgressFn<'_>,
        _cancel: &CancellationToken,
    ) -> Result<u64, UpdateError> {
        let total = file.size.or(Some(self.artifact.len() as u64));
        tokio::fs::create_dir_all(dest.parent().expect("download path should have a parent"))
            .await
            .expect("download dir should be created");
        progress(0, total);
        tokio::fs::write(dest, &self.artifact)
            .await
            .expect("artifact should be written");
        progress(self.artifact.len() as u64, total);
        Ok(self.artifact.len() as u64)
    }
}

#[derive(Default)]
struct RecordingInstaller {
    installed: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Installer for RecordingInstaller {
    async fn install(
        &self,
        artifact: &Path,
        _info: &UpdateInfo,
    ) -> Result<InstallOutcome, UpdateError> {
        self.installed
            .lock()
            .expect("install log should lock")
            .push(artifact.to_path_buf());
        Ok(InstallOutcome::ExitForInstaller)
    }
}

struct ChannelTransport {
    sender: mpsc::UnboundedSender<serde_json::Value>,
}

#[async_trait]
impl UiTransport for ChannelTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let value = serde_json::to_value(message)?;
        self.sender.send(value).map_err(|_| TransportError::Closed)
    }
}

fn sha512_hex(bytes: &[u8]) -> String {
    Sha512::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn build_lifecycle(
    current: &str,
    feed: StaticFeed,
    installer: Arc<RecordingInstaller>,
    root: &Path,
) -> (Arc<UpdateLifecycle>, JsonSettingsStore) {
    let store = JsonSettingsStore::new(root.join("config").join("settings.json"));
    let lifecycle = UpdateLifecycle::new(
        Version::parse(current).expect("current version should parse"),
        Arc::new(feed),
        installer,
        Arc::new(store.clone()),
        root.join("cache").join("pending-update"),
    )
    .expect("lifecycle should build");
    (Arc::new(lifecycle), store)
}

async fn drain_until(
    receiver: &mut mpsc::UnboundedReceiver<serde_json::Value>,
    status: &str,
) -> Vec<serde_json::Value> {
    let mut seen = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("message should arrive in time")
            .expect("transport channel should stay open");
        let done = message["type"] == "red-dots"
            && seen
                .last()
                .is_some_and(|last: &serde_json::Value| last["status"] == status);
        seen.push(message);
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn up_to_date_build_records_check_and_shows_no_dots() {
    let temp = tempdir().expect("create temp dir");
    let feed = StaticFeed {
        manifest: "version: 1.0.0\n".to_string(),
        artifact: Vec::new(),
    };
    let installer = Arc::new(RecordingInstaller::default());
    let (lifecycle, store) = build_lifecycle("1.0.0", feed, installer, temp.path());
    let bridge = IpcBridge::new(lifecycle.clone(), Arc::new(NotificationRegistry::new()));
    let (sender, mut receiver) = mpsc::unbounded_channel();
    assert!(bridge.attach(Arc::new(ChannelTransport { sender })));

    let status = lifecycle.check_for_updates(false).await;
    assert_eq!(status, UpdateStatus::NotAvailable { silent: false });

    let messages = drain_until(&mut receiver, "not-available").await;
    let last_dots = messages.last().expect("red dots should be sent");
    assert_eq!(last_dots["dots"], serde_json::json!([]));

    let settings = store.load().expect("settings should load from disk");
    assert!(settings.last_checked.is_some());
    assert_eq!(settings.update_channel, Channel::Stable);
    assert_eq!(
        bridge.handle(IpcCommand::GetRedDots).await,
        IpcReply::RedDots { dots: Vec::new() }
    );
}

#[tokio::test]
async fn corrupted_artifact_ends_in_integrity_failure_without_leftovers() {
    let temp = tempdir().expect("create temp dir");
    let declared = sha512_hex(b"the real installer");
    let feed = StaticFeed {
        manifest: format!(
            "version: 1.2.0\n\
             files:\n\
             \x20 - url: Glint-Setup-1.2.0.exe\n\
             \x20   sha512: {declared}\n\
             \x20   size: 26214400\n"
        ),
        artifact: b"a corrupted installer".to_vec(),
    };
    let installer = Arc::new(RecordingInstaller::default());
    let (lifecycle, _store) = build_lifecycle("1.0.0", feed, installer.clone(), temp.path());

    let status = lifecycle.check_for_updates(false).await;
    let UpdateStatus::Available { info, .. } = &status else {
        panic!("expected available, got {status:?}");
    };
    assert_eq!(info.update_size, Some(26_214_400));
    assert_eq!(
        info.files[0].url,
        "https://updates.example.com/stable/Glint-Setup-1.2.0.exe"
    );

    let status = lifecycle.download().await;
    assert!(matches!(
        status,
        UpdateStatus::Error {
            kind: ErrorKind::IntegrityFailure,
            ..
        }
    ));

    let download_dir = temp.path().join("cache").join("pending-update");
    let leftovers = std::fs::read_dir(&download_dir)
        .map(|entries| entries.flatten().count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);

    assert_eq!(lifecycle.install().await, None);
    assert!(
        installer
            .installed
            .lock()
            .expect("install log should lock")
            .is_empty()
    );
}

#[tokio::test]
async fn verified_update_flows_through_the_bridge_to_install() {
    let temp = tempdir().expect("create temp dir");
    let artifact = b"glint 2.0.0 installer".to_vec();
    let feed = StaticFeed {
        manifest: format!(
            "version: 2.0.0\n\
             path: Glint-Setup-2.0.0.exe\n\
             sha512: {}\n\
             releaseDate: '2026-10-01T08:00:00.000Z'\n\
             releaseNotes:\n\
             \x20 - version: 2.0.0\n\
             \x20   note: Dual subtitles\n",
            sha512_hex(&artifact)
        ),
        artifact,
    };
    let installer = Arc::new(RecordingInstaller::default());
    let (lifecycle, store) = build_lifecycle("1.9.0", feed, installer.clone(), temp.path());
    let bridge = IpcBridge::new(lifecycle.clone(), Arc::new(NotificationRegistry::new()));
    let (sender, mut receiver) = mpsc::unbounded_channel();
    assert!(bridge.attach(Arc::new(ChannelTransport { sender })));

    assert_eq!(
        bridge
            .handle(IpcCommand::CheckForUpdates { silent: false })
            .await,
        IpcReply::Ack
    );
    let messages = drain_until(&mut receiver, "available").await;
    let available = &messages[messages.len() - 2];
    assert_eq!(
        available["info"]["releaseNotes"],
        "## 2.0.0\nDual subtitles"
    );
    assert_eq!(
        messages.last().expect("red dots should be sent")["dots"][0]["id"],
        "update_available"
    );

    assert_eq!(bridge.handle(IpcCommand::DownloadUpdate).await, IpcReply::Ack);
    let messages = drain_until(&mut receiver, "downloaded").await;
    assert!(
        messages
            .iter()
            .any(|message| message["status"] == "downloading")
    );
    assert_eq!(
        messages.last().expect("red dots should be sent")["dots"][0]["id"],
        "update_ready"
    );

    assert_eq!(
        bridge.handle(IpcCommand::QuitAndInstall).await,
        IpcReply::Installing {
            outcome: InstallOutcome::ExitForInstaller
        }
    );
    let installed = installer
        .installed
        .lock()
        .expect("install log should lock")
        .clone();
    assert_eq!(
        installed,
        vec![
            temp.path()
                .join("cache")
                .join("pending-update")
                .join("Glint-Setup-2.0.0.exe")
        ]
    );
    assert_eq!(lifecycle.status(), UpdateStatus::Installing);

    assert!(store.load().expect("settings should load").last_checked.is_some());
    bridge.detach().await;
}
