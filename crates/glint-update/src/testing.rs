//! In-memory feed and installer for unit tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha512};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::UpdateError;
use crate::feed::{ProgressFn, ReleaseFeed};
use crate::install::{InstallOutcome, Installer};
use crate::manifest::{UpdateFile, UpdateInfo, to_hex};
use crate::version::{Channel, Version};

const CHUNK: usize = 1024;

pub(crate) struct FakeRelease {
    pub(crate) info: UpdateInfo,
    pub(crate) payload: Vec<u8>,
}

pub(crate) fn release(version: &str, payload: &[u8]) -> FakeRelease {
    release_with_digest(version, payload, payload)
}

/// The manifest declares the digest of `declared` but the feed serves
/// `served`.
pub(crate) fn release_with_digest(version: &str, declared: &[u8], served: &[u8]) -> FakeRelease {
    let size = served.len() as u64;
    FakeRelease {
        info: UpdateInfo {
            version: Version::parse(version).expect("test version should parse"),
            release_date: None,
            release_notes: Some(format!("## {version}\nTest build")),
            files: vec![UpdateFile {
                url: format!("https://updates.example.com/stable/Glint-Setup-{version}.exe"),
                sha512: Some(to_hex(&Sha512::digest(declared))),
                size: Some(size),
            }],
            update_size: Some(size),
            minimum_system_version: None,
            staging_percentage: None,
        },
        payload: served.to_vec(),
    }
}

pub(crate) struct FakeFeed {
    release: Option<FakeRelease>,
    hold_download: bool,
    fetched: Mutex<Vec<Channel>>,
    downloads: AtomicUsize,
    download_started: Notify,
}

impl FakeFeed {
    pub(crate) fn serving(release: FakeRelease) -> Self {
        Self {
            release: Some(release),
            hold_download: false,
            fetched: Mutex::new(Vec::new()),
            downloads: AtomicUsize::new(0),
            download_started: Notify::new(),
        }
    }

    /// Every manifest fetch fails with a network timeout.
    pub(crate) fn failing() -> Self {
        Self {
            release: None,
            ..Self::serving(release("0.0.0", b""))
        }
    }

    /// Downloads write one chunk and then wait for cancellation.
    pub(crate) fn holding_download(mut self) -> Self {
        self.hold_download = true;
        self
    }

    pub(crate) fn fetched_channels(&self) -> Vec<Channel> {
        self.fetched.lock().expect("fetch log should lock").clone()
    }

    pub(crate) fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_download_start(&self) {
        self.download_started.notified().await;
    }
}

#[async_trait]
impl ReleaseFeed for FakeFeed {
    async fn fetch_manifest(&self, channel: Channel) -> Result<UpdateInfo, UpdateError> {
        self.fetched
            .lock()
            .expect("fetch log should lock")
            .push(channel);
        match &self.release {
            Some(release) => Ok(release.info.clone()),
            None => Err(UpdateError::Timeout {
                operation: "manifest fetch",
                seconds: 10,
            }),
        }
    }

    async fn download_artifact(
        &self,
        _file: &UpdateFile,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let payload = self
            .release
            .as_ref()
            .map(|release| release.payload.clone())
            .unwrap_or_default();
        let total = Some(payload.len() as u64);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| UpdateError::io("failed to create download directory", error))?;
        }
        let mut out = tokio::fs::File::create(dest)
            .await
            .map_err(|error| UpdateError::io("failed to create download file", error))?;

        let mut written = 0_u64;
        progress(written, total);
        for chunk in payload.chunks(CHUNK) {
            out.write_all(chunk)
                .await
                .map_err(|error| UpdateError::io("failed to write download data", error))?;
            written += chunk.len() as u64;
            progress(written, total);

            if self.hold_download {
                self.download_started.notify_one();
                cancel.cancelled().await;
                drop(out);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(UpdateError::Cancelled);
            }
        }

        out.flush()
            .await
            .map_err(|error| UpdateError::io("failed to flush download file", error))?;
        Ok(written)
    }
}

#[derive(Default)]
pub(crate) struct FakeInstaller {
    installed: Mutex<Vec<PathBuf>>,
    fail: AtomicBool,
}

impl FakeInstaller {
    pub(crate) fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub(crate) fn installed(&self) -> Vec<PathBuf> {
        self.installed
            .lock()
            .expect("install log should lock")
            .clone()
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(
        &self,
        artifact: &Path,
        _info: &UpdateInfo,
    ) -> Result<InstallOutcome, UpdateError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(UpdateError::install("installer exited with code 2", None));
        }
        self.installed
            .lock()
            .expect("install log should lock")
            .push(artifact.to_path_buf());
        Ok(InstallOutcome::ExitForInstaller)
    }
}
