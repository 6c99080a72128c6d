//! The update state machine.
//!
//! ```text
//! Idle -> Checking -> Available | NotAvailable | Error
//! Available -> Downloading -> Downloaded | Error | Available (cancelled)
//! Downloaded -> Installing -> Error (handoff failed)
//! Error -> Idle (retry)
//! ```
//!
//! A check is refused while a check or download is running and once an
//! installer is staged. The state mutex is never held across an await.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::UpdateError;
use crate::feed::ReleaseFeed;
use crate::install::{InstallOutcome, Installer};
use crate::integrity::{Verification, verify_in_background};
use crate::manifest::{UpdateFile, UpdateInfo};
use crate::rollout::{self, RolloutDecision};
use crate::settings::{SettingsStore, UpdateSettings};
use crate::status::{DownloadProgress, StatusHub, StatusSubscription, UpdateStatus};
use crate::version::{Channel, Version, classify};

/// Minimum spacing of `downloading` events, apart from 0% and 100%.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

struct State {
    status: UpdateStatus,
    cancel: Option<CancellationToken>,
    /// Verified installer, present only while `Downloaded`.
    artifact: Option<PathBuf>,
}

pub struct UpdateLifecycle {
    current_version: Version,
    feed: Arc<dyn ReleaseFeed>,
    installer: Arc<dyn Installer>,
    store: Arc<dyn SettingsStore>,
    download_dir: PathBuf,
    system_version: Option<String>,
    progress_interval: Duration,
    state: Mutex<State>,
    settings: Mutex<UpdateSettings>,
    hub: Arc<StatusHub>,
}

impl UpdateLifecycle {
    /// # Errors
    /// Returns an error when the persisted settings cannot be read.
    pub fn new(
        current_version: Version,
        feed: Arc<dyn ReleaseFeed>,
        installer: Arc<dyn Installer>,
        store: Arc<dyn SettingsStore>,
        download_dir: impl Into<PathBuf>,
    ) -> Result<Self, UpdateError> {
        let settings = store.load()?;
        info!(
            "Updater ready: version {current_version}, channel setting {}, auto update {}",
            settings.update_channel, settings.auto_update
        );

        Ok(Self {
            current_version,
            feed,
            installer,
            store,
            download_dir: download_dir.into(),
            system_version: None,
            progress_interval: PROGRESS_INTERVAL,
            state: Mutex::new(State {
                status: UpdateStatus::Idle,
                cancel: None,
                artifact: None,
            }),
            settings: Mutex::new(settings),
            hub: Arc::new(StatusHub::default()),
        })
    }

    /// OS version checked against a release's `minimumSystemVersion`.
    #[must_use]
    pub fn with_system_version(mut self, version: impl Into<String>) -> Self {
        self.system_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    #[must_use]
    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    #[must_use]
    pub fn status(&self) -> UpdateStatus {
        self.lock_state().status.clone()
    }

    #[must_use]
    pub fn settings(&self) -> UpdateSettings {
        self.lock_settings().clone()
    }

    #[must_use]
    pub fn auto_update_enabled(&self) -> bool {
        self.lock_settings().auto_update
    }

    #[must_use]
    pub fn subscribe(&self) -> StatusSubscription {
        self.hub.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// An explicit non-stable channel setting wins; otherwise the channel
    /// the running build was cut from.
    #[must_use]
    pub fn effective_channel(&self) -> Channel {
        match self.lock_settings().update_channel {
            Channel::Stable => classify(&self.current_version),
            explicit => explicit,
        }
    }

    /// # Errors
    /// Returns an error when the setting cannot be persisted.
    pub fn set_auto_update(&self, enabled: bool) -> Result<(), UpdateError> {
        self.update_settings(|settings| settings.auto_update = enabled)?;
        info!("Auto update {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Persist `version` as acknowledged by the user.
    ///
    /// # Errors
    /// Returns an error when the setting cannot be persisted.
    pub fn mark_seen(&self, version: &str) -> Result<(), UpdateError> {
        self.update_settings(|settings| settings.seen_version = Some(version.to_string()))?;
        debug!("Marked {version} as seen");
        Ok(())
    }

    /// Persist the channel and run a silent check against it.
    ///
    /// # Errors
    /// Returns an error when the channel cannot be persisted; no check runs
    /// in that case.
    pub async fn set_channel(&self, channel: Channel) -> Result<UpdateStatus, UpdateError> {
        self.store_channel(channel)?;
        Ok(self.check_for_updates(true).await)
    }

    pub(crate) fn store_channel(&self, channel: Channel) -> Result<(), UpdateError> {
        self.update_settings(|settings| settings.update_channel = channel)?;
        info!("Update channel set to {channel}");
        Ok(())
    }

    /// Run one check and return the status it resolved to. While another
    /// check or a download is running, an installer is staged, or an error
    /// has not been cleared with [`retry`](Self::retry), this returns the
    /// current status untouched.
    pub async fn check_for_updates(&self, silent: bool) -> UpdateStatus {
        {
            let mut state = self.lock_state();
            if state.status.blocks_new_check() {
                debug!("Ignoring update check while {}", state.status.label());
                return state.status.clone();
            }
            self.set_status(&mut state, UpdateStatus::Checking);
        }

        let channel = self.effective_channel();
        info!(
            "Checking for updates on {channel} (running {})",
            self.current_version
        );
        let fetched = self.feed.fetch_manifest(channel).await;
        self.record_last_checked();

        let next = match fetched {
            Ok(info) => self.resolve_offer(info, silent),
            Err(error) => error_status(&error),
        };

        let mut state = self.lock_state();
        state.artifact = None;
        self.set_status(&mut state, next);
        state.status.clone()
    }

    fn resolve_offer(&self, info: UpdateInfo, silent: bool) -> UpdateStatus {
        if !info.version.is_newer_than(&self.current_version) {
            if self.current_version.is_newer_than(&info.version) {
                let rejected = UpdateError::Downgrade {
                    current: self.current_version.to_string(),
                    offered: info.version.to_string(),
                };
                warn!("{rejected}");
            } else {
                info!("Already up to date at {}", self.current_version);
            }
            return UpdateStatus::NotAvailable { silent };
        }

        let staging_id = if info.staging_percentage.is_some() {
            self.staging_id()
        } else {
            String::new()
        };
        match rollout::evaluate(&info, self.system_version.as_deref(), &staging_id) {
            RolloutDecision::Offer => {}
            RolloutDecision::SystemTooOld | RolloutDecision::NotInStage => {
                return UpdateStatus::NotAvailable { silent };
            }
        }

        if info.files.is_empty() {
            return error_status(&UpdateError::malformed(format!(
                "release {} lists no files",
                info.version
            )));
        }

        info!(
            "Update available: {} -> {}",
            self.current_version, info.version
        );
        UpdateStatus::Available { info, silent }
    }

    /// Download and verify the offered release. Only acts from `available`;
    /// elsewhere the current status is returned untouched.
    pub async fn download(&self) -> UpdateStatus {
        let (info, file, cancel) = {
            let mut state = self.lock_state();
            let UpdateStatus::Available { info, .. } = &state.status else {
                debug!("Ignoring download request while {}", state.status.label());
                return state.status.clone();
            };
            let info = info.clone();
            let Some(file) = info.primary_file().cloned() else {
                let status = error_status(&UpdateError::malformed(format!(
                    "release {} lists no files",
                    info.version
                )));
                self.set_status(&mut state, status);
                return state.status.clone();
            };

            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            state.artifact = None;
            self.set_status(
                &mut state,
                UpdateStatus::Downloading {
                    progress: DownloadProgress::new(0, file.size, 0),
                },
            );
            (info, file, cancel)
        };

        let dest = self.download_dir.join(file.file_name());
        remove_quietly(&dest).await;

        let throttle = ProgressThrottle::new(self.progress_interval);
        let report = |transferred: u64, total: Option<u64>| {
            if let Some(progress) = throttle.next(transferred, total) {
                self.publish_progress(&cancel, progress);
            }
        };
        let downloaded = self
            .feed
            .download_artifact(&file, &dest, &report, &cancel)
            .await;

        let verified = match downloaded {
            Ok(bytes) if !cancel.is_cancelled() => {
                if let Some(progress) = throttle.finish(bytes) {
                    self.publish_progress(&cancel, progress);
                }
                self.verify_artifact(&file, &dest).await
            }
            Ok(_) => Err(UpdateError::Cancelled),
            Err(error) => Err(error),
        };

        let mut state = self.lock_state();
        state.cancel = None;
        let next = match verified {
            Ok(()) if !cancel.is_cancelled() => {
                info!("Update {} downloaded to {}", info.version, dest.display());
                state.artifact = Some(dest);
                UpdateStatus::Downloaded { info }
            }
            Ok(()) => {
                let _ = std::fs::remove_file(&dest);
                info!("Download of {} cancelled", info.version);
                UpdateStatus::Available {
                    info,
                    silent: false,
                }
            }
            Err(UpdateError::Cancelled) => {
                info!("Download of {} cancelled", info.version);
                UpdateStatus::Available {
                    info,
                    silent: false,
                }
            }
            Err(error) => error_status(&error),
        };
        self.set_status(&mut state, next);
        state.status.clone()
    }

    async fn verify_artifact(&self, file: &UpdateFile, dest: &Path) -> Result<(), UpdateError> {
        let failure = match verify_in_background(dest.to_path_buf(), file.sha512.clone()).await {
            Ok(Verification::Ok) => return Ok(()),
            Ok(Verification::Mismatch { expected, actual }) => UpdateError::Integrity {
                file: file.file_name(),
                reason: format!("expected sha512 {expected}, got {actual}"),
            },
            Ok(Verification::MissingDigest) => UpdateError::Integrity {
                file: file.file_name(),
                reason: "the feed declared no sha512 digest".to_string(),
            },
            Err(error) => error,
        };

        warn!("Discarding {}: {failure}", dest.display());
        remove_quietly(dest).await;
        Err(failure)
    }

    fn publish_progress(&self, cancel: &CancellationToken, progress: DownloadProgress) {
        let mut state = self.lock_state();
        if cancel.is_cancelled() || !matches!(state.status, UpdateStatus::Downloading { .. }) {
            return;
        }
        self.set_status(&mut state, UpdateStatus::Downloading { progress });
    }

    /// Ask the running download to stop. The download call itself deletes the
    /// partial file and moves back to `available`. Returns whether a download
    /// was running.
    pub fn cancel_download(&self) -> bool {
        let state = self.lock_state();
        match (&state.status, &state.cancel) {
            (UpdateStatus::Downloading { .. }, Some(cancel)) => {
                info!("Cancelling update download");
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Hand the verified installer to the [`Installer`]. Only acts from
    /// `downloaded`. On failure the status becomes `error` and `None` is
    /// returned.
    pub async fn install(&self) -> Option<InstallOutcome> {
        let (artifact, info) = {
            let mut state = self.lock_state();
            let UpdateStatus::Downloaded { info } = &state.status else {
                debug!("Ignoring install request while {}", state.status.label());
                return None;
            };
            let info = info.clone();
            let artifact = state.artifact.clone()?;
            self.set_status(&mut state, UpdateStatus::Installing);
            (artifact, info)
        };

        match self.installer.install(&artifact, &info).await {
            Ok(outcome) => {
                info!("Installer for {} launched: {outcome:?}", info.version);
                Some(outcome)
            }
            Err(error) => {
                let mut state = self.lock_state();
                state.artifact = None;
                self.set_status(&mut state, error_status(&error));
                None
            }
        }
    }

    /// Leave `error` for `idle`. No effect in any other state.
    pub fn retry(&self) -> UpdateStatus {
        let mut state = self.lock_state();
        if matches!(state.status, UpdateStatus::Error { .. }) {
            self.set_status(&mut state, UpdateStatus::Idle);
        }
        state.status.clone()
    }

    fn set_status(&self, state: &mut State, status: UpdateStatus) {
        if state.status.label() != status.label() {
            debug!(
                "Update status {} -> {}",
                state.status.label(),
                status.label()
            );
        }
        state.status = status;
        self.hub.publish(&state.status);
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_settings(&self) -> MutexGuard<'_, UpdateSettings> {
        self.settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Apply `change` and persist; memory is only updated once the store
    /// accepted the new record.
    fn update_settings(
        &self,
        change: impl FnOnce(&mut UpdateSettings),
    ) -> Result<UpdateSettings, UpdateError> {
        let mut settings = self.lock_settings();
        let mut next = settings.clone();
        change(&mut next);
        self.store.save(&next)?;
        *settings = next.clone();
        Ok(next)
    }

    fn record_last_checked(&self) {
        let mut settings = self.lock_settings();
        settings.last_checked = Some(chrono::Utc::now().timestamp_millis());
        if let Err(error) = self.store.save(&settings) {
            warn!("Failed to persist last update check: {error}");
        }
    }

    fn staging_id(&self) -> String {
        let mut settings = self.lock_settings();
        if let Some(id) = &settings.staging_id {
            return id.clone();
        }

        let id = rollout::new_staging_id();
        settings.staging_id = Some(id.clone());
        if let Err(error) = self.store.save(&settings) {
            warn!("Failed to persist staging id: {error}");
        }
        id
    }
}

impl std::fmt::Debug for UpdateLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateLifecycle")
            .field("current_version", &self.current_version)
            .field("download_dir", &self.download_dir)
            .field("status", &self.status().label())
            .finish_non_exhaustive()
    }
}

fn error_status(error: &UpdateError) -> UpdateStatus {
    warn!("Update failed ({}): {error}", error.kind());
    UpdateStatus::Error {
        message: error.to_string(),
        kind: error.kind(),
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!("Failed to remove {}: {error}", path.display()),
    }
}

struct ProgressThrottle {
    interval: Duration,
    started: Instant,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    last_emit: Instant,
    completed: bool,
}

impl ProgressThrottle {
    fn new(interval: Duration) -> Self {
        let started = Instant::now();
        Self {
            interval,
            started,
            state: Mutex::new(ThrottleState {
                last_emit: started,
                completed: false,
            }),
        }
    }

    /// The 0% event is sent on entering `downloading`; after that, one event
    /// per interval plus the one that reaches the total.
    fn next(&self, transferred: u64, total: Option<u64>) -> Option<DownloadProgress> {
        let now = Instant::now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.completed {
            return None;
        }

        let complete = total.is_some_and(|total| total > 0 && transferred >= total);
        if !complete && now.duration_since(state.last_emit) < self.interval {
            return None;
        }

        state.last_emit = now;
        state.completed = complete;
        Some(DownloadProgress::new(
            transferred,
            total,
            self.rate(transferred, now),
        ))
    }

    /// The 100% event for downloads whose size was not known up front.
    fn finish(&self, transferred: u64) -> Option<DownloadProgress> {
        let now = Instant::now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.completed {
            return None;
        }
        state.completed = true;
        Some(DownloadProgress::new(
            transferred,
            Some(transferred),
            self.rate(transferred, now),
        ))
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn rate(&self, transferred: u64, now: Instant) -> u64 {
        let elapsed = now.duration_since(self.started).as_secs_f64();
        if elapsed > 0.0 {
            (transferred as f64 / elapsed) as u64
        } else {
            0
        }
    }
}
