//! Auto-update orchestration for Glint.
//!
//! This crate is independent of the UI toolkit and of the transport the UI
//! talks over:
//! - Version parsing and release channel classification.
//! - Channel manifest fetching, decoding, and artifact streaming.
//! - SHA-512 verification of downloaded installers.
//! - The update lifecycle state machine and its status stream.
//! - The prioritized, expiring badge registry fed by that stream.
//! - The command/event bridge a UI transport plugs into.

mod client;
mod error;
mod feed;
mod install;
pub mod integrity;
pub mod ipc;
mod lifecycle;
mod manifest;
pub mod notifications;
mod rollout;
mod settings;
mod status;
#[cfg(test)]
mod testing;
mod version;

/// HTTP feed client and its configuration.
pub use client::{ManifestClient, ManifestClientConfig};
/// Failure taxonomy shared by every component.
pub use error::{ErrorKind, UpdateError};
/// Source of manifests and artifacts.
pub use feed::{ProgressFn, ReleaseFeed};
/// Installer handoff and relaunch helper.
pub use install::{InstallOutcome, Installer, PlatformInstaller, restart_app};
pub use integrity::Verification;
pub use ipc::{
    IpcBridge, IpcCommand, IpcReply, IpcRequest, OutboundMessage, TransportError, UiTransport,
};
/// The update state machine.
pub use lifecycle::{PROGRESS_INTERVAL, UpdateLifecycle};
/// Manifest model and decoder.
pub use manifest::{UpdateFile, UpdateInfo, normalize_sha512, parse_manifest};
pub use notifications::{NotificationRegistry, RedDot, RedDotOptions};
pub use rollout::{RolloutDecision, staging_percentile};
/// Persisted update preferences.
pub use settings::{
    JsonSettingsStore, MemorySettingsStore, SETTINGS_KEY, SettingsStore, UpdateSettings,
};
pub use status::{DownloadProgress, StatusSubscription, UpdateStatus};
/// Version model and comparison helpers.
pub use version::{Channel, Version, VersionParseError, classify, meets_minimum_system_version};
