use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure class reported to the UI alongside an error message.
///
/// The UI chooses its affordance (retry button, "free up space", "run as
/// administrator") from this tag, never from the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Network,
    Server,
    MalformedManifest,
    IntegrityFailure,
    DiskSpace,
    Permission,
    DowngradeRejected,
    InstallFailure,
    Cancelled,
}

impl ErrorKind {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Server | Self::IntegrityFailure)
    }

    /// Whether a failure of this kind is shown to the user at all.
    #[must_use]
    pub fn is_surfaced(self) -> bool {
        !matches!(self, Self::DowngradeRejected | Self::Cancelled)
    }

    /// Classify a filesystem error. Anything that is not a full disk or a
    /// permission problem is treated as transient.
    #[must_use]
    pub fn from_io(error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::StorageFull => Self::DiskSpace,
            std::io::ErrorKind::PermissionDenied => Self::Permission,
            _ if is_disk_full_code(error.raw_os_error()) => Self::DiskSpace,
            _ => Self::Network,
        }
    }
}

#[cfg(unix)]
fn is_disk_full_code(code: Option<i32>) -> bool {
    // ENOSPC, EDQUOT
    matches!(code, Some(28 | 122))
}

#[cfg(windows)]
fn is_disk_full_code(code: Option<i32>) -> bool {
    // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
    matches!(code, Some(39 | 112))
}

#[cfg(not(any(unix, windows)))]
fn is_disk_full_code(_code: Option<i32>) -> bool {
    false
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Network => "network error",
            Self::Server => "server error",
            Self::MalformedManifest => "malformed manifest",
            Self::IntegrityFailure => "integrity check failed",
            Self::DiskSpace => "not enough disk space",
            Self::Permission => "permission denied",
            Self::DowngradeRejected => "downgrade rejected",
            Self::InstallFailure => "install failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("{context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },
    #[error("update feed returned HTTP {status} for {url}")]
    Server {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("invalid update manifest: {0}")]
    MalformedManifest(String),
    #[error("invalid update feed URL {url:?}: {reason}")]
    InvalidFeedUrl { url: String, reason: String },
    #[error("downloaded file {file} failed verification: {reason}")]
    Integrity { file: String, reason: String },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{context} ({}): {source}", path.display())]
    IoAt {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("offered version {offered} is not newer than {current}")]
    Downgrade { current: String, offered: String },
    #[error("failed to launch installer: {details}")]
    Install {
        details: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("download cancelled")]
    Cancelled,
}

impl UpdateError {
    pub(crate) fn http(context: &'static str, source: reqwest::Error) -> Self {
        Self::Http { context, source }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn io_with_path(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoAt {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(details: impl Into<String>) -> Self {
        Self::MalformedManifest(details.into())
    }

    pub(crate) fn install(details: impl Into<String>, source: Option<std::io::Error>) -> Self {
        Self::Install {
            details: details.into(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            // reqwest reports a cut-off body as a decode error.
            Self::Http { source, .. } if source.status().is_some() => ErrorKind::Server,
            Self::Http { .. } | Self::Timeout { .. } => ErrorKind::Network,
            Self::Server { .. } => ErrorKind::Server,
            Self::MalformedManifest(_) | Self::InvalidFeedUrl { .. } => {
                ErrorKind::MalformedManifest
            }
            Self::Integrity { .. } => ErrorKind::IntegrityFailure,
            Self::Io { source, .. } | Self::IoAt { source, .. } => ErrorKind::from_io(source),
            Self::Downgrade { .. } => ErrorKind::DowngradeRejected,
            Self::Install {
                source: Some(source),
                ..
            } if source.kind() == std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            Self::Install { .. } => ErrorKind::InstallFailure,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
