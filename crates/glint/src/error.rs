use glint_update::UpdateError;

use crate::single_instance::AcquireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppErrorDetail {
    Message(String),
}

impl From<String> for AppErrorDetail {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for AppErrorDetail {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

impl std::fmt::Display for AppErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(message) => write!(f, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    Message(String),
    AlreadyRunning,
    PathsUnavailable {
        details: AppErrorDetail,
    },
    UpdaterStartFailed {
        component: &'static str,
        details: AppErrorDetail,
    },
    UpdateCheckFailed {
        channel: String,
        details: AppErrorDetail,
    },
    TransportFailed {
        direction: &'static str,
        details: AppErrorDetail,
    },
    RestartFailed {
        details: AppErrorDetail,
    },
}

impl AppError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn paths_unavailable(details: impl Into<AppErrorDetail>) -> Self {
        Self::PathsUnavailable {
            details: details.into(),
        }
    }

    pub fn updater_start_failed(
        component: &'static str,
        details: impl Into<AppErrorDetail>,
    ) -> Self {
        Self::UpdaterStartFailed {
            component,
            details: details.into(),
        }
    }

    pub fn update_check_failed(
        channel: impl Into<String>,
        details: impl Into<AppErrorDetail>,
    ) -> Self {
        Self::UpdateCheckFailed {
            channel: channel.into(),
            details: details.into(),
        }
    }

    pub fn transport_failed(direction: &'static str, details: impl Into<AppErrorDetail>) -> Self {
        Self::TransportFailed {
            direction,
            details: details.into(),
        }
    }

    pub fn restart_failed(details: impl Into<AppErrorDetail>) -> Self {
        Self::RestartFailed {
            details: details.into(),
        }
    }

    /// Process exit code reported for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::AlreadyRunning => 3,
            Self::UpdateCheckFailed { .. } => 2,
            _ => 1,
        }
    }
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for AppError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<AcquireError> for AppError {
    fn from(value: AcquireError) -> Self {
        match value {
            AcquireError::AlreadyRunning => Self::AlreadyRunning,
            AcquireError::Io { .. } => Self::message(value.to_string()),
        }
    }
}

impl From<glint_platform::AppPathsError> for AppError {
    fn from(value: glint_platform::AppPathsError) -> Self {
        Self::paths_unavailable(value.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(message) => write!(f, "{message}"),
            Self::AlreadyRunning => write!(f, "Another Glint updater is already running"),
            Self::PathsUnavailable { details } => {
                write!(f, "Application directories unavailable: {details}")
            }
            Self::UpdaterStartFailed { component, details } => {
                write!(f, "Failed to start {component}: {details}")
            }
            Self::UpdateCheckFailed { channel, details } => {
                write!(f, "{channel} update check failed: {details}")
            }
            Self::TransportFailed { direction, details } => {
                write!(f, "UI transport {direction} failed: {details}")
            }
            Self::RestartFailed { details } => write!(f, "Failed to restart Glint: {details}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<&UpdateError> for AppErrorDetail {
    fn from(value: &UpdateError) -> Self {
        Self::Message(value.to_string())
    }
}
