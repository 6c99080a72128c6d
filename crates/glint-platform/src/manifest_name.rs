use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    #[must_use]
    pub fn manifest_file_name(self) -> &'static str {
        match self {
            Self::Windows => "latest.yml",
            Self::MacOs => "latest-mac.yml",
            Self::Linux => "latest-linux.yml",
        }
    }
}

/// Name of the release manifest published for the running platform.
#[must_use]
pub fn manifest_file_name() -> &'static str {
    Platform::current().manifest_file_name()
}
