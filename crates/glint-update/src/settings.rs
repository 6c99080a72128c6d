use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::version::Channel;

/// Key of the update record inside the shared `settings.json` document.
pub const SETTINGS_KEY: &str = "update";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettings {
    #[serde(default = "default_auto_update")]
    pub auto_update: bool,

    #[serde(default)]
    pub update_channel: Channel,

    /// Unix epoch milliseconds of the last completed check.
    #[serde(default)]
    pub last_checked: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_id: Option<String>,
}

fn default_auto_update() -> bool {
    true
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            auto_update: default_auto_update(),
            update_channel: Channel::Stable,
            last_checked: None,
            seen_version: None,
            staging_id: None,
        }
    }
}

/// Persistence for [`UpdateSettings`]. Every mutation goes through `save`.
pub trait SettingsStore: Send + Sync {
    /// # Errors
    /// Returns an error when the backing storage cannot be read.
    fn load(&self) -> Result<UpdateSettings, UpdateError>;

    /// # Errors
    /// Returns an error when the backing storage cannot be written.
    fn save(&self, settings: &UpdateSettings) -> Result<(), UpdateError>;
}

/// Stores the update record under [`SETTINGS_KEY`] of a JSON document,
/// leaving the other top-level keys untouched.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<serde_json::Map<String, serde_json::Value>, UpdateError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(serde_json::Map::new());
            }
            Err(error) => {
                return Err(UpdateError::io_with_path(
                    "failed to read settings",
                    &self.path,
                    error,
                ));
            }
        };

        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                warn!(
                    "Settings file {} is not a JSON object, starting fresh",
                    self.path.display()
                );
                Ok(serde_json::Map::new())
            }
        }
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<UpdateSettings, UpdateError> {
        let mut document = self.read_document()?;
        let Some(record) = document.remove(SETTINGS_KEY) else {
            return Ok(UpdateSettings::default());
        };

        Ok(serde_json::from_value(record).unwrap_or_else(|error| {
            warn!("Ignoring unreadable update settings: {error}");
            UpdateSettings::default()
        }))
    }

    fn save(&self, settings: &UpdateSettings) -> Result<(), UpdateError> {
        let mut document = self.read_document()?;
        let record = serde_json::to_value(settings).map_err(|error| {
            UpdateError::io("failed to encode settings", std::io::Error::other(error))
        })?;
        document.insert(SETTINGS_KEY.to_string(), record);

        let content = serde_json::to_vec_pretty(&serde_json::Value::Object(document))
            .map_err(|error| {
                UpdateError::io("failed to encode settings", std::io::Error::other(error))
            })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                UpdateError::io_with_path("failed to create settings directory", parent, error)
            })?;
        }

        write_atomic(&self.path, &content).map_err(|error| {
            UpdateError::io_with_path("failed to write settings", &self.path, error)
        })?;
        debug!("Saved update settings to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store for hosts without persistence and for tests.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<UpdateSettings>,
}

impl MemorySettingsStore {
    #[must_use]
    pub fn new(settings: UpdateSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> UpdateSettings {
        self.settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<UpdateSettings, UpdateError> {
        Ok(self.snapshot())
    }

    fn save(&self, settings: &UpdateSettings) -> Result<(), UpdateError> {
        *self
            .settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = settings.clone();
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "settings path has no parent")
    })?;

    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("settings");
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let pid = std::process::id();

    let mut tmp_path = None;
    for attempt in 0..16_u8 {
        let candidate = parent.join(format!(".{file_name}.{pid}.{timestamp}.{attempt}.tmp"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(data)?;
                file.sync_all()?;
                tmp_path = Some(candidate);
                break;
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }

    let Some(tmp_path) = tmp_path else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "failed to create unique settings temp file",
        ));
    };

    // std::fs::rename replaces an existing destination on every platform.
    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }

    Ok(())
}
