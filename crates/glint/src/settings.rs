use std::path::Path;
use std::time::Duration;

use glint_update::ManifestClientConfig;
use log::warn;
use serde::{Deserialize, Serialize};

/// Environment variable that points the updater at a different feed, such as
/// a local developer server.
pub const FEED_OVERRIDE_ENV: &str = "GLINT_UPDATE_FEED";

const DEFAULT_FEED_URL: &str = "https://updates.glint-player.app";

/// Host-level updater settings. They live at the top level of the same
/// `settings.json` document as the `update` record, which this type ignores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_download_idle_timeout")]
    pub download_idle_timeout_secs: u64,

    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,

    #[serde(default = "default_check_interval")]
    pub check_interval_hours: u64,

    #[serde(default = "default_red_dot_sweep")]
    pub red_dot_sweep_secs: u64,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_http_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_download_idle_timeout() -> u64 {
    30
}

fn default_retry_delays() -> Vec<u64> {
    vec![0, 2, 5]
}

fn default_check_interval() -> u64 {
    4
}

fn default_red_dot_sweep() -> u64 {
    300
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            feed_url: default_feed_url(),
            http_timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            download_idle_timeout_secs: default_download_idle_timeout(),
            retry_delays_secs: default_retry_delays(),
            check_interval_hours: default_check_interval(),
            red_dot_sweep_secs: default_red_dot_sweep(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl AppSettings {
    /// Read settings from `path`, falling back to defaults for a missing or
    /// unreadable document, then apply the environment feed override.
    pub fn load(path: &Path) -> Self {
        let mut settings = Self::load_file(path);
        settings.apply_feed_override(std::env::var(FEED_OVERRIDE_ENV).ok());
        settings
    }

    fn load_file(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Self::default();
            }
            Err(error) => {
                warn!("Failed to read {}: {error}", path.display());
                return Self::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|error| {
            warn!("Ignoring malformed settings in {}: {error}", path.display());
            Self::default()
        })
    }

    fn apply_feed_override(&mut self, feed: Option<String>) {
        if let Some(feed) = feed
            && !feed.trim().is_empty()
        {
            self.feed_url = feed.trim().to_string();
        }
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_hours.max(1) * 60 * 60)
    }

    #[must_use]
    pub fn red_dot_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.red_dot_sweep_secs.max(1))
    }

    #[must_use]
    pub fn client_config(&self) -> ManifestClientConfig {
        let mut config = ManifestClientConfig::new(self.feed_url.clone());
        config.request_timeout = Duration::from_secs(self.http_timeout_secs);
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config.idle_timeout = Duration::from_secs(self.download_idle_timeout_secs);
        if !self.retry_delays_secs.is_empty() {
            config.retry_delays = self
                .retry_delays_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::AppSettings;

    #[test]
    fn defaults_match_documented_values() {
        let settings = AppSettings::default();

        assert_eq!(settings.feed_url, "https://updates.glint-player.app");
        assert_eq!(settings.http_timeout_secs, 10);
        assert_eq!(settings.connect_timeout_secs, 10);
        assert_eq!(settings.download_idle_timeout_secs, 30);
        assert_eq!(settings.retry_delays_secs, vec![0, 2, 5]);
        assert_eq!(settings.check_interval_hours, 4);
        assert_eq!(settings.red_dot_sweep_secs, 300);
        assert!(!settings.debug_logging);
        assert_eq!(settings.max_log_size_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn partial_document_fills_missing_fields_and_ignores_update_record() {
        let settings: AppSettings = serde_json::from_value(json!({
            "feed_url": "https://mirror.example.com/glint",
            "check_interval_hours": 12,
            "update": { "autoUpdate": false, "updateChannel": "beta" }
        }))
        .expect("settings should deserialize");

        assert_eq!(settings.feed_url, "https://mirror.example.com/glint");
        assert_eq!(settings.check_interval_hours, 12);
        assert_eq!(settings.http_timeout_secs, 10);
        assert_eq!(settings.retry_delays_secs, vec![0, 2, 5]);
    }

    #[test]
    fn missing_or_corrupt_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("settings.json");

        assert_eq!(AppSettings::load_file(&path), AppSettings::default());

        std::fs::write(&path, "{ not json").expect("settings file should be written");
        assert_eq!(AppSettings::load_file(&path), AppSettings::default());
    }

    #[test]
    fn feed_override_replaces_configured_feed() {
        let mut settings = AppSettings::default();

        settings.apply_feed_override(Some("  http://127.0.0.1:8080/feed ".to_string()));
        assert_eq!(settings.feed_url, "http://127.0.0.1:8080/feed");

        settings.apply_feed_override(Some("   ".to_string()));
        assert_eq!(settings.feed_url, "http://127.0.0.1:8080/feed");

        settings.apply_feed_override(None);
        assert_eq!(settings.feed_url, "http://127.0.0.1:8080/feed");
    }

    #[test]
    fn client_config_carries_timeouts_and_retry_schedule() {
        let settings = AppSettings {
            http_timeout_secs: 3,
            connect_timeout_secs: 2,
            download_idle_timeout_secs: 7,
            retry_delays_secs: vec![0, 1],
            ..AppSettings::default()
        };

        let config = settings.client_config();
        assert_eq!(config.feed_url, settings.feed_url);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, Duration::from_secs(7));
        assert_eq!(
            config.retry_delays,
            vec![Duration::from_secs(0), Duration::from_secs(1)]
        );
    }

    #[test]
    fn empty_retry_schedule_keeps_client_default() {
        let settings = AppSettings {
            retry_delays_secs: Vec::new(),
            ..AppSettings::default()
        };

        assert!(!settings.client_config().retry_delays.is_empty());
    }

    #[test]
    fn intervals_never_collapse_to_zero() {
        let settings = AppSettings {
            check_interval_hours: 0,
            red_dot_sweep_secs: 0,
            ..AppSettings::default()
        };

        assert_eq!(settings.check_interval(), Duration::from_secs(3600));
        assert_eq!(settings.red_dot_sweep_interval(), Duration::from_secs(1));
    }
}
