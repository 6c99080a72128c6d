//! Badge ("red dot") registry the UI renders next to the settings and about
//! entries. Update badges are driven one way from [`UpdateStatus`]; other
//! features may add their own through [`NotificationRegistry::show_red_dot`].

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::status::UpdateStatus;

pub const UPDATE_CATEGORY: &str = "update";

pub const UPDATE_AVAILABLE: &str = "update_available";
pub const UPDATE_DOWNLOADING: &str = "update_downloading";
pub const UPDATE_READY: &str = "update_ready";
pub const UPDATE_ERROR: &str = "update_error";

const AVAILABLE_PRIORITY: i32 = 8;
const DOWNLOADING_PRIORITY: i32 = 7;
const READY_PRIORITY: i32 = 9;
const ERROR_PRIORITY: i32 = 6;
const ERROR_TTL_MINUTES: i64 = 30;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedDot {
    pub id: String,
    pub category: String,
    pub priority: i32,
    #[serde(default)]
    pub metadata: Metadata,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RedDot {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RedDotOptions {
    pub priority: i32,
    pub metadata: Metadata,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RedDotOptions {
    #[must_use]
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    dots: HashMap<String, RedDot>,
    seen_version: Option<String>,
    /// Version of the last `available` status, acknowledged by `mark_as_seen`.
    offered_version: Option<String>,
}

#[derive(Debug, Default)]
pub struct NotificationRegistry {
    state: Mutex<RegistryState>,
}

impl NotificationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert or replace the badge with this id.
    pub fn show_red_dot(&self, id: &str, category: &str, options: RedDotOptions) {
        let dot = RedDot {
            id: id.to_string(),
            category: category.to_string(),
            priority: options.priority,
            metadata: options.metadata,
            expires_at: options.expires_at,
        };
        self.lock().dots.insert(dot.id.clone(), dot);
    }

    pub fn hide_red_dot(&self, id: &str) {
        self.lock().dots.remove(id);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<RedDot> {
        self.lock().dots.get(id).cloned()
    }

    /// Removes badges whose expiry has passed and returns how many went.
    pub fn clear_expired_red_dots(&self) -> usize {
        self.clear_expired_red_dots_at(Utc::now())
    }

    pub fn clear_expired_red_dots_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let before = state.dots.len();
        state.dots.retain(|_, dot| !dot.is_expired_at(now));
        let removed = before - state.dots.len();
        if removed > 0 {
            debug!("Cleared {removed} expired red dot(s)");
        }
        removed
    }

    /// Live badges, highest priority first, ties broken by id.
    #[must_use]
    pub fn visible(&self) -> Vec<RedDot> {
        self.visible_at(Utc::now())
    }

    #[must_use]
    pub fn visible_at(&self, now: DateTime<Utc>) -> Vec<RedDot> {
        let mut dots: Vec<RedDot> = self
            .lock()
            .dots
            .values()
            .filter(|dot| !dot.is_expired_at(now))
            .cloned()
            .collect();
        dots.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        dots
    }

    #[must_use]
    pub fn highest_priority(&self) -> Option<RedDot> {
        self.visible().into_iter().next()
    }

    #[must_use]
    pub fn has_new_version(&self) -> bool {
        self.lock().dots.contains_key(UPDATE_AVAILABLE)
    }

    /// Acknowledge the offered version: its badge is hidden and does not come
    /// back for that version. Returns the acknowledged version, if any.
    pub fn mark_as_seen(&self) -> Option<String> {
        let mut state = self.lock();
        state.dots.remove(UPDATE_AVAILABLE);
        let offered = state.offered_version.clone()?;
        state.seen_version = Some(offered.clone());
        Some(offered)
    }

    /// Version of the last `available` status, whether seen or not.
    #[must_use]
    pub fn offered_version(&self) -> Option<String> {
        self.lock().offered_version.clone()
    }

    pub fn set_seen_version(&self, version: Option<String>) {
        self.lock().seen_version = version;
    }

    #[must_use]
    pub fn seen_version(&self) -> Option<String> {
        self.lock().seen_version.clone()
    }

    pub fn apply_status(&self, status: &UpdateStatus) {
        self.apply_status_at(status, Utc::now());
    }

    pub fn apply_status_at(&self, status: &UpdateStatus, now: DateTime<Utc>) {
        let mut state = self.lock();
        match status {
            UpdateStatus::Checking => {
                remove_all(&mut state, &[UPDATE_AVAILABLE, UPDATE_ERROR]);
            }
            UpdateStatus::Available { info, .. } => {
                let version = info.version.to_string();
                state.dots.remove(UPDATE_DOWNLOADING);
                state.offered_version = Some(version.clone());
                if state.seen_version.as_deref() == Some(version.as_str()) {
                    debug!("Not badging {version}: already seen");
                } else {
                    insert(
                        &mut state,
                        UPDATE_AVAILABLE,
                        AVAILABLE_PRIORITY,
                        metadata([("version", version.into())]),
                        None,
                    );
                }
            }
            UpdateStatus::NotAvailable { .. } => {
                remove_all(
                    &mut state,
                    &[
                        UPDATE_AVAILABLE,
                        UPDATE_ERROR,
                        UPDATE_READY,
                        UPDATE_DOWNLOADING,
                    ],
                );
            }
            UpdateStatus::Downloading { progress } => {
                insert(
                    &mut state,
                    UPDATE_DOWNLOADING,
                    DOWNLOADING_PRIORITY,
                    metadata([("percent", progress.percent.into())]),
                    None,
                );
            }
            UpdateStatus::Downloaded { info } => {
                remove_all(&mut state, &[UPDATE_AVAILABLE, UPDATE_DOWNLOADING]);
                insert(
                    &mut state,
                    UPDATE_READY,
                    READY_PRIORITY,
                    metadata([("version", info.version.to_string().into())]),
                    None,
                );
            }
            UpdateStatus::Error { message, kind } => {
                remove_all(&mut state, &[UPDATE_AVAILABLE, UPDATE_DOWNLOADING]);
                insert(
                    &mut state,
                    UPDATE_ERROR,
                    ERROR_PRIORITY,
                    metadata([
                        ("message", message.clone().into()),
                        ("kind", serde_json::to_value(kind).unwrap_or_default()),
                    ]),
                    Some(now + Duration::minutes(ERROR_TTL_MINUTES)),
                );
            }
            UpdateStatus::Idle | UpdateStatus::Installing => {}
        }
    }
}

fn insert(
    state: &mut RegistryState,
    id: &str,
    priority: i32,
    metadata: Metadata,
    expires_at: Option<DateTime<Utc>>,
) {
    state.dots.insert(
        id.to_string(),
        RedDot {
            id: id.to_string(),
            category: UPDATE_CATEGORY.to_string(),
            priority,
            metadata,
            expires_at,
        },
    );
}

fn remove_all(state: &mut RegistryState, ids: &[&str]) {
    for id in ids {
        state.dots.remove(*id);
    }
}

fn metadata<const N: usize>(entries: [(&str, serde_json::Value); N]) -> Metadata {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
