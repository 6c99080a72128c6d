//! Release manifest model and decoding.
//!
//! Feeds publish one small YAML document per channel and platform
//! (`latest.yml`, `latest-mac.yml`, `latest-linux.yml`). JSON documents are
//! accepted too since they are valid YAML.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::UpdateError;
use crate::version::Version;

const SHA512_BYTES: usize = 64;

/// One downloadable artifact of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFile {
    /// Absolute URL, resolved against the manifest location.
    pub url: String,
    /// Lowercase hex SHA-512, when the feed declared one.
    pub sha512: Option<String>,
    pub size: Option<u64>,
}

impl UpdateFile {
    /// Last path segment of the URL, safe to use as a local file name.
    #[must_use]
    pub fn file_name(&self) -> String {
        let raw = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .rsplit('/')
            .next()
            .unwrap_or_default();
        std::path::Path::new(raw)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty() && !name.contains(".."))
            .unwrap_or("update-download")
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub version: Version,
    pub release_date: Option<DateTime<Utc>>,
    /// Markdown; list-form notes are already flattened.
    pub release_notes: Option<String>,
    pub files: Vec<UpdateFile>,
    /// Sum of the declared file sizes, absent when no file declares one.
    pub update_size: Option<u64>,
    pub minimum_system_version: Option<String>,
    pub staging_percentage: Option<f64>,
}

impl UpdateInfo {
    #[must_use]
    pub fn primary_file(&self) -> Option<&UpdateFile> {
        self.files.first()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default, deserialize_with = "scalar_string")]
    version: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    sha512: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    release_date: Option<String>,
    #[serde(default)]
    release_notes: Option<RawReleaseNotes>,
    #[serde(default, deserialize_with = "scalar_string")]
    minimum_system_version: Option<String>,
    #[serde(default)]
    staging_percentage: Option<f64>,
}

#[derive(Deserialize)]
struct RawFile {
    url: String,
    #[serde(default)]
    sha512: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawReleaseNotes {
    Text(String),
    Entries(Vec<RawReleaseNote>),
}

#[derive(Deserialize)]
struct RawReleaseNote {
    #[serde(default, deserialize_with = "scalar_string")]
    version: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

/// YAML turns `1.10` or `2024-01-01` into numbers and dates; keep the text.
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_yaml::Value::String(text)) => Some(text),
        Some(serde_yaml::Value::Number(number)) => Some(number.to_string()),
        Some(serde_yaml::Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

/// Decode a manifest document fetched from `manifest_url`.
///
/// # Errors
/// Returns [`UpdateError::MalformedManifest`] when required fields are missing
/// or a field cannot be interpreted.
pub fn parse_manifest(text: &str, manifest_url: &Url) -> Result<UpdateInfo, UpdateError> {
    let raw: RawManifest = serde_yaml::from_str(text)
        .map_err(|error| UpdateError::malformed(format!("unreadable document: {error}")))?;

    let version_text = raw
        .version
        .ok_or_else(|| UpdateError::malformed("missing `version`"))?;
    let version = Version::parse(version_text.trim())
        .map_err(|error| UpdateError::malformed(error.to_string()))?;

    let mut raw_files = raw.files;
    if raw_files.is_empty()
        && let Some(path) = raw.path
    {
        raw_files.push(RawFile {
            url: path,
            sha512: raw.sha512.clone(),
            size: None,
        });
    }

    let files = raw_files
        .into_iter()
        .map(|file| resolve_file(file, manifest_url))
        .collect::<Result<Vec<_>, _>>()?;

    let release_date = raw
        .release_date
        .as_deref()
        .map(parse_release_date)
        .transpose()?;

    let staging_percentage = match raw.staging_percentage {
        Some(value) if !(0.0..=100.0).contains(&value) => {
            return Err(UpdateError::malformed(format!(
                "`stagingPercentage` {value} is outside 0-100"
            )));
        }
        other => other,
    };

    let update_size = total_size(&files);

    Ok(UpdateInfo {
        version,
        release_date,
        release_notes: raw.release_notes.and_then(normalize_release_notes),
        files,
        update_size,
        minimum_system_version: raw.minimum_system_version,
        staging_percentage,
    })
}

fn resolve_file(file: RawFile, manifest_url: &Url) -> Result<UpdateFile, UpdateError> {
    let url = manifest_url
        .join(file.url.trim())
        .map_err(|error| UpdateError::malformed(format!("bad file url {:?}: {error}", file.url)))?;

    let sha512 = match file.sha512.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(digest) => Some(normalize_sha512(digest).ok_or_else(|| {
            UpdateError::malformed(format!("unrecognized sha512 for {}", file.url))
        })?),
    };

    Ok(UpdateFile {
        url: url.to_string(),
        sha512,
        size: file.size,
    })
}

fn parse_release_date(raw: &str) -> Result<DateTime<Utc>, UpdateError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|date| date.with_timezone(&Utc))
        .map_err(|error| UpdateError::malformed(format!("bad `releaseDate` {raw:?}: {error}")))
}

fn total_size(files: &[UpdateFile]) -> Option<u64> {
    files
        .iter()
        .filter_map(|file| file.size)
        .fold(None, |total, size| {
            Some(total.unwrap_or(0_u64).saturating_add(size))
        })
}

/// Feeds publish SHA-512 digests either base64 encoded or as hex. Returns
/// lowercase hex, or `None` when the value is neither.
#[must_use]
pub fn normalize_sha512(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.len() == SHA512_BYTES * 2 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(raw.to_ascii_lowercase());
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(raw).ok()?;
    (bytes.len() == SHA512_BYTES).then(|| to_hex(&bytes))
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

fn normalize_release_notes(notes: RawReleaseNotes) -> Option<String> {
    let text = match notes {
        RawReleaseNotes::Text(text) => text,
        RawReleaseNotes::Entries(entries) => entries
            .into_iter()
            .map(|entry| {
                format!(
                    "## {}\n{}",
                    entry.version.unwrap_or_default(),
                    entry.note.unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    (!text.trim().is_empty()).then_some(text)
}
