use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionParseError {
    #[error("invalid version format: {0:?}")]
    InvalidFormat(String),
    #[error("version {0} has no prerelease to increment")]
    NoPrereleaseToIncrement(String),
    #[error("prerelease {0:?} does not end in a numeric ordinal")]
    InvalidPrerelease(String),
}

/// An application version of the form `major.minor.patch[-prerelease]`.
///
/// Equality and hashing look at the numeric components and the prerelease
/// only, so `01.2.3` equals `1.2.3` while still displaying as written.
#[derive(Debug, Clone)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    /// Core text as parsed, kept only when it is not the canonical rendering
    /// of the numbers (leading zeros).
    core_text: Option<String>,
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        (self.major, self.minor, self.patch, &self.prerelease)
            == (other.major, other.minor, other.patch, &other.prerelease)
    }
}

impl Eq for Version {}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.major, self.minor, self.patch, &self.prerelease).hash(state);
    }
}

/// Release track a build belongs to.
///
/// The derived ordering is for display only. Update eligibility never looks
/// at it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Beta,
    Alpha,
    Dev,
    Test,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Stable,
        Channel::Beta,
        Channel::Alpha,
        Channel::Dev,
        Channel::Test,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
            Self::Dev => "dev",
            Self::Test => "test",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Version {
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            core_text: None,
        }
    }

    /// Parse a strict `major.minor.patch[-prerelease]` string.
    ///
    /// # Errors
    /// Returns [`VersionParseError::InvalidFormat`] for a leading `v`, missing
    /// or non-numeric components, or an empty prerelease.
    pub fn parse(raw: &str) -> Result<Self, VersionParseError> {
        let invalid = || VersionParseError::InvalidFormat(raw.to_string());

        let (core, prerelease) = match raw.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (raw, None),
        };

        let mut parts = core.split('.');
        let mut component = || -> Result<u64, VersionParseError> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };

        let major = component()?;
        let minor = component()?;
        let patch = component()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        let core_text = (core != format!("{major}.{minor}.{patch}")).then(|| core.to_string());

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
            core_text,
        })
    }

    #[must_use]
    pub fn channel(&self) -> Channel {
        classify(self)
    }

    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    /// Compare release numbers only; prerelease tags do not take part.
    #[must_use]
    pub fn cmp_release(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }

    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.cmp_release(other) == Ordering::Greater
    }

    /// Bump the trailing ordinal of a `<tag>.<N>` prerelease.
    ///
    /// # Errors
    /// Fails on stable versions and on prereleases without a numeric ordinal.
    pub fn increment_prerelease(&self) -> Result<Self, VersionParseError> {
        let prerelease = self
            .prerelease
            .as_deref()
            .ok_or_else(|| VersionParseError::NoPrereleaseToIncrement(self.to_string()))?;

        let (tag, ordinal) = prerelease
            .rsplit_once('.')
            .filter(|(tag, _)| !tag.is_empty())
            .ok_or_else(|| VersionParseError::InvalidPrerelease(prerelease.to_string()))?;
        let next = ordinal
            .parse::<u64>()
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| VersionParseError::InvalidPrerelease(prerelease.to_string()))?;

        Ok(Self {
            prerelease: Some(format!("{tag}.{next}")),
            ..self.clone()
        })
    }
}

/// Derive a build's channel from its prerelease tag.
///
/// Substrings are checked in the order `dev`, `test`, `alpha`, `beta`; the
/// first hit wins.
#[must_use]
pub fn classify(version: &Version) -> Channel {
    let Some(prerelease) = version.prerelease.as_deref() else {
        return Channel::Stable;
    };

    [Channel::Dev, Channel::Test, Channel::Alpha, Channel::Beta]
        .into_iter()
        .find(|channel| prerelease.contains(channel.as_str()))
        .unwrap_or(Channel::Stable)
}

/// Whether `actual` satisfies `minimum` for loosely formatted OS versions such
/// as `10.15` or `10.0.19041`.
///
/// Unparseable input is treated as satisfied so a malformed gate never blocks
/// an update.
#[must_use]
pub fn meets_minimum_system_version(actual: &str, minimum: &str) -> bool {
    match (parse_lenient(actual), parse_lenient(minimum)) {
        (Some(actual), Some(minimum)) => actual >= minimum,
        _ => true,
    }
}

fn parse_lenient(version: &str) -> Option<semver::Version> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    if let Ok(parsed) = semver::Version::parse(version) {
        return Some(parsed);
    }

    let core = version.split(['-', '+', ' ']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = parts.next().map_or(Some(0), |part| part.parse::<u64>().ok())?;
    let patch = parts.next().map_or(Some(0), |part| part.parse::<u64>().ok())?;

    Some(semver::Version::new(major, minor, patch))
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.core_text {
            Some(core) => f.write_str(core)?,
            None => write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?,
        }
        if let Some(prerelease) = &self.prerelease {
            write!(f, "-{prerelease}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
