//! Gates applied to a release after the version check: the minimum OS
//! version a release supports and the share of installations a staged
//! release is offered to.

use log::{info, warn};
use uuid::Uuid;

use crate::manifest::UpdateInfo;
use crate::version::meets_minimum_system_version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutDecision {
    Offer,
    SystemTooOld,
    NotInStage,
}

/// Fresh identifier for an installation that has none yet.
#[must_use]
pub fn new_staging_id() -> String {
    Uuid::new_v4().to_string()
}

/// Percentile in `[0, 100]` this installation falls into. The last four
/// bytes of the id are read as a big-endian integer.
#[must_use]
pub fn staging_percentile(id: &Uuid) -> f64 {
    let bytes = id.as_bytes();
    let tail = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    f64::from(tail) / f64::from(u32::MAX) * 100.0
}

/// Decide whether `info` may be offered to this installation.
///
/// An unknown system version or an absent minimum never blocks. An absent
/// staging percentage means everyone. A `staging_id` that is not a UUID is
/// treated as outside the stage.
#[must_use]
pub fn evaluate(
    info: &UpdateInfo,
    system_version: Option<&str>,
    staging_id: &str,
) -> RolloutDecision {
    if let (Some(system), Some(minimum)) = (system_version, info.minimum_system_version.as_deref())
        && !meets_minimum_system_version(system, minimum)
    {
        info!(
            "Update {} requires system {minimum}, running {system}",
            info.version
        );
        return RolloutDecision::SystemTooOld;
    }

    let Some(percentage) = info.staging_percentage else {
        return RolloutDecision::Offer;
    };
    if percentage >= 100.0 {
        return RolloutDecision::Offer;
    }

    let Ok(id) = Uuid::parse_str(staging_id) else {
        warn!("Ignoring staged release {}: invalid staging id", info.version);
        return RolloutDecision::NotInStage;
    };

    let percentile = staging_percentile(&id);
    if percentile < percentage {
        RolloutDecision::Offer
    } else {
        info!(
            "Update {} is staged to {percentage}% (installation at {percentile:.1}%)",
            info.version
        );
        RolloutDecision::NotInStage
    }
}
