//! Cloud block-storage layer.
//!
//! The cloud API itself is consumed through the [`ApiClient`] capability
//! trait; [`CloudVolumeProvider`] wraps it with project/facility scoping and
//! owns the attach/detach/delete semantics the rest of the crate relies on.
//!
//! [`ApiClient`]: api::ApiClient
//! [`CloudVolumeProvider`]: provider::CloudVolumeProvider

pub mod api;
pub mod description;
pub mod provider;

use serde::{Deserialize, Serialize};

use crate::types::CapacityRange;

/// One Gibibyte in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;
/// Smallest volume the provider will provision, in GiB.
pub const MIN_VOLUME_SIZE_GIB: u64 = 10;
/// Largest volume the provider will provision, in GiB.
pub const MAX_VOLUME_SIZE_GIB: u64 = 10000;
/// Size used when the request carries no capacity range, in GiB.
pub const DEFAULT_VOLUME_SIZE_GIB: u64 = 100;

/// Storage-class parameter value selecting the standard plan.
pub const VOLUME_PLAN_STANDARD: &str = "standard";
/// Provider identifier of the standard plan.
pub const VOLUME_PLAN_STANDARD_ID: &str = "87728148-3155-4992-a730-8d1e6aca8a32";
/// Storage-class parameter value selecting the performance plan.
pub const VOLUME_PLAN_PERFORMANCE: &str = "performance";
/// Provider identifier of the performance plan.
pub const VOLUME_PLAN_PERFORMANCE_ID: &str = "d6570cfb-38fa-4467-92b3-e45d059bb249";

/// Billing cycle sent with every create request.
pub const BILLING_HOURLY: &str = "hourly";

/// Message prefix the provider returns when a detach is refused because the
/// volume is still mounted on the server.
pub const VOLUME_IN_USE_MESSAGE: &str =
    "Cannot detach since volume is actively being used on your server";

/// Facility feature required for block storage.
pub const STORAGE_FEATURE: &str = "storage";

// ---------------------------------------------------------------------------
// Cloud entities
// ---------------------------------------------------------------------------

/// Provider-side lifecycle state of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum VolumeState {
    /// Creation accepted, provisioning in progress.
    Queued,
    /// Provisioned and usable.
    Active,
    /// Any other provider-specific state.
    Other(String),
}

impl From<String> for VolumeState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => Self::Queued,
            "active" => Self::Active,
            _ => Self::Other(s),
        }
    }
}

impl From<VolumeState> for String {
    fn from(state: VolumeState) -> Self {
        match state {
            VolumeState::Queued => "queued".to_owned(),
            VolumeState::Active => "active".to_owned(),
            VolumeState::Other(s) => s,
        }
    }
}

impl VolumeState {
    /// Whether the volume has finished provisioning.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// A volume as reported by the cloud API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudVolume {
    /// Provider-assigned UUID.
    pub id: String,
    /// Provider-derived name, e.g. `"volume-3ee59355"`.
    pub name: String,
    /// Free-text description; carries the [`description::VolumeDescription`]
    /// fingerprint for volumes this plugin created.
    #[serde(default)]
    pub description: Option<String>,
    /// Provisioned size in GiB.
    pub size_gib: u64,
    /// Lifecycle state.
    pub state: VolumeState,
    /// Provider plan identifier.
    pub plan_id: String,
    /// Current attachments; at most one in this design.
    #[serde(default)]
    pub attachments: Vec<CloudAttachment>,
}

/// Links a volume to a compute node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudAttachment {
    /// Provider-assigned attachment UUID.
    pub id: String,
    /// The attached volume.
    pub volume_id: String,
    /// The compute node holding the attachment.
    pub node_id: String,
}

/// A compute node as reported by the cloud API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudNode {
    /// Provider-assigned UUID.
    pub id: String,
    /// Hostname.
    pub hostname: String,
    /// Assigned IP addresses.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// A provider facility (datacenter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudFacility {
    /// Provider-assigned UUID.
    pub id: String,
    /// Short facility code, e.g. `"ewr1"`.
    pub code: String,
    /// Features available in this facility.
    #[serde(default)]
    pub features: Vec<String>,
}

/// Parameters for a volume create call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCreate {
    /// Size in GiB.
    pub size_gib: u64,
    /// Billing cycle, always [`BILLING_HOURLY`].
    pub billing_cycle: String,
    /// Provider plan identifier.
    pub plan_id: String,
    /// Description blob carrying the idempotency fingerprint.
    pub description: String,
}

/// One page of volumes from a paged list call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumePage {
    /// Volumes on this page.
    pub volumes: Vec<CloudVolume>,
    /// Provider page number of the next page, absent on the last page.
    #[serde(default)]
    pub next_page: Option<u32>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Derive the representative volume name from a provider UUID,
/// e.g. `"3ee59355-a51a-42a8-b848-86626cc532f0"` -> `"volume-3ee59355"`.
pub fn volume_id_to_name(id: &str) -> String {
    let prefix = id.split('-').next().unwrap_or(id);
    format!("volume-{prefix}")
}

/// Compute the requested volume size in GiB from a capacity range.
///
/// The limit takes priority over the required minimum when both are present;
/// absent both, the fixed default applies.  The result is always clamped to
/// the provider's [min, max] bounds.
pub fn size_request_gib(range: Option<&CapacityRange>) -> u64 {
    let requested = match range {
        None => DEFAULT_VOLUME_SIZE_GIB,
        Some(range) => match (range.limit_bytes, range.required_bytes) {
            (Some(limit), _) if limit != 0 => limit / GIB,
            (_, Some(required)) if required != 0 => required / GIB,
            _ => DEFAULT_VOLUME_SIZE_GIB,
        },
    };
    requested.clamp(MIN_VOLUME_SIZE_GIB, MAX_VOLUME_SIZE_GIB)
}

/// Map the `plan` storage-class parameter to a provider plan identifier.
/// Unrecognized or absent values fall back to the standard plan.
pub fn plan_id_for(plan: Option<&str>) -> &'static str {
    match plan {
        Some(VOLUME_PLAN_PERFORMANCE) => VOLUME_PLAN_PERFORMANCE_ID,
        _ => VOLUME_PLAN_STANDARD_ID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(required: Option<u64>, limit: Option<u64>) -> CapacityRange {
        CapacityRange {
            required_bytes: required,
            limit_bytes: limit,
        }
    }

    #[test]
    fn size_request_default_without_range() {
        assert_eq!(size_request_gib(None), DEFAULT_VOLUME_SIZE_GIB);
        assert_eq!(
            size_request_gib(Some(&range(None, None))),
            DEFAULT_VOLUME_SIZE_GIB
        );
    }

    #[test]
    fn size_request_limit_beats_required() {
        let r = range(Some(10 * GIB), Some(173 * GIB));
        assert_eq!(size_request_gib(Some(&r)), 173);
    }

    #[test]
    fn size_request_required_when_no_limit() {
        let r = range(Some(42 * GIB), None);
        assert_eq!(size_request_gib(Some(&r)), 42);
    }

    #[test]
    fn size_request_clamps_to_bounds() {
        let too_big = range(None, Some(15000 * GIB));
        assert_eq!(size_request_gib(Some(&too_big)), MAX_VOLUME_SIZE_GIB);

        let too_small = range(Some(1024 * 1024), Some(1024 * 1024));
        assert_eq!(size_request_gib(Some(&too_small)), MIN_VOLUME_SIZE_GIB);
    }

    #[test]
    fn plan_mapping() {
        assert_eq!(plan_id_for(Some("performance")), VOLUME_PLAN_PERFORMANCE_ID);
        assert_eq!(plan_id_for(Some("standard")), VOLUME_PLAN_STANDARD_ID);
        assert_eq!(plan_id_for(Some("turbo")), VOLUME_PLAN_STANDARD_ID);
        assert_eq!(plan_id_for(None), VOLUME_PLAN_STANDARD_ID);
    }

    #[test]
    fn volume_name_from_id() {
        assert_eq!(
            volume_id_to_name("3ee59355-a51a-42a8-b848-86626cc532f0"),
            "volume-3ee59355"
        );
        assert_eq!(volume_id_to_name("plain"), "volume-plain");
    }

    #[test]
    fn volume_state_serde() {
        let v: VolumeState = serde_json::from_str("\"active\"").unwrap();
        assert!(v.is_ready());
        let v: VolumeState = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(v, VolumeState::Queued);
        let v: VolumeState = serde_json::from_str("\"deleting\"").unwrap();
        assert_eq!(v, VolumeState::Other("deleting".into()));
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"deleting\"");
    }
}
