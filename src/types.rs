//! Core CSI types: volumes, capabilities, requests, and publish context.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and the iSCSI backend.  They are all [`Serialize`]/[`Deserialize`] so they
//! can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, provider-assigned identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
///
/// The elastic block backend only supports the two single-node modes; the
/// multi-node modes exist so capability validation can recognize and reject
/// them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    SingleNodeWriter,
    /// Single-node read-only.
    SingleNodeReaderOnly,
    /// Multi-node read-only.
    MultiNodeReaderOnly,
    /// Multi-node, at most one writer.
    MultiNodeSingleWriter,
    /// Multi-node read-write.
    MultiNodeMultiWriter,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type.  Empty means "driver default"; the only other
    /// accepted value is `"ext4"`.
    #[serde(default)]
    pub fs_type: String,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            mount_flags: Vec::new(),
            fs_type: String::new(),
        }
    }
}

/// Requested capacity bounds for a new volume, in bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapacityRange {
    /// Minimum acceptable size.
    #[serde(default)]
    pub required_bytes: Option<u64>,
    /// Maximum acceptable size.  Takes priority over `required_bytes` when
    /// both are present.
    #[serde(default)]
    pub limit_bytes: Option<u64>,
}

// ---------------------------------------------------------------------------
// CSI-facing volume & publish context
// ---------------------------------------------------------------------------

/// The volume identity returned to the orchestrator by `create_volume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Provider-assigned volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
}

/// The hand-off value from controller attach to node staging.
///
/// Travels as opaque key/value data in [`NodeStageVolumeRequest`]; the node
/// side extracts the volume name to resolve portal IPs and the IQN from host
/// metadata, because the cloud attach step does not itself supply any iSCSI
/// details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishContext {
    /// Provider attachment identifier.
    pub attachment_id: String,
    /// Provider volume identifier.
    pub volume_id: String,
    /// Derived volume name, e.g. `"volume-3ee59355"`.
    pub volume_name: String,
}

impl PublishContext {
    /// Key under which the attachment ID is stored.
    pub const ATTACHMENT_ID: &'static str = "AttachmentId";
    /// Key under which the volume ID is stored.
    pub const VOLUME_ID: &'static str = "VolumeId";
    /// Key under which the volume name is stored.
    pub const VOLUME_NAME: &'static str = "VolumeName";

    /// Flatten into the opaque key/value map carried by stage requests.
    pub fn into_map(self) -> HashMap<String, String> {
        HashMap::from([
            (Self::ATTACHMENT_ID.to_owned(), self.attachment_id),
            (Self::VOLUME_ID.to_owned(), self.volume_id),
            (Self::VOLUME_NAME.to_owned(), self.volume_name),
        ])
    }

    /// Rebuild from the opaque map.  Returns `None` when any key is absent
    /// or empty.
    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        let get = |key: &str| {
            map.get(key)
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned)
        };
        Some(Self {
            attachment_id: get(Self::ATTACHMENT_ID)?,
            volume_id: get(Self::VOLUME_ID)?,
            volume_name: get(Self::VOLUME_NAME)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Orchestrator-chosen name; the idempotency key for creation.
    pub name: String,
    /// Desired capacity bounds.
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters from the storage class, e.g. `plan`.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to list volumes, with provider-side pagination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Page token from a previous response; maps directly to a provider
    /// page number.
    #[serde(default)]
    pub starting_token: Option<String>,
}

/// One page of volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    /// Volumes on this page.
    pub entries: Vec<Volume>,
    /// Token for the next page, absent on the last page.
    #[serde(default)]
    pub next_token: Option<String>,
}

/// Request to stage a volume on a node: iSCSI login, multipath binding,
/// format, and mount at the staging path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Opaque context carried from `controller_publish_volume`; see
    /// [`PublishContext`].
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a workload path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Target path the workload consumes.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.block.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// Capabilities advertised by the Node service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// The node implements stage/unstage in addition to publish/unpublish.
    StageUnstageVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node identifier as known to the orchestrator (hostname or IP).
    pub node_id: String,
}

/// Filesystem usage for a staged volume, from `statvfs`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VolumeStats {
    /// Bytes available to unprivileged users.
    pub available_bytes: u64,
    /// Total bytes in the filesystem.
    pub total_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
    /// Inodes available.
    pub available_inodes: u64,
    /// Total inodes.
    pub total_inodes: u64,
    /// Inodes in use.
    pub used_inodes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn publish_context_roundtrip() {
        let ctx = PublishContext {
            attachment_id: "att-1".into(),
            volume_id: "3ee59355-a51a-42a8-b848-86626cc532f0".into(),
            volume_name: "volume-3ee59355".into(),
        };
        let map = ctx.clone().into_map();
        assert_eq!(map.len(), 3);
        assert_eq!(PublishContext::from_map(&map), Some(ctx));
    }

    #[test]
    fn publish_context_rejects_missing_or_empty_keys() {
        let mut map = PublishContext {
            attachment_id: "att-1".into(),
            volume_id: "vol-1".into(),
            volume_name: "volume-1".into(),
        }
        .into_map();
        map.insert(PublishContext::VOLUME_NAME.to_owned(), String::new());
        assert!(PublishContext::from_map(&map).is_none());

        map.remove(PublishContext::VOLUME_NAME);
        assert!(PublishContext::from_map(&map).is_none());
    }

    #[test]
    fn create_volume_request_serde_roundtrip() {
        let req = CreateVolumeRequest {
            name: "pv-data".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: Some(10 << 30),
                limit_bytes: Some(100 << 30),
            }),
            volume_capabilities: vec![VolumeCapability::default()],
            parameters: HashMap::from([("plan".into(), "standard".into())]),
        };
        let json = serde_json::to_string(&req).expect("serialize");
        let de: CreateVolumeRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.name, req.name);
        assert_eq!(de.capacity_range.unwrap().limit_bytes, Some(100 << 30));
    }

    #[test]
    fn volume_capability_default() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.access_mode, AccessMode::SingleNodeWriter);
        assert!(cap.fs_type.is_empty());
    }
}
