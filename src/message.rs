//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the CSI client (control-plane side) and the
//! CSI server (plugin side) via QUIC bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Create a new volume (Controller).
    CreateVolume(CreateVolumeRequest),
    /// Delete a volume (Controller).
    DeleteVolume(VolumeId),
    /// Attach a volume to a node (Controller).
    ControllerPublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    /// Detach a volume from a node (Controller).
    ControllerUnpublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    /// Validate volume capabilities (Controller).
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    /// List volumes, paged (Controller).
    ListVolumes(ListVolumesRequest),
    /// Query remaining capacity (Controller).
    GetCapacity,

    /// Stage a volume on this node (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Unstage a previously staged volume (Node).
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Publish (bind-mount) a staged volume (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Unpublish a previously published volume (Node).
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    /// Query filesystem usage for a volume path (Node).
    GetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    /// Grow a volume's filesystem (Node).
    ExpandVolume {
        volume_id: VolumeId,
        volume_path: String,
    },

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,
    /// Query node info (Node).
    GetNodeInfo,
    /// Query node capabilities (Node).
    GetNodeCapabilities,

    // ----- Responses -------------------------------------------------------
    /// A volume is created and ready.
    VolumeCreated(Volume),
    /// A page of volumes.
    VolumeList(ListVolumesResponse),
    /// A volume was attached; context for the node's stage call.
    VolumePublished(PublishContext),
    /// Available capacity in bytes.
    Capacity(u64),
    /// Whether the requested capabilities are supported.
    CapabilitiesValid(bool),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),
    /// Node capabilities.
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    /// Filesystem usage.
    VolumeStatsResponse(VolumeStats),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({})", id),
            Self::ControllerPublishVolume { volume_id, node_id } => {
                write!(f, "ControllerPublishVolume({volume_id} -> {node_id})")
            }
            Self::ControllerUnpublishVolume { volume_id, node_id } => {
                write!(f, "ControllerUnpublishVolume({volume_id} -x- {node_id})")
            }
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({})", volume_id)
            }
            Self::ListVolumes(req) => write!(
                f,
                "ListVolumes(token={})",
                req.starting_token.as_deref().unwrap_or("-")
            ),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({})", volume_id)
            }
            Self::GetVolumeStats { volume_id, .. } => {
                write!(f, "GetVolumeStats({})", volume_id)
            }
            Self::ExpandVolume { volume_id, .. } => write!(f, "ExpandVolume({})", volume_id),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumeList(page) => write!(f, "VolumeList(count={})", page.entries.len()),
            Self::VolumePublished(ctx) => {
                write!(f, "VolumePublished(attachment={})", ctx.attachment_id)
            }
            Self::Capacity(c) => write!(f, "Capacity({})", c),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({})", v),
            Self::PluginInfoResponse(info) => {
                write!(f, "PluginInfo(name={})", info.name)
            }
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::VolumeStatsResponse(stats) => {
                write!(f, "VolumeStats(used={})", stats.used_bytes)
            }
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serde_roundtrip() {
        let msg = CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "test".into(),
            capacity_range: None,
            volume_capabilities: vec![VolumeCapability::default()],
            parameters: Default::default(),
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de, CsiMessage::CreateVolume(_)));
    }

    #[test]
    fn publish_context_roundtrip() {
        let msg = CsiMessage::VolumePublished(PublishContext {
            attachment_id: "att-1".into(),
            volume_id: "vol-1".into(),
            volume_name: "volume-1".into(),
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        match de {
            CsiMessage::VolumePublished(ctx) => assert_eq!(ctx.attachment_id, "att-1"),
            other => panic!("unexpected variant: {other}"),
        }
    }

    #[test]
    fn error_message_roundtrip() {
        let msg = CsiMessage::Error(CsiError::VolumeNotFound("vol-1".into()));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de, CsiMessage::Error(CsiError::VolumeNotFound(_))));
    }

    #[test]
    fn display_formatting() {
        let msg = CsiMessage::Ok;
        assert_eq!(msg.to_string(), "Ok");

        let msg = CsiMessage::ListVolumes(ListVolumesRequest::default());
        assert_eq!(msg.to_string(), "ListVolumes(token=-)");
    }
}
