//! Host metadata capability.
//!
//! Every node in the facility can query a link-local metadata service for
//! facts about itself and about the volumes attached to it.  The cloud attach
//! step hands the node nothing but identifiers, so the portal IPs and target
//! IQN needed for iSCSI always come from here, queried by volume name.
//!
//! Like the cloud API, the service is consumed through a capability trait;
//! deployments bind it to the real HTTP endpoint and tests use fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CsiError;

/// Facts about the host this process runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIdentity {
    /// Short code of the facility the host lives in, e.g. `"ewr1"`.
    pub facility_code: String,
    /// The host's iSCSI initiator IQN.
    pub initiator_iqn: String,
    /// The host's identity as known to the orchestrator.
    pub node_id: String,
}

/// iSCSI reachability data for one volume, from the host's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMetadata {
    /// Derived volume name, e.g. `"volume-3ee59355"`.
    pub name: String,
    /// Portal IP addresses exporting the target.
    pub ips: Vec<String>,
    /// Target IQN.
    pub iqn: String,
}

/// Capability for the host metadata service.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Facts about this host.
    async fn host_identity(&self) -> Result<HostIdentity, CsiError>;

    /// Reachability data for the named volume.  Fails with
    /// [`CsiError::Metadata`] when the service has no entry for the name.
    async fn volume_metadata(&self, volume_name: &str) -> Result<VolumeMetadata, CsiError>;
}
