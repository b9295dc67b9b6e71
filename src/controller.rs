//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle against
//! the cloud API: idempotent creation, deletion, attachment to and
//! detachment from compute nodes, capability validation, and listing.  It is
//! invoked by the orchestrator's control plane during scheduling decisions.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    CreateVolumeRequest, ListVolumesRequest, ListVolumesResponse, PublishContext, Volume,
    VolumeCapability, VolumeId,
};

/// Controller service — centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the existing one when a volume for
    /// this name was already provisioned.
    ///
    /// Does not return until the volume is ready for attachment; a volume
    /// that never becomes ready within the internal polling budget is an
    /// error.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  Idempotent: an absent volume is success.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to the node the orchestrator names.
    ///
    /// The returned [`PublishContext`] must be forwarded to the node's stage
    /// operation; it is the only hand-off between the cloud attach and the
    /// host-side iSCSI work.
    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<PublishContext, CsiError>;

    /// Detach a volume from a node.  Idempotent: an absent volume or
    /// attachment is success.
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError>;

    /// Check whether all of the given capabilities are supported.
    /// Confirmation is all-or-nothing across the requested set.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List volumes, one provider page per call.
    async fn list_volumes(&self, req: ListVolumesRequest)
        -> Result<ListVolumesResponse, CsiError>;

    /// Return the total available capacity in bytes.  The cloud API does not
    /// expose capacity accounting, so this is unimplemented.
    async fn get_capacity(&self) -> Result<u64, CsiError>;
}
