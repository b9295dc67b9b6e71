//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the host-side work
//! that makes an attached cloud volume usable by containers:
//!
//! 1. **Stage** — iSCSI discover/login, multipath binding, format if needed,
//!    mount at the global staging path.
//! 2. **Publish** — bind-mount the staging path into the workload's path.
//! 3. **Unpublish** — remove the bind-mount.
//! 4. **Unstage** — unmount, unbind, and log out, in exact reverse order.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
    VolumeStats,
};

/// Node service — host-side attach, mount, and teardown.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: drive it from "attached in the cloud" to "mounted at
    /// the staging path".
    ///
    /// Every sub-step is idempotent, so a failed call is retried from the
    /// top by the orchestrator rather than resumed mid-way.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: the exact inverse of staging, tolerant of
    /// already-torn-down state at every step.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged path into the workload path.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount.  Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Return this node's identity.  The first call also performs one-time
    /// host initialization (initiator identity, multipath configuration).
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Advertise the capabilities supported by this node service.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Filesystem usage for a staged or published volume path.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Grow a volume's filesystem in place.  Not supported by this plugin.
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<(), CsiError>;
}
