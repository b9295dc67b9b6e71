//! iSCSI block-storage backend.
//!
//! [`IscsiBackend`] implements the three CSI services for cloud block
//! volumes:
//!
//! * the **controller reconciler** — idempotent creation keyed by the
//!   description fingerprint, size/plan negotiation, readiness polling, and
//!   single-writer attach/detach against the [`VolumeProvider`];
//! * the **node staging state machine** — iSCSI discovery/login, multipath
//!   binding, format-if-needed, and mount, with its exact inverse for
//!   teardown, against [`Attacher`] and [`Mounter`].
//!
//! Nothing here caches external state: sessions, bindings, and attachments
//! are re-derived from their system of record on every call, which is what
//! makes each operation safe to retry from the top.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::attacher::Attacher;
use crate::cloud::description::VolumeDescription;
use crate::cloud::provider::VolumeProvider;
use crate::cloud::{self, CloudVolume, VolumeCreate, BILLING_HOURLY, GIB};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::initializer::Initializer;
use crate::metadata::MetadataBackend;
use crate::mounter::{Mounter, SUPPORTED_FS_TYPE};
use crate::node::CsiNode;
use crate::types::*;

/// Advertised plugin name; must match the plugin directory name the kubelet
/// uses.
pub const DRIVER_NAME: &str = "rk8s.block.csi";

/// Storage-class parameter selecting the volume plan.
const PLAN_PARAMETER: &str = "plan";

/// Delay between readiness polls after a create call.
const CREATE_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// How many readiness polls to attempt before giving up.  Together with the
/// interval this bounds how long a create call can block.
const CREATE_POLL_ATTEMPTS: u32 = 20;

/// CSI backend for iSCSI-attached cloud block storage.
pub struct IscsiBackend {
    name: String,
    node_id: String,
    /// Absent on node-only deployments that have no API credential.
    provider: Option<Arc<dyn VolumeProvider>>,
    metadata: Arc<dyn MetadataBackend>,
    attacher: Arc<dyn Attacher>,
    mounter: Arc<dyn Mounter>,
    initializer: Arc<dyn Initializer>,
    node_init: OnceCell<()>,
}

impl IscsiBackend {
    /// Create a node-only backend; add the controller service with
    /// [`Self::with_provider`].
    ///
    /// * `node_id` — this node's identity as known to the orchestrator
    pub fn new(
        node_id: impl Into<String>,
        metadata: Arc<dyn MetadataBackend>,
        attacher: Arc<dyn Attacher>,
        mounter: Arc<dyn Mounter>,
        initializer: Arc<dyn Initializer>,
    ) -> Self {
        Self {
            name: DRIVER_NAME.to_owned(),
            node_id: node_id.into(),
            provider: None,
            metadata,
            attacher,
            mounter,
            initializer,
            node_init: OnceCell::new(),
        }
    }

    /// Enable the controller service backed by `provider`.
    pub fn with_provider(mut self, provider: Arc<dyn VolumeProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    fn provider(&self) -> Result<&Arc<dyn VolumeProvider>, CsiError> {
        self.provider
            .as_ref()
            .ok_or_else(|| CsiError::Unavailable("controller service not configured".into()))
    }

    /// Scan all volume pages for one whose description fingerprint embeds
    /// `name`.  Descriptions that do not decode are volumes someone else
    /// created, never a match and never an error.
    async fn find_volume_by_name(
        provider: &dyn VolumeProvider,
        name: &str,
    ) -> Result<Option<CloudVolume>, CsiError> {
        let mut page = None;
        loop {
            let listing = provider.list_volumes(page).await?;
            for volume in listing.volumes {
                let matched = volume
                    .description
                    .as_deref()
                    .and_then(VolumeDescription::decode)
                    .is_some_and(|desc| desc.name == name);
                if matched {
                    return Ok(Some(volume));
                }
            }
            match listing.next_page {
                Some(next) => page = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Re-fetch `volume_id` until the provider reports it ready.  Exceeding
    /// the attempt budget is fatal: provisioning must resolve within this
    /// call, there is no way to report "still creating" and check back.
    async fn wait_until_ready(
        provider: &dyn VolumeProvider,
        volume_id: &VolumeId,
    ) -> Result<CloudVolume, CsiError> {
        for attempt in 1..=CREATE_POLL_ATTEMPTS {
            let volume = provider.get(volume_id).await?;
            if volume.state.is_ready() {
                debug!(%volume_id, attempt, "volume ready");
                return Ok(volume);
            }
            debug!(%volume_id, attempt, state = ?volume.state, "volume not ready yet");
            if attempt < CREATE_POLL_ATTEMPTS {
                tokio::time::sleep(CREATE_POLL_INTERVAL).await;
            }
        }
        Err(CsiError::Internal(format!(
            "volume {volume_id} still not ready after {CREATE_POLL_ATTEMPTS} attempts"
        )))
    }

    /// Map the orchestrator's node identifier to a provider node ID,
    /// matching hostname first, then any assigned IP address.
    async fn resolve_node_id(
        provider: &dyn VolumeProvider,
        node_id: &str,
    ) -> Result<String, CsiError> {
        let nodes = provider.nodes().await?;
        nodes
            .iter()
            .find(|n| n.hostname == node_id)
            .or_else(|| {
                nodes
                    .iter()
                    .find(|n| n.addresses.iter().any(|a| a == node_id))
            })
            .map(|n| n.id.clone())
            .ok_or_else(|| CsiError::NodeNotFound(node_id.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for IscsiBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        if self.name.is_empty() {
            return Err(CsiError::Unavailable("driver name not configured".into()));
        }
        Ok(PluginInfo {
            name: self.name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for IscsiBackend {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        let provider = self.provider()?;
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        }

        let size_gib = cloud::size_request_gib(req.capacity_range.as_ref());
        let plan_id = cloud::plan_id_for(req.parameters.get(PLAN_PARAMETER).map(String::as_str));

        // Idempotent create: a volume carrying this name in its fingerprint
        // already satisfies the request, provided size and plan agree.
        // Returning a mismatched volume would hand the workload the wrong
        // storage, so that is a hard conflict instead.
        if let Some(existing) = Self::find_volume_by_name(provider.as_ref(), &req.name).await? {
            if existing.size_gib != size_gib {
                return Err(CsiError::AlreadyExists {
                    name: req.name,
                    detail: format!("size {} != {size_gib}", existing.size_gib),
                });
            }
            if existing.plan_id != plan_id {
                return Err(CsiError::AlreadyExists {
                    name: req.name,
                    detail: format!("plan {} != {plan_id}", existing.plan_id),
                });
            }
            debug!(volume_id = %existing.id, "returning existing volume for idempotent create");
            return Ok(Volume {
                volume_id: existing.id.into(),
                capacity_bytes: existing.size_gib * GIB,
            });
        }

        let create = VolumeCreate {
            size_gib,
            billing_cycle: BILLING_HOURLY.to_owned(),
            plan_id: plan_id.to_owned(),
            description: VolumeDescription::new(&req.name).encode(),
        };
        let created = provider.create(&create).await?;

        // The create call returns before provisioning completes.
        let ready =
            Self::wait_until_ready(provider.as_ref(), &VolumeId(created.id.clone())).await?;

        info!(volume_id = %ready.id, size_gib = ready.size_gib, "volume created");
        Ok(Volume {
            volume_id: ready.id.into(),
            capacity_bytes: ready.size_gib * GIB,
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let provider = self.provider()?;
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        provider.delete(volume_id).await?;
        info!(%volume_id, "volume deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<PublishContext, CsiError> {
        let provider = self.provider()?;
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }

        let volume = provider.get(volume_id).await?;
        let provider_node_id = Self::resolve_node_id(provider.as_ref(), node_id).await?;
        let attachment = provider.attach(volume_id, &provider_node_id).await?;

        info!(%volume_id, node_id, attachment_id = %attachment.id, "volume attached");
        Ok(PublishContext {
            attachment_id: attachment.id,
            volume_id: volume_id.0.clone(),
            volume_name: volume.name,
        })
    }

    #[instrument(skip(self))]
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), CsiError> {
        let provider = self.provider()?;
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }

        let volume = match provider.get(volume_id).await {
            Ok(volume) => volume,
            Err(CsiError::VolumeNotFound(_)) => {
                debug!(%volume_id, "volume already gone, nothing to detach");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if volume.attachments.is_empty() {
            debug!(%volume_id, "volume not attached, nothing to detach");
            return Ok(());
        }

        let provider_node_id = Self::resolve_node_id(provider.as_ref(), node_id).await?;
        let attachment = volume
            .attachments
            .iter()
            .find(|a| a.volume_id == volume_id.0 && a.node_id == provider_node_id)
            .ok_or_else(|| {
                CsiError::Internal(format!(
                    "volume {volume_id} has attachments, but none for node {node_id}"
                ))
            })?;

        provider.detach(&attachment.id).await?;
        info!(%volume_id, node_id, "volume detached");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        _volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        // All-or-nothing: one unsupported mode anywhere leaves the whole
        // request unconfirmed.
        let supported = [AccessMode::SingleNodeWriter, AccessMode::SingleNodeReaderOnly];
        Ok(capabilities
            .iter()
            .all(|cap| supported.contains(&cap.access_mode)))
    }

    async fn list_volumes(
        &self,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, CsiError> {
        let provider = self.provider()?;
        let page = match req.starting_token.as_deref() {
            None | Some("") => None,
            Some(token) => Some(token.parse::<u32>().map_err(|_| {
                CsiError::Aborted(format!("unparsable starting token {token:?}"))
            })?),
        };

        let listing = provider.list_volumes(page).await?;
        Ok(ListVolumesResponse {
            entries: listing
                .volumes
                .into_iter()
                .map(|v| Volume {
                    volume_id: v.id.into(),
                    capacity_bytes: v.size_gib * GIB,
                })
                .collect(),
            next_token: listing.next_page.map(|p| p.to_string()),
        })
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented("get_capacity".into()))
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for IscsiBackend {
    #[instrument(
        skip(self, req),
        fields(volume_id = %req.volume_id, staging_target_path = %req.staging_target_path)
    )]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        // The publish context carries the derived name, which is the key for
        // both the metadata lookup and the multipath alias.
        let volume_name = req
            .publish_context
            .get(PublishContext::VOLUME_NAME)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| {
                CsiError::InvalidArgument("publish context is missing the volume name".into())
            })?;
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging target path is required".into(),
            ));
        }
        let fs_type = &req.volume_capability.fs_type;
        if !fs_type.is_empty() && fs_type != SUPPORTED_FS_TYPE {
            return Err(CsiError::InvalidArgument(format!(
                "fs type {fs_type} not supported"
            )));
        }

        let meta = self.metadata.volume_metadata(&volume_name).await?;
        if meta.ips.is_empty() {
            return Err(CsiError::Metadata(format!(
                "volume {volume_name} has no portals"
            )));
        }

        for ip in &meta.ips {
            self.attacher.discover(ip).await?;
            self.attacher.login(ip, &meta.iqn).await?;
        }

        let device = self.attacher.device_path(&meta.ips[0], &meta.iqn).await?;
        let scsi_id = self.attacher.scsi_id(&device).await?;

        let (mut bindings, discards) = self.attacher.read_bindings().await?;
        bindings.insert(volume_name.clone(), scsi_id);
        // Stale auto-generated maps from earlier attach cycles would block
        // the new alias from binding; flushing them is best-effort.
        for alias in discards.keys() {
            if let Err(e) = self.attacher.multipath_flush(alias).await {
                warn!(%alias, error = %e, "failed to flush stale multipath map");
            }
        }
        self.attacher.write_bindings(&bindings).await?;

        // Rescanned twice: on some hosts a single pass does not register the
        // map.  TODO: verify whether the second pass is still needed on
        // current multipath-tools.
        for _ in 0..2 {
            if let Err(e) = self.attacher.multipath_rescan(&volume_name).await {
                warn!(%volume_name, error = %e, "multipath rescan failed");
            }
        }
        match self.attacher.multipath_status(&device).await {
            Ok(listing) if listing.is_empty() => {
                // Detection timing is best-effort; the inspection below is
                // the authoritative check.
                warn!(device = %device.display(), "empty multipath listing");
            }
            Ok(listing) => debug!(device = %device.display(), %listing, "multipath listing"),
            Err(e) => warn!(device = %device.display(), error = %e, "multipath listing failed"),
        }

        let block_info = self.mounter.get_mapped_device(&volume_name).await?;
        if block_info.fs_type.as_deref().unwrap_or_default().is_empty() {
            // No filesystem yet; on a retry after a previous partial stage
            // the filesystem is already there and this is skipped.
            self.mounter.format_mapped_device(&volume_name).await?;
        }

        self.mounter
            .mount_mapped_device(&volume_name, &req.staging_target_path)
            .await?;
        info!(%volume_name, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging target path is required".into(),
            ));
        }
        let volume_name = cloud::volume_id_to_name(&volume_id.0);

        self.mounter.unmount(staging_target_path).await?;

        // Teardown still needs the portal list, so the metadata entry must
        // outlive the attachment.
        let meta = self.metadata.volume_metadata(&volume_name).await?;
        if meta.ips.is_empty() {
            return Err(CsiError::Metadata(format!(
                "volume {volume_name} has no portals"
            )));
        }

        let (mut bindings, discards) = self.attacher.read_bindings().await?;
        bindings.remove(&volume_name);
        self.attacher.write_bindings(&bindings).await?;
        for alias in discards.keys() {
            if let Err(e) = self.attacher.multipath_flush(alias).await {
                warn!(%alias, error = %e, "failed to flush stale multipath map");
            }
        }
        if let Err(e) = self.attacher.multipath_flush(&volume_name).await {
            warn!(%volume_name, error = %e, "failed to flush multipath map");
        }

        for ip in &meta.ips {
            self.attacher.logout(ip, &meta.iqn).await?;
        }

        info!(%volume_name, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path is required".into()));
        }
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging target path is required".into(),
            ));
        }

        self.mounter
            .bindmount(&req.staging_target_path, &req.target_path, req.read_only)
            .await?;
        info!("volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path is required".into()));
        }

        self.mounter.unmount(target_path).await?;
        info!(%volume_id, "volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        // One-time host preparation, collapsed to at-most-once even when the
        // first calls race.
        self.node_init
            .get_or_try_init(|| async {
                let identity = self.metadata.host_identity().await?;
                self.initializer.node_init(&identity.initiator_iqn).await
            })
            .await?;

        Ok(NodeInfo {
            node_id: self.node_id.clone(),
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        if volume_path.is_empty() {
            return Err(CsiError::InvalidArgument("volume path is required".into()));
        }

        let stat = nix::sys::statvfs::statvfs(volume_path)
            .map_err(|e| CsiError::Internal(format!("statvfs {volume_path}: {e}")))?;
        Ok(VolumeStats {
            available_bytes: stat.fragment_size() * stat.blocks_available(),
            total_bytes: stat.fragment_size() * stat.blocks(),
            used_bytes: stat.fragment_size() * (stat.blocks() - stat.blocks_free()),
            available_inodes: stat.files_available(),
            total_inodes: stat.files(),
            used_inodes: stat.files() - stat.files_free(),
        })
    }

    async fn expand_volume(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("node_expand_volume".into()))
    }
}
