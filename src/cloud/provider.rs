//! Volume provider: project-scoped cloud operations with the semantics the
//! controller relies on.
//!
//! [`CloudVolumeProvider`] wraps an [`ApiClient`] and owns the parts of the
//! cloud contract that are more than pass-through: single-writer attach
//! enforcement, recognition of the "volume in use" detach refusal, and
//! delete's tolerance of already-absent volumes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::cloud::api::ApiClient;
use crate::cloud::{
    CloudAttachment, CloudNode, CloudVolume, VolumeCreate, VolumePage, STORAGE_FEATURE,
    VOLUME_IN_USE_MESSAGE,
};
use crate::config::Config;
use crate::error::CsiError;
use crate::metadata::MetadataBackend;
use crate::types::VolumeId;

/// Capability the controller reconciler consumes.
///
/// The concrete [`CloudVolumeProvider`] talks to the cloud; tests substitute
/// an in-memory fake.
#[async_trait]
pub trait VolumeProvider: Send + Sync {
    /// List one page of the project's volumes.
    async fn list_volumes(&self, page: Option<u32>) -> Result<VolumePage, CsiError>;

    /// Fetch a volume.  Fails with [`CsiError::VolumeNotFound`] when absent.
    async fn get(&self, volume_id: &VolumeId) -> Result<CloudVolume, CsiError>;

    /// Create a volume.  Returns before provisioning completes; callers poll
    /// [`VolumeProvider::get`] until the state is ready.
    async fn create(&self, request: &VolumeCreate) -> Result<CloudVolume, CsiError>;

    /// Delete a volume.  Succeeds when the volume is already absent; fails
    /// with the retryable [`CsiError::VolumeBusy`] when the provider reports
    /// a transitional state.
    async fn delete(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a compute node, enforcing the single-writer model:
    /// an existing attachment to the same node is returned idempotently, an
    /// attachment to a different node is a hard conflict, and more than one
    /// attachment is an inconsistency.
    async fn attach(&self, volume_id: &VolumeId, node_id: &str)
        -> Result<CloudAttachment, CsiError>;

    /// Detach by attachment ID.  Succeeds when the attachment is already
    /// absent; fails with [`CsiError::VolumeBusy`] when the provider refuses
    /// because the volume is still in use on the server.
    async fn detach(&self, attachment_id: &str) -> Result<(), CsiError>;

    /// List the project's compute nodes.
    async fn nodes(&self) -> Result<Vec<CloudNode>, CsiError>;
}

/// The production [`VolumeProvider`], scoped to one project and facility.
pub struct CloudVolumeProvider {
    api: Arc<dyn ApiClient>,
    project_id: String,
    facility_id: String,
}

impl CloudVolumeProvider {
    /// Build a provider from configuration.
    ///
    /// The API key and project ID are required.  When the facility ID is
    /// absent it is resolved from host metadata: the facility whose code
    /// matches this host's must exist and carry the storage feature.
    pub async fn new(
        config: &Config,
        api: Arc<dyn ApiClient>,
        metadata: &dyn MetadataBackend,
    ) -> Result<Self, CsiError> {
        if config.api_key.is_empty() {
            return Err(CsiError::InvalidArgument("api key not specified".into()));
        }
        if config.project_id.is_empty() {
            return Err(CsiError::InvalidArgument("project id not specified".into()));
        }

        let facility_id = if config.facility_id.is_empty() {
            Self::resolve_facility(api.as_ref(), metadata).await?
        } else {
            config.facility_id.clone()
        };

        info!(project_id = %config.project_id, %facility_id, "cloud volume provider ready");
        Ok(Self {
            api,
            project_id: config.project_id.clone(),
            facility_id,
        })
    }

    /// Map this host's facility code to the provider facility ID, requiring
    /// block-storage support there.
    async fn resolve_facility(
        api: &dyn ApiClient,
        metadata: &dyn MetadataBackend,
    ) -> Result<String, CsiError> {
        let facility_code = metadata.host_identity().await?.facility_code;
        let (facilities, status) = api.list_facilities().await?;
        if !status.is_success() {
            return Err(CsiError::Provider(format!(
                "bad status from list facilities: {}",
                status.message()
            )));
        }

        let facility = facilities
            .into_iter()
            .find(|f| f.code == facility_code)
            .ok_or_else(|| {
                CsiError::Provider(format!("facility {facility_code} not found"))
            })?;
        if !facility.features.iter().any(|f| f == STORAGE_FEATURE) {
            return Err(CsiError::Provider(format!(
                "facility {facility_code} does not support storage volumes"
            )));
        }
        Ok(facility.id)
    }

    /// Facility volumes are provisioned in.
    pub fn facility_id(&self) -> &str {
        &self.facility_id
    }
}

#[async_trait]
impl VolumeProvider for CloudVolumeProvider {
    async fn list_volumes(&self, page: Option<u32>) -> Result<VolumePage, CsiError> {
        let (volumes, status) = self.api.list_volumes(&self.project_id, page).await?;
        if !status.is_success() {
            return Err(CsiError::Provider(format!(
                "bad status from list volumes: {}",
                status.message()
            )));
        }
        Ok(volumes)
    }

    async fn get(&self, volume_id: &VolumeId) -> Result<CloudVolume, CsiError> {
        let (volume, status) = self.api.get_volume(&volume_id.0).await?;
        if status.is_not_found() {
            return Err(CsiError::VolumeNotFound(volume_id.to_string()));
        }
        if !status.is_success() {
            return Err(CsiError::Provider(format!(
                "bad status from get volume {volume_id}: {}",
                status.message()
            )));
        }
        volume.ok_or_else(|| {
            CsiError::Provider(format!("get volume {volume_id} returned no body"))
        })
    }

    #[instrument(skip(self, request), fields(size_gib = request.size_gib))]
    async fn create(&self, request: &VolumeCreate) -> Result<CloudVolume, CsiError> {
        let (volume, status) = self.api.create_volume(&self.project_id, request).await?;
        if !status.is_success() {
            return Err(CsiError::Provider(format!(
                "bad status from create volume: {}",
                status.message()
            )));
        }
        volume.ok_or_else(|| CsiError::Provider("create volume returned no body".into()))
    }

    #[instrument(skip(self))]
    async fn delete(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let status = self.api.delete_volume(&volume_id.0).await?;
        if status.is_not_found() {
            // Already gone; delete is idempotent.
            return Ok(());
        }
        if status.is_unprocessable() {
            return Err(CsiError::VolumeBusy(status.message()));
        }
        if !status.is_success() {
            return Err(CsiError::Provider(format!(
                "bad status from delete volume {volume_id}: {}",
                status.message()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn attach(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<CloudAttachment, CsiError> {
        // Re-derive the attachment state from the provider before acting;
        // nothing is cached locally.
        let volume = self.get(volume_id).await?;

        match volume.attachments.as_slice() {
            [] => {
                let (attachment, status) =
                    self.api.create_attachment(&volume_id.0, node_id).await?;
                if !status.is_success() {
                    return Err(CsiError::Provider(format!(
                        "bad status from attach volume: {}",
                        status.message()
                    )));
                }
                attachment
                    .ok_or_else(|| CsiError::Provider("attach returned no body".into()))
            }
            [existing] if existing.node_id == node_id => {
                // Already attached where requested; hand back the existing
                // attachment.
                let (attachment, status) = self.api.get_attachment(&existing.id).await?;
                if !status.is_success() {
                    return Err(CsiError::Provider(format!(
                        "bad status from get attachment {}: {}",
                        existing.id,
                        status.message()
                    )));
                }
                attachment
                    .ok_or_else(|| CsiError::Provider("get attachment returned no body".into()))
            }
            [existing] => Err(CsiError::AttachedElsewhere {
                node_id: existing.node_id.clone(),
            }),
            many => Err(CsiError::InconsistentAttachments {
                node_ids: many.iter().map(|a| a.node_id.clone()).collect(),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn detach(&self, attachment_id: &str) -> Result<(), CsiError> {
        let status = self.api.delete_attachment(attachment_id).await?;
        if status.is_not_found() {
            return Ok(());
        }
        if status.is_unprocessable()
            && status
                .errors
                .first()
                .is_some_and(|e| e.starts_with(VOLUME_IN_USE_MESSAGE))
        {
            warn!(attachment_id, "volume still in use on the server");
            return Err(CsiError::VolumeBusy(status.message()));
        }
        if !status.is_success() {
            return Err(CsiError::Provider(format!(
                "bad status from detach {attachment_id}: {}",
                status.message()
            )));
        }
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<CloudNode>, CsiError> {
        let (nodes, status) = self.api.list_nodes(&self.project_id).await?;
        if !status.is_success() {
            return Err(CsiError::Provider(format!(
                "bad status from list nodes: {}",
                status.message()
            )));
        }
        Ok(nodes)
    }
}
