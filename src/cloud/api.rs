//! Raw cloud API capability.
//!
//! [`ApiClient`] is the seam between this crate and the provider's HTTP
//! client.  Every call yields both the decoded body and an [`ApiStatus`], so
//! callers can distinguish "the request never reached the service" (an `Err`)
//! from "the service answered with a non-2xx status" (an `Ok` whose status
//! says so).  Deployments supply an implementation bound to the real HTTP
//! client; tests use in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cloud::{CloudAttachment, CloudFacility, CloudNode, CloudVolume, VolumeCreate, VolumePage};
use crate::error::CsiError;

/// Out-of-band response status from the cloud API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiStatus {
    /// HTTP status code.
    pub code: u16,
    /// Error strings from the response body, if any.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ApiStatus {
    /// A status with the given code and no error strings.
    pub fn code(code: u16) -> Self {
        Self {
            code,
            errors: Vec::new(),
        }
    }

    /// Whether the service reported success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether the service reported the resource absent.
    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    /// Whether the service refused the request because the resource is in a
    /// transitional state.
    pub fn is_unprocessable(&self) -> bool {
        self.code == 422
    }

    /// First error string from the body, or the bare status code.
    pub fn message(&self) -> String {
        self.errors
            .first()
            .cloned()
            .unwrap_or_else(|| format!("status {}", self.code))
    }
}

/// Capability wrapping the cloud block-storage HTTP API.
///
/// An `Err` means the request never completed (transport failure); a
/// non-success [`ApiStatus`] means the service answered and refused.
/// Body values are `None` whenever the service did not return one.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// List one page of a project's volumes.
    async fn list_volumes(
        &self,
        project_id: &str,
        page: Option<u32>,
    ) -> Result<(VolumePage, ApiStatus), CsiError>;

    /// Fetch a single volume with its attachments.
    async fn get_volume(&self, volume_id: &str)
        -> Result<(Option<CloudVolume>, ApiStatus), CsiError>;

    /// Create a volume in a project.  Returns before provisioning completes.
    async fn create_volume(
        &self,
        project_id: &str,
        request: &VolumeCreate,
    ) -> Result<(Option<CloudVolume>, ApiStatus), CsiError>;

    /// Delete a volume.
    async fn delete_volume(&self, volume_id: &str) -> Result<ApiStatus, CsiError>;

    /// Attach a volume to a compute node.
    async fn create_attachment(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> Result<(Option<CloudAttachment>, ApiStatus), CsiError>;

    /// Fetch an existing attachment.
    async fn get_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<(Option<CloudAttachment>, ApiStatus), CsiError>;

    /// Delete an attachment.
    async fn delete_attachment(&self, attachment_id: &str) -> Result<ApiStatus, CsiError>;

    /// List a project's compute nodes.
    async fn list_nodes(&self, project_id: &str)
        -> Result<(Vec<CloudNode>, ApiStatus), CsiError>;

    /// List the provider's facilities.
    async fn list_facilities(&self) -> Result<(Vec<CloudFacility>, ApiStatus), CsiError>;
}
