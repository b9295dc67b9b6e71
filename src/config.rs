//! Provider configuration.
//!
//! Credentials and scoping for the cloud API come from environment variables,
//! with a JSON config file as fallback: the file (when given) is read first
//! and each field is then overridden by its environment variable when set.
//! The JSON field names match the original deployment config files.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CsiError;

/// Environment variable carrying the API credential.
pub const ENV_API_KEY: &str = "CSI_BLOCK_API_KEY";
/// Environment variable carrying the project identifier.
pub const ENV_PROJECT_ID: &str = "CSI_BLOCK_PROJECT_ID";
/// Environment variable carrying the facility identifier.
pub const ENV_FACILITY_ID: &str = "CSI_BLOCK_FACILITY_ID";
/// Environment variable carrying an alternate API base URL.
pub const ENV_API_URL: &str = "CSI_BLOCK_API_URL";
/// Environment variable carrying an alternate metadata service URL.
pub const ENV_METADATA_URL: &str = "CSI_BLOCK_METADATA_URL";

/// Configuration for the cloud volume provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// API authentication token.
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
    /// Project owning all volumes and nodes this plugin manages.
    #[serde(rename = "projectId", default)]
    pub project_id: String,
    /// Facility to provision volumes in.  May be left empty, in which case
    /// it is resolved from host metadata at provider construction.
    #[serde(rename = "facility-id", default)]
    pub facility_id: String,
    /// Alternate API endpoint.
    #[serde(rename = "base-url", default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Alternate metadata service endpoint.
    #[serde(
        rename = "metadata-url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata_url: Option<String>,
}

impl Config {
    /// Load configuration: JSON file (optional) plus environment overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self, CsiError> {
        let mut config = match path {
            Some(path) => Self::from_file(path).await?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parse the JSON config file at `path`.
    pub async fn from_file(path: &Path) -> Result<Self, CsiError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            CsiError::InvalidArgument(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CsiError::InvalidArgument(format!("cannot parse config {}: {e}", path.display()))
        })
    }

    /// Override each field from its environment variable when set and
    /// non-empty.  The lookup is injected so tests need not mutate the
    /// process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(v) = get(ENV_API_KEY) {
            self.api_key = v;
        }
        if let Some(v) = get(ENV_PROJECT_ID) {
            self.project_id = v;
        }
        if let Some(v) = get(ENV_FACILITY_ID) {
            self.facility_id = v;
        }
        if let Some(v) = get(ENV_API_URL) {
            self.base_url = Some(v);
        }
        if let Some(v) = get(ENV_METADATA_URL) {
            self.metadata_url = Some(v);
        }
    }
}
