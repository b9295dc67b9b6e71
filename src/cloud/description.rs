//! Volume description fingerprint.
//!
//! The provider has no dedicated idempotency-key field, so the orchestrator's
//! requested volume name rides inside the volume's free-text description as a
//! small versioned JSON blob.  Matching a create request against existing
//! volumes means decoding each description and comparing the embedded name.
//!
//! Volumes created by other tools carry arbitrary description text, so a
//! failed decode is "no match", never an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current fingerprint layout version.
pub const DESCRIPTION_VERSION: u32 = 1;

/// The request fingerprint embedded in a volume's description field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeDescription {
    /// Layout version, for forward compatibility.
    #[serde(default)]
    pub version: u32,
    /// The volume name the orchestrator requested.
    pub name: String,
    /// When the create request was first processed.
    pub created: DateTime<Utc>,
}

impl VolumeDescription {
    /// Build a fresh fingerprint for `name`, stamped now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: DESCRIPTION_VERSION,
            name: name.into(),
            created: Utc::now(),
        }
    }

    /// Serialize for the provider's description field.
    pub fn encode(&self) -> String {
        // A plain struct of strings and a timestamp cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a description blob.  Returns `None` for anything that is not a
    /// fingerprint this plugin wrote.
    pub fn decode(serialized: &str) -> Option<Self> {
        serde_json::from_str(serialized).ok()
    }
}
