//! CSI error types.
//!
//! All errors in the `libcsi-block` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.
//!
//! The variants map onto the CSI status taxonomy: invalid argument, not
//! found, already exists, failed precondition (retryable), aborted,
//! unimplemented, and internal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid or missing request field.
    /// Never retried; the caller must fix the request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// No provider node matched the orchestrator's node identifier.
    #[error("node not found for host/ip {0}")]
    NodeNotFound(String),

    /// A local block device node was not found.
    #[error("device {0} not found")]
    DeviceNotFound(String),

    /// A create request collided with an existing volume of a different
    /// size or plan. Fatal; silently returning the mismatched volume would
    /// hand the workload the wrong storage.
    #[error("volume {name} already exists: {detail}")]
    AlreadyExists {
        /// Requested volume name.
        name: String,
        /// What differed between the request and the existing volume.
        detail: String,
    },

    /// The volume is attached to a different node.
    #[error("volume attached to another node: {node_id}")]
    AttachedElsewhere {
        /// Provider identifier of the node holding the attachment.
        node_id: String,
    },

    /// The volume reports more than one attachment, which the single-writer
    /// model never produces.
    #[error("volume attached to multiple nodes: {node_ids:?}")]
    InconsistentAttachments {
        /// Provider identifiers of all attached nodes.
        node_ids: Vec<String>,
    },

    /// The provider reported the volume busy or in a transitional state.
    /// Retryable after a delay.
    #[error("volume busy: {0}")]
    VolumeBusy(String),

    /// A pagination token could not be parsed.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A host command exited non-zero or could not be spawned.
    #[error("command `{command}` failed: {output}")]
    CommandFailed {
        /// The full command line that was executed.
        command: String,
        /// Combined output (or spawn error) from the command.
        output: String,
    },

    /// The cloud storage API returned a non-success status or the request
    /// never reached it.
    #[error("provider error: {0}")]
    Provider(String),

    /// The host metadata service failed or had no entry for the volume.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// The requested service is not configured in this process.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation is not implemented by this plugin.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::Provider`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn provider<E: std::fmt::Display>(e: E) -> Self {
        Self::Provider(e.to_string())
    }

    /// Create a [`CsiError::Metadata`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn metadata<E: std::fmt::Display>(e: E) -> Self {
        Self::Metadata(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Whether the caller may retry the same request after a delay.
    ///
    /// Only transitional provider states qualify; everything else either
    /// needs a corrected request or operator attention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VolumeBusy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");

        let err = CsiError::AlreadyExists {
            name: "pv-data".into(),
            detail: "size 100 != 200".into(),
        };
        assert_eq!(err.to_string(), "volume pv-data already exists: size 100 != 200");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
    }

    #[test]
    fn retryable_classification() {
        assert!(CsiError::VolumeBusy("still detaching".into()).is_retryable());
        assert!(!CsiError::InvalidArgument("missing name".into()).is_retryable());
        assert!(!CsiError::AttachedElsewhere { node_id: "n1".into() }.is_retryable());
    }
}
