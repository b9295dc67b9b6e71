//! # libcsi-block — CSI plugin for iSCSI-attached elastic block storage
//!
//! `libcsi-block` implements a [Container Storage Interface][csi] plugin for
//! a bare-metal cloud's elastic block storage.  Volumes are provisioned
//! through the cloud's HTTP API and surfaced to nodes as iSCSI targets
//! aggregated under multipath; this crate brokers between the two: the
//! controller service reconciles volumes and attachments against the cloud,
//! and the node service drives the host's iSCSI, multipath, and mount
//! tooling to make an attached volume usable inside a container filesystem
//! tree.
//!
//! Transport uses QUIC (via [`quinn`]) instead of gRPC and follows the RK8s
//! architecture conventions (Tokio async runtime, `tracing` for
//! observability, `thiserror` for structured errors).  Every external seam —
//! the cloud API, the host metadata service, host commands, mounts — is a
//! capability trait with a production implementation and in-memory fakes for
//! tests.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: volumes, capabilities, requests, publish context. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait — volume lifecycle & attachment. |
//! | [`node`] | [`CsiNode`] trait — stage, publish, unpublish, unstage. |
//! | [`config`] | Provider configuration from environment and JSON file. |
//! | [`cloud`] | Cloud API capability, volume provider, description fingerprint. |
//! | [`metadata`] | Host metadata capability — identity and per-volume iSCSI facts. |
//! | [`attacher`] | iSCSI session & multipath binding capability. |
//! | [`mounter`] | Mount / format / block-device inspection capability. |
//! | [`initializer`] | One-time node host configuration. |
//! | [`backend`] | [`IscsiBackend`] — staging state machine & controller reconciler. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod attacher;
pub mod backend;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod initializer;
pub mod message;
pub mod metadata;
pub mod mounter;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::iscsi::IscsiBackend;
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
