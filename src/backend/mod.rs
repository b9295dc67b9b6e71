//! Storage backend implementations.
//!
//! [`iscsi::IscsiBackend`] implements [`CsiIdentity`], [`CsiController`],
//! and [`CsiNode`] for cloud block volumes surfaced over iSCSI/multipath.
//!
//! [`CsiIdentity`]: crate::identity::CsiIdentity
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

pub mod iscsi;

#[cfg(test)]
mod fakes;
