//! QUIC transport layer for CSI messages.
//!
//! This module provides [`client::CsiClient`] and [`server::CsiServer`] that
//! communicate [`CsiMessage`] values over QUIC bi-directional streams using
//! `quinn`.
//!
//! [`CsiMessage`]: crate::message::CsiMessage

pub mod client;
pub mod server;
