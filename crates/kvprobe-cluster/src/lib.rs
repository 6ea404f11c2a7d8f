//! kvprobe Cluster - Process control for store members
//!
//! This crate provides:
//! - Cluster configuration (TOML, presets, env overrides)
//! - Member process supervision with readiness detection
//! - `ProcessCluster`: start, join, endpoint listing and teardown
//! - `ClusterControl`: the seam scenario drivers run against

pub mod config;
pub mod member;
pub mod cluster;
pub mod control;

pub use config::*;
pub use member::{ClusterState, MemberProcess, MemberSpec, PortReservation, READY_MARKER};
pub use cluster::*;
pub use control::ClusterControl;
