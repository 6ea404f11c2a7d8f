//! kvprobe Test - Consistency scenarios against a store cluster
//!
//! This crate provides:
//! - The users/roles fixture applied before auth is enabled
//! - Sequential write workloads
//! - The cross-member convergence verifier
//! - The auth-cluster scenario driver and its report
//! - An in-memory simulated cluster for running scenarios without binaries

pub mod fixture;
pub mod workload;
pub mod verifier;
pub mod scenario;
pub mod sim;

pub use fixture::*;
pub use workload::*;
pub use verifier::*;
pub use scenario::*;
pub use sim::{PutRecord, SimClient, SimClientFactory, SimCluster, SimInspector, SIM_REQUEST_TIMEOUT};
