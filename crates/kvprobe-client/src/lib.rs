//! kvprobe Client - Credentialed access to the store under test
//!
//! This crate provides:
//! - The `KvClient` seam every harness phase talks through
//! - `ClientFactory` for binding clients to an identity and endpoint set
//! - An etcd v3 implementation with lazy connection setup

pub mod client;
pub mod etcd;

pub use client::*;
pub use etcd::{classify_message, EtcdClientFactory, EtcdKvClient};
