//! kvprobe Core - Shared types for the cluster consistency harness
//!
//! This crate defines the types every other kvprobe crate speaks:
//! - Identities, roles and key-range permission grants
//! - Per-member hash observations (HashSnapshot)
//! - The error taxonomy (ProbeError, TransportError)

pub mod auth;
pub mod snapshot;
pub mod error;

pub use auth::*;
pub use snapshot::*;
pub use error::*;
