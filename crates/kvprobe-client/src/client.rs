//! Client seam used by every harness phase

use std::sync::Arc;

use async_trait::async_trait;

use kvprobe_core::{Grant, HashSnapshot, Identity, TransportError};

/// A cluster member as reported by the membership API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: u64,
    /// Empty until the member has started and published its name
    pub name: String,
    pub peer_urls: Vec<String>,
}

/// Result of registering a new member with the existing quorum
#[derive(Clone, Debug)]
pub struct MemberAddition {
    /// Id assigned to the new member
    pub id: u64,
    /// Full membership after the addition, new member included
    pub members: Vec<MemberInfo>,
}

/// Client bound to one identity and one endpoint set.
///
/// Calls are awaited one at a time; no pipelining.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Endpoints this client targets
    fn endpoints(&self) -> &[String];

    /// Username the client authenticates as, if any
    fn username(&self) -> Option<&str>;

    /// Store `value` under `key`, returning the new revision
    async fn put(&self, key: &str, value: &str) -> Result<i64, TransportError>;

    /// One snapshot per endpoint that answered; revision 0 means "current".
    ///
    /// Endpoints that fail are skipped, so a short result means a member
    /// did not answer. Fails only when no endpoint answered.
    async fn hash_kv(&self, revision: i64) -> Result<Vec<HashSnapshot>, TransportError>;

    async fn user_add(&self, name: &str, password: &str) -> Result<(), TransportError>;

    async fn role_add(&self, name: &str) -> Result<(), TransportError>;

    async fn user_grant_role(&self, user: &str, role: &str) -> Result<(), TransportError>;

    async fn role_grant_permission(&self, role: &str, grant: &Grant)
        -> Result<(), TransportError>;

    async fn auth_enable(&self) -> Result<(), TransportError>;

    /// Register a new member by its peer URLs
    async fn member_add(&self, peer_urls: &[String]) -> Result<MemberAddition, TransportError>;

    async fn member_remove(&self, member_id: u64) -> Result<(), TransportError>;
}

/// Builds clients bound to an identity and an endpoint set.
///
/// Construction never touches the network.
pub trait ClientFactory: Send + Sync {
    fn client(&self, endpoints: &[String], identity: Option<&Identity>) -> Arc<dyn KvClient>;
}
