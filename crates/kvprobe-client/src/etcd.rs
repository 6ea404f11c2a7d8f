//! etcd v3 implementation of the client seam

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, Permission, PermissionType};
use tokio::sync::OnceCell;

use kvprobe_core::{
    Grant, HashSnapshot, Identity, PermissionKind, TransportError, TransportErrorKind,
};

use crate::client::{ClientFactory, KvClient, MemberAddition, MemberInfo};

/// Classify a store error message into a transport error kind
pub fn classify_message(message: &str) -> TransportErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission denied") {
        TransportErrorKind::PermissionDenied
    } else if lower.contains("authentication failed")
        || lower.contains("invalid auth token")
        || lower.contains("user name is empty")
        || lower.contains("unauthenticated")
    {
        TransportErrorKind::AuthFailed
    } else if lower.contains("unavailable")
        || lower.contains("transport error")
        || lower.contains("connection refused")
        || lower.contains("deadline")
        || lower.contains("timed out")
    {
        TransportErrorKind::Unavailable
    } else {
        TransportErrorKind::Other
    }
}

fn permission_type(kind: PermissionKind) -> PermissionType {
    match kind {
        PermissionKind::Read => PermissionType::Read,
        PermissionKind::Write => PermissionType::Write,
        PermissionKind::ReadWrite => PermissionType::Readwrite,
    }
}

/// etcd client bound to one identity and endpoint set.
///
/// Connections are opened on first use and reused afterwards. HashKV goes
/// through one dedicated connection per endpoint so every member answers
/// for itself.
pub struct EtcdKvClient {
    endpoints: Vec<String>,
    credentials: Option<(String, String)>,
    request_timeout: Duration,
    cluster: OnceCell<Client>,
    members: Vec<OnceCell<Client>>,
}

impl EtcdKvClient {
    pub fn new(endpoints: Vec<String>, identity: Option<&Identity>, request_timeout: Duration) -> Self {
        let members = endpoints.iter().map(|_| OnceCell::new()).collect();
        EtcdKvClient {
            endpoints,
            credentials: identity.map(|i| (i.username.clone(), i.password.clone())),
            request_timeout,
            cluster: OnceCell::new(),
            members,
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        let opts = ConnectOptions::new()
            .with_connect_timeout(self.request_timeout)
            .with_timeout(self.request_timeout);
        match &self.credentials {
            Some((user, password)) => opts.with_user(user.clone(), password.clone()),
            None => opts,
        }
    }

    async fn connect(&self, endpoints: &[String], operation: &str) -> Result<Client, TransportError> {
        tracing::debug!(?endpoints, user = ?self.username(), operation, "connecting");
        let connecting = Client::connect(endpoints.to_vec(), Some(self.connect_options()));
        self.bounded(operation, endpoints, connecting).await
    }

    async fn cluster_client(&self, operation: &str) -> Result<Client, TransportError> {
        self.cluster
            .get_or_try_init(|| self.connect(&self.endpoints, operation))
            .await
            .cloned()
    }

    async fn member_client(&self, index: usize, operation: &str) -> Result<Client, TransportError> {
        let endpoint = std::slice::from_ref(&self.endpoints[index]);
        self.members[index]
            .get_or_try_init(|| self.connect(endpoint, operation))
            .await
            .cloned()
    }

    /// HashKV answered by the member behind endpoint `index` alone
    async fn member_hash(&self, index: usize, revision: i64) -> Result<HashSnapshot, TransportError> {
        let endpoint = &self.endpoints[index];
        let mut client = self.member_client(index, "hash_kv").await?;
        let resp = self
            .bounded("hash_kv", std::slice::from_ref(endpoint), client.hash_kv(revision))
            .await?;
        let (member_id, at_revision) = resp
            .header()
            .map(|h| (h.member_id(), h.revision()))
            .unwrap_or_default();
        Ok(HashSnapshot::new(endpoint, member_id, at_revision, resp.hash())
            .with_compact_revision(resp.compact_version()))
    }

    /// Await `fut` under the request timeout, mapping failures to `TransportError`
    async fn bounded<T, F>(
        &self,
        operation: &str,
        endpoints: &[String],
        fut: F,
    ) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let message = e.to_string();
                Err(TransportError::new(
                    classify_message(&message),
                    operation,
                    endpoints,
                    message,
                ))
            }
            Err(_) => Err(TransportError::new(
                TransportErrorKind::Unavailable,
                operation,
                endpoints,
                format!("no response within {:?}", self.request_timeout),
            )),
        }
    }
}

#[async_trait]
impl KvClient for EtcdKvClient {
    fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|(user, _)| user.as_str())
    }

    async fn put(&self, key: &str, value: &str) -> Result<i64, TransportError> {
        let mut client = self.cluster_client("put").await?;
        let resp = self
            .bounded("put", &self.endpoints, client.put(key, value, None))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        tracing::trace!(key, revision, "put");
        Ok(revision)
    }

    async fn hash_kv(&self, revision: i64) -> Result<Vec<HashSnapshot>, TransportError> {
        let mut snapshots = Vec::with_capacity(self.endpoints.len());
        let mut first_error = None;
        for index in 0..self.endpoints.len() {
            match self.member_hash(index, revision).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(
                        endpoint = %self.endpoints[index],
                        error = %e,
                        "member did not answer hash_kv"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if snapshots.is_empty() => Err(e),
            _ => Ok(snapshots),
        }
    }

    async fn user_add(&self, name: &str, password: &str) -> Result<(), TransportError> {
        let mut client = self.cluster_client("user_add").await?;
        self.bounded(
            "user_add",
            &self.endpoints,
            client.user_add(name, password, None),
        )
        .await?;
        Ok(())
    }

    async fn role_add(&self, name: &str) -> Result<(), TransportError> {
        let mut client = self.cluster_client("role_add").await?;
        self.bounded("role_add", &self.endpoints, client.role_add(name))
            .await?;
        Ok(())
    }

    async fn user_grant_role(&self, user: &str, role: &str) -> Result<(), TransportError> {
        let mut client = self.cluster_client("user_grant_role").await?;
        self.bounded(
            "user_grant_role",
            &self.endpoints,
            client.user_grant_role(user, role),
        )
        .await?;
        Ok(())
    }

    async fn role_grant_permission(
        &self,
        role: &str,
        grant: &Grant,
    ) -> Result<(), TransportError> {
        let mut permission = Permission::new(permission_type(grant.kind), grant.range.start().to_vec());
        if let Some(end) = grant.range.end() {
            permission = permission.with_range_end(end.to_vec());
        }

        let mut client = self.cluster_client("role_grant_permission").await?;
        self.bounded(
            "role_grant_permission",
            &self.endpoints,
            client.role_grant_permission(role, permission),
        )
        .await?;
        Ok(())
    }

    async fn auth_enable(&self) -> Result<(), TransportError> {
        let mut client = self.cluster_client("auth_enable").await?;
        self.bounded("auth_enable", &self.endpoints, client.auth_enable())
            .await?;
        Ok(())
    }

    async fn member_add(&self, peer_urls: &[String]) -> Result<MemberAddition, TransportError> {
        let mut client = self.cluster_client("member_add").await?;
        let resp = self
            .bounded(
                "member_add",
                &self.endpoints,
                client.member_add(peer_urls.to_vec(), None),
            )
            .await?;

        let id = resp.member().map(|m| m.id()).ok_or_else(|| {
            TransportError::new(
                TransportErrorKind::Other,
                "member_add",
                &self.endpoints,
                "response carried no member",
            )
        })?;
        let members = resp
            .member_list()
            .iter()
            .map(|m| MemberInfo {
                id: m.id(),
                name: m.name().to_string(),
                peer_urls: m.peer_urls().to_vec(),
            })
            .collect();

        Ok(MemberAddition { id, members })
    }

    async fn member_remove(&self, member_id: u64) -> Result<(), TransportError> {
        let mut client = self.cluster_client("member_remove").await?;
        self.bounded(
            "member_remove",
            &self.endpoints,
            client.member_remove(member_id),
        )
        .await?;
        Ok(())
    }
}

/// Factory producing `EtcdKvClient`s
#[derive(Clone, Debug)]
pub struct EtcdClientFactory {
    request_timeout: Duration,
}

impl EtcdClientFactory {
    pub fn new(request_timeout: Duration) -> Self {
        EtcdClientFactory { request_timeout }
    }
}

impl Default for EtcdClientFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ClientFactory for EtcdClientFactory {
    fn client(&self, endpoints: &[String], identity: Option<&Identity>) -> Arc<dyn KvClient> {
        Arc::new(EtcdKvClient::new(
            endpoints.to_vec(),
            identity,
            self.request_timeout,
        ))
    }
}
