//! In-memory simulated cluster
//!
//! `SimCluster` stands in for a process cluster when no server binary is
//! around. It keeps one replicated log of Puts, tracks how far each member
//! has applied it, and enforces users, roles and grants once auth is
//! enabled, answering with the same error messages the real server uses so
//! error classification is exercised end to end.
//!
//! Members catch up instantly unless marked lagging. A member marked
//! diverged reports a different hash for the same revision. An
//! unreachable member refuses connections; a stalled one accepts them but
//! only answers HashKV with a timeout after `SIM_REQUEST_TIMEOUT`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use kvprobe_client::{classify_message, ClientFactory, KvClient, MemberAddition, MemberInfo};
use kvprobe_cluster::{ClusterControl, ShutdownReport};
use kvprobe_core::{
    Grant, HashSnapshot, Identity, MemberExit, ProbeError, ProbeResult, Role, TransportError,
};

const ROOT_ROLE: &str = "root";

/// How long a stalled member keeps a request waiting
pub const SIM_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A Put the simulated cluster accepted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutRecord {
    pub key: String,
    pub value: String,
    pub endpoint: String,
    pub user: Option<String>,
    pub revision: i64,
}

#[derive(Debug)]
struct SimMember {
    id: u64,
    name: String,
    endpoint: String,
    peer_url: String,
    applied: usize,
    lagging: bool,
    diverged: bool,
    unreachable: bool,
    stalled: bool,
    exit_code: i32,
    /// Registered through member_add but not started yet
    started: bool,
}

impl SimMember {
    fn info(&self) -> MemberInfo {
        MemberInfo {
            id: self.id,
            name: if self.started { self.name.clone() } else { String::new() },
            peer_urls: vec![self.peer_url.clone()],
        }
    }
}

#[derive(Debug)]
struct SimUser {
    password: String,
    roles: Vec<String>,
}

#[derive(Debug, Default)]
struct SimState {
    users: BTreeMap<String, SimUser>,
    roles: BTreeMap<String, Role>,
    auth_enabled: bool,
    log: Vec<(String, String)>,
    members: Vec<SimMember>,
    snapshot_count: u64,
    next_index: usize,
    next_id: u64,
    puts: Vec<PutRecord>,
    fail_next_join: bool,
    shutdowns: u32,
}

fn sim_error(operation: &str, endpoints: &[String], message: &str) -> TransportError {
    TransportError::new(classify_message(message), operation, endpoints, message)
}

impl SimState {
    fn new(snapshot_count: u64) -> Self {
        SimState {
            snapshot_count,
            next_id: 0x8e9e_05c5_2164_694d,
            ..Default::default()
        }
    }

    fn register_member(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(0x1000_0000_0001);
        self.members.push(SimMember {
            id,
            name: format!("m{}", index),
            endpoint: format!("sim://m{}:2379", index),
            peer_url: format!("sim://m{}:2380", index),
            applied: 0,
            lagging: false,
            diverged: false,
            unreachable: false,
            stalled: false,
            exit_code: 0,
            started: false,
        });
        self.members.len() - 1
    }

    fn start_member(&mut self, slot: usize) {
        let applied = self.log.len();
        let member = &mut self.members[slot];
        member.started = true;
        member.applied = applied;
    }

    fn endpoints(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.started)
            .map(|m| m.endpoint.clone())
            .collect()
    }

    fn member_by_endpoint(&self, endpoint: &str) -> Option<&SimMember> {
        self.members
            .iter()
            .find(|m| m.started && !m.unreachable && m.endpoint == endpoint)
    }

    /// Every bound endpoint must be a live member
    fn check_reachable(&self, operation: &str, endpoints: &[String]) -> Result<(), TransportError> {
        match endpoints.iter().find(|e| self.member_by_endpoint(e).is_none()) {
            Some(dead) => Err(sim_error(
                operation,
                endpoints,
                &format!("transport error: connection refused ({})", dead),
            )),
            None if endpoints.is_empty() => {
                Err(sim_error(operation, endpoints, "unavailable: no endpoints"))
            }
            None => Ok(()),
        }
    }

    /// Resolve the calling user; `None` while auth is off
    fn authenticate(
        &self,
        operation: &str,
        endpoints: &[String],
        credentials: Option<&(String, String)>,
    ) -> Result<Option<String>, TransportError> {
        if !self.auth_enabled {
            return Ok(None);
        }
        let Some((name, password)) = credentials else {
            return Err(sim_error(operation, endpoints, "etcdserver: user name is empty"));
        };
        match self.users.get(name) {
            Some(user) if &user.password == password => Ok(Some(name.clone())),
            _ => Err(sim_error(
                operation,
                endpoints,
                "etcdserver: authentication failed, invalid user ID or password",
            )),
        }
    }

    fn is_root(&self, user: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|u| u.roles.iter().any(|r| r == ROOT_ROLE))
    }

    /// Admin calls need the root role once auth is on
    fn require_admin(
        &self,
        operation: &str,
        endpoints: &[String],
        credentials: Option<&(String, String)>,
    ) -> Result<(), TransportError> {
        self.check_reachable(operation, endpoints)?;
        match self.authenticate(operation, endpoints, credentials)? {
            Some(user) if !self.is_root(&user) => {
                Err(sim_error(operation, endpoints, "etcdserver: permission denied"))
            }
            _ => Ok(()),
        }
    }

    fn can_write(&self, user: &str, key: &str) -> bool {
        if self.is_root(user) {
            return true;
        }
        let Some(account) = self.users.get(user) else {
            return false;
        };
        account
            .roles
            .iter()
            .filter_map(|r| self.roles.get(r))
            .any(|role| role.can_write(key.as_bytes()))
    }

    fn replicate(&mut self) {
        let head = self.log.len();
        for member in self.members.iter_mut().filter(|m| m.started && !m.lagging) {
            member.applied = head;
        }
    }

    fn snapshot_of(&self, member: &SimMember) -> HashSnapshot {
        let mut hasher = Sha256::new();
        if member.diverged {
            hasher.update(member.name.as_bytes());
        }
        for (key, value) in &self.log[..member.applied] {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        HashSnapshot::new(&member.endpoint, member.id, member.applied as i64 + 1, hash)
    }
}

/// In-memory cluster implementing `ClusterControl`
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Start `members` members snapshotting every `snapshot_count` entries
    pub fn start(members: usize, snapshot_count: u64) -> Self {
        let mut state = SimState::new(snapshot_count);
        for _ in 0..members {
            let slot = state.register_member();
            state.start_member(slot);
        }
        tracing::info!(members, snapshot_count, "started simulated cluster");
        SimCluster {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn factory(&self) -> SimClientFactory {
        SimClientFactory {
            state: Arc::clone(&self.state),
        }
    }

    pub fn inspector(&self) -> SimInspector {
        SimInspector {
            state: Arc::clone(&self.state),
        }
    }

    /// Make the next `add_member` fail after registration
    pub fn fail_next_join(&self) {
        self.state.lock().fail_next_join = true;
    }

    /// Stop or resume applying the log on member `index`
    pub fn set_lagging(&self, index: usize, lagging: bool) {
        let mut state = self.state.lock();
        if let Some(member) = state.members.get_mut(index) {
            member.lagging = lagging;
        }
        if !lagging {
            state.replicate();
        }
    }

    /// Make member `index` hash a different key space
    pub fn set_diverged(&self, index: usize, diverged: bool) {
        if let Some(member) = self.state.lock().members.get_mut(index) {
            member.diverged = diverged;
        }
    }

    /// Make member `index` refuse or accept connections
    pub fn set_unreachable(&self, index: usize, unreachable: bool) {
        if let Some(member) = self.state.lock().members.get_mut(index) {
            member.unreachable = unreachable;
        }
    }

    /// Make member `index` sit on HashKV requests until they time out
    pub fn set_stalled(&self, index: usize, stalled: bool) {
        if let Some(member) = self.state.lock().members.get_mut(index) {
            member.stalled = stalled;
        }
    }

    /// Exit code member `index` reports at shutdown
    pub fn set_exit_code(&self, index: usize, code: i32) {
        if let Some(member) = self.state.lock().members.get_mut(index) {
            member.exit_code = code;
        }
    }
}

#[async_trait]
impl ClusterControl for SimCluster {
    fn endpoints(&self) -> Vec<String> {
        self.state.lock().endpoints()
    }

    fn snapshot_threshold(&self) -> u64 {
        self.state.lock().snapshot_count
    }

    async fn add_member(
        &mut self,
        factory: &dyn ClientFactory,
        admin: Option<&Identity>,
    ) -> ProbeResult<()> {
        let client = factory.client(&self.endpoints(), admin);
        let peer_url = format!("sim://m{}:2380", self.state.lock().next_index);
        let addition = client
            .member_add(std::slice::from_ref(&peer_url))
            .await
            .map_err(|e| ProbeError::Join {
                member: peer_url.clone(),
                reason: e.to_string(),
            })?;

        let failed = std::mem::take(&mut self.state.lock().fail_next_join);
        if failed {
            if let Err(e) = client.member_remove(addition.id).await {
                tracing::warn!(error = %e, "member_remove failed");
            }
            return Err(ProbeError::Join {
                member: peer_url,
                reason: "member exited before becoming ready".into(),
            });
        }

        let mut state = self.state.lock();
        if let Some(slot) = state.members.iter().position(|m| m.id == addition.id) {
            state.start_member(slot);
        }
        tracing::info!(id = addition.id, "simulated member joined");
        Ok(())
    }

    async fn shutdown(self) -> ProbeResult<ShutdownReport> {
        let mut state = self.state.lock();
        state.shutdowns += 1;
        let members = std::mem::take(&mut state.members);
        let exits: Vec<MemberExit> = members
            .into_iter()
            .filter(|m| m.started)
            .rev()
            .map(|m| MemberExit {
                member: m.name,
                code: Some(m.exit_code),
                forced: false,
            })
            .collect();

        let failures: Vec<MemberExit> = exits.iter().filter(|e| e.is_failure()).cloned().collect();
        if failures.is_empty() {
            Ok(ShutdownReport { exits })
        } else {
            Err(ProbeError::Shutdown { failures })
        }
    }
}

/// Read-only view of a simulated cluster that outlives its shutdown
#[derive(Clone)]
pub struct SimInspector {
    state: Arc<Mutex<SimState>>,
}

impl SimInspector {
    pub fn puts(&self) -> Vec<PutRecord> {
        self.state.lock().puts.clone()
    }

    pub fn auth_enabled(&self) -> bool {
        self.state.lock().auth_enabled
    }

    pub fn users(&self) -> Vec<(String, Vec<String>)> {
        self.state
            .lock()
            .users
            .iter()
            .map(|(name, user)| (name.clone(), user.roles.clone()))
            .collect()
    }

    pub fn roles(&self) -> Vec<Role> {
        self.state.lock().roles.values().cloned().collect()
    }

    /// Snapshots member `index` would have taken so far
    pub fn snapshots_taken(&self, index: usize) -> u64 {
        let state = self.state.lock();
        match state.members.get(index) {
            Some(member) => member.applied as u64 / state.snapshot_count.max(1),
            None => 0,
        }
    }

    /// Registered members, started or not
    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn shutdowns(&self) -> u32 {
        self.state.lock().shutdowns
    }
}

/// Client factory bound to a simulated cluster
#[derive(Clone)]
pub struct SimClientFactory {
    state: Arc<Mutex<SimState>>,
}

impl ClientFactory for SimClientFactory {
    fn client(&self, endpoints: &[String], identity: Option<&Identity>) -> Arc<dyn KvClient> {
        Arc::new(SimClient {
            state: Arc::clone(&self.state),
            endpoints: endpoints.to_vec(),
            credentials: identity.map(|i| (i.username.clone(), i.password.clone())),
        })
    }
}

/// Client for a simulated cluster
pub struct SimClient {
    state: Arc<Mutex<SimState>>,
    endpoints: Vec<String>,
    credentials: Option<(String, String)>,
}

impl SimClient {
    fn admin<T>(
        &self,
        operation: &str,
        apply: impl FnOnce(&mut SimState) -> Result<T, &'static str>,
    ) -> Result<T, TransportError> {
        let mut state = self.state.lock();
        state.require_admin(operation, &self.endpoints, self.credentials.as_ref())?;
        apply(&mut state).map_err(|message| sim_error(operation, &self.endpoints, message))
    }

    async fn member_hash(&self, endpoint: &str) -> Result<HashSnapshot, TransportError> {
        let target = [endpoint.to_string()];
        let stalled = {
            let state = self.state.lock();
            state.require_admin("hash_kv", &target, self.credentials.as_ref())?;
            state.member_by_endpoint(endpoint).is_some_and(|m| m.stalled)
        };
        if stalled {
            tokio::time::sleep(SIM_REQUEST_TIMEOUT).await;
            return Err(sim_error(
                "hash_kv",
                &target,
                &format!("context deadline exceeded after {:?}", SIM_REQUEST_TIMEOUT),
            ));
        }

        let state = self.state.lock();
        match state.member_by_endpoint(endpoint) {
            Some(member) => Ok(state.snapshot_of(member)),
            None => Err(sim_error(
                "hash_kv",
                &target,
                &format!("transport error: connection refused ({})", endpoint),
            )),
        }
    }
}

#[async_trait]
impl KvClient for SimClient {
    fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|(user, _)| user.as_str())
    }

    async fn put(&self, key: &str, value: &str) -> Result<i64, TransportError> {
        let mut state = self.state.lock();
        state.check_reachable("put", &self.endpoints)?;
        let user = state.authenticate("put", &self.endpoints, self.credentials.as_ref())?;
        if let Some(user) = &user {
            if !state.can_write(user, key) {
                return Err(sim_error("put", &self.endpoints, "etcdserver: permission denied"));
            }
        }

        state.log.push((key.to_string(), value.to_string()));
        state.replicate();
        let revision = state.log.len() as i64 + 1;
        let endpoint = self.endpoints[0].clone();
        state.puts.push(PutRecord {
            key: key.to_string(),
            value: value.to_string(),
            endpoint,
            user,
            revision,
        });
        Ok(revision)
    }

    async fn hash_kv(&self, _revision: i64) -> Result<Vec<HashSnapshot>, TransportError> {
        if self.endpoints.is_empty() {
            return Err(sim_error("hash_kv", &self.endpoints, "unavailable: no endpoints"));
        }
        let mut snapshots = Vec::with_capacity(self.endpoints.len());
        let mut first_error = None;
        for endpoint in &self.endpoints {
            match self.member_hash(endpoint).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(
                        endpoint = %endpoint,
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
        self.admin("user_add", |state| {
            if state.users.contains_key(name) {
                return Err("etcdserver: user name already exists");
            }
            state.users.insert(
                name.to_string(),
                SimUser {
                    password: password.to_string(),
                    roles: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn role_add(&self, name: &str) -> Result<(), TransportError> {
        self.admin("role_add", |state| {
            if state.roles.contains_key(name) {
                return Err("etcdserver: role name already exists");
            }
            state.roles.insert(name.to_string(), Role::new(name));
            Ok(())
        })
    }

    async fn user_grant_role(&self, user: &str, role: &str) -> Result<(), TransportError> {
        self.admin("user_grant_role", |state| {
            if !state.roles.contains_key(role) {
                return Err("etcdserver: role name not found");
            }
            let account = state
                .users
                .get_mut(user)
                .ok_or("etcdserver: user name not found")?;
            if !account.roles.iter().any(|r| r == role) {
                account.roles.push(role.to_string());
            }
            Ok(())
        })
    }

    async fn role_grant_permission(&self, role: &str, grant: &Grant) -> Result<(), TransportError> {
        self.admin("role_grant_permission", |state| {
            let entry = state
                .roles
                .get_mut(role)
                .ok_or("etcdserver: role name not found")?;
            entry.grants.push(grant.clone());
            Ok(())
        })
    }

    async fn auth_enable(&self) -> Result<(), TransportError> {
        self.admin("auth_enable", |state| {
            let root = state
                .users
                .get("root")
                .ok_or("etcdserver: root user does not exist")?;
            if !root.roles.iter().any(|r| r == ROOT_ROLE) {
                return Err("etcdserver: root user does not have root role");
            }
            state.auth_enabled = true;
            Ok(())
        })
    }

    async fn member_add(&self, peer_urls: &[String]) -> Result<MemberAddition, TransportError> {
        self.admin("member_add", |state| {
            if state
                .members
                .iter()
                .any(|m| peer_urls.contains(&m.peer_url))
            {
                return Err("etcdserver: Peer URLs already exists");
            }
            let slot = state.register_member();
            Ok(MemberAddition {
                id: state.members[slot].id,
                members: state.members.iter().map(SimMember::info).collect(),
            })
        })
    }

    async fn member_remove(&self, member_id: u64) -> Result<(), TransportError> {
        self.admin("member_remove", |state| {
            let slot = state
                .members
                .iter()
                .position(|m| m.id == member_id)
                .ok_or("etcdserver: member not found")?;
            state.members.remove(slot);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{root_identity, test_identity, Fixture};
    use crate::verifier::{check_agreement, verify_converged, Mismatch, POLL_GRACE};
    use crate::workload::{clients_per_endpoint, write_one_each, write_until};
    use kvprobe_core::TransportErrorKind;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn with_auth(cluster: &SimCluster) {
        let factory = cluster.factory();
        let admin = factory.client(&cluster.endpoints(), None);
        Fixture::auth_cluster().apply(admin.as_ref()).await.unwrap();
        admin.auth_enable().await.unwrap();
    }

    #[tokio::test]
    async fn test_fixture_is_idempotent_on_fresh_clusters() {
        let mut states = Vec::new();
        for _ in 0..2 {
            let cluster = SimCluster::start(1, 2);
            with_auth(&cluster).await;
            let inspector = cluster.inspector();
            states.push((inspector.users(), inspector.roles(), inspector.auth_enabled()));
        }
        assert_eq!(states[0], states[1]);
        assert!(states[0].2);
    }

    #[tokio::test]
    async fn test_fixture_fails_fast_on_second_run() {
        let cluster = SimCluster::start(1, 2);
        let admin = cluster.factory().client(&cluster.endpoints(), None);
        Fixture::auth_cluster().apply(admin.as_ref()).await.unwrap();

        let err = Fixture::auth_cluster().apply(admin.as_ref()).await.unwrap_err();
        match err {
            ProbeError::Admin { operation, source } => {
                assert_eq!(operation, "user_add(root)");
                assert!(source.message.contains("already exists"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_enable_requires_root() {
        let cluster = SimCluster::start(1, 2);
        let admin = cluster.factory().client(&cluster.endpoints(), None);
        let err = admin.auth_enable().await.unwrap_err();
        assert!(err.message.contains("root user does not exist"));
    }

    // Scenario A
    #[tokio::test]
    async fn test_writes_past_snapshot_threshold() {
        let cluster = SimCluster::start(1, 2);
        with_auth(&cluster).await;

        let client = cluster.factory().client(&cluster.endpoints(), Some(&test_identity()));
        let summary = write_until(client.as_ref(), "/test", 10).await.unwrap();

        assert_eq!(summary.puts, 11);
        assert_eq!(summary.last_key, "/test/10");
        let puts = cluster.inspector().puts();
        assert_eq!(puts.len(), 11);
        assert!(puts.iter().all(|p| p.user.as_deref() == Some("test")));
        assert!(cluster.inspector().snapshots_taken(0) >= 5);

        // Still available after snapshotting.
        assert!(client.put("/test/after", "x").await.is_ok());
    }

    // Scenario B
    #[tokio::test]
    async fn test_put_outside_grant_is_denied() {
        let cluster = SimCluster::start(1, 2);
        with_auth(&cluster).await;

        let client = cluster.factory().client(&cluster.endpoints(), Some(&test_identity()));
        let err = client.put("/other/key", "test").await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::PermissionDenied);
        assert!(client.put("/test0", "ok").await.is_ok());
        assert!(client.put("/test1", "no").await.unwrap_err().is_permission_denied());
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let cluster = SimCluster::start(1, 2);
        with_auth(&cluster).await;

        let wrong = Identity::new("test", "nope");
        let client = cluster.factory().client(&cluster.endpoints(), Some(&wrong));
        let err = client.put("/test/0", "x").await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::AuthFailed);

        let anonymous = cluster.factory().client(&cluster.endpoints(), None);
        let err = anonymous.put("/test/0", "x").await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::AuthFailed);
    }

    // Scenario C
    #[tokio::test]
    async fn test_add_member_and_write_each() {
        let mut cluster = SimCluster::start(1, 2);
        with_auth(&cluster).await;
        let factory = cluster.factory();

        cluster.add_member(&factory, Some(&root_identity())).await.unwrap();
        let endpoints = cluster.endpoints();
        assert_eq!(endpoints.len(), 2);

        let clients = clients_per_endpoint(&endpoints, &factory, Some(&test_identity()));
        let revisions = write_one_each(&clients, "/test").await.unwrap();
        assert_eq!(revisions.len(), 2);

        let puts = cluster.inspector().puts();
        assert_eq!(puts.len(), 2);
        assert_ne!(puts[0].value, puts[1].value);
        assert_eq!(puts[0].key, "/test/key");
    }

    #[tokio::test]
    async fn test_add_member_as_test_user_is_rejected() {
        let mut cluster = SimCluster::start(1, 2);
        with_auth(&cluster).await;
        let factory = cluster.factory();

        let err = cluster
            .add_member(&factory, Some(&test_identity()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Join { .. }));
        assert_eq!(cluster.endpoints().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_join_removes_registration() {
        let mut cluster = SimCluster::start(1, 2);
        let factory = cluster.factory();
        cluster.fail_next_join();

        let err = cluster.add_member(&factory, None).await.unwrap_err();
        assert!(matches!(err, ProbeError::Join { .. }));
        assert_eq!(cluster.inspector().member_count(), 1);
        assert_eq!(cluster.endpoints().len(), 1);

        // Cluster remains usable.
        cluster.add_member(&factory, None).await.unwrap();
        assert_eq!(cluster.endpoints().len(), 2);
    }

    // Scenario D
    #[tokio::test(start_paused = true)]
    async fn test_verify_converges_after_catch_up() {
        let mut cluster = SimCluster::start(1, 2);
        with_auth(&cluster).await;
        let factory = cluster.factory();
        cluster.add_member(&factory, Some(&root_identity())).await.unwrap();

        cluster.set_lagging(1, true);
        let writer = factory.client(&cluster.endpoints(), Some(&test_identity()));
        write_until(writer.as_ref(), "/test", 3).await.unwrap();

        let state = Arc::clone(&cluster.state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            let mut state = state.lock();
            state.members[1].lagging = false;
            state.replicate();
        });

        let root = factory.client(&cluster.endpoints(), Some(&root_identity()));
        let converged = verify_converged(
            root.as_ref(),
            2,
            Duration::from_secs(5),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(converged.polls > 1);
        assert_eq!(converged.snapshots.len(), 2);
        assert_eq!(converged.revision, 5);
    }

    // Scenario E
    #[tokio::test(start_paused = true)]
    async fn test_verify_zero_timeout_on_diverged_pair() {
        let mut cluster = SimCluster::start(1, 2);
        let factory = cluster.factory();
        cluster.add_member(&factory, None).await.unwrap();
        cluster.set_diverged(1, true);

        let client = factory.client(&cluster.endpoints(), None);
        client.put("/test/0", "test").await.unwrap();

        let err = verify_converged(
            client.as_ref(),
            2,
            Duration::ZERO,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            ProbeError::Timeout(timeout) => {
                assert_eq!(timeout.polls, 1);
                assert_eq!(timeout.last.len(), 2);
                assert_eq!(timeout.last[0].revision, timeout.last[1].revision);
                assert_ne!(timeout.last[0].hash, timeout.last[1].hash);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_times_out_on_lagging_member() {
        let mut cluster = SimCluster::start(1, 2);
        let factory = cluster.factory();
        cluster.add_member(&factory, None).await.unwrap();
        cluster.set_lagging(1, true);

        let client = factory.client(&cluster.endpoints(), None);
        client.put("/test/0", "test").await.unwrap();

        let err = verify_converged(
            client.as_ref(),
            2,
            Duration::from_millis(500),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        let ProbeError::Timeout(timeout) = err else {
            panic!("expected timeout");
        };
        assert!(timeout.polls >= 5);
        assert!(timeout.to_string().contains("revisions differ"));
    }

    #[tokio::test]
    async fn test_verify_cancelled() {
        let cluster = SimCluster::start(1, 2);
        let client = cluster.factory().client(&cluster.endpoints(), None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = verify_converged(
            client.as_ref(),
            1,
            Duration::from_secs(5),
            Duration::from_millis(100),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_cancelled_while_polling() {
        let mut cluster = SimCluster::start(1, 2);
        let factory = cluster.factory();
        cluster.add_member(&factory, None).await.unwrap();
        cluster.set_lagging(1, true);

        let client = factory.client(&cluster.endpoints(), None);
        client.put("/test/0", "test").await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = verify_converged(
            client.as_ref(),
            2,
            Duration::from_secs(5),
            Duration::from_millis(100),
            &cancel,
        )
        .await
        .unwrap_err();

        match err {
            ProbeError::Cancelled(phase) => assert_eq!(phase, "verify"),
            other => panic!("unexpected error: {}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_member_is_missing_from_hash_kv() {
        let cluster = SimCluster::start(2, 2);
        let client = cluster.factory().client(&cluster.endpoints(), None);
        client.put("/test/0", "test").await.unwrap();
        cluster.set_unreachable(1, true);

        let snapshots = client.hash_kv(0).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].endpoint, "sim://m0:2379");

        let err = verify_converged(
            client.as_ref(),
            2,
            Duration::ZERO,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        let ProbeError::Timeout(timeout) = err else {
            panic!("expected timeout");
        };
        assert_eq!(timeout.polls, 1);
        assert_eq!(timeout.last, snapshots);
        assert_eq!(
            check_agreement(&timeout.last, 2),
            Err(Mismatch::MemberCount { expected: 2, actual: 1 })
        );
        assert!(timeout.last_reason.unwrap().contains("expected 2 members, 1 answered"));
    }

    #[tokio::test]
    async fn test_hash_kv_fails_when_no_member_answers() {
        let cluster = SimCluster::start(2, 2);
        let client = cluster.factory().client(&cluster.endpoints(), None);
        cluster.set_unreachable(0, true);
        cluster.set_unreachable(1, true);

        let err = client.hash_kv(0).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Unavailable);
        assert!(err.message.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_member_does_not_hold_verify_past_deadline() {
        let cluster = SimCluster::start(2, 2);
        let client = cluster.factory().client(&cluster.endpoints(), None);
        cluster.set_stalled(1, true);

        let started = tokio::time::Instant::now();
        let err = verify_converged(
            client.as_ref(),
            2,
            Duration::ZERO,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        let elapsed = started.elapsed();
        assert!(elapsed >= POLL_GRACE);
        assert!(elapsed < SIM_REQUEST_TIMEOUT);
        let ProbeError::Timeout(timeout) = err else {
            panic!("expected timeout");
        };
        assert_eq!(timeout.polls, 1);
        assert!(timeout.last_reason.unwrap().contains("verify deadline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_member_times_out_alone() {
        let cluster = SimCluster::start(2, 2);
        let client = cluster.factory().client(&cluster.endpoints(), None);
        cluster.set_stalled(0, true);

        let snapshots = client.hash_kv(0).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].endpoint, "sim://m1:2379");
    }

    #[tokio::test]
    async fn test_hash_kv_requires_root_once_auth_is_on() {
        let cluster = SimCluster::start(1, 2);
        with_auth(&cluster).await;

        let client = cluster.factory().client(&cluster.endpoints(), Some(&test_identity()));
        assert!(client.hash_kv(0).await.unwrap_err().is_permission_denied());

        let root = cluster.factory().client(&cluster.endpoints(), Some(&root_identity()));
        assert_eq!(root.hash_kv(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_reports_non_zero_exit() {
        let cluster = SimCluster::start(2, 2);
        cluster.set_exit_code(0, 2);
        let inspector = cluster.inspector();

        let err = cluster.shutdown().await.unwrap_err();
        match err {
            ProbeError::Shutdown { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].member, "m0");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(inspector.shutdowns(), 1);
    }
}
