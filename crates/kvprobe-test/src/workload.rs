//! Sequential write workloads

use std::sync::Arc;

use serde::Serialize;

use kvprobe_client::{ClientFactory, KvClient};
use kvprobe_cluster::ClusterControl;
use kvprobe_core::{Identity, ProbeError, ProbeResult};

/// Value stored by `write_until`
pub const WORKLOAD_VALUE: &str = "test";

/// Key suffix written by `write_one_each`
pub const EACH_KEY_SUFFIX: &str = "key";

/// Outcome of a successful `write_until`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub puts: u64,
    pub first_key: String,
    pub last_key: String,
    pub last_revision: i64,
}

/// `prefix/suffix`, without doubling a trailing slash
pub fn workload_key(prefix: &str, suffix: impl std::fmt::Display) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), suffix)
}

/// Client bound to `subset` if given, else every current endpoint
pub fn client_for<C: ClusterControl>(
    cluster: &C,
    factory: &dyn ClientFactory,
    identity: Option<&Identity>,
    subset: Option<&[String]>,
) -> Arc<dyn KvClient> {
    match subset {
        Some(endpoints) => factory.client(endpoints, identity),
        None => factory.client(&cluster.endpoints(), identity),
    }
}

/// One client per endpoint, all bound to `identity`
pub fn clients_per_endpoint(
    endpoints: &[String],
    factory: &dyn ClientFactory,
    identity: Option<&Identity>,
) -> Vec<Arc<dyn KvClient>> {
    endpoints
        .iter()
        .map(|e| factory.client(std::slice::from_ref(e), identity))
        .collect()
}

/// Put `prefix/0 ..= prefix/count`, one at a time; the first failure aborts
pub async fn write_until(client: &dyn KvClient, prefix: &str, count: u64) -> ProbeResult<WriteSummary> {
    let mut last_revision = 0;
    for i in 0..=count {
        let key = workload_key(prefix, i);
        last_revision = client
            .put(&key, WORKLOAD_VALUE)
            .await
            .map_err(|source| ProbeError::Write {
                key: key.clone(),
                source,
            })?;
        if i % 100 == 0 {
            tracing::debug!(key = %key, revision = last_revision, "workload progress");
        }
    }

    let summary = WriteSummary {
        puts: count + 1,
        first_key: workload_key(prefix, 0),
        last_key: workload_key(prefix, count),
        last_revision,
    };
    tracing::info!(
        puts = summary.puts,
        last_revision = summary.last_revision,
        user = ?client.username(),
        "workload complete"
    );
    Ok(summary)
}

/// Exactly one Put per client of `prefix/key`, valued with the client's endpoint
pub async fn write_one_each(clients: &[Arc<dyn KvClient>], prefix: &str) -> ProbeResult<Vec<i64>> {
    let key = workload_key(prefix, EACH_KEY_SUFFIX);
    let mut revisions = Vec::with_capacity(clients.len());
    for client in clients {
        let value = client.endpoints().join(",");
        let revision = client
            .put(&key, &value)
            .await
            .map_err(|source| ProbeError::Write {
                key: key.clone(),
                source,
            })?;
        tracing::debug!(endpoint = %value, revision, "wrote through endpoint");
        revisions.push(revision);
    }
    Ok(revisions)
}
