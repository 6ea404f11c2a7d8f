//! ProcessCluster - a set of member processes owned by one test run

use rand::Rng;
use tempfile::TempDir;

use kvprobe_client::{ClientFactory, MemberAddition};
use kvprobe_core::{Identity, MemberExit, ProbeError, ProbeResult};

use crate::config::ClusterConfig;
use crate::member::{ClusterState, MemberProcess, MemberSpec};

/// Outcome of a clean shutdown
#[derive(Clone, Debug, Default)]
pub struct ShutdownReport {
    pub exits: Vec<MemberExit>,
}

impl ShutdownReport {
    /// Members that had to be killed after the grace period
    pub fn forced(&self) -> usize {
        self.exits.iter().filter(|e| e.forced).count()
    }
}

/// Generate an initial cluster token unique to this run
pub fn generate_token() -> String {
    format!("kvprobe-{:016x}", rand::thread_rng().gen::<u64>())
}

/// Live member processes plus the configuration they were started with.
///
/// `shutdown` consumes the cluster; dropping it without shutting down
/// kills every remaining member.
pub struct ProcessCluster {
    config: ClusterConfig,
    token: String,
    data_dir: TempDir,
    members: Vec<MemberProcess>,
    next_index: usize,
}

impl ProcessCluster {
    /// Start `config.member_count` members and wait for all to be ready
    pub async fn start(config: ClusterConfig) -> ProbeResult<Self> {
        config.validate()?;

        let token = config.initial_token.clone().unwrap_or_else(generate_token);
        let data_dir = match &config.data_root {
            Some(root) => tempfile::Builder::new().prefix("kvprobe-").tempdir_in(root),
            None => tempfile::Builder::new().prefix("kvprobe-").tempdir(),
        }
        .map_err(|e| ProbeError::io("creating cluster data dir", e))?;

        let (specs, reservations): (Vec<_>, Vec<_>) = (0..config.member_count)
            .map(|i| MemberSpec::allocate(i, &config.host, data_dir.path()))
            .collect::<ProbeResult<Vec<_>>>()?
            .into_iter()
            .unzip();
        let initial_cluster = specs
            .iter()
            .map(MemberSpec::initial_cluster_entry)
            .collect::<Vec<_>>()
            .join(",");

        tracing::info!(
            members = config.member_count,
            token = %token,
            snapshot_count = config.snapshot_count,
            data_dir = %data_dir.path().display(),
            "starting cluster"
        );

        let mut cluster = ProcessCluster {
            next_index: specs.len(),
            config,
            token,
            data_dir,
            members: Vec::with_capacity(specs.len()),
        };

        // Spawn everything first: members of a new cluster only report
        // ready once a quorum of peers is up.
        for (spec, ports) in specs.into_iter().zip(reservations) {
            match MemberProcess::spawn(
                &cluster.config,
                spec,
                ports,
                &initial_cluster,
                &cluster.token,
                ClusterState::New,
            ) {
                Ok(member) => cluster.members.push(member),
                Err(e) => {
                    cluster.abort().await;
                    return Err(e);
                }
            }
        }

        let timeout = cluster.config.startup_timeout();
        for index in 0..cluster.members.len() {
            if let Err(e) = cluster.members[index].wait_ready(timeout).await {
                cluster.abort().await;
                return Err(e);
            }
        }

        Ok(cluster)
    }

    /// Register, start and wait for one additional member.
    ///
    /// `admin` must hold administrative privilege once auth is enabled.
    /// On failure the new process is killed, its registration is removed
    /// (best effort), and the cluster keeps its previous members.
    pub async fn add_member(
        &mut self,
        factory: &dyn ClientFactory,
        admin: Option<&Identity>,
    ) -> ProbeResult<()> {
        let (spec, ports) =
            MemberSpec::allocate(self.next_index, &self.config.host, self.data_dir.path())?;
        self.next_index += 1;
        let name = spec.name.clone();

        let client = factory.client(&self.endpoints(), admin);
        let addition = client
            .member_add(std::slice::from_ref(&spec.peer_url))
            .await
            .map_err(|e| ProbeError::Join {
                member: name.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(member = %name, id = addition.id, "member registered with quorum");

        let initial_cluster = join_initial_cluster(&addition, &spec);
        let started = match MemberProcess::spawn(
            &self.config,
            spec,
            ports,
            &initial_cluster,
            &self.token,
            ClusterState::Existing,
        ) {
            Ok(mut member) => match member.wait_ready(self.config.startup_timeout()).await {
                Ok(()) => Ok(member),
                Err(e) => {
                    member.terminate(self.config.shutdown_grace()).await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match started {
            Ok(member) => {
                self.members.push(member);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(member = %name, error = %e, "join failed, removing registration");
                if let Err(remove_err) = client.member_remove(addition.id).await {
                    tracing::warn!(member = %name, error = %remove_err, "member_remove failed");
                }
                Err(ProbeError::Join {
                    member: name,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Client URLs of live members, in the order they were added
    pub fn endpoints(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|m| m.client_url().to_string())
            .collect()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Terminate every member (newest first) and remove the data dir.
    ///
    /// Fails with `Shutdown` if any member exited with a non-zero code.
    pub async fn shutdown(mut self) -> ProbeResult<ShutdownReport> {
        let grace = self.config.shutdown_grace();
        let members = std::mem::take(&mut self.members);
        tracing::info!(members = members.len(), ?grace, "shutting down cluster");

        let mut exits = Vec::with_capacity(members.len());
        for member in members.into_iter().rev() {
            exits.push(member.terminate(grace).await);
        }

        let failures: Vec<MemberExit> = exits.iter().filter(|e| e.is_failure()).cloned().collect();
        if failures.is_empty() {
            Ok(ShutdownReport { exits })
        } else {
            Err(ProbeError::Shutdown { failures })
        }
    }

    /// Kill everything immediately; used when startup fails
    async fn abort(&mut self) {
        for member in std::mem::take(&mut self.members) {
            member.terminate(std::time::Duration::ZERO).await;
        }
    }
}

impl Drop for ProcessCluster {
    fn drop(&mut self) {
        if self.members.is_empty() {
            return;
        }
        tracing::warn!(
            members = self.members.len(),
            "cluster dropped without shutdown, killing members"
        );
        for member in &mut self.members {
            member.start_kill();
        }
    }
}

/// `--initial-cluster` value for a joining member.
///
/// The joining member has no published name yet, so its entry uses the
/// locally chosen one.
fn join_initial_cluster(addition: &MemberAddition, spec: &MemberSpec) -> String {
    let mut entries = Vec::new();
    for member in &addition.members {
        let name = if member.id == addition.id {
            spec.name.as_str()
        } else {
            member.name.as_str()
        };
        for url in &member.peer_urls {
            entries.push(format!("{}={}", name, url));
        }
    }
    entries.join(",")
}
