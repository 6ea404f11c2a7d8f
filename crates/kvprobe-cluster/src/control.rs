//! Process-control seam

use async_trait::async_trait;

use kvprobe_client::ClientFactory;
use kvprobe_core::{Identity, ProbeResult};

use crate::cluster::{ProcessCluster, ShutdownReport};

/// What a scenario driver needs from the cluster it runs against
#[async_trait]
pub trait ClusterControl: Send {
    /// Client URLs of live members, in the order they were added
    fn endpoints(&self) -> Vec<String>;

    /// Applied entries between store snapshots
    fn snapshot_threshold(&self) -> u64;

    /// Start and join one more member, using `admin` for the membership call
    async fn add_member(
        &mut self,
        factory: &dyn ClientFactory,
        admin: Option<&Identity>,
    ) -> ProbeResult<()>;

    /// Stop every member; consumes the handle
    async fn shutdown(self) -> ProbeResult<ShutdownReport>
    where
        Self: Sized;
}

#[async_trait]
impl ClusterControl for ProcessCluster {
    fn endpoints(&self) -> Vec<String> {
        ProcessCluster::endpoints(self)
    }

    fn snapshot_threshold(&self) -> u64 {
        self.config().snapshot_count
    }

    async fn add_member(
        &mut self,
        factory: &dyn ClientFactory,
        admin: Option<&Identity>,
    ) -> ProbeResult<()> {
        ProcessCluster::add_member(self, factory, admin).await
    }

    async fn shutdown(self) -> ProbeResult<ShutdownReport> {
        ProcessCluster::shutdown(self).await
    }
}
