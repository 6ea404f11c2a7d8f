//! Run configuration: file, then flags

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kvprobe_cluster::ClusterConfig;
use kvprobe_core::{ProbeError, ProbeResult};
use kvprobe_test::ScenarioConfig;

/// `[cluster]` and `[scenario]` tables of a run file.
///
/// A missing table falls back to the same values as a run without a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub cluster: ClusterConfig,
    pub scenario: ScenarioConfig,
}

/// Flag values that override the file
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub etcd_bin: Option<std::path::PathBuf>,
    pub members: Option<usize>,
    pub snapshot_count: Option<u64>,
    pub write_count: Option<u64>,
    pub startup_timeout: Option<Duration>,
    pub verify_timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::stress()
    }
}

impl RunConfig {
    /// Snapshot-stress cluster with the default scenario
    pub fn stress() -> Self {
        RunConfig {
            cluster: ClusterConfig::snapshot_stress(),
            scenario: ScenarioConfig::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> ProbeResult<Self> {
        toml::from_str(text).map_err(|e| ProbeError::Config(e.to_string()))
    }

    /// Load `path` if given, else the stress preset; `ETCD_BIN` applies either way
    pub fn load(path: Option<&Path>) -> ProbeResult<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ProbeError::io(format!("reading {}", path.display()), e))?;
                Self::from_toml_str(&text)?
            }
            None => Self::stress(),
        };
        config.cluster.apply_env();
        Ok(config)
    }

    pub fn apply(mut self, overrides: &Overrides) -> Self {
        if let Some(bin) = &overrides.etcd_bin {
            self.cluster = self.cluster.with_etcd_bin(bin.clone());
        }
        if let Some(members) = overrides.members {
            self.cluster = self.cluster.with_members(members);
        }
        if let Some(count) = overrides.snapshot_count {
            self.cluster = self.cluster.with_snapshot_count(count);
        }
        if let Some(timeout) = overrides.startup_timeout {
            self.cluster = self.cluster.with_startup_timeout(timeout);
        }
        if let Some(count) = overrides.write_count {
            self.scenario = self.scenario.with_write_count(count);
        }
        if let Some(timeout) = overrides.verify_timeout {
            self.scenario = self.scenario.with_verify_timeout(timeout);
        }
        if let Some(interval) = overrides.poll_interval {
            self.scenario = self.scenario.with_poll_interval(interval);
        }
        self
    }

    pub fn validate(&self) -> ProbeResult<()> {
        self.cluster.validate()?;
        self.scenario.validate()
    }
}
