//! Cluster configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kvprobe_core::{ProbeError, ProbeResult};

/// Environment variable overriding the server binary path
pub const ETCD_BIN_ENV: &str = "ETCD_BIN";

/// Locate the server binary: `ETCD_BIN` first, then `etcd` on `PATH`
pub fn find_etcd_bin() -> Option<PathBuf> {
    if let Some(bin) = std::env::var_os(ETCD_BIN_ENV).filter(|v| !v.is_empty()) {
        let bin = PathBuf::from(bin);
        return bin.is_file().then_some(bin);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("etcd"))
        .find(|candidate| candidate.is_file())
}

/// Configuration for a member process cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Members started by `ProcessCluster::start`
    pub member_count: usize,

    /// Initial cluster token; a unique one is generated when unset
    pub initial_token: Option<String>,

    /// Applied entries between store snapshots
    pub snapshot_count: u64,

    /// Server binary
    pub etcd_bin: PathBuf,

    /// Parent directory for member data dirs (system temp dir when unset)
    pub data_root: Option<PathBuf>,

    /// Loopback host members listen on
    pub host: String,

    pub startup_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            member_count: 1,
            initial_token: None,
            snapshot_count: 10_000,
            etcd_bin: PathBuf::from("etcd"),
            data_root: None,
            host: "127.0.0.1".to_string(),
            startup_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl ClusterConfig {
    /// One member, default snapshot interval
    pub fn single_node() -> Self {
        Self::default()
    }

    /// One member snapshotting every two entries, token "new"
    pub fn snapshot_stress() -> Self {
        Self {
            member_count: 1,
            initial_token: Some("new".to_string()),
            snapshot_count: 2,
            ..Self::default()
        }
    }

    pub fn with_members(mut self, count: usize) -> Self {
        self.member_count = count;
        self
    }

    pub fn with_snapshot_count(mut self, count: u64) -> Self {
        self.snapshot_count = count;
        self
    }

    pub fn with_initial_token(mut self, token: &str) -> Self {
        self.initial_token = Some(token.to_string());
        self
    }

    pub fn with_etcd_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.etcd_bin = path.into();
        self
    }

    pub fn with_data_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_root = Some(path.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse a TOML document; missing fields keep their defaults
    pub fn from_toml_str(text: &str) -> ProbeResult<Self> {
        toml::from_str(text).map_err(|e| ProbeError::Config(e.to_string()))
    }

    /// Load from a TOML file and apply environment overrides
    pub fn load(path: &Path) -> ProbeResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProbeError::io(format!("reading {}", path.display()), e))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Apply `ETCD_BIN` if set
    pub fn apply_env(&mut self) {
        if let Some(bin) = std::env::var_os(ETCD_BIN_ENV).filter(|v| !v.is_empty()) {
            self.etcd_bin = PathBuf::from(bin);
        }
    }

    pub fn validate(&self) -> ProbeResult<()> {
        if self.member_count == 0 {
            return Err(ProbeError::Config("member_count must be at least 1".into()));
        }
        if self.snapshot_count == 0 {
            return Err(ProbeError::Config("snapshot_count must be at least 1".into()));
        }
        if self.initial_token.as_deref().is_some_and(str::is_empty) {
            return Err(ProbeError::Config("initial_token must not be empty".into()));
        }
        if self.startup_timeout_ms == 0 {
            return Err(ProbeError::Config("startup_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
