//! The auth-cluster scenario driver
//!
//! Threads one cluster handle through fixture, auth enable, workload,
//! denied-write probe, member join, per-endpoint writes and convergence
//! check. Teardown runs on every path.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use kvprobe_client::ClientFactory;
use kvprobe_cluster::ClusterControl;
use kvprobe_core::{MemberExit, ProbeError, ProbeResult};

use crate::fixture::{root_identity, test_identity, Fixture};
use crate::verifier::{verify_converged, Converged};
use crate::workload::{
    client_for, clients_per_endpoint, write_one_each, write_until, WriteSummary, WORKLOAD_VALUE,
};

/// Workload and verifier parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Prefix for workload keys; must fall inside the test role's grant
    pub key_prefix: String,
    /// `write_until` issues `write_count + 1` Puts
    pub write_count: u64,
    /// Key outside every grant, written to confirm denial
    pub denied_key: String,
    pub verify_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            key_prefix: "/test".to_string(),
            write_count: 10,
            denied_key: "/other/key".to_string(),
            verify_timeout_ms: 5_000,
            poll_interval_ms: 100,
        }
    }
}

impl ScenarioConfig {
    pub fn with_write_count(mut self, count: u64) -> Self {
        self.write_count = count;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn from_toml_str(text: &str) -> ProbeResult<Self> {
        toml::from_str(text).map_err(|e| ProbeError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> ProbeResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProbeError::io(format!("reading {}", path.display()), e))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ProbeResult<()> {
        if self.key_prefix.is_empty() {
            return Err(ProbeError::Config("key_prefix must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ProbeError::Config("poll_interval_ms must be positive".into()));
        }
        if self.denied_key.is_empty() {
            return Err(ProbeError::Config("denied_key must not be empty".into()));
        }
        Ok(())
    }
}

/// Wall time spent in one phase
#[derive(Clone, Debug, Serialize)]
pub struct PhaseTiming {
    pub phase: &'static str,
    pub elapsed_ms: u64,
    pub ok: bool,
}

/// Everything observed during one scenario run
#[derive(Clone, Debug, Default, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub phases: Vec<PhaseTiming>,
    pub snapshot_threshold: u64,
    pub writes: Option<WriteSummary>,
    /// Error the store returned for the out-of-grant write
    pub denied_write: Option<String>,
    pub endpoints: Vec<String>,
    pub converged: Option<Converged>,
    pub exits: Vec<MemberExit>,
    #[serde(skip)]
    current: Option<(&'static str, Instant)>,
}

impl ScenarioReport {
    fn new(scenario: &'static str) -> Self {
        ScenarioReport {
            scenario,
            ..Default::default()
        }
    }

    fn begin(&mut self, phase: &'static str) {
        tracing::info!(phase, "phase started");
        self.current = Some((phase, Instant::now()));
    }

    fn end(&mut self, ok: bool) {
        if let Some((phase, started)) = self.current.take() {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            tracing::info!(phase, elapsed_ms, ok, "phase finished");
            self.phases.push(PhaseTiming { phase, elapsed_ms, ok });
        }
    }

    /// Close the running phase with the outcome of `result`
    fn finish<T>(&mut self, result: ProbeResult<T>) -> ProbeResult<T> {
        self.end(result.is_ok());
        result
    }

    /// Phase that was running when the scenario stopped, if any
    pub fn interrupted_phase(&self) -> Option<&'static str> {
        self.current.map(|(phase, _)| phase)
    }
}

/// A failed scenario run: the primary error, a teardown error reported
/// alongside it, and the partial report
#[derive(Error, Debug)]
#[error("{error}{}", teardown_suffix(.teardown))]
pub struct ScenarioFailure {
    #[source]
    pub error: ProbeError,
    pub teardown: Option<ProbeError>,
    pub report: Box<ScenarioReport>,
}

fn teardown_suffix(teardown: &Option<ProbeError>) -> String {
    match teardown {
        Some(e) => format!(" (teardown also failed: {})", e),
        None => String::new(),
    }
}

/// Run the auth-cluster scenario, then shut the cluster down.
///
/// Cancelling `cancel` stops the running phase; teardown still runs.
pub async fn run_auth_cluster<C: ClusterControl>(
    mut cluster: C,
    factory: &dyn ClientFactory,
    config: &ScenarioConfig,
    cancel: &CancellationToken,
) -> Result<ScenarioReport, ScenarioFailure> {
    let mut report = ScenarioReport::new("auth-cluster");
    report.snapshot_threshold = cluster.snapshot_threshold();

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = run_phases(&mut cluster, factory, config, cancel, &mut report) => Some(result),
    };
    let outcome = outcome.unwrap_or_else(|| {
        let phase = report.interrupted_phase().unwrap_or("scenario");
        Err(ProbeError::Cancelled(phase.to_string()))
    });
    if let Err(e) = &outcome {
        tracing::error!(error = %e, "scenario failed, tearing down");
        report.end(false);
    }

    report.begin("teardown");
    let teardown = match cluster.shutdown().await {
        Ok(shutdown) => {
            if shutdown.forced() > 0 {
                tracing::warn!(forced = shutdown.forced(), "members needed SIGKILL");
            }
            report.exits = shutdown.exits;
            report.end(true);
            None
        }
        Err(e) => {
            if let ProbeError::Shutdown { failures } = &e {
                report.exits = failures.clone();
            }
            tracing::error!(error = %e, "teardown failed");
            report.end(false);
            Some(e)
        }
    };

    match (outcome, teardown) {
        (Ok(()), None) => Ok(report),
        (Ok(()), Some(error)) => Err(ScenarioFailure {
            error,
            teardown: None,
            report: Box::new(report),
        }),
        (Err(error), teardown) => Err(ScenarioFailure {
            error,
            teardown,
            report: Box::new(report),
        }),
    }
}

async fn run_phases<C: ClusterControl>(
    cluster: &mut C,
    factory: &dyn ClientFactory,
    config: &ScenarioConfig,
    cancel: &CancellationToken,
    report: &mut ScenarioReport,
) -> ProbeResult<()> {
    report.begin("validate");
    let checked = validate(config, cluster.snapshot_threshold());
    report.finish(checked)?;

    let root = root_identity();
    let test = test_identity();
    let initial = cluster.endpoints();

    report.begin("fixture");
    let admin = client_for(&*cluster, factory, None, None);
    let applied = Fixture::auth_cluster().apply(admin.as_ref()).await;
    report.finish(applied)?;

    report.begin("auth_enable");
    let enabled = admin
        .auth_enable()
        .await
        .map_err(|source| ProbeError::Admin {
            operation: "auth_enable".into(),
            source,
        });
    report.finish(enabled)?;

    report.begin("write");
    let writer = client_for(&*cluster, factory, Some(&test), None);
    let written = write_until(writer.as_ref(), &config.key_prefix, config.write_count).await;
    report.writes = Some(report.finish(written)?);

    report.begin("denied_write");
    let denied = match writer.put(&config.denied_key, WORKLOAD_VALUE).await {
        Err(e) if e.is_permission_denied() => Ok(e.message),
        Err(source) => Err(ProbeError::Write {
            key: config.denied_key.clone(),
            source,
        }),
        Ok(revision) => Err(ProbeError::check(
            "denied_write",
            format!(
                "put of {} as {} succeeded at revision {}",
                config.denied_key, test.username, revision
            ),
        )),
    };
    report.denied_write = Some(report.finish(denied)?);

    report.begin("join");
    let joined = cluster.add_member(factory, Some(&root)).await;
    report.finish(joined)?;

    report.begin("endpoints");
    let endpoints = cluster.endpoints();
    report.endpoints = endpoints.clone();
    let counted = if endpoints.len() == initial.len() + 1 {
        Ok(())
    } else {
        Err(ProbeError::check(
            "endpoints",
            format!("expected {} endpoints, found {}", initial.len() + 1, endpoints.len()),
        ))
    };
    report.finish(counted)?;

    report.begin("write_each");
    let clients = clients_per_endpoint(&endpoints, factory, Some(&test));
    let each = write_one_each(&clients, &config.key_prefix).await;
    report.finish(each)?;

    report.begin("verify");
    let verifier = client_for(&*cluster, factory, Some(&root), None);
    let converged = verify_converged(
        verifier.as_ref(),
        endpoints.len(),
        config.verify_timeout(),
        config.poll_interval(),
        cancel,
    )
    .await;
    report.converged = Some(report.finish(converged)?);

    Ok(())
}

fn validate(config: &ScenarioConfig, threshold: u64) -> ProbeResult<()> {
    config.validate()?;
    if config.write_count <= threshold {
        return Err(ProbeError::Config(format!(
            "write_count {} must exceed the snapshot threshold {}",
            config.write_count, threshold
        )));
    }
    Ok(())
}
