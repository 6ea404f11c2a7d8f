//! kvprobe - run the auth-cluster consistency scenario
//!
//! `kvprobe run` drives real etcd member processes; `kvprobe simulate`
//! runs the same scenario against the in-memory cluster. Both print a
//! JSON report on stdout and exit non-zero when the scenario fails.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kvprobe_client::EtcdClientFactory;
use kvprobe_cluster::ProcessCluster;
use kvprobe_core::ProbeError;
use kvprobe_test::{run_auth_cluster, ScenarioFailure, ScenarioReport, SimCluster};

use crate::config::{Overrides, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "kvprobe")]
#[command(about = "Cluster consistency checks for etcd-compatible stores")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start real member processes and run the scenario
    Run(RunArgs),
    /// Run the scenario against an in-memory cluster
    Simulate(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// TOML file with [cluster] and [scenario] tables
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Server binary (overrides ETCD_BIN)
    #[arg(long)]
    etcd_bin: Option<PathBuf>,

    /// Members started before the join
    #[arg(long)]
    members: Option<usize>,

    /// Applied entries between snapshots
    #[arg(long)]
    snapshot_count: Option<u64>,

    /// Workload size; must exceed the snapshot count
    #[arg(long)]
    write_count: Option<u64>,

    /// How long each member may take to become ready, e.g. "20s"
    #[arg(long, value_parser = humantime::parse_duration)]
    startup_timeout: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration)]
    verify_timeout: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            etcd_bin: self.etcd_bin.clone(),
            members: self.members,
            snapshot_count: self.snapshot_count,
            write_count: self.write_count,
            startup_timeout: self.startup_timeout,
            verify_timeout: self.verify_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// Cancel on Ctrl-C so teardown still runs
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling scenario");
            token.cancel();
        }
    });
    cancel
}

async fn run(
    args: &RunArgs,
    simulate: bool,
    cancel: &CancellationToken,
) -> Result<ScenarioReport, ScenarioFailure> {
    let config = RunConfig::load(args.config.as_deref())
        .map(|c| c.apply(&args.overrides()))
        .and_then(|c| c.validate().map(|()| c))
        .map_err(setup_failure)?;

    if simulate {
        let cluster = SimCluster::start(config.cluster.member_count, config.cluster.snapshot_count);
        let factory = cluster.factory();
        return run_auth_cluster(cluster, &factory, &config.scenario, cancel).await;
    }

    let factory = EtcdClientFactory::new(config.cluster.request_timeout());
    // Dropping a half-started cluster kills its members.
    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled("startup".into())),
        started = ProcessCluster::start(config.cluster) => started,
    };
    let cluster = started.map_err(setup_failure)?;
    run_auth_cluster(cluster, &factory, &config.scenario, cancel).await
}

fn setup_failure(error: ProbeError) -> ScenarioFailure {
    ScenarioFailure {
        error,
        teardown: None,
        report: Box::default(),
    }
}

fn print_report(report: &ScenarioReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!(error = %e, "could not serialize report"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let cancel = cancel_on_interrupt();
    let result = match &cli.command {
        Command::Run(args) => run(args, false, &cancel).await,
        Command::Simulate(args) => run(args, true, &cancel).await,
    };

    match result {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            print_report(&failure.report);
            eprintln!("kvprobe: {}", failure);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_durations() {
        let cli = Cli::parse_from([
            "kvprobe",
            "--log-json",
            "simulate",
            "--write-count",
            "12",
            "--verify-timeout",
            "2s",
            "--poll-interval",
            "50ms",
        ]);
        assert!(cli.log_json);
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        let overrides = args.overrides();
        assert_eq!(overrides.write_count, Some(12));
        assert_eq!(overrides.verify_timeout, Some(Duration::from_secs(2)));
        assert_eq!(overrides.poll_interval, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_rejects_bare_number_duration() {
        let parsed = Cli::try_parse_from(["kvprobe", "run", "--verify-timeout", "5000"]);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_simulate_passes() {
        let args = RunArgs {
            config: None,
            etcd_bin: None,
            members: None,
            snapshot_count: None,
            write_count: None,
            startup_timeout: None,
            verify_timeout: Some(Duration::from_secs(1)),
            poll_interval: Some(Duration::from_millis(10)),
        };
        let report = run(&args, true, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.endpoints.len(), 2);
        assert!(report.converged.is_some());
    }

    #[tokio::test]
    async fn test_bad_config_fails_before_start() {
        let args = RunArgs {
            config: None,
            etcd_bin: None,
            members: Some(0),
            snapshot_count: None,
            write_count: None,
            startup_timeout: None,
            verify_timeout: None,
            poll_interval: None,
        };
        let failure = run(&args, true, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(failure.error, ProbeError::Config(_)));
        assert!(failure.report.phases.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_during_startup() {
        use std::os::unix::fs::PermissionsExt;

        // A server that never reports ready.
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("etcd");
        std::fs::write(&bin, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let args = RunArgs {
            config: None,
            etcd_bin: Some(bin),
            members: None,
            snapshot_count: None,
            write_count: None,
            startup_timeout: Some(Duration::from_secs(30)),
            verify_timeout: None,
            poll_interval: None,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let failure = run(&args, false, &cancel).await.unwrap_err();

        match &failure.error {
            ProbeError::Cancelled(phase) => assert_eq!(phase, "startup"),
            other => panic!("unexpected error: {}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
