//! Auth-cluster scenarios against real etcd members.
//!
//! Skipped unless `ETCD_BIN` points at a server binary or `etcd` is on `PATH`.

use std::time::Duration;

use serial_test::serial;
use tokio_util::sync::CancellationToken;

use kvprobe_client::{ClientFactory, EtcdClientFactory};
use kvprobe_cluster::{find_etcd_bin, ClusterConfig, ClusterControl, ProcessCluster};
use kvprobe_core::{ProbeError, TransportErrorKind};
use kvprobe_test::{
    clients_per_endpoint, root_identity, run_auth_cluster, test_identity, verify_converged,
    write_one_each, write_until, Fixture, ScenarioConfig,
};

fn stress_config() -> Option<ClusterConfig> {
    let Some(bin) = find_etcd_bin() else {
        eprintln!("etcd binary not found (set ETCD_BIN); skipping");
        return None;
    };
    Some(
        ClusterConfig::snapshot_stress()
            .with_etcd_bin(bin)
            .with_startup_timeout(Duration::from_secs(20))
            .with_initial_token(&kvprobe_cluster::generate_token()),
    )
}

fn factory(config: &ClusterConfig) -> EtcdClientFactory {
    EtcdClientFactory::new(config.request_timeout())
}

#[tokio::test]
#[serial]
async fn auth_cluster_scenario() {
    let Some(config) = stress_config() else {
        return;
    };
    let factory = factory(&config);
    let cluster = ProcessCluster::start(config).await.unwrap();

    let report = run_auth_cluster(
        cluster,
        &factory,
        &ScenarioConfig::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.writes.as_ref().unwrap().puts, 11);
    assert!(report.denied_write.is_some());
    assert_eq!(report.endpoints.len(), 2);
    assert_eq!(report.converged.as_ref().unwrap().snapshots.len(), 2);
    assert!(report.exits.iter().all(|e| !e.is_failure()));
}

#[tokio::test]
#[serial]
async fn step_by_step_scenarios() {
    let Some(config) = stress_config() else {
        return;
    };
    let factory = factory(&config);
    let mut cluster = ProcessCluster::start(config).await.unwrap();
    let root = root_identity();
    let test = test_identity();

    let admin = factory.client(&cluster.endpoints(), None);
    Fixture::auth_cluster().apply(admin.as_ref()).await.unwrap();
    admin.auth_enable().await.unwrap();

    // Scenario A: writes past the snapshot threshold
    let writer = factory.client(&cluster.endpoints(), Some(&test));
    let summary = write_until(writer.as_ref(), "/test", 10).await.unwrap();
    assert_eq!(summary.puts, 11);

    // Scenario B: outside the grant
    let err = writer.put("/other/key", "test").await.unwrap_err();
    assert_eq!(err.kind, TransportErrorKind::PermissionDenied);

    // Scenario C: join as root, one write per endpoint
    ClusterControl::add_member(&mut cluster, &factory, Some(&root))
        .await
        .unwrap();
    let endpoints = cluster.endpoints();
    assert_eq!(endpoints.len(), 2);
    let clients = clients_per_endpoint(&endpoints, &factory, Some(&test));
    assert_eq!(write_one_each(&clients, "/test").await.unwrap().len(), 2);

    // Scenario D: converge within 5s
    let verifier = factory.client(&endpoints, Some(&root));
    let converged = verify_converged(
        verifier.as_ref(),
        2,
        Duration::from_secs(5),
        Duration::from_millis(100),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(converged.snapshots.len(), 2);

    // Scenario E: expecting a third member can never pass
    let err = verify_converged(
        verifier.as_ref(),
        3,
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
        }
        other => panic!("unexpected error: {}", other),
    }

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn join_without_admin_credentials_fails_cleanly() {
    let Some(config) = stress_config() else {
        return;
    };
    let factory = factory(&config);
    let mut cluster = ProcessCluster::start(config).await.unwrap();

    let admin = factory.client(&cluster.endpoints(), None);
    Fixture::auth_cluster().apply(admin.as_ref()).await.unwrap();
    admin.auth_enable().await.unwrap();

    let err = cluster
        .add_member(&factory, Some(&test_identity()))
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::Join { .. }));
    assert_eq!(cluster.endpoints().len(), 1);

    cluster.shutdown().await.unwrap();
}
