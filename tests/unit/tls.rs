//! Certificates and TLS server placement

use postgres_lifecycle::controller::Outcome;
use postgres_lifecycle::model::{CertificateKind, Signal, TlsMaterial, TlsServerRole};

use crate::common::*;

#[tokio::test]
async fn test_internal_certificate_restarts_member() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(2).await;

    let outcome = units[0].issue_certificate(CertificateKind::Internal).await;
    assert_eq!(outcome, Outcome::Completed);

    let calls = cluster.fake.calls();
    assert!(calls.contains(&"pg-0:install-internal".to_string()));
    assert!(calls.contains(&"pg-0:restart".to_string()));
    let state = cluster.state().await;
    assert!(state.units["pg-0"].tls_ready);
    assert!(state.operation.is_none());
}

#[tokio::test]
async fn test_external_certificate_does_not_restart() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;

    units[0].issue_certificate(CertificateKind::External).await;
    let calls = cluster.fake.calls();
    assert_eq!(calls, vec!["pg-0:install-external".to_string()]);
}

#[tokio::test]
async fn test_partial_material_is_held_until_complete() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;
    let full = tls_material();

    let partial = TlsMaterial {
        cert: full.cert.clone(),
        ..Default::default()
    };
    units[0]
        .dispatch(Signal::CertificateIssued {
            unit: "pg-0".into(),
            kind: CertificateKind::Internal,
            material: partial,
        })
        .await;
    assert!(cluster.fake.calls().is_empty());

    let rest = TlsMaterial {
        key: full.key.clone(),
        ca: full.ca.clone(),
        ..Default::default()
    };
    units[0]
        .dispatch(Signal::CertificateIssued {
            unit: "pg-0".into(),
            kind: CertificateKind::Internal,
            material: rest,
        })
        .await;
    assert!(
        cluster
            .fake
            .calls()
            .contains(&"pg-0:install-internal".to_string())
    );
}

#[tokio::test]
async fn test_single_unit_never_runs_tls_server() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;

    units[0].issue_certificate(CertificateKind::Internal).await;
    assert_eq!(cluster.fake.tls_server("pg-0"), TlsServerRole::Stopped);
}

#[tokio::test]
async fn test_replica_waits_for_primary_server() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(2).await;

    let outcome = units[1].issue_certificate(CertificateKind::Internal).await;
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(units[1].dispatcher.deferred().count(), 0);
    assert_eq!(cluster.fake.tls_server("pg-1"), TlsServerRole::Stopped);

    units[0].issue_certificate(CertificateKind::Internal).await;
    assert_eq!(cluster.fake.tls_server("pg-0"), TlsServerRole::Primary);

    // placement is revisited by the replica's health check
    units[1].dispatch(Signal::PeriodicHealthCheck).await;
    assert_eq!(cluster.fake.tls_server("pg-1"), TlsServerRole::Replica);
}

#[tokio::test]
async fn test_replica_certificate_is_applied_once() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(2).await;

    units[1].issue_certificate(CertificateKind::Internal).await;
    let after_issue = cluster.state().await;
    assert!(after_issue.units["pg-1"].tls_ready);

    // later passes neither reinstall nor restart
    units[1].dispatch(Signal::PeriodicHealthCheck).await;
    units[1].dispatch(Signal::PeriodicHealthCheck).await;
    let calls = cluster.fake.calls();
    assert_eq!(
        calls,
        vec![
            "pg-1:install-internal".to_string(),
            "pg-1:restart".to_string()
        ]
    );
    assert_eq!(cluster.state().await, after_issue);
}

#[tokio::test]
async fn test_repository_binding_completes_while_placement_waits() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(2).await;
    // the leader is not the primary and no primary-role server runs
    cluster.fake.promote("pg-1");
    units[0].dispatch(Signal::PeriodicHealthCheck).await;
    units[0].issue_certificate(CertificateKind::Internal).await;

    assert_eq!(units[0].bind_s3().await, Outcome::Completed);
    assert_eq!(units[0].dispatcher.deferred().count(), 0);
    assert_eq!(cluster.state().await.stanza.as_deref(), Some(STANZA));
}

#[tokio::test]
async fn test_one_primary_server_across_failover() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(2).await;
    units[0].issue_certificate(CertificateKind::Internal).await;
    units[1].issue_certificate(CertificateKind::Internal).await;
    assert_eq!(cluster.fake.primary_tls_servers(), vec!["pg-0"]);
    assert_eq!(cluster.fake.tls_server("pg-1"), TlsServerRole::Replica);

    cluster.fake.promote("pg-1");

    // the new primary waits for the old one to step down
    units[1].dispatch(Signal::PeriodicHealthCheck).await;
    assert_eq!(cluster.fake.primary_tls_servers(), vec!["pg-0"]);

    units[0].dispatch(Signal::PeriodicHealthCheck).await;
    assert!(cluster.fake.primary_tls_servers().is_empty());

    units[1].dispatch(Signal::PeriodicHealthCheck).await;
    assert_eq!(cluster.fake.primary_tls_servers(), vec!["pg-1"]);

    units[0].dispatch(Signal::PeriodicHealthCheck).await;
    assert_eq!(cluster.fake.tls_server("pg-0"), TlsServerRole::Replica);
    assert_eq!(cluster.state().await.primary_tls_servers(), vec!["pg-1"]);
}

#[tokio::test]
async fn test_certificate_removal_stops_server() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(2).await;
    units[0].issue_certificate(CertificateKind::Internal).await;

    let outcome = units[0]
        .dispatch(Signal::CertificateRemoved {
            unit: "pg-0".into(),
            kind: CertificateKind::Internal,
        })
        .await;
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(cluster.fake.tls_server("pg-0"), TlsServerRole::Stopped);
    assert!(!cluster.state().await.units["pg-0"].tls_ready);
    assert!(
        cluster
            .fake
            .calls()
            .contains(&"pg-0:remove-internal".to_string())
    );
}
