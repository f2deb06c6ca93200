//! Deferral, replay, blocking and the command channel

use postgres_lifecycle::UnitStatus;
use postgres_lifecycle::controller::dispatcher::NOT_INITIALISED;
use postgres_lifecycle::controller::operation::{acquire, release};
use postgres_lifecycle::controller::{CommandOutput, Envelope, Outcome};
use postgres_lifecycle::model::{
    BackupType, CertificateKind, OperationKind, S3Config, Signal, SignalKind,
};
use tokio::sync::mpsc;

use crate::common::*;

#[tokio::test]
async fn test_signals_wait_for_initialisation() {
    let cluster = TestCluster::new();
    let mut unit = cluster.unit("pg-0");
    unit.set_leader(true);

    let outcome = unit.dispatch(Signal::PeerTopologyChanged).await;
    assert_eq!(outcome, Outcome::Deferred(NOT_INITIALISED.into()));
    assert_eq!(unit.dispatcher.deferral_count(SignalKind::PeerTopologyChanged), 1);

    // a completed pass that does not initialise re-defers the queue
    assert_eq!(unit.dispatch(Signal::LeaderElected).await, Outcome::Completed);
    assert_eq!(unit.dispatcher.deferral_count(SignalKind::PeerTopologyChanged), 2);
    assert_eq!(unit.dispatcher.deferred().count(), 1);

    assert_eq!(unit.dispatch(Signal::ContainerReady).await, Outcome::Completed);
    assert_eq!(unit.dispatcher.deferred().count(), 0);
    assert_eq!(unit.dispatcher.deferral_count(SignalKind::PeerTopologyChanged), 0);
    assert!(cluster.state().await.initialised);
}

#[tokio::test]
async fn test_identical_signals_queue_once_in_arrival_order() {
    let cluster = TestCluster::new();
    let mut unit = cluster.unit("pg-0");

    unit.dispatch(Signal::PeerTopologyChanged).await;
    unit.dispatch(Signal::S3ConfigChanged { config: None }).await;
    unit.dispatch(Signal::PeerTopologyChanged).await;

    let queued: Vec<SignalKind> = unit.dispatcher.deferred().map(Signal::kind).collect();
    assert_eq!(
        queued,
        vec![SignalKind::PeerTopologyChanged, SignalKind::S3ConfigChanged]
    );
    assert_eq!(unit.dispatcher.deferral_count(SignalKind::PeerTopologyChanged), 2);
}

#[tokio::test]
async fn test_different_payloads_queue_separately() {
    let cluster = TestCluster::new();
    let mut unit = cluster.unit("pg-0");

    unit.dispatch(Signal::PeerDeparted {
        unit: "pg-1".into(),
    })
    .await;
    unit.dispatch(Signal::PeerDeparted {
        unit: "pg-2".into(),
    })
    .await;
    assert_eq!(unit.dispatcher.deferred().count(), 2);
}

#[tokio::test]
async fn test_deferred_s3_binding_replays_after_bootstrap() {
    let cluster = TestCluster::new();
    let mut unit = cluster.unit("pg-0");
    unit.set_leader(true);

    let outcome = unit.bind_s3().await;
    assert!(matches!(outcome, Outcome::Deferred(_)));

    unit.dispatch(Signal::ContainerReady).await;
    let state = cluster.state().await;
    assert_eq!(state.stanza.as_deref(), Some(STANZA));
    assert!(cluster.fake.inner().stanzas.contains(STANZA));
}

#[tokio::test]
async fn test_incomplete_s3_blocks_until_fixed() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;

    let partial = S3Config {
        bucket: Some("backups".into()),
        ..Default::default()
    };
    let outcome = units[0].configure_s3(Some(partial)).await;
    assert!(matches!(outcome, Outcome::Failed(_)));
    assert_eq!(
        units[0].status().await,
        UnitStatus::Blocked("missing S3 parameters: access-key, secret-key".into())
    );

    assert_eq!(units[0].bind_s3().await, Outcome::Completed);
    assert_eq!(units[0].status().await, UnitStatus::Active("Primary".into()));
}

#[tokio::test]
async fn test_stanza_failure_blocks_cluster_until_repository_fixed() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;

    cluster.fake.fail(Fault::InitStanza);
    assert!(matches!(units[0].bind_s3().await, Outcome::Failed(_)));
    let state = cluster.state().await;
    assert_eq!(
        state.blocked.as_deref(),
        Some("failed to initialize stanza, check your S3 settings")
    );
    assert!(state.stanza.is_none());
    assert_eq!(units[0].status().await.name(), "blocked");

    cluster.fake.heal(Fault::InitStanza);
    assert_eq!(units[0].bind_s3().await, Outcome::Completed);
    assert!(cluster.state().await.blocked.is_none());
    assert_eq!(units[0].status().await, UnitStatus::Active("Primary".into()));
}

#[tokio::test]
async fn test_wal_failure_cleared_when_repository_removed() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;

    cluster.fake.fail(Fault::WalArchiving);
    units[0].bind_s3().await;
    assert!(cluster.state().await.blocked.is_some());

    assert_eq!(units[0].configure_s3(None).await, Outcome::Completed);
    assert!(cluster.state().await.blocked.is_none());
}

#[tokio::test]
async fn test_failed_command_is_not_queued() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;

    let result = units[0].backup(BackupType::Full).await;
    assert_eq!(result.unwrap_err(), "S3 relation not established");
    assert_eq!(units[0].dispatcher.deferred().count(), 0);
    assert_eq!(
        units[0]
            .dispatch(Signal::ListBackupsRequested)
            .await,
        Outcome::Failed("S3 relation not established".into())
    );
}

#[tokio::test]
async fn test_commands_answer_through_the_channel() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;
    units[0].bind_s3().await;
    let unit = units.remove(0);

    let (tx, rx) = mpsc::channel(8);
    let handle = tokio::spawn(unit.dispatcher.run(rx));

    let (envelope, reply) = Envelope::command(Signal::CreateBackupRequested {
        backup_type: BackupType::Full,
    });
    tx.send(envelope).await.unwrap();
    match reply.await.unwrap() {
        Ok(CommandOutput::Backup(record)) => assert_eq!(record.id, "2024-01-01T09:00:00Z"),
        other => panic!("unexpected result: {:?}", other),
    }

    let (envelope, reply) = Envelope::command(Signal::RestoreRequested {
        backup_id: Some("2023-01-01T00:00:00Z".into()),
    });
    tx.send(envelope).await.unwrap();
    assert_eq!(reply.await.unwrap(), Err("invalid backup id".to_string()));

    tx.send(Envelope::signal(Signal::PeriodicHealthCheck))
        .await
        .unwrap();
    drop(tx);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_deferral_before_initialisation_writes_nothing() {
    let cluster = TestCluster::new();
    let mut unit = cluster.unit("pg-1");
    let before = cluster.state().await;

    let signals = vec![
        Signal::PeerTopologyChanged,
        Signal::PeerDeparted {
            unit: "pg-2".into(),
        },
        Signal::S3ConfigChanged {
            config: Some(s3_config()),
        },
        Signal::CertificateIssued {
            unit: "pg-1".into(),
            kind: CertificateKind::Internal,
            material: tls_material(),
        },
        Signal::CertificateRemoved {
            unit: "pg-1".into(),
            kind: CertificateKind::External,
        },
    ];
    for signal in signals {
        let outcome = unit.dispatch(signal).await;
        assert_eq!(outcome, Outcome::Deferred(NOT_INITIALISED.into()));
        assert_eq!(cluster.state().await, before);
    }
    assert!(cluster.fake.calls().is_empty());
}

#[tokio::test]
async fn test_bootstrap_deferral_writes_nothing() {
    let cluster = TestCluster::new();
    cluster.fake.set_auto_run(false);
    let mut leader = cluster.unit("pg-0");
    leader.set_leader(true);

    for signal in [Signal::ContainerReady, Signal::LeaderElected] {
        let outcome = leader.dispatch(signal).await;
        assert!(matches!(outcome, Outcome::Deferred(_)));
        let state = cluster.state().await;
        assert_eq!(state.generation, 0);
        assert!(state.credentials.is_none());
        assert!(state.units.is_empty());
    }
    assert!(cluster.fake.calls().is_empty());
}

#[tokio::test]
async fn test_deferral_behind_operation_lock_writes_nothing() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(2).await;
    let mut joiner = cluster.unit("pg-2");
    joiner.dispatch(Signal::ContainerReady).await;

    let other = cluster.unit("pg-9");
    acquire(other.ctx(), OperationKind::Backup).await.unwrap();
    let before = cluster.state().await;

    let outcome = units[1].issue_certificate(CertificateKind::Internal).await;
    assert!(matches!(outcome, Outcome::Deferred(_)));
    let outcome = units[0].dispatch(Signal::PeerTopologyChanged).await;
    assert!(matches!(outcome, Outcome::Deferred(_)));
    let outcome = units[0]
        .dispatch(Signal::PeerDeparted {
            unit: "pg-1".into(),
        })
        .await;
    assert!(matches!(outcome, Outcome::Deferred(_)));

    // replays while the lock is still held change nothing either
    units[0].dispatch(Signal::PeriodicHealthCheck).await;
    units[1].dispatch(Signal::PeriodicHealthCheck).await;
    assert_eq!(cluster.state().await, before);
    assert!(cluster.fake.calls().is_empty());

    release(other.ctx(), OperationKind::Backup).await.unwrap();
    units[1].dispatch(Signal::PeriodicHealthCheck).await;
    assert!(
        cluster
            .fake
            .calls()
            .contains(&"pg-1:install-internal".to_string())
    );
    assert_eq!(units[1].dispatcher.deferred().count(), 0);
}
