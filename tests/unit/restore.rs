//! Restore from the repository

use postgres_lifecycle::UnitStatus;
use postgres_lifecycle::controller::CommandOutput;
use postgres_lifecycle::controller::restore::{
    INVALID_BACKUP_ID, MISSING_BACKUP_ID, REQUIRES_LEADER, REQUIRES_SINGLE_UNIT, RESTORE_FAILED,
    STOP_FAILED,
};
use postgres_lifecycle::model::{BackupType, Signal};

use crate::common::*;

/// Single bootstrapped unit with the repository bound
async fn ready_unit(cluster: &TestCluster) -> TestUnit {
    let mut units = cluster.bootstrap(1).await;
    let mut unit = units.remove(0);
    unit.bind_s3().await;
    unit
}

#[tokio::test]
async fn test_restore_to_differential_reproduces_rows() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;

    cluster.fake.insert_rows(&["a", "b"]);
    unit.backup(BackupType::Full).await.unwrap();
    cluster.fake.insert_rows(&["c"]);
    unit.backup(BackupType::Differential).await.unwrap();
    cluster.fake.insert_rows(&["d"]);

    let output = unit.restore("2024-01-01T09:01:00Z").await.unwrap();
    assert_eq!(
        output,
        CommandOutput::RestoreStarted {
            backup_id: "2024-01-01T09:01:00Z".into()
        }
    );
    assert_eq!(cluster.fake.rows(), vec!["a", "b", "c"]);
    assert_eq!(cluster.fake.inner().metadata_cleared, 1);

    let state = cluster.state().await;
    assert_eq!(state.restoring.as_deref(), Some("2024-01-01T09:01:00Z"));
    assert!(state.operation.is_none());
    assert_eq!(
        unit.status().await,
        UnitStatus::Maintenance("restoring backup 2024-01-01T09:01:00Z".into())
    );

    // completion is picked up by the health check
    unit.dispatch(Signal::PeriodicHealthCheck).await;
    assert!(cluster.state().await.restoring.is_none());
    assert_eq!(unit.status().await, UnitStatus::Active("Primary".into()));
}

#[tokio::test]
async fn test_restore_by_engine_label() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    cluster.fake.insert_rows(&["a"]);
    unit.backup(BackupType::Full).await.unwrap();

    let output = unit.restore("20240101-090000F").await.unwrap();
    assert_eq!(
        output,
        CommandOutput::RestoreStarted {
            backup_id: "2024-01-01T09:00:00Z".into()
        }
    );
}

#[tokio::test]
async fn test_restore_still_starting_keeps_maintenance() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    unit.backup(BackupType::Full).await.unwrap();

    cluster.fake.set_auto_run(false);
    unit.restore("2024-01-01T09:00:00Z").await.unwrap();
    unit.dispatch(Signal::PeriodicHealthCheck).await;
    assert!(cluster.state().await.restoring.is_some());
    assert_eq!(unit.status().await.name(), "maintenance");
}

#[tokio::test]
async fn test_unknown_backup_id_leaves_database_running() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    unit.backup(BackupType::Full).await.unwrap();

    let result = unit.restore("2023-01-01T00:00:00Z").await;
    assert_eq!(result.unwrap_err(), INVALID_BACKUP_ID);
    assert!(!cluster.fake.calls().contains(&"pg-0:stop".to_string()));
    // a rejected request does not block the unit
    assert_eq!(unit.status().await, UnitStatus::Active("Primary".into()));
}

#[tokio::test]
async fn test_missing_backup_id() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;

    let result = unit
        .command(Signal::RestoreRequested { backup_id: None })
        .await;
    assert_eq!(result.unwrap_err(), MISSING_BACKUP_ID);
    let result = unit.restore("   ").await;
    assert_eq!(result.unwrap_err(), MISSING_BACKUP_ID);
}

#[tokio::test]
async fn test_restore_requires_single_unit() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(3).await;
    units[0].bind_s3().await;

    let result = units[0].restore("2024-01-01T09:00:00Z").await;
    assert_eq!(result.unwrap_err(), REQUIRES_SINGLE_UNIT);
    assert!(cluster.fake.calls().is_empty());
}

#[tokio::test]
async fn test_restore_requires_leader() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    unit.set_leader(false);

    let result = unit.restore("2024-01-01T09:00:00Z").await;
    assert_eq!(result.unwrap_err(), REQUIRES_LEADER);
}

#[tokio::test]
async fn test_unreachable_workload_rejects_restore() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    cluster.fake.set_unreachable("pg-0", true);

    let reason = unit.restore("2024-01-01T09:00:00Z").await.unwrap_err();
    assert_eq!(reason, "workload container not reachable");
}

#[tokio::test]
async fn test_stop_failure_blocks_and_restarts() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    cluster.fake.insert_rows(&["a"]);
    unit.backup(BackupType::Full).await.unwrap();
    cluster.fake.insert_rows(&["b"]);
    cluster.fake.fail(Fault::StopDatabase);

    let result = unit.restore("2024-01-01T09:00:00Z").await;
    assert_eq!(result.unwrap_err(), STOP_FAILED);
    assert!(cluster.fake.calls().contains(&"pg-0:start".to_string()));
    assert_eq!(cluster.fake.rows(), vec!["a", "b"]);
    assert_eq!(unit.status().await, UnitStatus::Blocked(STOP_FAILED.into()));
    assert!(cluster.state().await.operation.is_none());

    // fixing the repository binding lifts the block
    cluster.fake.heal(Fault::StopDatabase);
    unit.bind_s3().await;
    assert_eq!(unit.status().await, UnitStatus::Active("Primary".into()));
}

#[tokio::test]
async fn test_data_directory_not_emptied() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    cluster.fake.insert_rows(&["a"]);
    unit.backup(BackupType::Full).await.unwrap();
    cluster.fake.fail(Fault::ClearDataDirectory);

    let reason = unit.restore("2024-01-01T09:00:00Z").await.unwrap_err();
    assert_eq!(reason, "failed to clear data directory");
    assert!(cluster.state().await.restoring.is_none());
    assert!(cluster.fake.inner().restore_command.is_none());
}

#[tokio::test]
async fn test_failed_start_blocks_until_repository_reconfigured() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    cluster.fake.insert_rows(&["a"]);
    unit.backup(BackupType::Full).await.unwrap();
    cluster.fake.fail(Fault::RestoreStart);

    unit.restore("2024-01-01T09:00:00Z").await.unwrap();
    unit.dispatch(Signal::PeriodicHealthCheck).await;

    let state = cluster.state().await;
    assert!(state.restoring.is_none());
    assert_eq!(state.blocked.as_deref(), Some(RESTORE_FAILED));
    assert_eq!(unit.status().await, UnitStatus::Blocked(RESTORE_FAILED.into()));

    // later health checks do not lift it
    unit.dispatch(Signal::PeriodicHealthCheck).await;
    assert_eq!(unit.status().await.name(), "blocked");
    let reason = unit.backup(BackupType::Full).await.unwrap_err();
    assert_eq!(reason, format!("unit is blocked: {}", RESTORE_FAILED));

    unit.bind_s3().await;
    assert!(cluster.state().await.blocked.is_none());
}

#[tokio::test]
async fn test_backup_refused_while_restoring() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    unit.backup(BackupType::Full).await.unwrap();
    cluster.fake.set_auto_run(false);
    unit.restore("2024-01-01T09:00:00Z").await.unwrap();

    let reason = unit.backup(BackupType::Full).await.unwrap_err();
    assert_eq!(reason, "restore in progress");
}

#[tokio::test]
async fn test_start_failure_after_clearing_blocks_cluster() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    cluster.fake.insert_rows(&["a"]);
    unit.backup(BackupType::Full).await.unwrap();
    cluster.fake.fail(Fault::StartDatabase);

    let reason = unit.restore("2024-01-01T09:00:00Z").await.unwrap_err();
    assert_eq!(reason, RESTORE_FAILED);
    let state = cluster.state().await;
    assert!(state.restoring.is_none());
    assert_eq!(state.blocked.as_deref(), Some(RESTORE_FAILED));
    assert!(state.operation.is_none());

    unit.dispatch(Signal::PeriodicHealthCheck).await;
    assert_eq!(unit.status().await, UnitStatus::Blocked(RESTORE_FAILED.into()));

    // reconfiguring the repository unblocks, and membership converges again
    cluster.fake.heal(Fault::StartDatabase);
    unit.bind_s3().await;
    assert!(cluster.state().await.blocked.is_none());
    unit.dispatch(Signal::PeriodicHealthCheck).await;
    unit.dispatch(Signal::PeriodicHealthCheck).await;
    assert!(cluster.fake.member_names().contains("pg-0"));
    assert!(unit.backup(BackupType::Full).await.is_ok());
}

#[tokio::test]
async fn test_member_missing_after_restore_counts_as_failed() {
    let cluster = TestCluster::new();
    let mut unit = ready_unit(&cluster).await;
    unit.backup(BackupType::Full).await.unwrap();
    cluster.fake.set_auto_run(false);
    unit.restore("2024-01-01T09:00:00Z").await.unwrap();

    cluster.fake.inner().members.clear();
    unit.dispatch(Signal::PeriodicHealthCheck).await;

    let state = cluster.state().await;
    assert!(state.restoring.is_none());
    assert_eq!(state.blocked.as_deref(), Some(RESTORE_FAILED));
    let reason = unit.backup(BackupType::Full).await.unwrap_err();
    assert_eq!(reason, format!("unit is blocked: {}", RESTORE_FAILED));
}
