//! The cluster-wide operation lock

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;

use postgres_lifecycle::controller::operation::{acquire, release};
use postgres_lifecycle::controller::{Error, Result, with_operation};
use postgres_lifecycle::model::{BackupType, ClusterState, OperationKind};
use postgres_lifecycle::store::{MemoryStore, StateStore, StoreError};

use crate::common::*;

/// Store whose writes can be switched off
struct ReadOnlyAfterSwitch {
    inner: MemoryStore,
    read_only: AtomicBool,
}

#[async_trait]
impl StateStore for ReadOnlyAfterSwitch {
    async fn load(&self) -> std::result::Result<ClusterState, StoreError> {
        self.inner.load().await
    }

    async fn compare_and_swap(
        &self,
        expected: u64,
        next: ClusterState,
    ) -> std::result::Result<ClusterState, StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::InvariantViolation("store is read-only".into()));
        }
        self.inner.compare_and_swap(expected, next).await
    }
}

async fn crash() -> Result<()> {
    panic!("engine crashed")
}

#[tokio::test]
async fn test_second_unit_cannot_take_lock() {
    let cluster = TestCluster::new();
    let first = cluster.unit("pg-0");
    let second = cluster.unit("pg-1");

    acquire(first.ctx(), OperationKind::Rescale).await.unwrap();
    let err = acquire(second.ctx(), OperationKind::Backup)
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::OperationInProgress(lease) if lease.holder == "pg-0"));
    assert_eq!(err.to_string(), "rescale operation in progress on pg-0");

    release(first.ctx(), OperationKind::Rescale).await.unwrap();
    acquire(second.ctx(), OperationKind::Backup).await.unwrap();
}

#[tokio::test]
async fn test_release_only_by_holder_and_kind() {
    let cluster = TestCluster::new();
    let first = cluster.unit("pg-0");
    let second = cluster.unit("pg-1");

    acquire(first.ctx(), OperationKind::Backup).await.unwrap();
    release(second.ctx(), OperationKind::Backup).await.unwrap();
    release(first.ctx(), OperationKind::Restore).await.unwrap();
    assert!(cluster.state().await.operation.is_some());
}

#[tokio::test]
async fn test_own_stale_lease_is_taken_over() {
    let cluster = TestCluster::new();
    let unit = cluster.unit("pg-0");

    acquire(unit.ctx(), OperationKind::Backup).await.unwrap();
    let lease = acquire(unit.ctx(), OperationKind::Restore).await.unwrap();
    assert_eq!(lease.kind, OperationKind::Restore);
}

#[tokio::test]
async fn test_lock_released_after_panic() {
    let cluster = TestCluster::new();
    let unit = cluster.unit("pg-0");

    let outcome = AssertUnwindSafe(with_operation(unit.ctx(), OperationKind::Backup, crash))
        .catch_unwind()
        .await;
    assert!(outcome.is_err());
    assert!(cluster.state().await.operation.is_none());
}

#[tokio::test]
async fn test_lock_released_after_failure() {
    let cluster = TestCluster::new();
    let unit = cluster.unit("pg-0");

    let result: Result<()> = with_operation(unit.ctx(), OperationKind::TlsToggle, || async {
        Err(Error::operational("restart failed"))
    })
    .await;
    assert_eq!(result.unwrap_err().to_string(), "restart failed");
    assert!(cluster.state().await.operation.is_none());
}

#[tokio::test]
async fn test_backup_refused_while_another_unit_restores() {
    let cluster = TestCluster::new();
    let mut units = cluster.bootstrap(1).await;
    units[0].bind_s3().await;
    // never registered, so the cluster still counts as single-unit
    let other = cluster.unit("pg-1");
    acquire(other.ctx(), OperationKind::Restore).await.unwrap();

    let reason = units[0].backup(BackupType::Full).await.unwrap_err();
    assert_eq!(reason, "restore operation in progress on pg-1");
    assert!(!cluster.fake.calls().iter().any(|c| c.ends_with(":backup")));
    assert_eq!(units[0].dispatcher.deferred().count(), 0);
}

#[tokio::test]
async fn test_failed_release_keeps_work_result() {
    let cluster = TestCluster::new();
    let store = Arc::new(ReadOnlyAfterSwitch {
        inner: cluster.store.clone(),
        read_only: AtomicBool::new(false),
    });
    let unit = cluster.unit_with_store("pg-0", store.clone());

    let result = with_operation(unit.ctx(), OperationKind::Backup, || async {
        store.read_only.store(true, Ordering::SeqCst);
        Ok("finished")
    })
    .await;
    assert_eq!(result.unwrap(), "finished");
    assert!(cluster.state().await.operation.is_some());

    // the leftover lease is taken over by the same unit
    store.read_only.store(false, Ordering::SeqCst);
    let lease = acquire(unit.ctx(), OperationKind::Rescale).await.unwrap();
    assert_eq!(lease.kind, OperationKind::Rescale);
}
