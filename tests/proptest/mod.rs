// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for the lifecycle controller
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. The operation lock has at most one holder under any acquire/release sequence
//! 2. Only the lease holder writes leader-owned fields
//! 3. The deferred queue never holds the same signal twice
//! 4. Status selection always picks the most severe candidate
//! 5. At most one unit is ever told to run a primary-role TLS server
//! 6. Membership plans only add unknown units and only remove known ones

#[path = "../common/mod.rs"]
mod common;

use std::collections::{BTreeSet, HashSet};
use std::future::Future;

use proptest::prelude::*;

use postgres_lifecycle::controller::membership::plan_membership;
use postgres_lifecycle::controller::operation::{acquire, release};
use postgres_lifecycle::controller::status::highest_precedence;
use postgres_lifecycle::controller::tls::{TlsServerAction, TlsServerInput, decide_tls_server};
use postgres_lifecycle::controller::{Error, UnitStatus};
use postgres_lifecycle::model::{
    ClusterState, OperationKind, S3Config, Signal, TlsServerRole, UnitData,
};

use common::*;

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

// =============================================================================
// Strategy generators
// =============================================================================

fn operation_kind() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Backup),
        Just(OperationKind::Restore),
        Just(OperationKind::Rescale),
        Just(OperationKind::TlsToggle),
    ]
}

/// (unit index, acquire?, kind)
fn lock_step() -> impl Strategy<Value = (usize, bool, OperationKind)> {
    (0..3usize, any::<bool>(), operation_kind())
}

fn unit_status() -> impl Strategy<Value = UnitStatus> {
    let message = "[a-z ]{0,12}";
    prop_oneof![
        message.prop_map(UnitStatus::Active),
        message.prop_map(UnitStatus::Waiting),
        message.prop_map(UnitStatus::Maintenance),
        message.prop_map(UnitStatus::Blocked),
        message.prop_map(UnitStatus::Error),
    ]
}

/// Signals that wait for initialisation
fn gated_signal() -> impl Strategy<Value = Signal> {
    prop_oneof![
        Just(Signal::PeerTopologyChanged),
        (0..3usize).prop_map(|i| Signal::PeerDeparted {
            unit: format!("pg-{}", i)
        }),
        Just(Signal::S3ConfigChanged { config: None }),
        Just(Signal::S3ConfigChanged {
            config: Some(S3Config::default())
        }),
    ]
}

fn tls_input() -> impl Strategy<Value = TlsServerInput> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(tls_enabled, single_unit, is_primary, other_primary_running)| TlsServerInput {
            tls_enabled,
            single_unit,
            is_primary,
            other_primary_running,
        },
    )
}

/// Cluster document with up to five registered units, some departing
fn cluster_state() -> impl Strategy<Value = ClusterState> {
    (
        prop::collection::btree_map(0..5usize, (any::<bool>(), any::<bool>()), 0..5),
        prop::collection::btree_set(0..6usize, 0..4),
    )
        .prop_map(|(units, members)| {
            let mut state = ClusterState::default();
            for (i, (registered, departing)) in units {
                let address = if registered {
                    format!("10.0.0.{}", i)
                } else {
                    String::new()
                };
                state.units.insert(
                    format!("pg-{}", i),
                    UnitData {
                        address,
                        departing,
                        ..Default::default()
                    },
                );
            }
            state.members = members.into_iter().map(|i| format!("pg-{}", i)).collect();
            state
        })
}

// =============================================================================
// Property-based tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the lock has at most one holder, and only a free lock or the
    /// holder itself can take it
    #[test]
    fn prop_operation_lock_is_exclusive(steps in prop::collection::vec(lock_step(), 1..30)) {
        block_on(async {
            let cluster = TestCluster::new();
            let units: Vec<TestUnit> = (0..3).map(|i| cluster.unit(&format!("pg-{}", i))).collect();
            let mut holder: Option<(usize, OperationKind)> = None;

            for (i, take, kind) in steps {
                let ctx = units[i].ctx();
                if take {
                    match acquire(ctx, kind).await {
                        Ok(_) => {
                            assert!(holder.is_none_or(|(h, _)| h == i));
                            holder = Some((i, kind));
                        }
                        Err(Error::OperationInProgress(lease)) => {
                            let (h, _) = holder.unwrap();
                            assert_ne!(h, i);
                            assert_eq!(lease.holder, format!("pg-{}", h));
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                } else {
                    release(ctx, kind).await.unwrap();
                    if holder == Some((i, kind)) {
                        holder = None;
                    }
                }

                let stored = cluster.state().await.operation;
                assert_eq!(
                    stored.map(|lease| (lease.holder, lease.kind)),
                    holder.map(|(h, k)| (format!("pg-{}", h), k))
                );
            }
        });
    }

    /// Property: followers never write leader-owned fields
    #[test]
    fn prop_only_leader_writes(leaders in prop::collection::vec(any::<bool>(), 1..6)) {
        block_on(async {
            let cluster = TestCluster::new();
            let mut expected = 0u64;
            for (i, leader) in leaders.iter().enumerate() {
                let unit = cluster.unit(&format!("pg-{}", i));
                unit.set_leader(*leader);
                let result = unit
                    .ctx()
                    .with_leader_write("members", |state| {
                        state.members.insert(format!("pg-{}", i));
                    })
                    .await;
                match result {
                    Ok(()) => {
                        assert!(*leader);
                        expected += 1;
                    }
                    Err(Error::NotLeaderError(_)) => assert!(!*leader),
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            assert_eq!(cluster.state().await.members.len() as u64, expected);
        });
    }

    /// Property: before initialisation every gated signal is queued exactly once
    #[test]
    fn prop_deferred_queue_has_no_duplicates(signals in prop::collection::vec(gated_signal(), 1..20)) {
        block_on(async {
            let cluster = TestCluster::new();
            let mut unit = cluster.unit("pg-0");
            for signal in &signals {
                unit.dispatch(signal.clone()).await;
            }

            let queued: Vec<&Signal> = unit.dispatcher.deferred().collect();
            let mut distinct = Vec::new();
            for signal in &signals {
                if !distinct.contains(&signal) {
                    distinct.push(signal);
                }
            }
            // arrival order of first occurrences
            assert_eq!(queued, distinct);
        });
    }

    /// Property: the chosen status is the first candidate of the highest severity
    #[test]
    fn prop_status_precedence(candidates in prop::collection::vec(unit_status(), 1..8)) {
        let chosen = highest_precedence(candidates.clone());
        let max = candidates.iter().map(UnitStatus::severity).max().unwrap();
        prop_assert_eq!(chosen.severity(), max);
        let first = candidates.iter().find(|c| c.severity() == max).unwrap();
        prop_assert_eq!(&chosen, first);
    }

    /// Property: a primary-role server is only started on a primary with no
    /// other primary-role server, and a replica-role one only once a primary
    /// runs
    #[test]
    fn prop_tls_server_exclusive(input in tls_input()) {
        match decide_tls_server(input) {
            TlsServerAction::Run(TlsServerRole::Primary) => {
                prop_assert!(input.is_primary);
                prop_assert!(!input.other_primary_running);
                prop_assert!(input.tls_enabled && !input.single_unit);
            }
            TlsServerAction::Run(TlsServerRole::Replica) => {
                prop_assert!(!input.is_primary);
                prop_assert!(input.other_primary_running);
            }
            TlsServerAction::Run(TlsServerRole::Stopped) => {
                prop_assert!(false, "stopped is not a running role");
            }
            TlsServerAction::Stop => {
                prop_assert!(!input.tls_enabled || input.single_unit);
            }
            TlsServerAction::Wait(_) => {
                prop_assert!(input.tls_enabled && !input.single_unit);
            }
        }
    }

    /// Property: plans add only registered, unknown units and remove only known ones
    #[test]
    fn prop_membership_plan_is_consistent(
        state in cluster_state(),
        actual in prop::collection::btree_set(0..6usize, 0..6),
    ) {
        let actual: BTreeSet<String> = actual.into_iter().map(|i| format!("pg-{}", i)).collect();
        let plan = plan_membership(&state, &actual);

        let added: HashSet<&String> = plan.add.keys().collect();
        for unit in &added {
            prop_assert!(!actual.contains(*unit));
            let data = &state.units[*unit];
            prop_assert!(!data.address.is_empty() && !data.departing);
        }
        for unit in &plan.remove {
            prop_assert!(actual.contains(unit));
            prop_assert!(!added.contains(unit));
        }
    }
}
