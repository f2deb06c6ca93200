//! Cluster bootstrap and replication-group membership
//!
//! The leader brings up the first member, then keeps the control plane's
//! member set equal to the planned units: additions first, removals second,
//! all under the rescale lock. Synchronous replication is switched on exactly
//! when more than one member is present.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::context::Context;
use super::error::{Error, Result};
use super::operation::with_operation;
use super::Step;
use crate::model::{ClusterState, CredentialSet, OperationKind};

/// Membership changes needed to converge
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipPlan {
    /// Unit id to address
    pub add: BTreeMap<String, String>,
    pub remove: BTreeSet<String>,
}

impl MembershipPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Diff the planned units against the members the control plane reports
///
/// Units that have not registered an address yet cannot be added. Only units
/// marked departing, or members the document no longer knows, are removed.
pub fn plan_membership(state: &ClusterState, actual: &BTreeSet<String>) -> MembershipPlan {
    let add = state
        .planned_units()
        .filter(|(id, data)| !data.address.is_empty() && !actual.contains(*id))
        .map(|(id, data)| (id.clone(), data.address.clone()))
        .collect();

    let remove = actual
        .iter()
        .filter(|id| match state.units.get(*id) {
            Some(data) => data.departing,
            None => state.members.contains(*id),
        })
        .cloned()
        .collect();

    MembershipPlan { add, remove }
}

/// Poll the control plane until `unit` reports running, within the retry budget
pub async fn wait_until_running(ctx: &Context, unit: &str) -> Result<bool> {
    for attempt in 0..ctx.readiness_retry_budget {
        match ctx.control_plane.is_member_running(unit).await {
            Ok(true) => return Ok(true),
            Ok(false) => debug!(unit, attempt, "Member not running yet"),
            Err(e) => debug!(unit, attempt, error = %e, "Member state unavailable"),
        }
        tokio::time::sleep(ctx.backoff.delay_for_attempt(attempt)).await;
    }
    Ok(false)
}

/// Container-ready: register the unit, bootstrap the cluster on the leader
pub async fn on_container_ready(ctx: &Context) -> Result<Step> {
    ctx.local().await.container_ready = true;

    let state = ctx.load_state().await?;
    if !state.initialised && ctx.is_leader() {
        // the first member registers itself with the initialisation write
        return bootstrap(ctx).await;
    }
    register_unit(ctx).await?;
    if state.initialised {
        return reconcile(ctx).await;
    }
    debug!(unit = %ctx.unit, "Waiting for the leader to initialise the cluster");
    Ok(Step::Completed)
}

/// Leader-elected: make sure credentials exist, then continue bootstrap or membership
pub async fn on_leader_elected(ctx: &Context) -> Result<Step> {
    if !ctx.is_leader() {
        return Ok(Step::Completed);
    }

    let state = ctx.load_state().await?;
    if !state.initialised && ctx.local().await.container_ready {
        // credentials are written together with the initialisation
        return bootstrap(ctx).await;
    }

    let generated = ctx
        .with_leader_write("credentials", |state| {
            if state.credentials.is_none() {
                state.credentials = Some(CredentialSet::generate(1));
                true
            } else {
                false
            }
        })
        .await?;
    if generated {
        info!(unit = %ctx.unit, "Generated cluster credentials");
    }

    if !state.initialised {
        return Ok(Step::Completed);
    }
    reconcile(ctx).await
}

/// Peer-departed: the leader marks the unit departing and removes it
///
/// A lease held by the departing unit is dropped with it; a lease held by any
/// other unit defers the departure before anything is written.
pub async fn on_peer_departed(ctx: &Context, unit: &str) -> Result<Step> {
    if !ctx.is_leader() || unit == ctx.unit {
        return Ok(Step::Completed);
    }

    let state = ctx.load_state().await?;
    if let Some(lease) = state.operation.as_ref()
        && lease.holder != unit
        && lease.holder != ctx.unit
    {
        return Err(Error::OperationInProgress(lease.clone()));
    }

    let departing = unit.to_string();
    let released = ctx
        .with_leader_write("departing units", |state| {
            if state.units.contains_key(&departing) || state.members.contains(&departing) {
                state.units.entry(departing.clone()).or_default().departing = true;
            }
            match &state.operation {
                Some(lease) if lease.holder == departing => {
                    let kind = lease.kind;
                    state.operation = None;
                    Some(kind)
                }
                _ => None,
            }
        })
        .await?;
    if let Some(kind) = released {
        warn!(unit, operation = %kind, "Released operation lock held by departing unit");
    }
    info!(unit, "Peer departing");
    reconcile(ctx).await
}

/// Record this unit's address in its own partition
async fn register_unit(ctx: &Context) -> Result<()> {
    let address = ctx.address.clone();
    ctx.update_own_unit(|data| {
        data.address = address.clone();
        data.departing = false;
    })
    .await
}

/// First member: join, wait for it to run, then mark the cluster initialised
async fn bootstrap(ctx: &Context) -> Result<Step> {
    let address = if ctx.address.is_empty() {
        ctx.unit.clone()
    } else {
        ctx.address.clone()
    };

    ctx.control_plane.add_member(&ctx.unit, &address).await?;

    if !wait_until_running(ctx, &ctx.unit).await? {
        return Ok(Step::Deferred(
            "waiting for the control plane to report the first member running".to_string(),
        ));
    }

    let unit = ctx.unit.clone();
    ctx.with_leader_write("initialisation", |state| {
        let data = state.units.entry(unit.clone()).or_default();
        data.address = address.clone();
        data.departing = false;
        state.mark_initialised();
        state.members.insert(unit.clone());
        if state.credentials.is_none() {
            state.credentials = Some(CredentialSet::generate(1));
        }
    })
    .await?;
    ctx.discovery.set_member(&ctx.unit, true).await?;
    ctx.discovery.set_client_connections(&ctx.unit, true).await?;
    ctx.refresh_role().await?;
    info!(unit = %ctx.unit, "Cluster initialised");
    Ok(Step::Completed)
}

/// Converge the member set and synchronous mode; leader only
pub async fn reconcile(ctx: &Context) -> Result<Step> {
    if !ctx.is_leader() {
        return Ok(Step::Completed);
    }

    let state = ctx.load_state().await?;
    let actual: BTreeSet<String> = ctx
        .control_plane
        .members()
        .await?
        .into_iter()
        .map(|member| member.name)
        .collect();
    let plan = plan_membership(&state, &actual);

    if !plan.is_empty() {
        info!(
            add = ?plan.add.keys().collect::<Vec<_>>(),
            remove = ?plan.remove,
            "Rescaling cluster"
        );
        with_operation(ctx, OperationKind::Rescale, || apply_plan(ctx, &plan)).await?;
    } else {
        // the control plane may know members the document has not recorded yet
        let known = actual.clone();
        ctx.with_leader_write("members", |state| {
            for id in &known {
                if state.units.get(id).is_some_and(|d| !d.departing) {
                    state.members.insert(id.clone());
                }
            }
        })
        .await?;
    }

    sync_synchronous_mode(ctx).await?;
    Ok(Step::Completed)
}

async fn apply_plan(ctx: &Context, plan: &MembershipPlan) -> Result<()> {
    for (unit, address) in &plan.add {
        ctx.control_plane.add_member(unit, address).await?;
        ctx.discovery.set_member(unit, true).await?;
        ctx.discovery.set_client_connections(unit, true).await?;
    }

    for unit in &plan.remove {
        ctx.control_plane.remove_member(unit).await?;
        if let Err(e) = ctx.discovery.set_member(unit, false).await {
            // the pod is usually gone already
            debug!(unit = %unit, error = %e, "Could not clear member label");
        }
    }

    let added: Vec<String> = plan.add.keys().cloned().collect();
    let removed = plan.remove.clone();
    ctx.with_leader_write("members", |state| {
        state.members.extend(added.iter().cloned());
        for unit in &removed {
            state.members.remove(unit);
            state.units.remove(unit);
            if state
                .operation
                .as_ref()
                .is_some_and(|lease| &lease.holder == unit)
            {
                state.operation = None;
            }
        }
    })
    .await?;
    Ok(())
}

/// Enable synchronous replication iff the group has more than one member
async fn sync_synchronous_mode(ctx: &Context) -> Result<()> {
    let state = ctx.load_state().await?;
    let desired = state.members.len() > 1;
    if state.synchronous_mode == desired {
        return Ok(());
    }

    ctx.control_plane.set_synchronous_mode(desired).await?;
    ctx.with_leader_write("synchronous mode", |state| {
        state.synchronous_mode = desired;
    })
    .await?;
    info!(enabled = desired, "Synchronous replication updated");
    Ok(())
}

/// Refresh this unit's primary/replica labels; any unit
pub async fn refresh_role_labels(ctx: &Context) -> Result<()> {
    let state = ctx.load_state().await?;
    if !state.is_member(&ctx.unit) {
        return Ok(());
    }
    ctx.refresh_role().await?;
    Ok(())
}
