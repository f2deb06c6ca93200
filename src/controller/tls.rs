//! Certificate rotation and the backup engine's TLS server
//!
//! Installing or removing the internal certificate changes the unit's
//! TLS-ready flag; a member whose flag changes restarts its database under
//! the TLS-toggle lock. Afterwards the TLS server placement is re-evaluated:
//! the server runs in primary role on the primary only, and replicas start
//! theirs only once they have seen the primary's running. A placement that has
//! to wait is picked up again by the periodic health check; it never holds back
//! the certificate signal itself.

use tracing::{debug, info};

use super::Step;
use super::context::Context;
use super::error::Result;
use super::operation::with_operation;
use crate::model::{CertificateKind, ClusterState, OperationKind, TlsMaterial, TlsServerRole};

/// Inputs to the TLS server placement decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsServerInput {
    pub tls_enabled: bool,
    pub single_unit: bool,
    pub is_primary: bool,
    /// Another unit currently reports a primary-role server
    pub other_primary_running: bool,
}

/// What the unit should do with its TLS server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsServerAction {
    Stop,
    Run(TlsServerRole),
    /// Not yet; the reason says what is awaited
    Wait(&'static str),
}

/// Decide where the TLS server runs
pub fn decide_tls_server(input: TlsServerInput) -> TlsServerAction {
    if !input.tls_enabled || input.single_unit {
        return TlsServerAction::Stop;
    }
    match (input.is_primary, input.other_primary_running) {
        (true, false) => TlsServerAction::Run(TlsServerRole::Primary),
        (true, true) => TlsServerAction::Wait("previous primary still runs the TLS server"),
        (false, true) => TlsServerAction::Run(TlsServerRole::Replica),
        (false, false) => TlsServerAction::Wait("waiting for the primary's TLS server"),
    }
}

fn placement_input(
    ctx: &Context,
    state: &ClusterState,
    tls_enabled: bool,
    is_primary: bool,
) -> TlsServerInput {
    TlsServerInput {
        tls_enabled,
        single_unit: state.is_single_unit(),
        is_primary,
        other_primary_running: state
            .primary_tls_servers()
            .into_iter()
            .any(|unit| unit != ctx.unit),
    }
}

/// Bring this unit's TLS server in line with the placement decision
pub async fn update_tls_server(ctx: &Context) -> Result<()> {
    let state = ctx.load_state().await?;
    let (tls_enabled, is_primary) = {
        let local = ctx.local().await;
        (local.tls_state(&state, &ctx.unit).enabled(), local.is_primary)
    };
    let current = state.tls_server_role(&ctx.unit);

    match decide_tls_server(placement_input(ctx, &state, tls_enabled, is_primary)) {
        TlsServerAction::Stop => set_server_role(ctx, current, TlsServerRole::Stopped).await,
        TlsServerAction::Run(role) => set_server_role(ctx, current, role).await,
        TlsServerAction::Wait(reason) => {
            // a demoted primary steps down so the new primary can take over
            if current == TlsServerRole::Primary && !is_primary {
                set_server_role(ctx, current, TlsServerRole::Stopped).await?;
            }
            debug!(unit = %ctx.unit, reason, "TLS server placement waiting");
            Ok(())
        }
    }
}

async fn set_server_role(
    ctx: &Context,
    current: TlsServerRole,
    role: TlsServerRole,
) -> Result<()> {
    if current == role {
        return Ok(());
    }
    ctx.backup_engine.set_tls_server(role).await?;
    ctx.update_own_unit(|data| data.tls_server = role).await?;
    info!(unit = %ctx.unit, from = ?current, to = ?role, "TLS server role changed");
    Ok(())
}

/// Certificate issued for a unit
pub async fn on_certificate_issued(
    ctx: &Context,
    unit: &str,
    kind: CertificateKind,
    material: &TlsMaterial,
) -> Result<Step> {
    if unit != ctx.unit {
        // a peer's posture changed; only placement may need revisiting
        update_tls_server(ctx).await?;
        return Ok(Step::Completed);
    }

    let merged = {
        let local = ctx.local().await;
        let mut merged = local.tls_material.get(&kind).cloned().unwrap_or_default();
        merged.merge(material.clone());
        merged
    };

    if merged.is_complete() {
        apply_material(ctx, kind, Some(merged)).await?;
    } else {
        debug!(unit = %ctx.unit, kind = %kind, "Certificate material incomplete, holding");
        ctx.local().await.tls_material.insert(kind, merged);
        return Ok(Step::Completed);
    }
    update_tls_server(ctx).await?;
    Ok(Step::Completed)
}

/// Certificate removed for a unit
pub async fn on_certificate_removed(
    ctx: &Context,
    unit: &str,
    kind: CertificateKind,
) -> Result<Step> {
    if unit != ctx.unit {
        update_tls_server(ctx).await?;
        return Ok(Step::Completed);
    }
    apply_material(ctx, kind, None).await?;
    update_tls_server(ctx).await?;
    Ok(Step::Completed)
}

/// Install (or remove) material and restart the database when TLS readiness flips
///
/// Nothing is changed unless the TLS-toggle lock can be taken, so a deferred
/// signal replays from scratch.
async fn apply_material(
    ctx: &Context,
    kind: CertificateKind,
    material: Option<TlsMaterial>,
) -> Result<()> {
    let state = ctx.load_state().await?;
    let was_ready = state.units.get(&ctx.unit).is_some_and(|d| d.tls_ready);
    let ready = match kind {
        CertificateKind::Internal => material.is_some(),
        CertificateKind::External => was_ready,
    };
    let member = state.is_member(&ctx.unit);

    let flips = ready != was_ready;
    if flips && member {
        let material = material.as_ref();
        with_operation(ctx, OperationKind::TlsToggle, || {
            install_material(ctx, kind, material, Some(ready), true)
        })
        .await?;
        info!(unit = %ctx.unit, tls_ready = ready, "Database restarted for TLS change");
    } else {
        install_material(ctx, kind, material.as_ref(), flips.then_some(ready), false).await?;
    }

    let mut local = ctx.local().await;
    match material {
        Some(m) => {
            local.tls_material.insert(kind, m);
        }
        None => {
            local.tls_material.remove(&kind);
        }
    }
    Ok(())
}

async fn install_material(
    ctx: &Context,
    kind: CertificateKind,
    material: Option<&TlsMaterial>,
    ready: Option<bool>,
    restart: bool,
) -> Result<()> {
    match material {
        Some(m) => ctx.workload.install_tls_material(kind, m).await?,
        None => ctx.workload.remove_tls_material(kind).await?,
    }
    if restart {
        ctx.workload.restart_database().await?;
    }
    if let Some(ready) = ready {
        ctx.update_own_unit(|data| data.tls_ready = ready).await?;
    }
    Ok(())
}
