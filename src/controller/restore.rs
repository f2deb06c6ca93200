//! Restore from the backup repository
//!
//! A restore replaces the data directory of a single-unit cluster with a
//! backup. The database is stopped, the control plane's record of the old
//! cluster is dropped and the data directory is emptied; only then is the
//! control plane pointed at the repository and the database started again.
//! Completion is observed by the periodic health check, not by the command.

use tracing::{debug, error, info, warn};

use super::backup::S3_NOT_ESTABLISHED;
use super::context::Context;
use super::error::{Error, Result};
use super::operation::with_operation;
use crate::clients::MemberState;
use crate::model::{OperationKind, RepositoryBackup};

pub const MISSING_BACKUP_ID: &str = "missing backup-id to restore";
pub const WORKLOAD_UNREACHABLE: &str = "workload container not reachable";
pub const REQUIRES_SINGLE_UNIT: &str = "restore requires single-unit cluster";
pub const REQUIRES_LEADER: &str = "restore must be run on the leader unit";
pub const INVALID_BACKUP_ID: &str = "invalid backup id";
pub const STOP_FAILED: &str = "failed to stop database";
pub const CLEAR_FAILED: &str = "failed to clear data directory";
pub const RESTORE_FAILED: &str = "failed to restore backup";

/// Find the repository backup a user-facing id refers to
///
/// Both the timestamp id and the raw engine label are accepted.
pub fn find_backup<'a>(backups: &'a [RepositoryBackup], id: &str) -> Option<&'a RepositoryBackup> {
    backups
        .iter()
        .find(|backup| backup.id() == id || backup.label == id)
}

/// Restore command; returns the backup id the restore started from
pub async fn restore(ctx: &Context, backup_id: Option<String>) -> Result<String> {
    let backup_id = backup_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::precondition(MISSING_BACKUP_ID))?;

    if !ctx.workload.can_connect().await {
        return Err(Error::precondition(WORKLOAD_UNREACHABLE));
    }

    let state = ctx.load_state().await?;
    let (blocked, s3) = {
        let local = ctx.local().await;
        (
            local
                .blocked_message()
                .map(str::to_string)
                .or_else(|| state.blocked.clone()),
            local.s3.clone(),
        )
    };
    if let Some(reason) = blocked {
        return Err(Error::precondition(format!("unit is blocked: {}", reason)));
    }
    if !state.is_single_unit() {
        return Err(Error::precondition(REQUIRES_SINGLE_UNIT));
    }
    if !ctx.is_leader() {
        return Err(Error::precondition(REQUIRES_LEADER));
    }
    let Some(s3) = s3 else {
        return Err(Error::precondition(S3_NOT_ESTABLISHED));
    };
    let missing = s3.missing_parameters();
    if !missing.is_empty() {
        return Err(Error::precondition(format!(
            "missing S3 parameters: {}",
            missing.join(", ")
        )));
    }

    let stanza = state.stanza.clone().unwrap_or_else(|| ctx.stanza.clone());
    let backups = ctx
        .backup_engine
        .list_backups(&stanza)
        .await
        .map_err(|e| Error::action(format!("failed to list backups: {}", e)))?;
    let Some(backup) = find_backup(&backups, &backup_id) else {
        return Err(Error::precondition(INVALID_BACKUP_ID));
    };
    let backup_id = backup.id();
    let label = backup.label.clone();

    with_operation(ctx, OperationKind::Restore, || {
        run_restore(ctx, &stanza, &backup_id, &label)
    })
    .await?;
    Ok(backup_id)
}

async fn run_restore(ctx: &Context, stanza: &str, backup_id: &str, label: &str) -> Result<()> {
    info!(backup_id, label, "Starting restore");
    ctx.set_maintenance(Some(format!("restoring backup {}", backup_id)))
        .await;
    let outcome = replace_data_directory(ctx, stanza, backup_id, label).await;
    ctx.set_maintenance(None).await;
    outcome
}

async fn replace_data_directory(
    ctx: &Context,
    stanza: &str,
    backup_id: &str,
    label: &str,
) -> Result<()> {
    if let Err(e) = ctx.workload.stop_database().await {
        error!(error = %e, "Database did not stop for restore");
        restart_previous(ctx).await;
        return Err(Error::operational(STOP_FAILED));
    }

    if let Err(e) = ctx.control_plane.clear_cluster_metadata().await {
        error!(error = %e, "Could not remove previous cluster metadata");
        restart_previous(ctx).await;
        return Err(Error::operational(CLEAR_FAILED));
    }

    let cleared = match ctx.workload.clear_data_directory().await {
        Ok(()) => ctx.workload.data_directory_is_empty().await,
        Err(e) => Err(e),
    };
    match cleared {
        Ok(true) => {}
        Ok(false) => {
            error!("Data directory not empty after clearing");
            restart_previous(ctx).await;
            return Err(Error::operational(CLEAR_FAILED));
        }
        Err(e) => {
            error!(error = %e, "Could not clear data directory");
            restart_previous(ctx).await;
            return Err(Error::operational(CLEAR_FAILED));
        }
    }

    // the old data is gone from here on; a failure leaves the cluster blocked
    if let Err(e) = start_from_repository(ctx, stanza, backup_id, label).await {
        error!(backup_id, error = %e, "Database could not be started from backup");
        if let Err(e) = mark_restore_failed(ctx).await {
            warn!(error = %e, "Could not record the failed restore");
        }
        return Err(Error::operational(RESTORE_FAILED));
    }
    info!(backup_id, "Database started from backup");
    Ok(())
}

async fn start_from_repository(
    ctx: &Context,
    stanza: &str,
    backup_id: &str,
    label: &str,
) -> Result<()> {
    let command = ctx.backup_engine.restore_command(stanza, label);
    ctx.control_plane
        .reconfigure_for_restore(stanza, &command)
        .await?;

    let restoring = backup_id.to_string();
    ctx.with_leader_write("restoring", |state| {
        state.restoring = Some(restoring.clone());
    })
    .await?;

    ctx.workload.start_database().await?;
    Ok(())
}

/// Drop the pending restore and block the cluster until the repository is reconfigured
async fn mark_restore_failed(ctx: &Context) -> Result<()> {
    ctx.with_leader_write("restoring", |state| {
        state.restoring = None;
        state.blocked = Some(RESTORE_FAILED.to_string());
    })
    .await
}

async fn restart_previous(ctx: &Context) {
    if let Err(e) = ctx.workload.start_database().await {
        warn!(error = %e, "Could not restart database with its previous data");
    }
}

/// Health check: settle a started restore once the control plane reports on it
pub async fn check_restore_progress(ctx: &Context) -> Result<()> {
    let state = ctx.load_state().await?;
    let Some(backup_id) = state.restoring.clone() else {
        return Ok(());
    };
    if !ctx.is_leader() {
        return Ok(());
    }

    let member = ctx.control_plane.member(&ctx.unit).await?;
    match member.map(|m| m.state) {
        Some(MemberState::Running) | Some(MemberState::Streaming) => {
            ctx.with_leader_write("restoring", |state| {
                state.restoring = None;
            })
            .await?;
            info!(backup_id = %backup_id, "Restore completed");
        }
        Some(MemberState::Starting) | Some(MemberState::Other) => {
            debug!(backup_id = %backup_id, "Restore still starting");
        }
        // stays blocked until the repository configuration is fixed
        other => {
            mark_restore_failed(ctx).await?;
            error!(
                backup_id = %backup_id,
                member_state = ?other,
                "Database failed to start from backup"
            );
        }
    }
    Ok(())
}
