//! Backup commands and the S3 repository binding
//!
//! Preconditions are checked in a fixed order and the first failing one is
//! reported verbatim. A backup holds the backup lock for its whole run; on a
//! replica client connections are withheld while it runs. The engine log is
//! uploaded next to the backup whether the run succeeded or not.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, info, warn};

use super::Step;
use super::context::Context;
use super::error::{Error, Result};
use super::operation::with_operation;
use crate::clients::BackupRun;
use crate::model::{
    BackupRecord, BackupRecordStatus, BackupType, OperationKind, S3Config, backup_id_from_label,
    format_backup_list,
};

/// Maintenance message while a backup runs
pub const CREATING_BACKUP_MESSAGE: &str = "Creating backup";

pub const S3_NOT_ESTABLISHED: &str = "S3 relation not established";
pub const PRIMARY_EXCLUDED_WITH_TLS: &str =
    "primary excluded when TLS enabled on multi-unit cluster";
pub const REPLICA_EXCLUDED_WITHOUT_TLS: &str =
    "replica excluded when TLS disabled; run on the primary";
pub const RESTORE_IN_PROGRESS: &str = "restore in progress";
pub const STANZA_NOT_INITIALISED: &str = "backup stanza not initialised";
pub const STANZA_INIT_FAILED: &str = "failed to initialize stanza, check your S3 settings";
pub const WAL_ARCHIVING_FAILED: &str =
    "WAL archiving to the S3 repository failed, check your S3 settings";

/// Everything the backup preconditions look at
#[derive(Clone, Copy, Debug)]
pub struct BackupPreconditions<'a> {
    pub blocked: Option<&'a str>,
    pub restoring: bool,
    pub is_primary: bool,
    pub multi_unit: bool,
    pub tls_enabled: bool,
    pub s3: Option<&'a S3Config>,
    pub stanza: Option<&'a str>,
}

/// First failing precondition of a create-backup request, if any
pub fn check_backup_preconditions(p: BackupPreconditions<'_>) -> std::result::Result<(), String> {
    if let Some(reason) = p.blocked {
        return Err(format!("unit is blocked: {}", reason));
    }
    if p.restoring {
        return Err(RESTORE_IN_PROGRESS.to_string());
    }
    if p.multi_unit {
        if p.is_primary && p.tls_enabled {
            return Err(PRIMARY_EXCLUDED_WITH_TLS.to_string());
        }
        if !p.is_primary && !p.tls_enabled {
            return Err(REPLICA_EXCLUDED_WITHOUT_TLS.to_string());
        }
    }
    let Some(s3) = p.s3 else {
        return Err(S3_NOT_ESTABLISHED.to_string());
    };
    let missing = s3.missing_parameters();
    if !missing.is_empty() {
        return Err(format!("missing S3 parameters: {}", missing.join(", ")));
    }
    if p.stanza.is_none() {
        return Err(STANZA_NOT_INITIALISED.to_string());
    }
    Ok(())
}

/// Object key the backup log is uploaded to
pub fn backup_log_key(stanza: &str, backup_id: &str) -> String {
    format!("backup/{}/{}/backup.log", stanza, backup_id)
}

/// Create-backup command
pub async fn create_backup(ctx: &Context, backup_type: BackupType) -> Result<BackupRecord> {
    let state = ctx.load_state().await?;
    let is_primary = match ctx.refresh_role().await {
        Ok(primary) => primary,
        Err(e) => {
            warn!(error = %e, "Could not confirm role, using last known");
            ctx.local().await.is_primary
        }
    };

    let (s3, blocked, tls_enabled) = {
        let local = ctx.local().await;
        (
            local.s3.clone(),
            local
                .blocked_message()
                .map(str::to_string)
                .or_else(|| state.blocked.clone()),
            local.tls_state(&state, &ctx.unit).enabled(),
        )
    };

    check_backup_preconditions(BackupPreconditions {
        blocked: blocked.as_deref(),
        restoring: state.restoring.is_some(),
        is_primary,
        multi_unit: !state.is_single_unit(),
        tls_enabled,
        s3: s3.as_ref(),
        stanza: state.stanza.as_deref(),
    })
    .map_err(Error::PreconditionError)?;

    // checked above
    let Some(s3) = s3 else {
        return Err(Error::precondition(S3_NOT_ESTABLISHED));
    };
    let stanza = state.stanza.clone().unwrap_or_else(|| ctx.stanza.clone());

    if let Err(e) = ctx.object_storage.probe(&s3).await {
        return Err(Error::precondition(format!(
            "S3 repository not reachable: {}",
            e
        )));
    }

    if backup_type.requires_full_base() {
        let backups = ctx
            .backup_engine
            .list_backups(&stanza)
            .await
            .map_err(|e| Error::action(format!("failed to list backups: {}", e)))?;
        let has_full = backups.iter().any(|b| {
            b.backup_type == BackupType::Full && b.status == BackupRecordStatus::Finished
        });
        if !has_full {
            return Err(Error::precondition(format!(
                "{} backup requires a prior full backup",
                backup_type
            )));
        }
    }

    with_operation(ctx, OperationKind::Backup, || {
        run_backup(ctx, backup_type, &s3, &stanza, !is_primary)
    })
    .await
}

async fn run_backup(
    ctx: &Context,
    backup_type: BackupType,
    s3: &S3Config,
    stanza: &str,
    on_replica: bool,
) -> Result<BackupRecord> {
    let mut record = BackupRecord::start(backup_type, s3.repository());

    if on_replica {
        ctx.discovery
            .set_client_connections(&ctx.unit, false)
            .await?;
    }
    ctx.set_maintenance(Some(CREATING_BACKUP_MESSAGE.to_string()))
        .await;
    info!(backup_type = %backup_type, repository = %record.repository, "Starting backup");

    let run: Result<BackupRun> =
        match AssertUnwindSafe(ctx.backup_engine.create_backup(stanza, backup_type))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::action("backup engine panicked")),
        };

    let log = match &run {
        Ok(output) => output.log.clone(),
        Err(e) => e.to_string(),
    };
    let log_id = run
        .as_ref()
        .ok()
        .and_then(|output| output.label.as_deref().and_then(backup_id_from_label))
        .unwrap_or_else(|| record.id.clone());
    if let Err(e) = ctx
        .object_storage
        .upload(s3, &backup_log_key(stanza, &log_id), log)
        .await
    {
        warn!(error = %e, "Failed to upload backup log");
    }

    if on_replica
        && let Err(e) = ctx
            .discovery
            .set_client_connections(&ctx.unit, true)
            .await
    {
        error!(unit = %ctx.unit, error = %e, "Failed to re-enable client connections");
    }
    ctx.set_maintenance(None).await;

    match run {
        Ok(output) => {
            record.finish(output.label.as_deref().and_then(backup_id_from_label))?;
            info!(backup_id = %record.id, "Backup finished");
            ctx.local().await.backups.push(record.clone());
            Ok(record)
        }
        Err(e) => {
            record.fail()?;
            error!(backup_id = %record.id, error = %e, "Backup failed");
            ctx.local().await.backups.push(record);
            Err(Error::action(format!("failed to create backup: {}", e)))
        }
    }
}

/// List-backups command
pub async fn list_backups(ctx: &Context) -> Result<String> {
    let s3 = ctx.local().await.s3.clone();
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

    let state = ctx.load_state().await?;
    let stanza = state.stanza.unwrap_or_else(|| ctx.stanza.clone());
    let backups = ctx
        .backup_engine
        .list_backups(&stanza)
        .await
        .map_err(|e| Error::action(format!("failed to list backups: {}", e)))?;
    Ok(format_backup_list(&backups))
}

/// S3 configuration appeared, changed or went away
pub async fn on_s3_config_changed(ctx: &Context, config: Option<S3Config>) -> Result<Step> {
    ctx.local().await.s3 = config.clone();

    let Some(s3) = config else {
        if ctx.is_leader() {
            ctx.with_leader_write("stanza", |state| {
                state.stanza = None;
                let stanza_failure = state.blocked.as_deref().is_some_and(|reason| {
                    reason == STANZA_INIT_FAILED || reason == WAL_ARCHIVING_FAILED
                });
                if stanza_failure {
                    state.blocked = None;
                }
            })
            .await?;
            info!("S3 configuration removed, stanza unbound");
        }
        super::tls::update_tls_server(ctx).await?;
        return Ok(Step::Completed);
    };

    let missing = s3.missing_parameters();
    if !missing.is_empty() {
        return Err(Error::operational(format!(
            "missing S3 parameters: {}",
            missing.join(", ")
        )));
    }

    ctx.backup_engine.configure(&ctx.stanza, &s3).await?;

    if ctx.is_leader() {
        let stanza = ctx.stanza.clone();
        if let Err(e) = ctx.backup_engine.init_stanza(&stanza).await {
            error!(stanza = %stanza, error = %e, "Stanza creation failed");
            block_cluster(ctx, STANZA_INIT_FAILED).await?;
            return Err(Error::operational(STANZA_INIT_FAILED));
        }
        if let Err(e) = ctx.backup_engine.verify_wal_archiving(&stanza).await {
            error!(stanza = %stanza, error = %e, "WAL archiving check failed");
            block_cluster(ctx, WAL_ARCHIVING_FAILED).await?;
            return Err(Error::operational(WAL_ARCHIVING_FAILED));
        }
        ctx.with_leader_write("stanza", |state| {
            state.stanza = Some(stanza.clone());
            state.blocked = None;
        })
        .await?;
        info!(stanza = %stanza, repository = %s3.repository(), "Backup stanza bound");
    }

    super::tls::update_tls_server(ctx).await?;
    Ok(Step::Completed)
}

async fn block_cluster(ctx: &Context, reason: &str) -> Result<()> {
    let reason = reason.to_string();
    ctx.with_leader_write("blocked", |state| {
        state.stanza = None;
        state.blocked = Some(reason.clone());
    })
    .await
}
