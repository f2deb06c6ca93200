//! Cluster-wide mutex for long-running operations
//!
//! At most one of backup, restore, rescale and TLS toggle runs at a time across
//! the whole cluster. The lease lives in the shared document and is taken and
//! released through a generation compare-and-swap, so any unit may hold it.
//!
//! A lease already held by this unit is taken over: a unit handles one signal
//! at a time, so such a lease can only be left over from a previous run of
//! this agent.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use tracing::{info, warn};

use super::context::Context;
use super::error::{Error, Result};
use crate::model::{OperationKind, OperationLease};
use crate::store::read_modify_write;

/// Take the mutex for `kind` on behalf of this unit
pub async fn acquire(ctx: &Context, kind: OperationKind) -> Result<OperationLease> {
    let holder = ctx.unit.clone();
    let outcome = read_modify_write(ctx.store.as_ref(), |state| {
        let leftover = match &state.operation {
            Some(lease) if lease.holder != holder => return Err(lease.clone()),
            Some(lease) => Some(lease.kind),
            None => None,
        };
        let lease = OperationLease {
            kind,
            holder: holder.clone(),
            acquired_at: Utc::now(),
        };
        state.operation = Some(lease.clone());
        Ok((lease, leftover))
    })
    .await?;

    match outcome {
        Ok((lease, leftover)) => {
            if let Some(previous) = leftover {
                warn!(
                    operation = %kind,
                    previous = %previous,
                    unit = %ctx.unit,
                    "Took over leftover operation lock"
                );
            }
            info!(operation = %kind, unit = %ctx.unit, "Acquired operation lock");
            Ok(lease)
        }
        Err(held) => Err(Error::OperationInProgress(held)),
    }
}

/// Release the mutex if this unit holds it for `kind`
pub async fn release(ctx: &Context, kind: OperationKind) -> Result<()> {
    let holder = ctx.unit.clone();
    let released = read_modify_write(ctx.store.as_ref(), |state| {
        let ours = state
            .operation
            .as_ref()
            .is_some_and(|lease| lease.holder == holder && lease.kind == kind);
        if ours {
            state.operation = None;
        }
        ours
    })
    .await?;

    if released {
        info!(operation = %kind, unit = %ctx.unit, "Released operation lock");
    }
    Ok(())
}

/// Run `work` while holding the mutex for `kind`
///
/// The mutex is released whether `work` succeeds, fails or panics; a panic
/// resumes unwinding after the release. A failed release is logged and does
/// not change the result of `work`.
pub async fn with_operation<T, F, Fut>(ctx: &Context, kind: OperationKind, work: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    acquire(ctx, kind).await?;

    let outcome = AssertUnwindSafe(work()).catch_unwind().await;
    let released = release(ctx, kind).await;

    match outcome {
        Ok(result) => {
            // a leftover lease is taken over on this unit's next acquire
            if let Err(e) = released {
                warn!(operation = %kind, error = %e, "Failed to release operation lock");
            }
            result
        }
        Err(panic) => {
            if let Err(e) = released {
                warn!(
                    operation = %kind,
                    error = %e,
                    "Failed to release operation lock after panic"
                );
            }
            std::panic::resume_unwind(panic)
        }
    }
}
