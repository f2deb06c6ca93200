//! Signal dispatcher
//!
//! Every signal drives exactly one reconciliation pass. Lifecycle signals that
//! cannot make progress yet are queued (one copy per distinct signal) and
//! replayed in arrival order after the next pass that completes. User commands
//! never queue: they answer with a result or a failure reason.
//!
//! Failures are handled by class:
//! - deferrable: queued like an explicit deferral
//! - precondition: logged, nothing changes
//! - operational: the unit is blocked until a later pass of the same kind completes
//! - fatal: the unit goes into error

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::Step;
use super::backup::{create_backup, list_backups, on_s3_config_changed};
use super::context::{BlockedReason, Context};
use super::error::{DeferralCounter, Error, ErrorClass, Result};
use super::membership::{
    on_container_ready, on_leader_elected, on_peer_departed, reconcile, refresh_role_labels,
};
use super::restore::{check_restore_progress, restore};
use super::status::{UnitStatus, compute_status};
use super::tls::{on_certificate_issued, on_certificate_removed, update_tls_server};
use crate::model::{BackupRecord, Signal, SignalKind};

/// Consecutive deferrals of one kind after which a warning is logged
pub const DEFAULT_DEFER_WARN_THRESHOLD: u32 = 10;

/// Deferral reason while the cluster has not been initialised
pub const NOT_INITIALISED: &str = "cluster not yet initialised";

/// Result of one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Deferred(String),
    Failed(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Deferred(_) => "deferred",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// What a successful command returns
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandOutput {
    Backup(BackupRecord),
    BackupList(String),
    #[serde(rename_all = "kebab-case")]
    RestoreStarted { backup_id: String },
}

pub type CommandResult = std::result::Result<CommandOutput, String>;

/// A signal with an optional channel for the command result
pub struct Envelope {
    pub signal: Signal,
    pub reply: Option<oneshot::Sender<CommandResult>>,
}

impl Envelope {
    pub fn signal(signal: Signal) -> Self {
        Self {
            signal,
            reply: None,
        }
    }

    pub fn command(signal: Signal) -> (Self, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                signal,
                reply: Some(tx),
            },
            rx,
        )
    }
}

/// Sequences signals for one unit
pub struct Dispatcher {
    ctx: Arc<Context>,
    deferred: VecDeque<Signal>,
    counters: HashMap<SignalKind, DeferralCounter>,
    defer_warn_threshold: u32,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            deferred: VecDeque::new(),
            counters: HashMap::new(),
            defer_warn_threshold: DEFAULT_DEFER_WARN_THRESHOLD,
        }
    }

    pub fn with_defer_warn_threshold(mut self, threshold: u32) -> Self {
        self.defer_warn_threshold = threshold;
        self
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Signals waiting for replay, oldest first
    pub fn deferred(&self) -> impl Iterator<Item = &Signal> {
        self.deferred.iter()
    }

    pub fn deferral_count(&self, kind: SignalKind) -> u32 {
        self.counters.get(&kind).map_or(0, |c| c.consecutive)
    }

    /// Handle a lifecycle signal
    ///
    /// A completed pass replays the deferred queue afterwards.
    pub async fn dispatch(&mut self, signal: Signal) -> Outcome {
        if signal.is_command() {
            return match self.run_command(signal).await {
                Ok(_) => Outcome::Completed,
                Err(reason) => Outcome::Failed(reason),
            };
        }

        let outcome = self.process(signal).await;
        if outcome == Outcome::Completed {
            self.replay_deferred().await;
        }
        self.refresh_status().await;
        outcome
    }

    /// Handle a user command; never deferred
    pub async fn run_command(&mut self, signal: Signal) -> CommandResult {
        let kind = signal.kind();
        let started = Instant::now();
        debug!(signal = %kind, unit = %self.ctx.unit, "Running command");

        let result = match signal {
            Signal::CreateBackupRequested { backup_type } => create_backup(&self.ctx, backup_type)
                .await
                .map(CommandOutput::Backup),
            Signal::ListBackupsRequested => {
                list_backups(&self.ctx).await.map(CommandOutput::BackupList)
            }
            Signal::RestoreRequested { backup_id } => restore(&self.ctx, backup_id)
                .await
                .map(|backup_id| CommandOutput::RestoreStarted { backup_id }),
            other => Err(Error::FatalError(format!(
                "{} is not a command",
                other.kind()
            ))),
        };

        let result = match result {
            Ok(output) => {
                info!(signal = %kind, unit = %self.ctx.unit, "Command succeeded");
                Ok(output)
            }
            Err(e) => {
                let reason = e.to_string();
                match e.class() {
                    ErrorClass::Operational => self.block(kind, &reason).await,
                    ErrorClass::Fatal => self.set_error(kind, &reason).await,
                    ErrorClass::Deferrable | ErrorClass::Precondition => {
                        warn!(
                            signal = %kind,
                            unit = %self.ctx.unit,
                            reason = %reason,
                            "Command failed"
                        );
                    }
                }
                Err(reason)
            }
        };

        let label = if result.is_ok() { "completed" } else { "failed" };
        self.record(kind, label, started);
        self.refresh_status().await;
        result
    }

    /// One pass for a lifecycle signal, without replay
    async fn process(&mut self, signal: Signal) -> Outcome {
        let kind = signal.kind();
        let started = Instant::now();

        let outcome = match self.pass(&signal).await {
            Ok(Step::Completed) => {
                self.complete(kind).await;
                Outcome::Completed
            }
            Ok(Step::Deferred(reason)) => {
                self.defer(signal, &reason);
                Outcome::Deferred(reason)
            }
            Err(e) => {
                let reason = e.to_string();
                match e.class() {
                    ErrorClass::Deferrable => {
                        self.defer(signal, &reason);
                        Outcome::Deferred(reason)
                    }
                    ErrorClass::Precondition => {
                        warn!(
                            signal = %kind,
                            unit = %self.ctx.unit,
                            reason = %reason,
                            "Precondition not met"
                        );
                        Outcome::Failed(reason)
                    }
                    ErrorClass::Operational => {
                        self.block(kind, &reason).await;
                        Outcome::Failed(reason)
                    }
                    ErrorClass::Fatal => {
                        self.set_error(kind, &reason).await;
                        Outcome::Failed(reason)
                    }
                }
            }
        };

        self.record(kind, outcome.label(), started);
        outcome
    }

    async fn pass(&self, signal: &Signal) -> Result<Step> {
        let ctx = self.ctx.as_ref();
        if !signal.runs_before_initialisation() && !ctx.load_state().await?.initialised {
            return Ok(Step::Deferred(NOT_INITIALISED.to_string()));
        }

        match signal {
            Signal::ContainerReady => on_container_ready(ctx).await,
            Signal::LeaderElected => on_leader_elected(ctx).await,
            Signal::PeerTopologyChanged => reconcile(ctx).await,
            Signal::PeerDeparted { unit } => on_peer_departed(ctx, unit).await,
            Signal::S3ConfigChanged { config } => on_s3_config_changed(ctx, config.clone()).await,
            Signal::CertificateIssued {
                unit,
                kind,
                material,
            } => on_certificate_issued(ctx, unit, *kind, material).await,
            Signal::CertificateRemoved { unit, kind } => {
                on_certificate_removed(ctx, unit, *kind).await
            }
            Signal::PeriodicHealthCheck => health_check(ctx).await,
            Signal::CreateBackupRequested { .. }
            | Signal::ListBackupsRequested
            | Signal::RestoreRequested { .. } => Err(Error::FatalError(format!(
                "{} must be run as a command",
                signal.kind()
            ))),
        }
    }

    /// A pass of `kind` completed: reset its deferrals and lift a block it raised
    ///
    /// Blocks raised by commands are lifted by a successful repository
    /// reconfiguration, since a command cannot be retried while blocked.
    async fn complete(&mut self, kind: SignalKind) {
        if let Some(counter) = self.counters.get_mut(&kind) {
            counter.reset();
        }
        let lifts = |blocked: &BlockedReason| {
            blocked.source == kind
                || (kind == SignalKind::S3ConfigChanged && blocked.source.is_command())
        };
        let mut local = self.ctx.local().await;
        if local.blocked.as_ref().is_some_and(lifts) {
            info!(signal = %kind, unit = %self.ctx.unit, "Blocked condition cleared");
            local.blocked = None;
        }
    }

    fn defer(&mut self, signal: Signal, reason: &str) {
        let kind = signal.kind();
        let counter = self.counters.entry(kind).or_default();
        counter.record(reason);
        if counter.exceeded(self.defer_warn_threshold) {
            warn!(
                signal = %kind,
                unit = %self.ctx.unit,
                deferrals = counter.consecutive,
                reason,
                "Signal keeps deferring"
            );
        } else {
            debug!(signal = %kind, unit = %self.ctx.unit, reason, "Signal deferred");
        }

        if !self.deferred.contains(&signal) {
            self.deferred.push_back(signal);
        }
    }

    /// Replay every queued signal once, in arrival order
    async fn replay_deferred(&mut self) {
        let pending = std::mem::take(&mut self.deferred);
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), unit = %self.ctx.unit, "Replaying deferred signals");
        for signal in pending {
            self.process(signal).await;
        }
    }

    async fn block(&self, kind: SignalKind, reason: &str) {
        error!(signal = %kind, unit = %self.ctx.unit, reason, "Unit blocked");
        self.ctx.local().await.blocked = Some(BlockedReason {
            source: kind,
            message: reason.to_string(),
        });
    }

    async fn set_error(&self, kind: SignalKind, reason: &str) {
        error!(signal = %kind, unit = %self.ctx.unit, reason, "Unit in error");
        self.ctx.local().await.error = Some(reason.to_string());
    }

    fn record(&self, kind: SignalKind, outcome: &str, started: Instant) {
        if let Some(health) = &self.ctx.health_state {
            health
                .metrics
                .record_signal(kind.as_str(), outcome, started.elapsed().as_secs_f64());
            health.metrics.set_deferred(self.deferred.len());
            health.touch();
        }
    }

    /// Recompute and publish the unit status
    pub async fn refresh_status(&self) -> UnitStatus {
        let status = match self.ctx.load_state().await {
            Ok(state) => {
                let unit = self.ctx.unit_view(&state).await;
                let local = self.ctx.local().await;
                compute_status(&state, &unit, &local)
            }
            Err(e) => {
                debug!(error = %e, "Cluster state unavailable, keeping last status");
                match &self.ctx.health_state {
                    Some(health) => return health.status().await,
                    None => return UnitStatus::default(),
                }
            }
        };

        if let Some(health) = &self.ctx.health_state {
            health.set_status(status.clone()).await;
        }
        if let Err(e) = self.ctx.publisher.publish(&self.ctx.unit, &status).await {
            debug!(error = %e, "Failed to publish unit status");
        }
        status
    }

    /// Consume envelopes until every sender is dropped
    pub async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        if let Some(health) = &self.ctx.health_state {
            health.set_ready(true).await;
        }
        info!(unit = %self.ctx.unit, "Dispatcher started");

        while let Some(envelope) = rx.recv().await {
            if envelope.signal.is_command() {
                let result = self.run_command(envelope.signal).await;
                if let Some(reply) = envelope.reply
                    && reply.send(result).is_err()
                {
                    debug!("Command caller went away before the result");
                }
            } else {
                self.dispatch(envelope.signal).await;
            }
        }

        if let Some(health) = &self.ctx.health_state {
            health.set_ready(false).await;
        }
        info!(unit = %self.ctx.unit, "Dispatcher stopped");
    }
}

/// Periodic health check: refresh roles, re-place the TLS server, converge
/// membership on the leader and settle a started restore
async fn health_check(ctx: &Context) -> Result<Step> {
    if !ctx.local().await.container_ready {
        let reachable = ctx.workload.can_connect().await;
        ctx.local().await.container_ready = reachable;
    }
    let state = ctx.load_state().await?;
    if !state.initialised {
        return Ok(Step::Completed);
    }

    refresh_role_labels(ctx).await?;
    check_restore_progress(ctx).await?;
    // placement waits are resolved by a later health check
    update_tls_server(ctx).await?;
    if ctx.is_leader() && state.restoring.is_none() {
        reconcile(ctx).await?;
    }
    Ok(Step::Completed)
}
