//! Error types for the lifecycle controller

use std::time::Duration;

use thiserror::Error;

use crate::clients::{
    BackupEngineError, ControlPlaneError, ExecError, MetadataError, ObjectStorageError,
    WorkloadError,
};
use crate::model::{OperationLease, RecordError};
use crate::store::StoreError;

/// How the dispatcher reacts to a failed handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient condition; the signal is queued and replayed
    Deferrable,
    /// The request cannot be honoured in the current state; nothing changed
    Precondition,
    /// Something broke while acting; the unit is blocked with the reason
    Operational,
    /// An internal invariant was violated; the unit goes into error
    Fatal,
}

/// Error variants are named with the `Error` suffix for clarity (e.g., `StoreError`, `WorkloadError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Cluster state error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Control plane error: {0}")]
    ControlPlaneError(#[from] ControlPlaneError),

    #[error("Backup engine error: {0}")]
    BackupEngineError(#[from] BackupEngineError),

    #[error("Workload error: {0}")]
    WorkloadError(#[from] WorkloadError),

    #[error("Discovery error: {0}")]
    MetadataError(#[from] MetadataError),

    #[error("Object storage error: {0}")]
    ObjectStorageError(#[from] ObjectStorageError),

    #[error(transparent)]
    RecordError(#[from] RecordError),

    #[error("{} operation in progress on {}", .0.kind, .0.holder)]
    OperationInProgress(OperationLease),

    #[error("only the leader may change {0}")]
    NotLeaderError(&'static str),

    #[error("{0}")]
    PreconditionError(String),

    /// A command ran and failed; reported to the caller only
    #[error("{0}")]
    ActionError(String),

    #[error("{0}")]
    OperationalError(String),

    #[error("{0}")]
    FatalError(String),
}

impl Error {
    pub fn precondition(reason: impl Into<String>) -> Self {
        Error::PreconditionError(reason.into())
    }

    pub fn action(reason: impl Into<String>) -> Self {
        Error::ActionError(reason.into())
    }

    pub fn operational(reason: impl Into<String>) -> Self {
        Error::OperationalError(reason.into())
    }

    /// Classify the error for the dispatcher
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::StoreError(e) => match e {
                StoreError::InvariantViolation(_) | StoreError::SerializationError(_) => {
                    ErrorClass::Fatal
                }
                StoreError::KubeError(kube_err) if !is_retryable_kube(kube_err) => {
                    ErrorClass::Operational
                }
                _ => ErrorClass::Deferrable,
            },
            Error::ControlPlaneError(e) => match e {
                ControlPlaneError::KubeError(kube_err) if !is_retryable_kube(kube_err) => {
                    ErrorClass::Operational
                }
                ControlPlaneError::ExecError(ExecError::CommandFailed { .. }) => {
                    ErrorClass::Operational
                }
                _ => ErrorClass::Deferrable,
            },
            Error::BackupEngineError(e) => match e {
                BackupEngineError::ExecError(ExecError::CommandFailed { .. })
                | BackupEngineError::StanzaNotFound(_)
                | BackupEngineError::JsonError(_) => ErrorClass::Operational,
                BackupEngineError::ExecError(_) => ErrorClass::Deferrable,
            },
            Error::WorkloadError(e) => match e {
                WorkloadError::ExecError(ExecError::CommandFailed { .. }) => {
                    ErrorClass::Operational
                }
                WorkloadError::IncompleteMaterial(_) => ErrorClass::Precondition,
                WorkloadError::ExecError(_) => ErrorClass::Deferrable,
            },
            Error::MetadataError(MetadataError::KubeError(kube_err)) => {
                if is_retryable_kube(kube_err) {
                    ErrorClass::Deferrable
                } else {
                    ErrorClass::Operational
                }
            }
            Error::ObjectStorageError(_) => ErrorClass::Deferrable,
            Error::OperationInProgress(_) => ErrorClass::Deferrable,
            Error::NotLeaderError(_) | Error::PreconditionError(_) | Error::ActionError(_) => {
                ErrorClass::Precondition
            }
            Error::OperationalError(_) => ErrorClass::Operational,
            Error::RecordError(_) | Error::FatalError(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error clears up by retrying later
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Deferrable
    }
}

/// 4xx responses other than 409 Conflict and 429 TooManyRequests are not worth retrying
fn is_retryable_kube(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(api_err) => {
            let code = api_err.code;
            if (400..500).contains(&code) {
                return code == 409 || code == 429;
            }
            true
        }
        _ => true,
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// No waiting between attempts
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}

/// Consecutive deferrals of one signal kind
#[derive(Clone, Debug, Default)]
pub struct DeferralCounter {
    /// Number of consecutive deferrals
    pub consecutive: u32,
    /// Reason given by the last deferral
    pub last_reason: Option<String>,
}

impl DeferralCounter {
    pub fn record(&mut self, reason: &str) {
        self.consecutive += 1;
        self.last_reason = Some(reason.to_string());
    }

    /// Called once the signal kind completes
    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.last_reason = None;
    }

    pub fn exceeded(&self, threshold: u32) -> bool {
        self.consecutive >= threshold
    }
}
