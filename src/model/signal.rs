//! Lifecycle signals and user commands

use std::fmt;

use serde::{Deserialize, Serialize};

use super::backup::BackupType;
use super::s3::S3Config;
use super::tls::{CertificateKind, TlsMaterial};

/// A signal delivered to one unit's dispatcher
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum Signal {
    /// The database container on this unit can be reached
    ContainerReady,
    /// This unit acquired the leadership lease
    LeaderElected,
    /// Units were added to or changed in the peer group
    PeerTopologyChanged,
    /// A unit is leaving the peer group
    #[serde(rename_all = "kebab-case")]
    PeerDeparted { unit: String },
    /// The repository configuration changed; `None` means the relation is gone
    S3ConfigChanged {
        #[serde(default)]
        config: Option<S3Config>,
    },
    #[serde(rename_all = "kebab-case")]
    CertificateIssued {
        unit: String,
        kind: CertificateKind,
        material: TlsMaterial,
    },
    #[serde(rename_all = "kebab-case")]
    CertificateRemoved {
        unit: String,
        kind: CertificateKind,
    },
    #[serde(rename_all = "kebab-case")]
    CreateBackupRequested {
        #[serde(default)]
        backup_type: BackupType,
    },
    ListBackupsRequested,
    #[serde(rename_all = "kebab-case")]
    RestoreRequested {
        #[serde(default)]
        backup_id: Option<String>,
    },
    PeriodicHealthCheck,
}

/// Payload-free discriminant of a [`Signal`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    ContainerReady,
    LeaderElected,
    PeerTopologyChanged,
    PeerDeparted,
    S3ConfigChanged,
    CertificateIssued,
    CertificateRemoved,
    CreateBackupRequested,
    ListBackupsRequested,
    RestoreRequested,
    PeriodicHealthCheck,
}

impl SignalKind {
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            SignalKind::CreateBackupRequested
                | SignalKind::ListBackupsRequested
                | SignalKind::RestoreRequested
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::ContainerReady => "container-ready",
            SignalKind::LeaderElected => "leader-elected",
            SignalKind::PeerTopologyChanged => "peer-topology-changed",
            SignalKind::PeerDeparted => "peer-departed",
            SignalKind::S3ConfigChanged => "s3-config-changed",
            SignalKind::CertificateIssued => "certificate-issued",
            SignalKind::CertificateRemoved => "certificate-removed",
            SignalKind::CreateBackupRequested => "create-backup-requested",
            SignalKind::ListBackupsRequested => "list-backups-requested",
            SignalKind::RestoreRequested => "restore-requested",
            SignalKind::PeriodicHealthCheck => "periodic-health-check",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::ContainerReady => SignalKind::ContainerReady,
            Signal::LeaderElected => SignalKind::LeaderElected,
            Signal::PeerTopologyChanged => SignalKind::PeerTopologyChanged,
            Signal::PeerDeparted { .. } => SignalKind::PeerDeparted,
            Signal::S3ConfigChanged { .. } => SignalKind::S3ConfigChanged,
            Signal::CertificateIssued { .. } => SignalKind::CertificateIssued,
            Signal::CertificateRemoved { .. } => SignalKind::CertificateRemoved,
            Signal::CreateBackupRequested { .. } => SignalKind::CreateBackupRequested,
            Signal::ListBackupsRequested => SignalKind::ListBackupsRequested,
            Signal::RestoreRequested { .. } => SignalKind::RestoreRequested,
            Signal::PeriodicHealthCheck => SignalKind::PeriodicHealthCheck,
        }
    }

    /// User-invoked commands resolve to success or failure and never defer
    pub fn is_command(&self) -> bool {
        self.kind().is_command()
    }

    /// Signals allowed to run before the cluster is initialised
    ///
    /// Container-ready and leader-elected drive initialisation itself; the
    /// health check only recomputes status.
    pub fn runs_before_initialisation(&self) -> bool {
        self.is_command()
            || matches!(
                self,
                Signal::ContainerReady | Signal::LeaderElected | Signal::PeriodicHealthCheck
            )
    }
}
