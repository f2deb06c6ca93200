//! Collaborators the lifecycle controller drives
//!
//! Each external system sits behind a trait so the controller can be exercised
//! against in-memory fakes:
//! - [`ControlPlane`]: the HA control plane (Patroni) and its membership
//! - [`BackupEngine`]: the backup engine (pgBackRest) running in the database container
//! - [`ObjectStorage`]: the S3 repository, for probes and log upload
//! - [`Workload`]: the database process and its data directory
//! - [`Discovery`]: routing labels that services select on, including whether
//!   the unit accepts client connections
//! - [`StatusPublisher`]: where the unit status is shown to operators
//!
//! The Kubernetes-backed implementations live in the submodules.

pub mod exec;
pub mod labels;
mod object_storage;
mod patroni;
mod pgbackrest;
mod pod_metadata;
mod workload;

pub use exec::{ExecError, ExecOutput, PodExec};
pub use object_storage::{ObjectStorageError, S3ObjectStorage};
pub use patroni::{ControlPlaneError, PatroniClient};
pub use pgbackrest::{BackupEngineError, PgBackRest};
pub use pod_metadata::{MetadataError, PodMetadata};
pub use workload::{KubeWorkload, WorkloadError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::controller::UnitStatus;
use crate::model::{
    BackupType, CertificateKind, RepositoryBackup, S3Config, TlsMaterial, TlsServerRole,
};

/// Role of a member as reported by the control plane
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    #[serde(alias = "master", alias = "primary")]
    Leader,
    StandbyLeader,
    Replica,
    SyncStandby,
    #[serde(other)]
    Unknown,
}

/// Lifecycle state of a member as reported by the control plane
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Running,
    Streaming,
    Starting,
    #[serde(rename = "start failed")]
    StartFailed,
    Stopped,
    #[serde(other)]
    Other,
}

/// One member of the replication group
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub role: MemberRole,
    #[serde(default = "unknown_state")]
    pub state: MemberState,
}

fn unknown_state() -> MemberState {
    MemberState::Other
}

impl Member {
    /// Member is up and serving (or streaming from the primary)
    pub fn is_running(&self) -> bool {
        matches!(self.state, MemberState::Running | MemberState::Streaming)
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.role, MemberRole::Leader | MemberRole::StandbyLeader)
    }
}

/// The HA control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Current members of the replication group
    async fn members(&self) -> Result<Vec<Member>, ControlPlaneError>;

    /// Make `unit` visible to the control plane. Idempotent.
    async fn add_member(&self, unit: &str, address: &str) -> Result<(), ControlPlaneError>;

    /// Remove `unit` from the replication group. Idempotent.
    async fn remove_member(&self, unit: &str) -> Result<(), ControlPlaneError>;

    async fn set_synchronous_mode(&self, enabled: bool) -> Result<(), ControlPlaneError>;

    /// Configure the next bootstrap to restore from the repository
    async fn reconfigure_for_restore(
        &self,
        stanza: &str,
        restore_command: &str,
    ) -> Result<(), ControlPlaneError>;

    /// Remove the control plane's record of the previous cluster
    async fn clear_cluster_metadata(&self) -> Result<(), ControlPlaneError>;

    /// State of one member, if the control plane knows it
    async fn member(&self, unit: &str) -> Result<Option<Member>, ControlPlaneError> {
        Ok(self
            .members()
            .await?
            .into_iter()
            .find(|member| member.name == unit))
    }

    async fn is_member_running(&self, unit: &str) -> Result<bool, ControlPlaneError> {
        Ok(self.member(unit).await?.is_some_and(|m| m.is_running()))
    }

    /// Name of the current primary, if any
    async fn primary(&self) -> Result<Option<String>, ControlPlaneError> {
        Ok(self
            .members()
            .await?
            .into_iter()
            .find(Member::is_primary)
            .map(|member| member.name))
    }
}

/// Output of a successful backup run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupRun {
    /// Engine label of the backup just taken, when it could be determined
    pub label: Option<String>,
    /// Engine output, uploaded next to the backup
    pub log: String,
}

/// The backup engine
#[async_trait]
pub trait BackupEngine: Send + Sync {
    /// Render repository settings for `stanza`
    async fn configure(&self, stanza: &str, s3: &S3Config) -> Result<(), BackupEngineError>;

    /// Create the stanza in the repository
    async fn init_stanza(&self, stanza: &str) -> Result<(), BackupEngineError>;

    /// Check that WAL segments reach the repository
    async fn verify_wal_archiving(&self, stanza: &str) -> Result<(), BackupEngineError>;

    async fn create_backup(
        &self,
        stanza: &str,
        backup_type: BackupType,
    ) -> Result<BackupRun, BackupEngineError>;

    async fn list_backups(&self, stanza: &str) -> Result<Vec<RepositoryBackup>, BackupEngineError>;

    /// Command the control plane runs to restore `label` into an empty data directory
    fn restore_command(&self, stanza: &str, label: &str) -> String;

    /// Start, reconfigure or stop the engine's TLS server
    async fn set_tls_server(&self, role: TlsServerRole) -> Result<(), BackupEngineError>;
}

/// The S3 repository, as seen from the agent
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write and remove a probe object to prove the repository is reachable
    async fn probe(&self, s3: &S3Config) -> Result<(), ObjectStorageError>;

    async fn upload(&self, s3: &S3Config, key: &str, body: String)
    -> Result<(), ObjectStorageError>;
}

/// The database workload in this unit
#[async_trait]
pub trait Workload: Send + Sync {
    /// The database container accepts commands
    async fn can_connect(&self) -> bool;

    async fn stop_database(&self) -> Result<(), WorkloadError>;

    async fn start_database(&self) -> Result<(), WorkloadError>;

    async fn restart_database(&self) -> Result<(), WorkloadError>;

    async fn clear_data_directory(&self) -> Result<(), WorkloadError>;

    async fn data_directory_is_empty(&self) -> Result<bool, WorkloadError>;

    async fn install_tls_material(
        &self,
        kind: CertificateKind,
        material: &TlsMaterial,
    ) -> Result<(), WorkloadError>;

    async fn remove_tls_material(&self, kind: CertificateKind) -> Result<(), WorkloadError>;
}

/// Routing labels consumed by the cluster's services
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn set_member(&self, unit: &str, member: bool) -> Result<(), MetadataError>;

    async fn set_primary(&self, unit: &str, primary: bool) -> Result<(), MetadataError>;

    /// Route client connections to the unit again, or stop routing them
    async fn set_client_connections(&self, unit: &str, allowed: bool)
    -> Result<(), MetadataError>;
}

/// Sink for the computed unit status
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, unit: &str, status: &UnitStatus) -> Result<(), MetadataError>;
}
