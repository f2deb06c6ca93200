//! Data model shared by every unit of a cluster
//!
//! - [`ClusterState`]: the replicated peer document (leader-written)
//! - [`Unit`]: one member process as seen from its own agent
//! - [`BackupRecord`]: metadata for one backup attempt
//! - [`S3Config`]: object-storage coordinates for the backup repository
//! - [`TlsState`]: per-unit certificate posture
//! - [`Signal`]: lifecycle signals and user commands fed to the dispatcher

pub mod backup;
pub mod cluster_state;
pub mod s3;
pub mod signal;
pub mod tls;
pub mod unit;

pub use backup::{
    BackupRecord, BackupRecordStatus, BackupType, RecordError, RepositoryBackup,
    backup_id_from_label, format_backup_list,
};
pub use cluster_state::{ClusterState, CredentialSet, OperationKind, OperationLease, UnitData};
pub use s3::S3Config;
pub use signal::{Signal, SignalKind};
pub use tls::{CertificateKind, TlsMaterial, TlsServerRole, TlsState};
pub use unit::{Unit, UnitRole};
