//! Backup records and repository listings

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format of user-facing backup ids
const BACKUP_ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Timestamp prefix of a pgBackRest backup label (`20240101-090000F`)
const LABEL_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Kind of backup
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Full,
    Differential,
    Incremental,
}

impl BackupType {
    /// Value passed to the backup engine's `--type` option
    pub fn engine_flag(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Differential => "diff",
            BackupType::Incremental => "incr",
        }
    }

    /// Parse the backup engine's own type name
    pub fn from_engine(value: &str) -> Option<Self> {
        match value {
            "full" => Some(BackupType::Full),
            "diff" => Some(BackupType::Differential),
            "incr" => Some(BackupType::Incremental),
            _ => None,
        }
    }

    /// Whether this type needs a finished full backup to build on
    pub fn requires_full_base(&self) -> bool {
        !matches!(self, BackupType::Full)
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "full"),
            BackupType::Differential => write!(f, "differential"),
            BackupType::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "differential" => Ok(BackupType::Differential),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(format!(
                "invalid backup type {:?}, expected one of: full, differential, incremental",
                other
            )),
        }
    }
}

/// Status of a backup attempt
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackupRecordStatus {
    InProgress,
    Finished,
    Failed,
}

impl BackupRecordStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupRecordStatus::InProgress)
    }
}

impl fmt::Display for BackupRecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupRecordStatus::InProgress => write!(f, "in-progress"),
            BackupRecordStatus::Finished => write!(f, "finished"),
            BackupRecordStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A terminal record was asked to change
#[derive(Debug, thiserror::Error)]
#[error("backup record {id} is already {status}")]
pub struct RecordError {
    pub id: String,
    pub status: BackupRecordStatus,
}

/// Metadata for one backup attempt made by this agent
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Timestamp-derived id; provisional until the engine reports its label
    pub id: String,
    pub backup_type: BackupType,
    pub status: BackupRecordStatus,
    /// Repository location (`s3://bucket/path`)
    pub repository: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    /// Create an in-progress record stamped with the current time
    pub fn start(backup_type: BackupType, repository: impl Into<String>) -> Self {
        let started_at = Utc::now();
        Self {
            id: started_at.format(BACKUP_ID_FORMAT).to_string(),
            backup_type,
            status: BackupRecordStatus::InProgress,
            repository: repository.into(),
            started_at,
            finished_at: None,
        }
    }

    /// Mark the record finished, adopting the engine-assigned id when known
    pub fn finish(&mut self, engine_id: Option<String>) -> Result<(), RecordError> {
        self.transition(BackupRecordStatus::Finished)?;
        if let Some(id) = engine_id {
            self.id = id;
        }
        Ok(())
    }

    /// Mark the record failed
    pub fn fail(&mut self) -> Result<(), RecordError> {
        self.transition(BackupRecordStatus::Failed)
    }

    fn transition(&mut self, to: BackupRecordStatus) -> Result<(), RecordError> {
        if self.status.is_terminal() {
            return Err(RecordError {
                id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = to;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// A backup as enumerated from the repository
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepositoryBackup {
    /// Engine label (`20240101-090000F`, `20240101-090000F_20240101-100000D`)
    pub label: String,
    pub backup_type: BackupType,
    pub status: BackupRecordStatus,
}

impl RepositoryBackup {
    /// User-facing id derived from the label; falls back to the raw label
    pub fn id(&self) -> String {
        backup_id_from_label(&self.label).unwrap_or_else(|| self.label.clone())
    }
}

/// Derive the timestamp id of a backup from its engine label
///
/// Differential and incremental labels carry the label of their base backup
/// as a prefix; the id is taken from the last segment.
pub fn backup_id_from_label(label: &str) -> Option<String> {
    let own = label.rsplit('_').next()?;
    let stamp = own.get(..15)?;
    let parsed = NaiveDateTime::parse_from_str(stamp, LABEL_FORMAT).ok()?;
    Some(parsed.format(BACKUP_ID_FORMAT).to_string())
}

/// Render backups as the table returned by the list-backups command
pub fn format_backup_list(backups: &[RepositoryBackup]) -> String {
    let header = format!("{:<21} | {:<12} | backup-status", "backup-id", "backup-type");
    let mut lines = vec![header.clone(), "-".repeat(header.len())];
    for backup in backups {
        lines.push(format!(
            "{:<21} | {:<12} | {}",
            backup.id(),
            backup.backup_type.to_string(),
            backup.status
        ));
    }
    lines.join("\n")
}
