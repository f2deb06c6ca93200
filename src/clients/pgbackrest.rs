//! pgBackRest as the backup engine
//!
//! Every command runs inside the database container as the `postgres` user.
//! Repository settings are rendered into the pgBackRest configuration file
//! whenever the S3 coordinates change; the TLS server settings live in a
//! separate include file so they can be toggled independently.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::exec::{ExecError, PodExec, as_postgres, shell, write_file_command};
use super::workload::{PG_DATA, tls_dir};
use super::{BackupEngine, BackupRun};
use crate::model::{
    BackupRecordStatus, BackupType, CertificateKind, RepositoryBackup, S3Config, TlsServerRole,
    backup_id_from_label,
};

/// Main pgBackRest configuration file
const CONFIG_PATH: &str = "/etc/pgbackrest/pgbackrest.conf";

/// Include file holding the TLS server settings
const TLS_CONFIG_PATH: &str = "/etc/pgbackrest/conf.d/tls-server.conf";

/// Port the pgBackRest TLS server listens on
const TLS_SERVER_PORT: u16 = 8432;

/// Full backups kept before expiry
const RETENTION_FULL: u32 = 9_999_999;

#[derive(Debug, thiserror::Error)]
pub enum BackupEngineError {
    #[error("Exec failed: {0}")]
    ExecError(#[from] ExecError),

    #[error("Failed to parse pgbackrest info: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("stanza {0} not found in repository")]
    StanzaNotFound(String),
}

type Result<T> = std::result::Result<T, BackupEngineError>;

/// One stanza in `pgbackrest info --output=json`
#[derive(Debug, Deserialize)]
struct StanzaInfo {
    name: String,
    #[serde(default)]
    backup: Vec<BackupInfo>,
}

/// One backup in `pgbackrest info --output=json`
#[derive(Debug, Deserialize)]
struct BackupInfo {
    label: String,
    #[serde(rename = "type")]
    backup_type: String,
    #[serde(default)]
    error: bool,
}

/// pgBackRest driven through `kubectl exec`-style calls into the database container
pub struct PgBackRest {
    exec: PodExec,
}

impl PgBackRest {
    pub fn new(exec: PodExec) -> Self {
        Self { exec }
    }

    async fn run(&self, command_line: &str) -> Result<String> {
        let output = self.exec.run_checked(&as_postgres(command_line)).await?;
        Ok(output.combined())
    }
}

/// Render the repository section of the configuration
fn render_config(stanza: &str, s3: &S3Config) -> String {
    let mut lines = vec![
        "[global]".to_string(),
        "repo1-type=s3".to_string(),
        format!("repo1-path={}", s3.normalized_path()),
        format!("repo1-s3-region={}", s3.region_or_default()),
        format!("repo1-retention-full={}", RETENTION_FULL),
        "start-fast=y".to_string(),
        "log-level-console=detail".to_string(),
    ];
    if let Some(bucket) = &s3.bucket {
        lines.push(format!("repo1-s3-bucket={}", bucket));
    }
    let endpoint = s3
        .endpoint
        .as_deref()
        .map(|e| e.trim_start_matches("https://").trim_start_matches("http://"))
        .unwrap_or("s3.amazonaws.com");
    lines.push(format!("repo1-s3-endpoint={}", endpoint));
    if let Some(key) = &s3.access_key {
        lines.push(format!("repo1-s3-key={}", key));
    }
    if let Some(secret) = &s3.secret_key {
        lines.push(format!("repo1-s3-key-secret={}", secret));
    }
    if s3.uses_path_style() {
        lines.push("repo1-s3-uri-style=path".to_string());
    }
    lines.push(String::new());
    lines.push(format!("[{}]", stanza));
    lines.push(format!("pg1-path={}", PG_DATA));
    lines.push("pg1-user=postgres".to_string());
    lines.join("\n")
}

/// Render the TLS server include for a running role
fn render_tls_config(role: TlsServerRole) -> String {
    let dir = tls_dir(CertificateKind::Internal);
    let mut lines = vec![
        "[global]".to_string(),
        "tls-server-address=*".to_string(),
        format!("tls-server-port={}", TLS_SERVER_PORT),
        format!("tls-server-cert-file={}/cert.pem", dir),
        format!("tls-server-key-file={}/key.pem", dir),
        format!("tls-server-ca-file={}/ca.pem", dir),
        "tls-server-auth=*=*".to_string(),
    ];
    if role == TlsServerRole::Replica {
        // replicas hand backups to the primary's server
        lines.push("repo1-host-type=tls".to_string());
    }
    lines.join("\n")
}

/// Parse `pgbackrest info --output=json` for one stanza
fn parse_info(stanza: &str, raw: &str) -> Result<Vec<RepositoryBackup>> {
    let stanzas: Vec<StanzaInfo> = serde_json::from_str(raw)?;
    let info = stanzas
        .into_iter()
        .find(|s| s.name == stanza)
        .ok_or_else(|| BackupEngineError::StanzaNotFound(stanza.to_string()))?;

    Ok(info
        .backup
        .into_iter()
        .map(|b| RepositoryBackup {
            backup_type: BackupType::from_engine(&b.backup_type).unwrap_or_default(),
            status: if b.error {
                BackupRecordStatus::Failed
            } else {
                BackupRecordStatus::Finished
            },
            label: b.label,
        })
        .collect())
}

/// Most recent backup by the timestamp in its own label segment
fn latest_label(backups: &[RepositoryBackup]) -> Option<String> {
    backups
        .iter()
        .filter_map(|b| backup_id_from_label(&b.label).map(|id| (id, &b.label)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, label)| label.clone())
}

#[async_trait]
impl BackupEngine for PgBackRest {
    async fn configure(&self, stanza: &str, s3: &S3Config) -> Result<()> {
        let script = format!(
            "mkdir -p /etc/pgbackrest/conf.d && {}",
            write_file_command(CONFIG_PATH, &render_config(stanza, s3))
        );
        self.exec.run_checked(&shell(&script)).await?;
        debug!(stanza, "Rendered pgBackRest configuration");
        Ok(())
    }

    async fn init_stanza(&self, stanza: &str) -> Result<()> {
        self.run(&format!("pgbackrest --stanza={} stanza-create", stanza))
            .await?;
        info!(stanza, "Created backup stanza");
        Ok(())
    }

    async fn verify_wal_archiving(&self, stanza: &str) -> Result<()> {
        self.run(&format!("pgbackrest --stanza={} check", stanza))
            .await?;
        debug!(stanza, "WAL archiving verified");
        Ok(())
    }

    async fn create_backup(&self, stanza: &str, backup_type: BackupType) -> Result<BackupRun> {
        let log = self
            .run(&format!(
                "pgbackrest --stanza={} --type={} backup",
                stanza,
                backup_type.engine_flag()
            ))
            .await?;
        let label = match self.list_backups(stanza).await {
            Ok(backups) => latest_label(&backups),
            Err(e) => {
                debug!(error = %e, "Could not determine label of new backup");
                None
            }
        };
        Ok(BackupRun { label, log })
    }

    async fn list_backups(&self, stanza: &str) -> Result<Vec<RepositoryBackup>> {
        let output = self
            .exec
            .run_checked(&as_postgres(&format!(
                "pgbackrest --stanza={} --output=json info",
                stanza
            )))
            .await?;
        parse_info(stanza, &output.stdout)
    }

    fn restore_command(&self, stanza: &str, label: &str) -> String {
        format!(
            "pgbackrest --stanza={} --set={} --type=immediate --target-action=promote --delta restore",
            stanza, label
        )
    }

    async fn set_tls_server(&self, role: TlsServerRole) -> Result<()> {
        // stop first so a role change restarts with the new include
        self.exec
            .run(&shell("pkill -f 'pgbackrest server' || true"))
            .await?;

        if !role.is_running() {
            self.exec
                .run_checked(&shell(&format!("rm -f {}", TLS_CONFIG_PATH)))
                .await?;
            info!("Stopped pgBackRest TLS server");
            return Ok(());
        }

        let script = format!(
            "{} && chown postgres {}",
            write_file_command(TLS_CONFIG_PATH, &render_tls_config(role)),
            TLS_CONFIG_PATH
        );
        self.exec.run_checked(&shell(&script)).await?;
        self.exec
            .run_checked(&as_postgres("nohup pgbackrest server >/dev/null 2>&1 &"))
            .await?;
        info!(role = ?role, "Started pgBackRest TLS server");
        Ok(())
    }
}
