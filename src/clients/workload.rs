//! The database process inside the Spilo container
//!
//! Patroni (and with it PostgreSQL) runs under supervisord, so stopping and
//! starting the database goes through `supervisorctl`.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Workload;
use super::exec::{ExecError, PodExec, shell, write_file_command};
use crate::model::{CertificateKind, TlsMaterial};

/// Data directory of the database
pub(crate) const PG_DATA: &str = "/home/postgres/pgdata/pgroot/data";

/// Root of the installed certificate material
const TLS_ROOT: &str = "/home/postgres/tls";

/// Directory holding the certificate triple of one kind
pub(crate) fn tls_dir(kind: CertificateKind) -> String {
    format!("{}/{}", TLS_ROOT, kind)
}

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("Exec failed: {0}")]
    ExecError(#[from] ExecError),

    #[error("Incomplete {0} certificate material")]
    IncompleteMaterial(CertificateKind),
}

type Result<T> = std::result::Result<T, WorkloadError>;

pub struct KubeWorkload {
    exec: PodExec,
}

impl KubeWorkload {
    pub fn new(exec: PodExec) -> Self {
        Self { exec }
    }

    async fn supervisorctl(&self, action: &str) -> Result<()> {
        self.exec
            .run_checked(&shell(&format!("supervisorctl {} patroni", action)))
            .await?;
        info!(pod = %self.exec.pod(), action, "Changed database process state");
        Ok(())
    }
}

#[async_trait]
impl Workload for KubeWorkload {
    async fn can_connect(&self) -> bool {
        match self.exec.run(&shell("true")).await {
            Ok(output) => output.success,
            Err(e) => {
                debug!(error = %e, "Database container not reachable");
                false
            }
        }
    }

    async fn stop_database(&self) -> Result<()> {
        self.supervisorctl("stop").await
    }

    async fn start_database(&self) -> Result<()> {
        self.supervisorctl("start").await
    }

    async fn restart_database(&self) -> Result<()> {
        self.supervisorctl("restart").await
    }

    async fn clear_data_directory(&self) -> Result<()> {
        self.exec
            .run_checked(&shell(&format!(
                "[ ! -d {0} ] || find {0} -mindepth 1 -delete",
                PG_DATA
            )))
            .await?;
        warn!(path = PG_DATA, "Cleared data directory");
        Ok(())
    }

    async fn data_directory_is_empty(&self) -> Result<bool> {
        let output = self
            .exec
            .run_checked(&shell(&format!(
                "[ ! -d {0} ] || find {0} -mindepth 1 -print -quit",
                PG_DATA
            )))
            .await?;
        Ok(output.stdout.trim().is_empty())
    }

    async fn install_tls_material(
        &self,
        kind: CertificateKind,
        material: &TlsMaterial,
    ) -> Result<()> {
        let (Some(cert), Some(key), Some(ca)) = (&material.cert, &material.key, &material.ca)
        else {
            return Err(WorkloadError::IncompleteMaterial(kind));
        };
        let dir = tls_dir(kind);
        let script = [
            "set -e".to_string(),
            format!("mkdir -p {}", dir),
            write_file_command(&format!("{}/cert.pem", dir), cert),
            write_file_command(&format!("{}/key.pem", dir), key),
            write_file_command(&format!("{}/ca.pem", dir), ca),
            format!("chmod 600 {}/key.pem", dir),
            format!("chown -R postgres {}", dir),
        ]
        .join("\n");
        self.exec.run_checked(&shell(&script)).await?;
        info!(kind = %kind, "Installed certificate material");
        Ok(())
    }

    async fn remove_tls_material(&self, kind: CertificateKind) -> Result<()> {
        self.exec
            .run_checked(&shell(&format!("rm -rf {}", tls_dir(kind))))
            .await?;
        info!(kind = %kind, "Removed certificate material");
        Ok(())
    }
}
