//! Patroni as the HA control plane
//!
//! Cluster state is read from the local Patroni REST API (`GET /cluster`) and
//! dynamic configuration is changed with `PATCH /config`. Membership follows
//! Patroni's Kubernetes DCS: a pod takes part in the cluster while it carries
//! the scope label, so joining and leaving are label patches.
//!
//! The REST API is plain HTTP on the pod network without authentication.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::exec::{ExecError, PodExec, shell, write_file_command};
use super::labels::{FIELD_MANAGER, SCOPE_LABEL};
use super::{ControlPlane, Member};

/// Overall timeout for one REST call (connect + request + response)
const OVERALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Directory Patroni merges its configuration from
const PATRONI_CONFIG_DIR: &str = "/home/postgres/patroni.d";

/// Bootstrap override written before a restore
const RESTORE_CONFIG_FILE: &str = "90-restore.yml";

/// Suffixes of the DCS objects Patroni keeps per scope
const DCS_SUFFIXES: [&str; 5] = ["", "-config", "-leader", "-failover", "-sync"];

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Exec failed: {0}")]
    ExecError(#[from] ExecError),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Request timed out")]
    Timeout,
}

type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Response of `GET /cluster`
#[derive(Debug, Deserialize)]
struct ClusterResponse {
    #[serde(default)]
    members: Vec<Member>,
}

/// Patroni client bound to one unit's REST API and the cluster's DCS scope
pub struct PatroniClient {
    host: String,
    port: u16,
    scope: String,
    pods: Api<Pod>,
    endpoints: Api<Endpoints>,
    configmaps: Api<ConfigMap>,
    exec: PodExec,
}

impl PatroniClient {
    pub fn new(
        client: Client,
        namespace: &str,
        scope: &str,
        host: &str,
        port: u16,
        exec: PodExec,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            scope: scope.to_string(),
            pods: Api::namespaced(client.clone(), namespace),
            endpoints: Api::namespaced(client.clone(), namespace),
            configmaps: Api::namespaced(client, namespace),
            exec,
        }
    }

    /// Send one request to the REST API and return the response body
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Bytes> {
        timeout(OVERALL_TIMEOUT, self.send(method, path, body))
            .await
            .map_err(|_| ControlPlaneError::Timeout)?
    }

    async fn send(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Bytes> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ControlPlaneError::ConnectionError(format!("Invalid address: {}", e)))?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ControlPlaneError::ConnectionError(e.to_string()))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| ControlPlaneError::HttpError(e.to_string()))?;

        let payload = match body {
            Some(value) => Bytes::from(serde_json::to_vec(&value)?),
            None => Bytes::new(),
        };
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("Host", format!("{}:{}", self.host, self.port))
            .header("Content-Type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| ControlPlaneError::HttpError(e.to_string()))?;

        let response = tokio::select! {
            conn_result = conn => {
                if let Err(e) = conn_result {
                    debug!("Connection closed: {}", e);
                }
                return Err(ControlPlaneError::ConnectionError(
                    "Connection closed unexpectedly".to_string(),
                ));
            }
            response = sender.send_request(req) => {
                response.map_err(|e| ControlPlaneError::HttpError(e.to_string()))?
            }
        };

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ControlPlaneError::HttpError(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(ControlPlaneError::HttpError(format!(
                "HTTP {} on {} {}: {}",
                status.as_u16(),
                method,
                path,
                String::from_utf8_lossy(&body)
            )));
        }

        trace!(
            host = %self.host,
            path,
            response = %String::from_utf8_lossy(&body),
            "Patroni response"
        );
        Ok(body)
    }

    async fn patch_scope_label(&self, unit: &str, value: Option<&str>) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "labels": { SCOPE_LABEL: value }
            }
        });
        self.pods
            .patch(unit, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Render the bootstrap override that restores `restore_command` into an empty data directory
///
/// JSON is valid YAML, so the document is written with serde_json.
fn restore_bootstrap_config(stanza: &str, restore_command: &str) -> serde_json::Value {
    serde_json::json!({
        "bootstrap": {
            "method": "pgbackrest",
            "pgbackrest": {
                "command": restore_command,
                "keep_existing_recoveryconf": true,
                "no_params": true,
            }
        },
        "postgresql": {
            "recovery_conf": {
                "restore_command": format!("pgbackrest --stanza={} archive-get %f \"%p\"", stanza),
            }
        }
    })
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

#[async_trait]
impl ControlPlane for PatroniClient {
    async fn members(&self) -> Result<Vec<Member>> {
        let body = self.request("GET", "/cluster", None).await?;
        let cluster: ClusterResponse = serde_json::from_slice(&body)?;
        Ok(cluster.members)
    }

    async fn add_member(&self, unit: &str, address: &str) -> Result<()> {
        debug!(unit, address, scope = %self.scope, "Labelling pod into Patroni scope");
        self.patch_scope_label(unit, Some(&self.scope)).await
    }

    async fn remove_member(&self, unit: &str) -> Result<()> {
        match self.patch_scope_label(unit, None).await {
            Err(ControlPlaneError::KubeError(ref e)) if is_not_found(e) => {
                debug!(unit, "Departed pod already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn set_synchronous_mode(&self, enabled: bool) -> Result<()> {
        self.request(
            "PATCH",
            "/config",
            Some(serde_json::json!({ "synchronous_mode": enabled })),
        )
        .await?;
        info!(enabled, "Updated Patroni synchronous mode");
        Ok(())
    }

    async fn reconfigure_for_restore(&self, stanza: &str, restore_command: &str) -> Result<()> {
        let config =
            serde_json::to_string_pretty(&restore_bootstrap_config(stanza, restore_command))?;
        let path = format!("{}/{}", PATRONI_CONFIG_DIR, RESTORE_CONFIG_FILE);
        let script = format!(
            "mkdir -p {} && {}",
            PATRONI_CONFIG_DIR,
            write_file_command(&path, &config)
        );
        self.exec.run_checked(&shell(&script)).await?;
        info!(path = %path, "Wrote restore bootstrap configuration");
        Ok(())
    }

    async fn clear_cluster_metadata(&self) -> Result<()> {
        for suffix in DCS_SUFFIXES {
            let name = format!("{}{}", self.scope, suffix);
            for result in [
                self.endpoints
                    .delete(&name, &DeleteParams::default())
                    .await
                    .map(|_| ()),
                self.configmaps
                    .delete(&name, &DeleteParams::default())
                    .await
                    .map(|_| ()),
            ] {
                match result {
                    Ok(()) => debug!(name = %name, "Deleted DCS object"),
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        info!(scope = %self.scope, "Cleared Patroni cluster metadata");
        Ok(())
    }
}
