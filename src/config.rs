//! Agent configuration from the environment

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::controller::context::DEFAULT_READINESS_RETRY_BUDGET;
use crate::controller::dispatcher::DEFAULT_DEFER_WARN_THRESHOLD;
use crate::model::CertificateKind;

/// Patroni REST API port
pub const DEFAULT_PATRONI_PORT: u16 = 8008;
/// Health, metrics and action endpoints
pub const DEFAULT_AGENT_PORT: u16 = 8080;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SECRET_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_CONTAINER: &str = "postgres";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },

    #[error("{name}={value:?} is not a valid number")]
    Invalid { name: &'static str, value: String },
}

/// Everything the agent needs to know about where it runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    pub pod_name: String,
    pub namespace: String,
    pub cluster_name: String,
    /// Address registered with the control plane
    pub pod_ip: String,
    /// Database container commands are executed in
    pub container: String,
    pub patroni_port: u16,
    pub agent_port: u16,
    pub health_check_interval: Duration,
    pub secret_poll_interval: Duration,
    pub readiness_retry_budget: u32,
    pub defer_warn_threshold: u32,
    /// Secret holding the S3 repository settings
    pub s3_secret: String,
}

impl AgentConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let pod_name = get("POD_NAME").unwrap_or_else(|| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let namespace = get("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default'");
            "default".to_string()
        });
        let cluster_name = get("CLUSTER_NAME").ok_or(ConfigError::Missing {
            name: "CLUSTER_NAME",
        })?;
        let pod_ip = get("POD_IP").unwrap_or_else(|| pod_name.clone());
        let s3_secret = get("S3_SECRET_NAME").unwrap_or_else(|| format!("{}-s3", cluster_name));

        Ok(Self {
            container: get("DATABASE_CONTAINER").unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
            patroni_port: parse(&get, "PATRONI_PORT", DEFAULT_PATRONI_PORT)?,
            agent_port: parse(&get, "AGENT_PORT", DEFAULT_AGENT_PORT)?,
            health_check_interval: Duration::from_secs(parse(
                &get,
                "HEALTH_CHECK_INTERVAL_SECS",
                DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            )?),
            secret_poll_interval: Duration::from_secs(parse(
                &get,
                "SECRET_POLL_INTERVAL_SECS",
                DEFAULT_SECRET_POLL_INTERVAL_SECS,
            )?),
            readiness_retry_budget: parse(
                &get,
                "READINESS_RETRY_BUDGET",
                DEFAULT_READINESS_RETRY_BUDGET,
            )?,
            defer_warn_threshold: parse(
                &get,
                "DEFER_WARN_THRESHOLD",
                DEFAULT_DEFER_WARN_THRESHOLD,
            )?,
            pod_name,
            namespace,
            cluster_name,
            pod_ip,
            s3_secret,
        })
    }

    /// Backup stanza of the cluster
    pub fn stanza(&self) -> String {
        format!("{}.{}", self.namespace, self.cluster_name)
    }

    /// Secret holding this unit's certificate of `kind`
    pub fn tls_secret(&self, kind: CertificateKind) -> String {
        format!("{}-{}-tls", self.pod_name, kind)
    }
}

fn parse<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}
