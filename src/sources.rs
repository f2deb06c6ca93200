//! Signal sources
//!
//! Each source is a long-running task that observes one external fact and
//! feeds the dispatcher: the leadership lease, the health-check tick, the
//! database container, the repository and certificate Secrets, and the pods
//! of the cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clients::Workload;
use crate::clients::labels::cluster_selector;
use crate::config::AgentConfig;
use crate::controller::{Context, Envelope};
use crate::model::{CertificateKind, S3Config, Signal, TlsMaterial};

/// Lease configuration
pub const LEASE_TTL_SECS: u64 = 15;
pub const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Interval between container reachability checks until the first success
const CONTAINER_POLL_INTERVAL_SECS: u64 = 5;

async fn emit(tx: &mpsc::Sender<Envelope>, signal: Signal) -> bool {
    tx.send(Envelope::signal(signal)).await.is_ok()
}

/// Name of the leadership lease for a cluster
pub fn lease_name(cluster_name: &str) -> String {
    format!("{}-lifecycle-leader", cluster_name)
}

/// Keep trying to hold the cluster's lease; emit leader-elected on every gain
pub async fn run_leader_election(
    client: Client,
    config: AgentConfig,
    ctx: Arc<Context>,
    tx: mpsc::Sender<Envelope>,
) {
    let lease_lock = LeaseLock::new(
        client,
        &config.namespace,
        LeaseLockParams {
            holder_id: config.pod_name.clone(),
            lease_name: lease_name(&config.cluster_name),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    );

    loop {
        let leading = match lease_lock.try_acquire_or_renew().await {
            Ok(result) => result.acquired_lease,
            Err(e) => {
                warn!("Failed to acquire or renew lease: {}", e);
                false
            }
        };

        let was_leading = ctx.set_leader(leading);
        if leading && !was_leading {
            info!(unit = %ctx.unit, "Acquired leadership");
            if !emit(&tx, Signal::LeaderElected).await {
                return;
            }
        } else if !leading && was_leading {
            error!(unit = %ctx.unit, "Lost leadership");
        }

        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }
}

/// Emit a periodic health check every `interval`
pub async fn run_health_ticks(interval: Duration, tx: mpsc::Sender<Envelope>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !emit(&tx, Signal::PeriodicHealthCheck).await {
            return;
        }
    }
}

/// Wait until the database container answers, then emit container-ready once
pub async fn run_container_probe(workload: Arc<dyn Workload>, tx: mpsc::Sender<Envelope>) {
    while !workload.can_connect().await {
        debug!("Database container not ready yet");
        tokio::time::sleep(Duration::from_secs(CONTAINER_POLL_INTERVAL_SECS)).await;
    }
    info!("Database container ready");
    emit(&tx, Signal::ContainerReady).await;
}

fn secret_string_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut data: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .filter_map(|(k, v)| String::from_utf8(v.0.clone()).ok().map(|v| (k.clone(), v)))
        .collect();
    if let Some(string_data) = &secret.string_data {
        data.extend(string_data.clone());
    }
    data
}

async fn read_secret(
    api: &Api<Secret>,
    name: &str,
) -> Result<Option<BTreeMap<String, String>>, kube::Error> {
    Ok(api.get_opt(name).await?.as_ref().map(secret_string_data))
}

/// Certificate material from a `kubernetes.io/tls` style Secret
pub fn tls_material_from_secret(data: &BTreeMap<String, String>) -> TlsMaterial {
    TlsMaterial {
        cert: data.get("tls.crt").cloned(),
        key: data.get("tls.key").cloned(),
        ca: data.get("ca.crt").cloned(),
    }
}

/// Poll the repository Secret and emit s3-config-changed whenever it changes
pub async fn run_s3_watch(client: Client, config: AgentConfig, tx: mpsc::Sender<Envelope>) {
    let api: Api<Secret> = Api::namespaced(client, &config.namespace);
    let mut last: Option<Option<S3Config>> = None;

    loop {
        match read_secret(&api, &config.s3_secret).await {
            Ok(data) => {
                let current = data.as_ref().map(S3Config::from_secret_data);
                if last.as_ref() != Some(&current) {
                    info!(
                        secret = %config.s3_secret,
                        present = current.is_some(),
                        "S3 configuration changed"
                    );
                    let signal = Signal::S3ConfigChanged {
                        config: current.clone(),
                    };
                    if !emit(&tx, signal).await {
                        return;
                    }
                    last = Some(current);
                }
            }
            Err(e) => warn!(secret = %config.s3_secret, error = %e, "Failed to read S3 secret"),
        }
        tokio::time::sleep(config.secret_poll_interval).await;
    }
}

/// Poll this unit's certificate Secrets and emit issued/removed on change
pub async fn run_certificate_watch(
    client: Client,
    config: AgentConfig,
    tx: mpsc::Sender<Envelope>,
) {
    let api: Api<Secret> = Api::namespaced(client, &config.namespace);
    let mut last: BTreeMap<CertificateKind, Option<TlsMaterial>> = BTreeMap::new();

    loop {
        for kind in [CertificateKind::Internal, CertificateKind::External] {
            let name = config.tls_secret(kind);
            let current = match read_secret(&api, &name).await {
                Ok(data) => data.as_ref().map(tls_material_from_secret),
                Err(e) => {
                    warn!(secret = %name, error = %e, "Failed to read certificate secret");
                    continue;
                }
            };

            let previous = last.get(&kind);
            let changed = match previous {
                Some(previous) => previous != &current,
                // nothing to remove before the first observation
                None => current.is_some(),
            };
            if changed {
                let signal = match &current {
                    Some(material) => Signal::CertificateIssued {
                        unit: config.pod_name.clone(),
                        kind,
                        material: material.clone(),
                    },
                    None => Signal::CertificateRemoved {
                        unit: config.pod_name.clone(),
                        kind,
                    },
                };
                info!(secret = %name, kind = %kind, "Certificate changed");
                if !emit(&tx, signal).await {
                    return;
                }
            }
            last.insert(kind, current);
        }
        tokio::time::sleep(config.secret_poll_interval).await;
    }
}

/// Watch the cluster's pods; new or changed pods are topology changes,
/// deleted pods are departures
pub async fn run_pod_watch(client: Client, config: AgentConfig, tx: mpsc::Sender<Envelope>) {
    let api: Api<Pod> = Api::namespaced(client, &config.namespace);
    let selector = cluster_selector(&config.cluster_name);
    let watcher_config = watcher::Config::default().labels(&selector);
    let mut stream = watcher::watcher(api, watcher_config)
        .default_backoff()
        .boxed();

    loop {
        let event = match stream.try_next().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                error!("Pod watch stream ended");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Pod watch error");
                continue;
            }
        };

        let signal = match event {
            Event::Apply(pod) if pod.metadata.deletion_timestamp.is_some() => {
                pod.metadata.name.map(|unit| Signal::PeerDeparted { unit })
            }
            Event::Apply(_) | Event::InitDone => Some(Signal::PeerTopologyChanged),
            Event::Delete(pod) => pod.metadata.name.map(|unit| Signal::PeerDeparted { unit }),
            Event::Init | Event::InitApply(_) => None,
        };
        if let Some(signal) = signal {
            debug!(signal = %signal.kind(), "Pod event");
            if !emit(&tx, signal).await {
                return;
            }
        }
    }
}
