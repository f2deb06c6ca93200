pub mod api;
pub mod clients;
pub mod config;
pub mod controller;
pub mod health;
pub mod model;
pub mod sources;
pub mod store;

pub use config::{AgentConfig, ConfigError};
pub use controller::{
    BackoffConfig, Collaborators, CommandOutput, CommandResult, Context, Dispatcher, Envelope,
    Error, ErrorClass, Outcome, Result, Step, UnitStatus,
};
pub use health::{HealthState, Metrics};
pub use model::{ClusterState, Signal, SignalKind};

use std::sync::Arc;

use kube::Client;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use clients::{KubeWorkload, PatroniClient, PgBackRest, PodExec, PodMetadata, S3ObjectStorage};
use store::ConfigMapStore;

/// Capacity of the signal channel
const SIGNAL_QUEUE_CAPACITY: usize = 64;

/// Wire the Kubernetes-backed collaborators for this unit
pub fn collaborators(client: Client, config: &AgentConfig) -> Collaborators {
    let exec = PodExec::new(
        client.clone(),
        &config.namespace,
        &config.pod_name,
        &config.container,
    );
    let metadata = Arc::new(PodMetadata::new(client.clone(), &config.namespace));

    Collaborators {
        store: Arc::new(ConfigMapStore::new(
            client.clone(),
            &config.namespace,
            &config.cluster_name,
        )),
        control_plane: Arc::new(PatroniClient::new(
            client,
            &config.namespace,
            &config.cluster_name,
            &config.pod_ip,
            config.patroni_port,
            exec.clone(),
        )),
        backup_engine: Arc::new(PgBackRest::new(exec.clone())),
        object_storage: Arc::new(S3ObjectStorage::new()),
        workload: Arc::new(KubeWorkload::new(exec)),
        discovery: metadata.clone(),
        publisher: metadata,
    }
}

/// Run the agent for one unit.
///
/// Spawns the signal sources, the dispatcher and the HTTP server, and returns
/// when any of them stops.
pub async fn run_agent(
    client: Client,
    config: AgentConfig,
    health_state: Arc<HealthState>,
) -> std::io::Result<()> {
    let collaborators = collaborators(client.clone(), &config);
    let workload = collaborators.workload.clone();
    let ctx = Arc::new(
        Context::new(&config.pod_name, &config.stanza(), collaborators)
            .with_address(&config.pod_ip)
            .with_readiness_retry_budget(config.readiness_retry_budget)
            .with_health_state(health_state.clone()),
    );

    let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
    let dispatcher =
        Dispatcher::new(ctx.clone()).with_defer_warn_threshold(config.defer_warn_threshold);

    let app = health::create_router(health_state).merge(api::create_router(tx.clone()));
    let addr = format!("0.0.0.0:{}", config.agent_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Agent server listening on {}", addr);

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(dispatcher.run(rx));
    tasks.spawn(sources::run_leader_election(
        client.clone(),
        config.clone(),
        ctx,
        tx.clone(),
    ));
    tasks.spawn(sources::run_health_ticks(
        config.health_check_interval,
        tx.clone(),
    ));
    tasks.spawn(sources::run_container_probe(workload, tx.clone()));
    tasks.spawn(sources::run_s3_watch(client.clone(), config.clone(), tx.clone()));
    tasks.spawn(sources::run_certificate_watch(
        client.clone(),
        config.clone(),
        tx.clone(),
    ));
    tasks.spawn(sources::run_pod_watch(client, config, tx));
    tasks.spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Agent server error: {}", e);
        }
    });

    if let Some(Err(e)) = tasks.join_next().await {
        tracing::error!("Agent task panicked: {}", e);
    }
    tracing::error!("Agent task ended unexpectedly");
    tasks.shutdown().await;
    Ok(())
}
