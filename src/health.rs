//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the dispatcher running?)
//! - `/metrics` - Prometheus metrics
//! - `/status` - The unit's current status as JSON

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::controller::UnitStatus;

/// Labels for per-signal outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SignalLabels {
    pub signal: String,
    pub outcome: String,
}

impl prometheus_client::encoding::EncodeLabelSet for SignalLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("signal", self.signal.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for metrics keyed by signal only
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SignalNameLabels {
    pub signal: String,
}

impl prometheus_client::encoding::EncodeLabelSet for SignalNameLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("signal", self.signal.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the unit status gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StatusLabels {
    pub status: String,
}

impl prometheus_client::encoding::EncodeLabelSet for StatusLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("status", self.status.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Signals handled, by signal and outcome
    pub signals_total: Family<SignalLabels, Counter>,
    /// Time spent in one reconciliation pass
    pub signal_duration_seconds: Family<SignalNameLabels, Histogram>,
    /// Signals waiting in the deferred queue
    pub deferred_signals: Gauge,
    /// 1 for the unit's current status, 0 for the others
    pub unit_status: Family<StatusLabels, Gauge>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let signals_total = Family::<SignalLabels, Counter>::default();
        registry.register(
            "postgres_lifecycle_signals",
            "Total number of lifecycle signals and commands handled",
            signals_total.clone(),
        );

        let signal_duration_seconds =
            Family::<SignalNameLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "postgres_lifecycle_signal_duration_seconds",
            "Duration of a reconciliation pass in seconds",
            signal_duration_seconds.clone(),
        );

        let deferred_signals = Gauge::default();
        registry.register(
            "postgres_lifecycle_deferred_signals",
            "Number of signals waiting to be replayed",
            deferred_signals.clone(),
        );

        let unit_status = Family::<StatusLabels, Gauge>::default();
        registry.register(
            "postgres_lifecycle_unit_status",
            "Current externally visible status of the unit",
            unit_status.clone(),
        );

        Self {
            signals_total,
            signal_duration_seconds,
            deferred_signals,
            unit_status,
            registry,
        }
    }

    /// Record one handled signal
    pub fn record_signal(&self, signal: &str, outcome: &str, duration_secs: f64) {
        self.signals_total
            .get_or_create(&SignalLabels {
                signal: signal.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.signal_duration_seconds
            .get_or_create(&SignalNameLabels {
                signal: signal.to_string(),
            })
            .observe(duration_secs);
    }

    pub fn set_deferred(&self, count: usize) {
        self.deferred_signals.set(count as i64);
    }

    pub fn set_unit_status(&self, status: &UnitStatus) {
        for name in UnitStatus::names() {
            let value = i64::from(name == status.name());
            self.unit_status
                .get_or_create(&StatusLabels {
                    status: name.to_string(),
                })
                .set(value);
        }
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the dispatcher is consuming signals
    pub ready: RwLock<bool>,
    /// Last computed unit status
    pub status: RwLock<UnitStatus>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Unix time of the last handled signal
    pub last_signal: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            status: RwLock::new(UnitStatus::default()),
            metrics: Metrics::new(),
            last_signal: AtomicU64::new(0),
        }
    }

    /// Mark the agent as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the agent is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub async fn set_status(&self, status: UnitStatus) {
        self.metrics.set_unit_status(&status);
        *self.status.write().await = status;
    }

    pub async fn status(&self) -> UnitStatus {
        self.status.read().await.clone()
    }

    pub fn touch(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_signal.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK once the dispatcher runs, 503 Service Unavailable before.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
///
/// Returns Prometheus-formatted metrics.
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn status(State(state): State<Arc<HealthState>>) -> Json<UnitStatus> {
    Json(state.status().await)
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}
