//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe
//! - `/readyz` - Readiness probe (leadership acquired, controllers running)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Per-cluster labels
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl EncodeLabelSet for ClusterLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for phase gauges and counters
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-volume counters
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct VolumeLabels {
    pub namespace: String,
    pub cluster: String,
    pub role: String,
}

impl EncodeLabelSet for VolumeLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("cluster", self.cluster.as_str()).encode(encoder.encode_label())?;
        ("role", self.role.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    pub reconciliations_total: Family<ClusterLabels, Counter>,
    pub reconciliation_errors_total: Family<ClusterLabels, Counter>,
    pub reconcile_duration_seconds: Family<ClusterLabels, Histogram>,

    // Instances
    pub cluster_instances_desired: Family<ClusterLabels, Gauge>,
    pub cluster_instances_ready: Family<ClusterLabels, Gauge>,

    // Topology
    pub failovers_total: Family<ClusterLabels, Counter>,
    pub switchovers_total: Family<ClusterLabels, Counter>,
    pub fenced_instances: Family<ClusterLabels, Gauge>,

    // Storage and backups
    pub resize_requests_total: Family<VolumeLabels, Counter>,
    pub backups_total: Family<PhaseLabels, Counter>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("pgha_operator");

        let reconciliations_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let cluster_instances_desired = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "cluster_instances_desired",
            "Desired number of instances for each cluster",
            cluster_instances_desired.clone(),
        );

        let cluster_instances_ready = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "cluster_instances_ready",
            "Number of ready instances for each cluster",
            cluster_instances_ready.clone(),
        );

        let failovers_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "failovers",
            "Number of failovers started",
            failovers_total.clone(),
        );

        let switchovers_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "switchovers",
            "Number of switchovers started",
            switchovers_total.clone(),
        );

        let fenced_instances = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "fenced_instances",
            "Number of fenced instances for each cluster",
            fenced_instances.clone(),
        );

        let resize_requests_total = Family::<VolumeLabels, Counter>::default();
        registry.register(
            "resize_requests",
            "Number of PVC storage request increases",
            resize_requests_total.clone(),
        );

        let backups_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "backups",
            "Number of backups that reached a terminal phase",
            backups_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            cluster_instances_desired,
            cluster_instances_ready,
            failovers_total,
            switchovers_total,
            fenced_instances,
            resize_requests_total,
            backups_total,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ClusterLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    pub fn set_cluster_instances(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ClusterLabels::new(namespace, name);
        self.cluster_instances_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_instances_ready.get_or_create(&labels).set(ready);
    }

    pub fn record_failover(&self, namespace: &str, name: &str) {
        self.failovers_total
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    pub fn record_switchover(&self, namespace: &str, name: &str) {
        self.switchovers_total
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    pub fn set_fenced_instances(&self, namespace: &str, name: &str, count: i64) {
        self.fenced_instances
            .get_or_create(&ClusterLabels::new(namespace, name))
            .set(count);
    }

    pub fn record_resize_request(&self, namespace: &str, cluster: &str, role: &str) {
        let labels = VolumeLabels {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            role: role.to_string(),
        };
        self.resize_requests_total.get_or_create(&labels).inc();
    }

    pub fn record_backup(&self, phase: &str) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.backups_total.get_or_create(&labels).inc();
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails.
    pub fn encode(&self) -> String {
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
    /// Set once leadership is held and the controllers are running
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
    /// Unix seconds of the last successful reconcile
    pub last_reconcile: AtomicU64,
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
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve health and metrics endpoints on 0.0.0.0:`port`
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, app).await
}
