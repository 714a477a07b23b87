//! Prometheus metrics for the operator process
//!
//! One [`OperatorMetrics`] value owns the registry and is shared through `Arc`
//! by the startup sequencer, the admission handlers and the leader loop.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

/// Path serving the text exposition format
pub const METRICS_PATH: &str = "/metrics";

/// Operator metric handles
pub struct OperatorMetrics {
    registry: Registry,

    /// Startup task outcomes, by `task` and `result` (success, error, cancelled)
    pub startup_tasks_total: IntCounterVec,

    /// Admission requests, by `path` and `result` (allowed, patched, denied)
    pub admission_requests_total: IntCounterVec,

    /// Managed instances touched by upgrade tasks, by `kind` and `result`
    pub upgraded_instances_total: IntCounterVec,

    /// 1 while this replica holds the leader lease
    pub leader_status: IntGauge,
}

impl OperatorMetrics {
    /// Create all metrics and register them with a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("opentelemetry_operator".to_string()), None)?;

        let startup_tasks_total = IntCounterVec::new(
            Opts::new("startup_tasks_total", "Startup task executions by outcome"),
            &["task", "result"],
        )?;
        registry.register(Box::new(startup_tasks_total.clone()))?;

        let admission_requests_total = IntCounterVec::new(
            Opts::new("admission_requests_total", "Admission requests by outcome"),
            &["path", "result"],
        )?;
        registry.register(Box::new(admission_requests_total.clone()))?;

        let upgraded_instances_total = IntCounterVec::new(
            Opts::new(
                "upgraded_instances_total",
                "Managed instances processed by upgrade tasks",
            ),
            &["kind", "result"],
        )?;
        registry.register(Box::new(upgraded_instances_total.clone()))?;

        let leader_status = IntGauge::new("leader_status", "Whether this replica is the leader")?;
        registry.register(Box::new(leader_status.clone()))?;

        Ok(Self {
            registry,
            startup_tasks_total,
            admission_requests_total,
            upgraded_instances_total,
            leader_status,
        })
    }

    /// Record one startup task outcome
    pub fn task_finished(&self, task: &str, result: &str) {
        self.startup_tasks_total
            .with_label_values(&[task, result])
            .inc();
    }

    /// Record one admission outcome
    pub fn admission(&self, path: &str, result: &str) {
        self.admission_requests_total
            .with_label_values(&[path, result])
            .inc();
    }

    /// Record one upgrade outcome
    pub fn upgrade(&self, kind: &str, result: &str) {
        self.upgraded_instances_total
            .with_label_values(&[kind, result])
            .inc();
    }

    /// Encode every metric in the Prometheus text format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

async fn metrics_handler(State(metrics): State<Arc<OperatorMetrics>>) -> Response {
    match metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Router serving [`METRICS_PATH`]
pub fn metrics_router(metrics: Arc<OperatorMetrics>) -> Router {
    Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.task_finished("auto-detect", "success");
        metrics.admission("/mutate-v1-pod", "patched");
        metrics.leader_status.set(1);

        let output = metrics.export().unwrap();
        assert!(output.contains("opentelemetry_operator_startup_tasks_total"));
        assert!(output.contains("task=\"auto-detect\""));
        assert!(output.contains("opentelemetry_operator_leader_status 1"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = OperatorMetrics::new().unwrap();
        let b = OperatorMetrics::new().unwrap();
        a.upgrade("OpenTelemetryCollector", "upgraded");
        assert!(a.export().unwrap().contains("kind=\"OpenTelemetryCollector\""));
        assert!(!b.export().unwrap().contains("kind=\"OpenTelemetryCollector\""));
    }
}
