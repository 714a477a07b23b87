//! Liveness and readiness endpoints
//!
//! Both endpoints run every installed check and answer 200 `ok` when all pass,
//! 500 with the failing check names otherwise.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::debug;

/// Liveness path
pub const HEALTHZ_PATH: &str = "/healthz";

/// Readiness path
pub const READYZ_PATH: &str = "/readyz";

/// A named probe check
pub type Check = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Check that always passes
pub fn ping() -> Check {
    Arc::new(|| Ok(()))
}

/// Installed liveness and readiness checks
#[derive(Clone, Default)]
pub struct HealthChecks {
    healthz: Vec<(String, Check)>,
    readyz: Vec<(String, Check)>,
}

impl HealthChecks {
    /// No checks installed
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a liveness check
    pub fn add_healthz(&mut self, name: impl Into<String>, check: Check) {
        self.healthz.push((name.into(), check));
    }

    /// Install a readiness check
    pub fn add_readyz(&mut self, name: impl Into<String>, check: Check) {
        self.readyz.push((name.into(), check));
    }

    /// Names of installed liveness and readiness checks
    pub fn names(&self) -> (Vec<&str>, Vec<&str>) {
        (
            self.healthz.iter().map(|(n, _)| n.as_str()).collect(),
            self.readyz.iter().map(|(n, _)| n.as_str()).collect(),
        )
    }
}

fn run_checks(checks: &[(String, Check)]) -> Response {
    let failed: Vec<String> = checks
        .iter()
        .filter_map(|(name, check)| match check() {
            Ok(()) => None,
            Err(reason) => {
                debug!(check = %name, reason = %reason, "probe check failed");
                Some(format!("[-]{name} failed: {reason}"))
            }
        })
        .collect();

    if failed.is_empty() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, failed.join("\n")).into_response()
    }
}

async fn healthz(State(checks): State<Arc<HealthChecks>>) -> Response {
    run_checks(&checks.healthz)
}

async fn readyz(State(checks): State<Arc<HealthChecks>>) -> Response {
    run_checks(&checks.readyz)
}

/// Router serving both probe endpoints
pub fn health_router(checks: HealthChecks) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(READYZ_PATH, get(readyz))
        .with_state(Arc::new(checks))
}
