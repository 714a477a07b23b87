//! Diagnostics listener served on the profiling address

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::config::ResolvedConfig;

/// Process command line, NUL separated
pub const CMDLINE_PATH: &str = "/debug/pprof/cmdline";

/// Resolved configuration as JSON
pub const CONFIG_PATH: &str = "/debug/config";

async fn cmdline() -> String {
    std::env::args().collect::<Vec<_>>().join("\x00")
}

async fn resolved_config(State(config): State<Arc<ResolvedConfig>>) -> Json<ResolvedConfig> {
    Json(config.as_ref().clone())
}

/// Router for the diagnostics listener
pub fn diagnostics_router(config: Arc<ResolvedConfig>) -> Router {
    Router::new()
        .route(CMDLINE_PATH, get(cmdline))
        .route(CONFIG_PATH, get(resolved_config))
        .with_state(config)
}
