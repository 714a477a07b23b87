//! Mutating admission webhooks
//!
//! The admission path is decided once at startup from [`AdmissionMode`]:
//!
//! - Enabled: the pod mutation chain and the custom-resource defaulting
//!   handlers are constructed and mounted on the webhook server
//! - Disabled: nothing is constructed and the process runs without any
//!   mutation capability, which is an unsupported mode
//!
//! The pod chain order is fixed: sidecar injection first, then instrumentation
//! injection, so the instrumentation mutator sees an injected collector sidecar.

pub mod defaulting;
pub mod pod;
pub mod tls;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::config::{AdmissionMode, DefaultImages};
use crate::metrics::OperatorMetrics;
use crate::Error;

/// Path of the pod mutation entry point
pub const POD_MUTATE_PATH: &str = "/mutate-v1-pod";

/// Path of the OpenTelemetryCollector defaulting entry point
pub const COLLECTOR_DEFAULT_PATH: &str = "/mutate-opentelemetry-io-v1alpha1-opentelemetrycollector";

/// Path of the Instrumentation defaulting entry point
pub const INSTRUMENTATION_DEFAULT_PATH: &str = "/mutate-opentelemetry-io-v1alpha1-instrumentation";

/// Error type for webhook request handling
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let WebhookError::InvalidReview(message) = self;
        (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// One step of pod mutation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodMutator: Send + Sync {
    /// Name used in logs and denial messages
    fn name(&self) -> &'static str;

    /// Return the mutated pod
    async fn mutate(&self, namespace: &Namespace, pod: Pod) -> Result<Pod, Error>;
}

/// Looks up the namespace of an admitted pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceLookup: Send + Sync {
    /// Fetch the namespace called `name`
    async fn get(&self, name: &str) -> Result<Namespace, Error>;
}

/// Namespace lookup through the Kubernetes API
pub struct KubeNamespaceLookup {
    api: Api<Namespace>,
}

impl KubeNamespaceLookup {
    /// Lookup using `client`
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NamespaceLookup for KubeNamespaceLookup {
    async fn get(&self, name: &str) -> Result<Namespace, Error> {
        Ok(self.api.get(name).await?)
    }
}

/// Ordered, immutable list of pod mutators
#[derive(Clone)]
pub struct AdmissionChain {
    mutators: Arc<[Arc<dyn PodMutator>]>,
}

impl AdmissionChain {
    /// Chain applying `mutators` in the given order
    pub fn new(mutators: Vec<Arc<dyn PodMutator>>) -> Self {
        Self {
            mutators: mutators.into(),
        }
    }

    /// Mutator names in application order
    pub fn names(&self) -> Vec<&'static str> {
        self.mutators.iter().map(|m| m.name()).collect()
    }

    /// Run every mutator in order, stopping at the first failure
    pub async fn apply(&self, namespace: &Namespace, mut pod: Pod) -> Result<Pod, Error> {
        for mutator in self.mutators.iter() {
            pod = mutator
                .mutate(namespace, pod)
                .await
                .map_err(|e| Error::webhook(format!("{} mutator failed: {e}", mutator.name())))?;
        }
        Ok(pod)
    }
}

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Pod mutation chain
    pub chain: AdmissionChain,
    /// Namespace lookup for admitted pods
    pub namespaces: Arc<dyn NamespaceLookup>,
    /// Default images used by the defaulting handlers
    pub images: DefaultImages,
    /// Admission outcome counters
    pub metrics: Arc<OperatorMetrics>,
}

/// Create the webhook router with all mutation endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(POD_MUTATE_PATH, post(pod::mutate_handler))
        .route(COLLECTOR_DEFAULT_PATH, post(defaulting::collector_handler))
        .route(
            INSTRUMENTATION_DEFAULT_PATH,
            post(defaulting::instrumentation_handler),
        )
        .with_state(state)
}

/// Outcome of the admission wiring decision
pub enum AdmissionWiring {
    /// Mutation entry points were constructed
    Enabled(Arc<WebhookState>),
    /// Nothing was constructed
    Disabled,
}

impl AdmissionWiring {
    /// Decide once whether the admission path exists
    ///
    /// `build` is only called when `mode` is enabled; its failure is fatal.
    pub fn decide<F>(mode: AdmissionMode, build: F) -> Result<Self, Error>
    where
        F: FnOnce() -> Result<WebhookState, Error>,
    {
        match mode {
            AdmissionMode::Enabled => {
                let state = build()?;
                info!(
                    path = POD_MUTATE_PATH,
                    mutators = ?state.chain.names(),
                    "admission webhooks enabled"
                );
                Ok(Self::Enabled(Arc::new(state)))
            }
            AdmissionMode::Disabled => {
                warn!(
                    ENABLE_WEBHOOKS = "false",
                    "webhooks are disabled, operator is running an unsupported mode"
                );
                Ok(Self::Disabled)
            }
        }
    }

    /// True when the entry points exist
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    /// Router for the webhook server, `None` when disabled
    pub fn router(&self) -> Option<Router> {
        match self {
            Self::Enabled(state) => Some(webhook_router(Arc::clone(state))),
            Self::Disabled => None,
        }
    }

    /// Mounted entry point paths
    pub fn paths(&self) -> &'static [&'static str] {
        match self {
            Self::Enabled(_) => &[
                POD_MUTATE_PATH,
                COLLECTOR_DEFAULT_PATH,
                INSTRUMENTATION_DEFAULT_PATH,
            ],
            Self::Disabled => &[],
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::webhook::test_support::state_with_chain;

    fn recording(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn PodMutator> {
        let mut mutator = MockPodMutator::new();
        mutator.expect_name().return_const(name);
        mutator.expect_mutate().returning(move |_, pod| {
            log.lock().unwrap().push(name);
            Ok(pod)
        });
        Arc::new(mutator)
    }

    // =========================================================================
    // Chain
    // =========================================================================

    #[tokio::test]
    async fn test_chain_applies_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = AdmissionChain::new(vec![
            recording("sidecar", Arc::clone(&log)),
            recording("instrumentation", Arc::clone(&log)),
        ]);

        chain.apply(&Namespace::default(), Pod::default()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["sidecar", "instrumentation"]);
        assert_eq!(chain.names(), vec!["sidecar", "instrumentation"]);
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = MockPodMutator::new();
        failing.expect_name().return_const("sidecar");
        failing
            .expect_mutate()
            .returning(|_, _| Err(Error::webhook("no collector")));

        let chain = AdmissionChain::new(vec![
            Arc::new(failing),
            recording("instrumentation", Arc::clone(&log)),
        ]);
        let err = chain
            .apply(&Namespace::default(), Pod::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sidecar mutator failed"));
        assert!(log.lock().unwrap().is_empty());
    }

    // =========================================================================
    // Wiring decision
    // =========================================================================

    #[test]
    fn test_disabled_never_constructs_entry_point() {
        let built = AtomicBool::new(false);
        let wiring = AdmissionWiring::decide(AdmissionMode::Disabled, || {
            built.store(true, Ordering::SeqCst);
            Ok(state_with_chain(AdmissionChain::new(Vec::new())))
        })
        .unwrap();

        assert!(!built.load(Ordering::SeqCst));
        assert!(!wiring.is_enabled());
        assert!(wiring.router().is_none());
        assert!(wiring.paths().is_empty());
    }

    #[test]
    fn test_enabled_mounts_pod_path() {
        let wiring = AdmissionWiring::decide(AdmissionMode::Enabled, || {
            Ok(state_with_chain(AdmissionChain::new(Vec::new())))
        })
        .unwrap();

        assert!(wiring.is_enabled());
        assert!(wiring.router().is_some());
        assert!(wiring.paths().contains(&POD_MUTATE_PATH));
    }

    #[test]
    fn test_enabled_construction_failure_is_fatal() {
        let result = AdmissionWiring::decide(AdmissionMode::Enabled, || {
            Err(Error::webhook("missing client"))
        });
        assert!(matches!(result, Err(Error::Webhook(_))));
    }

    #[test]
    fn test_webhook_error_display() {
        let err = WebhookError::InvalidReview("missing request".to_string());
        assert_eq!(err.to_string(), "invalid admission review: missing request");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
