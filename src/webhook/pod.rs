//! Pod Mutation Webhook
//!
//! Handles AdmissionReview requests for Pods: only CREATE requests are
//! mutated, the pod's namespace is looked up, the admission chain runs in
//! order and the difference is returned as a JSON patch. Any failure denies
//! the request.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use tracing::{debug, error, info, warn};

use super::{WebhookError, WebhookState, POD_MUTATE_PATH};

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let req: AdmissionRequest<Pod> = body.try_into().map_err(|e| {
        error!(error = %e, "failed to parse pod admission request");
        WebhookError::InvalidReview(format!("{e}"))
    })?;

    let response = mutate_pod(&state, &req).await;
    Ok(Json(response.into_review()))
}

/// Process a single pod admission request
pub async fn mutate_pod(state: &WebhookState, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let uid = request.uid.clone();

    if !matches!(request.operation, Operation::Create) {
        debug!(uid = %uid, operation = ?request.operation, "not a create request, allowing unchanged");
        state.metrics.admission(POD_MUTATE_PATH, "allowed");
        return AdmissionResponse::from(request);
    }

    let Some(pod) = request.object.clone() else {
        debug!(uid = %uid, "no pod object in request, allowing unchanged");
        state.metrics.admission(POD_MUTATE_PATH, "allowed");
        return AdmissionResponse::from(request);
    };

    let namespace_name = request
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone());
    let Some(namespace_name) = namespace_name else {
        return deny(state, request, "pod has no namespace".to_string());
    };

    let namespace = match state.namespaces.get(&namespace_name).await {
        Ok(ns) => ns,
        Err(e) => {
            warn!(uid = %uid, namespace = %namespace_name, error = %e, "failed to look up pod namespace");
            return deny(state, request, format!("failed to look up namespace {namespace_name}: {e}"));
        }
    };

    let original = match serde_json::to_value(&pod) {
        Ok(v) => v,
        Err(e) => return deny(state, request, format!("failed to encode pod: {e}")),
    };

    let mutated = match state.chain.apply(&namespace, pod).await {
        Ok(p) => p,
        Err(e) => {
            warn!(uid = %uid, namespace = %namespace_name, error = %e, "pod mutation failed");
            return deny(state, request, e.to_string());
        }
    };

    let mutated = match serde_json::to_value(&mutated) {
        Ok(v) => v,
        Err(e) => return deny(state, request, format!("failed to encode mutated pod: {e}")),
    };

    let patch = json_patch::diff(&original, &mutated);
    if patch.0.is_empty() {
        debug!(uid = %uid, "pod unchanged by mutators");
        state.metrics.admission(POD_MUTATE_PATH, "allowed");
        return AdmissionResponse::from(request);
    }

    info!(uid = %uid, namespace = %namespace_name, patch_ops = patch.0.len(), "patching pod");
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => {
            state.metrics.admission(POD_MUTATE_PATH, "patched");
            response
        }
        Err(e) => {
            error!(uid = %uid, error = %e, "failed to serialize patch");
            deny(state, request, format!("patch serialization error: {e}"))
        }
    }
}

fn deny(state: &WebhookState, request: &AdmissionRequest<Pod>, reason: String) -> AdmissionResponse {
    state.metrics.admission(POD_MUTATE_PATH, "denied");
    AdmissionResponse::from(request).deny(reason)
}
