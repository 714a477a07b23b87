//! Custom-resource defaulting webhooks
//!
//! Fill unset fields of OpenTelemetryCollector and Instrumentation objects on
//! CREATE and UPDATE and return the difference as a JSON patch.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use super::{WebhookError, WebhookState, COLLECTOR_DEFAULT_PATH, INSTRUMENTATION_DEFAULT_PATH};
use crate::config::DefaultImages;
use crate::crd::{
    CollectorMode, Instrumentation, Language, OpenTelemetryCollector, UpgradeStrategy,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};

/// Apply collector defaults in place
pub fn default_collector(collector: &mut OpenTelemetryCollector) {
    let mode = *collector.spec.mode.get_or_insert(CollectorMode::Deployment);
    if collector.spec.replicas.is_none()
        && matches!(mode, CollectorMode::Deployment | CollectorMode::StatefulSet)
    {
        collector.spec.replicas = Some(1);
    }
    collector
        .spec
        .upgrade_strategy
        .get_or_insert(UpgradeStrategy::Automatic);
    collector
        .labels_mut()
        .entry(MANAGED_BY_LABEL.to_string())
        .or_insert_with(|| MANAGED_BY_VALUE.to_string());
}

/// Apply instrumentation defaults in place
///
/// Each language's default-image annotation is stamped when missing, and an
/// empty image is filled from that annotation.
pub fn default_instrumentation(inst: &mut Instrumentation, images: &DefaultImages) {
    for lang in Language::ALL {
        let annotated = inst
            .annotations_mut()
            .entry(lang.default_image_annotation())
            .or_insert_with(|| lang.default_image(images).to_string())
            .clone();
        let spec = inst.spec.language_mut(lang);
        if spec.image.is_empty() {
            spec.image = annotated;
        }
    }
}

/// Handle defaulting review for OpenTelemetryCollector
pub async fn collector_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<OpenTelemetryCollector>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let req: AdmissionRequest<OpenTelemetryCollector> = body
        .try_into()
        .map_err(|e| WebhookError::InvalidReview(format!("{e}")))?;
    let response = apply_defaults(&state, &req, COLLECTOR_DEFAULT_PATH, |obj, _| {
        default_collector(obj)
    });
    Ok(Json(response.into_review()))
}

/// Handle defaulting review for Instrumentation
pub async fn instrumentation_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Instrumentation>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let req: AdmissionRequest<Instrumentation> = body
        .try_into()
        .map_err(|e| WebhookError::InvalidReview(format!("{e}")))?;
    let response = apply_defaults(&state, &req, INSTRUMENTATION_DEFAULT_PATH, |obj, images| {
        default_instrumentation(obj, images)
    });
    Ok(Json(response.into_review()))
}

fn apply_defaults<K, F>(
    state: &WebhookState,
    request: &AdmissionRequest<K>,
    path: &str,
    defaulter: F,
) -> AdmissionResponse
where
    K: Resource + Clone + Serialize + DeserializeOwned,
    F: FnOnce(&mut K, &DefaultImages),
{
    let mutating = matches!(request.operation, Operation::Create | Operation::Update);
    let Some(object) = request.object.as_ref().filter(|_| mutating) else {
        state.metrics.admission(path, "allowed");
        return AdmissionResponse::from(request);
    };

    let mut defaulted = object.clone();
    defaulter(&mut defaulted, &state.images);

    let patch = match (serde_json::to_value(object), serde_json::to_value(&defaulted)) {
        (Ok(before), Ok(after)) => json_patch::diff(&before, &after),
        (Err(e), _) | (_, Err(e)) => {
            error!(uid = %request.uid, error = %e, "failed to encode object for defaulting");
            state.metrics.admission(path, "denied");
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    };

    if patch.0.is_empty() {
        state.metrics.admission(path, "allowed");
        return AdmissionResponse::from(request);
    }

    debug!(uid = %request.uid, path, patch_ops = patch.0.len(), "defaulting object");
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => {
            state.metrics.admission(path, "patched");
            response
        }
        Err(e) => {
            state.metrics.admission(path, "denied");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}
