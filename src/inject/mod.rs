//! Pod mutators for the admission chain
//!
//! The chain runs [`SidecarInjector`] first, then [`InstrumentationInjector`].
//! Both read their opt-in annotation from the pod first and fall back to the
//! pod's namespace.

mod instrumentation;
mod sidecar;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Pod};

use crate::config::DefaultImages;
use crate::webhook::{AdmissionChain, PodMutator};

pub use instrumentation::{InstrumentationInjector, INSTRUMENTATION_VOLUME_PREFIX};
pub use sidecar::{SidecarInjector, SIDECAR_ANNOTATION, SIDECAR_CONTAINER_NAME};

/// Annotation lookup: pod wins over namespace
pub(crate) fn annotation<'a>(pod: &'a Pod, namespace: &'a Namespace, key: &str) -> Option<&'a str> {
    let lookup = |annotations: Option<&'a BTreeMap<String, String>>| {
        annotations.and_then(|a| a.get(key)).map(String::as_str)
    };
    lookup(pod.metadata.annotations.as_ref())
        .or_else(|| lookup(namespace.metadata.annotations.as_ref()))
}

/// The pod admission chain in its fixed order: sidecar, then instrumentation
pub fn default_chain(images: &DefaultImages) -> AdmissionChain {
    let mutators: Vec<Arc<dyn PodMutator>> = vec![
        Arc::new(SidecarInjector::new(images.collector.clone())),
        Arc::new(InstrumentationInjector::new(images.clone())),
    ];
    AdmissionChain::new(mutators)
}
