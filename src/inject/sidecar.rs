//! Collector sidecar injection

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, Namespace, Pod};
use tracing::debug;

use super::annotation;
use crate::webhook::PodMutator;
use crate::Error;

/// Pod or namespace annotation requesting a collector sidecar
pub const SIDECAR_ANNOTATION: &str = "sidecar.opentelemetry.io/inject";

/// Name of the injected container
pub const SIDECAR_CONTAINER_NAME: &str = "otc-container";

/// Adds a collector container to opted-in pods
pub struct SidecarInjector {
    image: String,
}

impl SidecarInjector {
    /// Injector using `image` for the sidecar container
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    fn container(&self, pod: &Pod) -> Container {
        let mut env = vec![EnvVar {
            name: "POD_NAME".to_string(),
            value: pod.metadata.name.clone(),
            ..Default::default()
        }];
        if let Some(ns) = &pod.metadata.namespace {
            env.push(EnvVar {
                name: "POD_NAMESPACE".to_string(),
                value: Some(ns.clone()),
                ..Default::default()
            });
        }

        Container {
            name: SIDECAR_CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            args: Some(vec!["--config=env:OTEL_CONFIG".to_string()]),
            env: Some(env),
            ..Default::default()
        }
    }
}

fn requested(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) => !v.eq_ignore_ascii_case("false") && !v.is_empty(),
    }
}

#[async_trait]
impl PodMutator for SidecarInjector {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    async fn mutate(&self, namespace: &Namespace, mut pod: Pod) -> Result<Pod, Error> {
        if !requested(annotation(&pod, namespace, SIDECAR_ANNOTATION)) {
            return Ok(pod);
        }

        let container = self.container(&pod);
        let Some(spec) = pod.spec.as_mut() else {
            return Err(Error::webhook("pod has no spec"));
        };
        if spec.containers.iter().any(|c| c.name == SIDECAR_CONTAINER_NAME) {
            debug!("sidecar already present");
            return Ok(pod);
        }
        spec.containers.push(container);
        Ok(pod)
    }
}
