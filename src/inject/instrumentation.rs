//! Auto-instrumentation injection
//!
//! For every language whose inject annotation is `true`, the pod gets an
//! emptyDir volume, an init container that copies the agent into it, and the
//! language's agent hook on the first application container.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Namespace, Pod, Volume, VolumeMount,
};
use tracing::debug;

use super::annotation;
use crate::config::DefaultImages;
use crate::crd::Language;
use crate::webhook::PodMutator;
use crate::Error;

/// Prefix of the shared volume and init container names
pub const INSTRUMENTATION_VOLUME_PREFIX: &str = "opentelemetry-auto-instrumentation";

fn mount_path(lang: Language) -> String {
    format!("/otel-auto-instrumentation-{}", lang.name())
}

/// Environment variable that loads the agent, with the value to append
///
/// The value starts with the list separator used when the variable is set.
fn agent_hook(lang: Language) -> Option<(&'static str, String)> {
    let path = mount_path(lang);
    match lang {
        Language::Java => Some((
            "JAVA_TOOL_OPTIONS",
            format!(" -javaagent:{path}/javaagent.jar"),
        )),
        Language::NodeJs => Some((
            "NODE_OPTIONS",
            format!(" --require {path}/autoinstrumentation.js"),
        )),
        Language::Python => Some((
            "PYTHONPATH",
            format!(":{path}/opentelemetry/instrumentation/auto_instrumentation:{path}"),
        )),
        Language::DotNet => Some((
            "DOTNET_STARTUP_HOOKS",
            format!(":{path}/net/OpenTelemetry.AutoInstrumentation.StartupHook.dll"),
        )),
        Language::Go | Language::ApacheHttpd => None,
    }
}

fn append_env(container: &mut Container, name: &str, suffix: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => {
            let current = existing.value.take().unwrap_or_default();
            existing.value = Some(format!("{current}{suffix}"));
        }
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(suffix.trim_start_matches([' ', ':']).to_string()),
            ..Default::default()
        }),
    }
}

/// Injects language agents into opted-in pods
pub struct InstrumentationInjector {
    images: DefaultImages,
}

impl InstrumentationInjector {
    /// Injector using the configured default agent images
    pub fn new(images: DefaultImages) -> Self {
        Self { images }
    }

    fn inject(&self, pod: &mut Pod, lang: Language) -> Result<(), Error> {
        let Some(spec) = pod.spec.as_mut() else {
            return Err(Error::webhook("pod has no spec"));
        };
        let volume_name = format!("{INSTRUMENTATION_VOLUME_PREFIX}-{}", lang.name());
        if spec
            .init_containers
            .as_ref()
            .is_some_and(|c| c.iter().any(|c| c.name == volume_name))
        {
            debug!(language = lang.name(), "instrumentation already injected");
            return Ok(());
        }

        let path = mount_path(lang);
        let mount = VolumeMount {
            name: volume_name.clone(),
            mount_path: path.clone(),
            ..Default::default()
        };

        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: volume_name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        spec.init_containers
            .get_or_insert_with(Vec::new)
            .push(Container {
                name: volume_name,
                image: Some(lang.default_image(&self.images).to_string()),
                command: Some(vec![
                    "cp".to_string(),
                    "-r".to_string(),
                    "/autoinstrumentation/.".to_string(),
                    path,
                ]),
                volume_mounts: Some(vec![mount.clone()]),
                ..Default::default()
            });

        let Some(app) = spec.containers.first_mut() else {
            return Err(Error::webhook("pod has no containers"));
        };
        app.volume_mounts.get_or_insert_with(Vec::new).push(mount);
        if let Some((name, value)) = agent_hook(lang) {
            append_env(app, name, &value);
        }
        Ok(())
    }
}

#[async_trait]
impl PodMutator for InstrumentationInjector {
    fn name(&self) -> &'static str {
        "instrumentation"
    }

    async fn mutate(&self, namespace: &Namespace, mut pod: Pod) -> Result<Pod, Error> {
        for lang in Language::ALL {
            let requested = annotation(&pod, namespace, &lang.inject_annotation())
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            if requested {
                self.inject(&mut pod, lang)?;
            }
        }
        Ok(pod)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::PodSpec;

    use super::*;
    use crate::version::Version;

    fn injector() -> InstrumentationInjector {
        InstrumentationInjector::new(DefaultImages::for_version(&Version::get()))
    }

    fn pod(annotations: &[(&str, &str)], env: Option<Vec<EnvVar>>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                env,
                ..Default::default()
            }],
            ..Default::default()
        });
        pod
    }

    fn env_value(pod: &Pod, name: &str) -> Option<String> {
        pod.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone()
    }

    #[tokio::test]
    async fn test_java_injection() {
        let annotation = Language::Java.inject_annotation();
        let out = injector()
            .mutate(&Namespace::default(), pod(&[(&annotation, "true")], None))
            .await
            .unwrap();

        let spec = out.spec.as_ref().unwrap();
        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "opentelemetry-auto-instrumentation-java");
        assert!(init.image.as_deref().unwrap().contains("autoinstrumentation-java"));
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(
            env_value(&out, "JAVA_TOOL_OPTIONS").as_deref(),
            Some("-javaagent:/otel-auto-instrumentation-java/javaagent.jar")
        );
    }

    #[tokio::test]
    async fn test_existing_env_is_appended() {
        let annotation = Language::NodeJs.inject_annotation();
        let existing = vec![EnvVar {
            name: "NODE_OPTIONS".to_string(),
            value: Some("--max-old-space-size=512".to_string()),
            ..Default::default()
        }];
        let out = injector()
            .mutate(
                &Namespace::default(),
                pod(&[(&annotation, "true")], Some(existing)),
            )
            .await
            .unwrap();

        assert_eq!(
            env_value(&out, "NODE_OPTIONS").as_deref(),
            Some("--max-old-space-size=512 --require /otel-auto-instrumentation-nodejs/autoinstrumentation.js")
        );
    }

    #[tokio::test]
    async fn test_go_uses_go_image() {
        let annotation = Language::Go.inject_annotation();
        let out = injector()
            .mutate(&Namespace::default(), pod(&[(&annotation, "true")], None))
            .await
            .unwrap();

        let init = &out.spec.unwrap().init_containers.unwrap()[0];
        assert!(init.image.as_deref().unwrap().contains("autoinstrumentation-go"));
    }

    #[tokio::test]
    async fn test_not_requested_is_untouched() {
        let annotation = Language::Python.inject_annotation();
        let before = pod(&[(&annotation, "false")], None);
        let out = injector()
            .mutate(&Namespace::default(), before.clone())
            .await
            .unwrap();
        assert_eq!(out, before);
    }

    #[tokio::test]
    async fn test_injection_is_idempotent() {
        let annotation = Language::Python.inject_annotation();
        let once = injector()
            .mutate(&Namespace::default(), pod(&[(&annotation, "true")], None))
            .await
            .unwrap();
        let twice = injector()
            .mutate(&Namespace::default(), once.clone())
            .await
            .unwrap();
        assert_eq!(once, twice);
    }
}
