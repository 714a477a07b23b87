//! Managed-instance upgrade tasks
//!
//! Both tasks list stored instances once, migrate each one independently and
//! keep going when a single instance fails. Cancellation is checked between
//! instances.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{StartupTask, COLLECTOR_UPGRADE_TASK, INSTRUMENTATION_UPGRADE_TASK};
use crate::config::{DefaultImages, WatchScope};
use crate::crd::{Instrumentation, Language, OpenTelemetryCollector, OpenTelemetryCollectorStatus};
use crate::metrics::OperatorMetrics;
use crate::version::parse_semver;
use crate::Error;

/// Access to stored instances of one kind
#[async_trait]
pub trait InstanceStore<K>: Send + Sync {
    /// Every instance in scope
    async fn list(&self) -> Result<Vec<K>, Error>;

    /// Replace the stored object (metadata and spec)
    async fn replace(&self, obj: &K) -> Result<K, Error>;

    /// Replace the status subresource
    async fn replace_status(&self, obj: &K) -> Result<K, Error>;
}

/// Store backed by the Kubernetes API, limited to the watch scope
pub struct KubeInstanceStore<K> {
    client: Client,
    scope: WatchScope,
    label_selector: Option<String>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> KubeInstanceStore<K> {
    /// Store listing every instance within `scope`
    pub fn new(client: Client, scope: WatchScope) -> Self {
        Self {
            client,
            scope,
            label_selector: None,
            _kind: std::marker::PhantomData,
        }
    }

    /// Only list objects matching `selector`
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

impl<K> KubeInstanceStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    fn api_for(&self, obj: &K) -> Result<Api<K>, Error> {
        let ns = obj
            .meta()
            .namespace
            .as_deref()
            .ok_or_else(|| Error::runtime(format!("{} has no namespace", obj.name_any())))?;
        Ok(Api::namespaced(self.client.clone(), ns))
    }

    fn list_params(&self) -> ListParams {
        match &self.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        }
    }
}

#[async_trait]
impl<K> InstanceStore<K> for KubeInstanceStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn list(&self) -> Result<Vec<K>, Error> {
        let lp = self.list_params();
        match &self.scope {
            WatchScope::All => {
                let api: Api<K> = Api::all(self.client.clone());
                Ok(api.list(&lp).await?.items)
            }
            WatchScope::Namespaces(namespaces) => {
                let mut items = Vec::new();
                for ns in namespaces {
                    let api: Api<K> = Api::namespaced(self.client.clone(), ns);
                    items.extend(api.list(&lp).await?.items);
                }
                Ok(items)
            }
        }
    }

    async fn replace(&self, obj: &K) -> Result<K, Error> {
        let api = self.api_for(obj)?;
        Ok(api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn replace_status(&self, obj: &K) -> Result<K, Error> {
        let api = self.api_for(obj)?;
        let data = serde_json::to_vec(obj)?;
        Ok(api
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await?)
    }
}

// =============================================================================
// Collector upgrade
// =============================================================================

/// What the collector upgrade does with one instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectorUpgradePlan {
    /// Record the operator's collector version in status
    Stamp,
    /// Leave the instance alone
    Skip(&'static str),
    /// The instance reports a version newer than the operator knows
    Newer,
}

/// Decide how to migrate `instance` to `target`
pub fn plan_collector_upgrade(
    instance: &OpenTelemetryCollector,
    target: (u64, u64, u64),
) -> CollectorUpgradePlan {
    if !instance.upgrades_enabled() {
        return CollectorUpgradePlan::Skip("upgrade strategy is none");
    }

    let recorded = instance.recorded_version();
    if recorded.is_empty() {
        return CollectorUpgradePlan::Stamp;
    }

    match parse_semver(recorded) {
        None => CollectorUpgradePlan::Skip("recorded version is not a semantic version"),
        Some(v) if v < target => CollectorUpgradePlan::Stamp,
        Some(v) if v > target => CollectorUpgradePlan::Newer,
        Some(_) => CollectorUpgradePlan::Skip("already up to date"),
    }
}

/// Migrates stored collectors to the operator's collector version
pub struct CollectorUpgradeTask {
    store: Arc<dyn InstanceStore<OpenTelemetryCollector>>,
    version: String,
    metrics: Arc<OperatorMetrics>,
}

impl CollectorUpgradeTask {
    /// Upgrade instances in `store` to collector `version`
    pub fn new(
        store: Arc<dyn InstanceStore<OpenTelemetryCollector>>,
        version: impl Into<String>,
        metrics: Arc<OperatorMetrics>,
    ) -> Self {
        Self {
            store,
            version: version.into(),
            metrics,
        }
    }
}

#[async_trait]
impl StartupTask for CollectorUpgradeTask {
    fn name(&self) -> &'static str {
        COLLECTOR_UPGRADE_TASK
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let target = parse_semver(&self.version).ok_or_else(|| {
            Error::task(
                COLLECTOR_UPGRADE_TASK,
                format!("operator collector version {:?} is not semantic", self.version),
            )
        })?;

        let instances = self
            .store
            .list()
            .await
            .map_err(|e| Error::task(COLLECTOR_UPGRADE_TASK, format!("failed to list instances: {e}")))?;
        info!(count = instances.len(), version = %self.version, "checking collector instances");

        for mut instance in instances {
            if cancel.is_cancelled() {
                info!("collector upgrade cancelled");
                return Ok(());
            }

            let name = instance.name_any();
            let namespace = instance.namespace().unwrap_or_default();
            match plan_collector_upgrade(&instance, target) {
                CollectorUpgradePlan::Skip(reason) => {
                    debug!(instance = %name, namespace = %namespace, reason, "skipping collector");
                    self.metrics.upgrade("OpenTelemetryCollector", "skipped");
                }
                CollectorUpgradePlan::Newer => {
                    warn!(
                        instance = %name,
                        namespace = %namespace,
                        recorded = instance.recorded_version(),
                        operator = %self.version,
                        "collector reports a newer version than the operator supports"
                    );
                    self.metrics.upgrade("OpenTelemetryCollector", "skipped");
                }
                CollectorUpgradePlan::Stamp => {
                    let previous = instance.recorded_version().to_string();
                    instance.status = Some(OpenTelemetryCollectorStatus {
                        version: self.version.clone(),
                    });
                    match self.store.replace_status(&instance).await {
                        Ok(_) => {
                            info!(
                                instance = %name,
                                namespace = %namespace,
                                from = %previous,
                                to = %self.version,
                                "collector instance upgraded"
                            );
                            self.metrics.upgrade("OpenTelemetryCollector", "upgraded");
                        }
                        Err(e) => {
                            warn!(instance = %name, namespace = %namespace, error = %e, "failed to upgrade collector instance");
                            self.metrics.upgrade("OpenTelemetryCollector", "failed");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Instrumentation upgrade
// =============================================================================

/// Move languages still on an old default image to the current default
///
/// A language is upgraded only when its default-image annotation differs from
/// the current default and the spec image still equals that annotation.
/// Returns the upgraded languages.
pub fn upgrade_instrumentation(inst: &mut Instrumentation, images: &DefaultImages) -> Vec<Language> {
    let mut upgraded = Vec::new();

    for lang in Language::ALL {
        let key = lang.default_image_annotation();
        let current_default = lang.default_image(images);
        let Some(annotated) = inst.annotations().get(&key).cloned() else {
            continue;
        };
        if annotated == current_default || inst.spec.language(lang).image != annotated {
            continue;
        }

        inst.spec.language_mut(lang).image = current_default.to_string();
        inst.annotations_mut()
            .insert(key, current_default.to_string());
        upgraded.push(lang);
    }

    upgraded
}

/// Moves stored Instrumentation objects to the current default images
pub struct InstrumentationUpgradeTask {
    store: Arc<dyn InstanceStore<Instrumentation>>,
    images: DefaultImages,
    metrics: Arc<OperatorMetrics>,
}

impl InstrumentationUpgradeTask {
    /// Upgrade instances in `store` to `images`
    pub fn new(
        store: Arc<dyn InstanceStore<Instrumentation>>,
        images: DefaultImages,
        metrics: Arc<OperatorMetrics>,
    ) -> Self {
        Self {
            store,
            images,
            metrics,
        }
    }
}

#[async_trait]
impl StartupTask for InstrumentationUpgradeTask {
    fn name(&self) -> &'static str {
        INSTRUMENTATION_UPGRADE_TASK
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let instances = self.store.list().await.map_err(|e| {
            Error::task(
                INSTRUMENTATION_UPGRADE_TASK,
                format!("failed to list instances: {e}"),
            )
        })?;
        info!(count = instances.len(), "checking instrumentation instances");

        for mut instance in instances {
            if cancel.is_cancelled() {
                info!("instrumentation upgrade cancelled");
                return Ok(());
            }

            let name = instance.name_any();
            let namespace = instance.namespace().unwrap_or_default();
            let upgraded = upgrade_instrumentation(&mut instance, &self.images);
            if upgraded.is_empty() {
                self.metrics.upgrade("Instrumentation", "skipped");
                continue;
            }

            let languages: Vec<&str> = upgraded.iter().map(Language::name).collect();
            match self.store.replace(&instance).await {
                Ok(_) => {
                    info!(instance = %name, namespace = %namespace, languages = ?languages, "instrumentation upgraded");
                    self.metrics.upgrade("Instrumentation", "upgraded");
                }
                Err(e) => {
                    warn!(instance = %name, namespace = %namespace, error = %e, "failed to upgrade instrumentation");
                    self.metrics.upgrade("Instrumentation", "failed");
                }
            }
        }

        Ok(())
    }
}
