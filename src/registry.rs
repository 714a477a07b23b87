//! Registry of every resource kind the operator serializes, watches or admits
//!
//! Kinds are collected into a [`TypeRegistryBuilder`] during process init and
//! frozen into an immutable [`TypeRegistry`] before the runtime is constructed.
//! The registry is an explicit value passed by reference, so tests can build a
//! scoped one instead of sharing process-wide state.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Service, ServiceAccount};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Resource;
use tracing::debug;

use crate::crd::{Instrumentation, OpAMPBridge, OpenTelemetryCollector};
use crate::Error;

/// Identity of a kind: group, version and kind name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KindKey {
    /// API group, empty for the core group
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Kind name
    pub kind: String,
}

impl KindKey {
    /// Build a key from its parts
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Key of a typed resource
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(&K::group(&()), &K::version(&()), &K::kind(&()))
    }
}

impl fmt::Display for KindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Whether objects of a kind live in a namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Namespaced objects
    Namespaced,
    /// Cluster-scoped objects
    Cluster,
}

/// What the runtime needs to address a kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindDescriptor {
    /// Lowercase plural used in URLs
    pub plural: String,
    /// Object scope
    pub scope: Scope,
}

/// Mutable collection phase of the registry
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    entries: BTreeMap<KindKey, KindDescriptor>,
}

impl TypeRegistryBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one kind
    ///
    /// Registering an identical descriptor again is a no-op; registering a
    /// different descriptor under an existing key is rejected.
    pub fn register(&mut self, key: KindKey, descriptor: KindDescriptor) -> Result<(), Error> {
        if key.kind.is_empty() || key.version.is_empty() || descriptor.plural.is_empty() {
            return Err(Error::registry(
                key.to_string(),
                "kind, version and plural must not be empty",
            ));
        }

        match self.entries.get(&key) {
            Some(existing) if existing == &descriptor => {
                debug!(kind = %key, "kind already registered");
                Ok(())
            }
            Some(existing) => Err(Error::registry(
                key.to_string(),
                format!("conflicting registration: {existing:?} vs {descriptor:?}"),
            )),
            None => {
                self.entries.insert(key, descriptor);
                Ok(())
            }
        }
    }

    /// Register a typed namespaced kind
    pub fn register_namespaced<K>(&mut self) -> Result<(), Error>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.register_typed::<K>(Scope::Namespaced)
    }

    /// Register a typed cluster-scoped kind
    pub fn register_cluster<K>(&mut self) -> Result<(), Error>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
    {
        self.register_typed::<K>(Scope::Cluster)
    }

    fn register_typed<K: Resource<DynamicType = ()>>(&mut self, scope: Scope) -> Result<(), Error> {
        self.register(
            KindKey::of::<K>(),
            KindDescriptor {
                plural: K::plural(&()).to_string(),
                scope,
            },
        )
    }

    /// Freeze the registry
    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable registry of known kinds
#[derive(Clone, Debug)]
pub struct TypeRegistry {
    entries: BTreeMap<KindKey, KindDescriptor>,
}

impl TypeRegistry {
    /// Descriptor for `key`, if registered
    pub fn get(&self, key: &KindKey) -> Option<&KindDescriptor> {
        self.entries.get(key)
    }

    /// True when the typed kind is registered
    pub fn contains<K: Resource<DynamicType = ()>>(&self) -> bool {
        self.entries.contains_key(&KindKey::of::<K>())
    }

    /// Fail unless the typed kind is registered
    pub fn require<K: Resource<DynamicType = ()>>(&self) -> Result<&KindDescriptor, Error> {
        let key = KindKey::of::<K>();
        self.entries
            .get(&key)
            .ok_or_else(|| Error::registry(key.to_string(), "kind is not registered"))
    }

    /// Dynamic API resource for a registered kind
    pub fn api_resource(&self, key: &KindKey) -> Option<ApiResource> {
        self.entries.get(key).map(|d| {
            ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk(&key.group, &key.version, &key.kind),
                &d.plural,
            )
        })
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered kinds in key order
    pub fn iter(&self) -> impl Iterator<Item = (&KindKey, &KindDescriptor)> {
        self.entries.iter()
    }
}

/// OpenShift routes, registered so they can be managed when available
pub fn route_kind() -> (KindKey, KindDescriptor) {
    (
        KindKey::new("route.openshift.io", "v1", "Route"),
        KindDescriptor {
            plural: "routes".to_string(),
            scope: Scope::Namespaced,
        },
    )
}

/// Prometheus-operator kinds, registered so they can be managed when available
pub fn monitoring_kinds() -> [(KindKey, KindDescriptor); 2] {
    [
        (
            KindKey::new("monitoring.coreos.com", "v1", "ServiceMonitor"),
            KindDescriptor {
                plural: "servicemonitors".to_string(),
                scope: Scope::Namespaced,
            },
        ),
        (
            KindKey::new("monitoring.coreos.com", "v1", "PodMonitor"),
            KindDescriptor {
                plural: "podmonitors".to_string(),
                scope: Scope::Namespaced,
            },
        ),
    ]
}

/// Registry with every kind the operator works with
pub fn default_registry() -> Result<TypeRegistry, Error> {
    let mut builder = TypeRegistryBuilder::new();

    builder.register_namespaced::<Pod>()?;
    builder.register_cluster::<Namespace>()?;
    builder.register_namespaced::<Deployment>()?;
    builder.register_namespaced::<DaemonSet>()?;
    builder.register_namespaced::<StatefulSet>()?;
    builder.register_namespaced::<Service>()?;
    builder.register_namespaced::<ConfigMap>()?;
    builder.register_namespaced::<ServiceAccount>()?;
    builder.register_namespaced::<Lease>()?;

    builder.register_namespaced::<OpenTelemetryCollector>()?;
    builder.register_namespaced::<Instrumentation>()?;
    builder.register_namespaced::<OpAMPBridge>()?;

    let (key, descriptor) = route_kind();
    builder.register(key, descriptor)?;
    for (key, descriptor) in monitoring_kinds() {
        builder.register(key, descriptor)?;
    }

    Ok(builder.build())
}
