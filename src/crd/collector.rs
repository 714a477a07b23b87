//! OpenTelemetryCollector Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the collector is deployed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CollectorMode {
    /// A Deployment
    #[default]
    Deployment,
    /// A DaemonSet
    DaemonSet,
    /// A StatefulSet
    StatefulSet,
    /// Injected into pods by the sidecar mutator
    Sidecar,
}

/// Whether the operator migrates an instance to newer versions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStrategy {
    /// Upgrade on operator start
    #[default]
    Automatic,
    /// Never touch this instance
    None,
}

/// Specification for an OpenTelemetry Collector instance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "opentelemetry.io",
    version = "v1alpha1",
    kind = "OpenTelemetryCollector",
    plural = "opentelemetrycollectors",
    shortname = "otelcol",
    status = "OpenTelemetryCollectorStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpenTelemetryCollectorSpec {
    /// Deployment mode, defaulted by the admission webhook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CollectorMode>,

    /// Collector image; the operator default is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Replica count for deployment and statefulset modes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Raw collector configuration (YAML)
    #[serde(default)]
    pub config: String,

    /// Upgrade policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_strategy: Option<UpgradeStrategy>,
}

/// Observed state of a collector instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenTelemetryCollectorStatus {
    /// Collector version the instance was last migrated to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl OpenTelemetryCollector {
    /// True unless the instance opted out of upgrades
    pub fn upgrades_enabled(&self) -> bool {
        self.spec.upgrade_strategy != Some(UpgradeStrategy::None)
    }

    /// Version recorded in status, empty when never reconciled
    pub fn recorded_version(&self) -> &str {
        self.status.as_ref().map(|s| s.version.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_parses_camel_case() {
        let spec: OpenTelemetryCollectorSpec = serde_json::from_value(serde_json::json!({
            "mode": "daemonset",
            "upgradeStrategy": "none",
            "config": "receivers: {}"
        }))
        .unwrap();
        assert_eq!(spec.mode, Some(CollectorMode::DaemonSet));
        assert_eq!(spec.upgrade_strategy, Some(UpgradeStrategy::None));
    }

    #[test]
    fn test_upgrade_opt_out() {
        let mut col = OpenTelemetryCollector::new("otel", OpenTelemetryCollectorSpec::default());
        assert!(col.upgrades_enabled());
        assert_eq!(col.recorded_version(), "");

        col.spec.upgrade_strategy = Some(UpgradeStrategy::None);
        assert!(!col.upgrades_enabled());
    }
}
