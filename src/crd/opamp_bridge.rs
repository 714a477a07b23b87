//! OpAMPBridge Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::UpgradeStrategy;

/// Specification for a bridge between an OpAMP server and managed collectors
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "opentelemetry.io",
    version = "v1alpha1",
    kind = "OpAMPBridge",
    plural = "opampbridges",
    status = "OpAMPBridgeStatus",
    namespaced,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.endpoint"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpAMPBridgeSpec {
    /// OpAMP server endpoint
    pub endpoint: String,

    /// Capabilities announced to the server
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,

    /// Bridge image; the operator default is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Upgrade policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_strategy: Option<UpgradeStrategy>,
}

/// Observed state of a bridge
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpAMPBridgeStatus {
    /// Bridge version currently running
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}
