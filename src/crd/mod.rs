//! Custom Resource Definitions managed by the operator
//!
//! All kinds live in the `opentelemetry.io/v1alpha1` group and are namespaced.

mod collector;
mod instrumentation;
mod opamp_bridge;

pub use collector::{
    CollectorMode, OpenTelemetryCollector, OpenTelemetryCollectorSpec,
    OpenTelemetryCollectorStatus, UpgradeStrategy,
};
pub use instrumentation::{Instrumentation, InstrumentationSpec, Language, LanguageSpec};
pub use opamp_bridge::{OpAMPBridge, OpAMPBridgeSpec, OpAMPBridgeStatus};

/// API group of every managed kind
pub const GROUP: &str = "opentelemetry.io";

/// API version of every managed kind
pub const VERSION: &str = "v1alpha1";

/// Label marking objects owned by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on owned objects
pub const MANAGED_BY_VALUE: &str = "opentelemetry-operator";

/// Label selector matching every object owned by this operator
pub fn managed_by_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}
