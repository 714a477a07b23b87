//! Build-time version information
//!
//! Default component versions are compiled in and can be overridden at build
//! time through the matching `OTEL_*_VERSION` environment variables.

use serde::Serialize;

/// Versions of the operator and of every component it deploys by default
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    /// Operator version
    pub operator: String,
    /// OpenTelemetry Collector version
    pub open_telemetry_collector: String,
    /// Target allocator version
    pub target_allocator: String,
    /// Operator OpAMP bridge version
    pub operator_opamp_bridge: String,
    /// Java auto-instrumentation version
    pub auto_instrumentation_java: String,
    /// NodeJS auto-instrumentation version
    pub auto_instrumentation_nodejs: String,
    /// Python auto-instrumentation version
    pub auto_instrumentation_python: String,
    /// DotNet auto-instrumentation version
    pub auto_instrumentation_dotnet: String,
    /// Go auto-instrumentation version
    pub auto_instrumentation_go: String,
    /// Apache HTTPD auto-instrumentation version
    pub auto_instrumentation_apache_httpd: String,
}

impl Version {
    /// Version information baked into this build
    pub fn get() -> Self {
        Self {
            operator: env!("CARGO_PKG_VERSION").to_string(),
            open_telemetry_collector: option_env!("OTEL_COLLECTOR_VERSION")
                .unwrap_or("0.88.0")
                .to_string(),
            target_allocator: option_env!("OTEL_TARGET_ALLOCATOR_VERSION")
                .unwrap_or("0.88.0")
                .to_string(),
            operator_opamp_bridge: option_env!("OTEL_OPAMP_BRIDGE_VERSION")
                .unwrap_or("0.88.0")
                .to_string(),
            auto_instrumentation_java: option_env!("OTEL_AUTOINSTRUMENTATION_JAVA_VERSION")
                .unwrap_or("1.31.0")
                .to_string(),
            auto_instrumentation_nodejs: option_env!("OTEL_AUTOINSTRUMENTATION_NODEJS_VERSION")
                .unwrap_or("0.44.0")
                .to_string(),
            auto_instrumentation_python: option_env!("OTEL_AUTOINSTRUMENTATION_PYTHON_VERSION")
                .unwrap_or("0.41b0")
                .to_string(),
            auto_instrumentation_dotnet: option_env!("OTEL_AUTOINSTRUMENTATION_DOTNET_VERSION")
                .unwrap_or("1.1.0")
                .to_string(),
            auto_instrumentation_go: option_env!("OTEL_AUTOINSTRUMENTATION_GO_VERSION")
                .unwrap_or("v0.8.0-alpha")
                .to_string(),
            auto_instrumentation_apache_httpd: option_env!(
                "OTEL_AUTOINSTRUMENTATION_APACHE_HTTPD_VERSION"
            )
            .unwrap_or("1.0.3")
            .to_string(),
        }
    }
}

/// Parse a `major.minor.patch` version, tolerating a leading `v` and any
/// pre-release or build suffix on the patch component
pub fn parse_semver(raw: &str) -> Option<(u64, u64, u64)> {
    let trimmed = raw.trim().trim_start_matches('v');
    let mut parts = trimmed.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch_raw = parts.next()?;
    let patch_digits: String = patch_raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    let patch = patch_digits.parse().ok()?;
    Some((major, minor, patch))
}
