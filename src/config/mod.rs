//! Operator configuration resolution
//!
//! The resolved configuration is built exactly once at process start from
//! three layers, lowest precedence first:
//!
//! 1. Built-in defaults ([`ResolvedConfig::defaults`])
//! 2. An optional YAML/JSON configuration file ([`ConfigLayer::from_file`])
//! 3. Command-line flags ([`FlagOverrides`])
//!
//! Each layer is a [`ConfigLayer`] where every field is optional; a field that
//! is absent leaves the value of the layer below untouched. The merged value is
//! validated once and never mutated afterwards.

pub mod env;
mod layer;
mod validate;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::version::Version;
use crate::Error;

pub use env::{AdmissionMode, OperatorEnv, WatchScope};
pub use layer::{ConfigLayer, FlagOverrides, TlsLayer};
pub use validate::{parse_bind_address, validate};

/// Default metrics bind address
pub const DEFAULT_METRICS_ADDR: &str = ":8080";

/// Default health probe bind address
pub const DEFAULT_PROBE_ADDR: &str = ":8081";

/// Default webhook server port
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Default directory holding the webhook serving certificate
pub const DEFAULT_WEBHOOK_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Default minimum TLS version for the webhook server
pub const DEFAULT_TLS_MIN_VERSION: &str = "VersionTLS12";

/// Default leader election lease name
pub const DEFAULT_LEADER_ELECTION_ID: &str = "9f7554c3.opentelemetry.io";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(137);
const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(107);
const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(26);

/// Default container images, keyed by the component that runs them
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultImages {
    /// OpenTelemetry Collector image
    pub collector: String,
    /// Target allocator image
    pub target_allocator: String,
    /// Operator OpAMP bridge image
    pub operator_opamp_bridge: String,
    /// Java auto-instrumentation image
    pub auto_instrumentation_java: String,
    /// NodeJS auto-instrumentation image
    pub auto_instrumentation_nodejs: String,
    /// Python auto-instrumentation image
    pub auto_instrumentation_python: String,
    /// DotNet auto-instrumentation image
    pub auto_instrumentation_dotnet: String,
    /// Go auto-instrumentation image
    pub auto_instrumentation_go: String,
    /// Apache HTTPD auto-instrumentation image
    pub auto_instrumentation_apache_httpd: String,
}

impl DefaultImages {
    /// Images built from the well-known registry paths and the given versions
    pub fn for_version(v: &Version) -> Self {
        const OPERATOR_REGISTRY: &str = "ghcr.io/open-telemetry/opentelemetry-operator";
        Self {
            collector: format!(
                "ghcr.io/open-telemetry/opentelemetry-collector-releases/opentelemetry-collector:{}",
                v.open_telemetry_collector
            ),
            target_allocator: format!("{OPERATOR_REGISTRY}/target-allocator:{}", v.target_allocator),
            operator_opamp_bridge: format!(
                "{OPERATOR_REGISTRY}/operator-opamp-bridge:{}",
                v.operator_opamp_bridge
            ),
            auto_instrumentation_java: format!(
                "{OPERATOR_REGISTRY}/autoinstrumentation-java:{}",
                v.auto_instrumentation_java
            ),
            auto_instrumentation_nodejs: format!(
                "{OPERATOR_REGISTRY}/autoinstrumentation-nodejs:{}",
                v.auto_instrumentation_nodejs
            ),
            auto_instrumentation_python: format!(
                "{OPERATOR_REGISTRY}/autoinstrumentation-python:{}",
                v.auto_instrumentation_python
            ),
            auto_instrumentation_dotnet: format!(
                "{OPERATOR_REGISTRY}/autoinstrumentation-dotnet:{}",
                v.auto_instrumentation_dotnet
            ),
            auto_instrumentation_go: format!(
                "ghcr.io/open-telemetry/opentelemetry-go-instrumentation/autoinstrumentation-go:{}",
                v.auto_instrumentation_go
            ),
            auto_instrumentation_apache_httpd: format!(
                "{OPERATOR_REGISTRY}/autoinstrumentation-apache-httpd:{}",
                v.auto_instrumentation_apache_httpd
            ),
        }
    }

    /// All images with their component names, in a stable order
    pub fn entries(&self) -> [(&'static str, &str); 9] {
        [
            ("collector", &self.collector),
            ("target-allocator", &self.target_allocator),
            ("operator-opamp-bridge", &self.operator_opamp_bridge),
            ("auto-instrumentation-java", &self.auto_instrumentation_java),
            ("auto-instrumentation-nodejs", &self.auto_instrumentation_nodejs),
            ("auto-instrumentation-python", &self.auto_instrumentation_python),
            ("auto-instrumentation-dotnet", &self.auto_instrumentation_dotnet),
            ("auto-instrumentation-go", &self.auto_instrumentation_go),
            (
                "auto-instrumentation-apache-httpd",
                &self.auto_instrumentation_apache_httpd,
            ),
        ]
    }
}

/// TLS policy for the webhook server
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Minimum protocol version, using Go constant names (`VersionTLS12`)
    pub min_version: String,
    /// Optional cipher-suite allow-list; empty means the provider defaults
    pub cipher_suites: Vec<String>,
}

/// Single-active-instance election parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    /// Lease object name
    pub id: String,
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the holder keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Interval between acquisition attempts
    pub retry_period: Duration,
}

/// The immutable configuration threaded through the whole bootstrap
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    /// Metrics listener address (`0` disables the listener)
    pub metrics_addr: String,
    /// Health probe listener address
    pub probe_addr: String,
    /// Profiling listener address, empty when disabled
    pub pprof_addr: String,
    /// Whether single-active-instance election gates mutating work
    pub enable_leader_election: bool,
    /// Election parameters
    pub leader_election: LeaderElectionConfig,
    /// Default images per component
    pub images: DefaultImages,
    /// Label keys filtered away from propagation, in order, without duplicates
    pub labels_filter: Vec<String>,
    /// Webhook server port
    pub webhook_port: u16,
    /// Directory holding `tls.crt` and `tls.key` for the webhook server
    pub webhook_cert_dir: PathBuf,
    /// Webhook TLS policy
    pub tls: TlsConfig,
    /// Logging verbosity
    pub log_level: String,
    /// Feature gates requested on the command line or in the file
    pub feature_gates: Vec<String>,
}

impl ResolvedConfig {
    /// Built-in defaults for the given version information
    pub fn defaults(version: &Version) -> Self {
        Self {
            metrics_addr: DEFAULT_METRICS_ADDR.to_string(),
            probe_addr: DEFAULT_PROBE_ADDR.to_string(),
            pprof_addr: String::new(),
            enable_leader_election: false,
            leader_election: LeaderElectionConfig {
                id: DEFAULT_LEADER_ELECTION_ID.to_string(),
                lease_duration: DEFAULT_LEASE_DURATION,
                renew_deadline: DEFAULT_RENEW_DEADLINE,
                retry_period: DEFAULT_RETRY_PERIOD,
            },
            images: DefaultImages::for_version(version),
            labels_filter: Vec::new(),
            webhook_port: DEFAULT_WEBHOOK_PORT,
            webhook_cert_dir: PathBuf::from(DEFAULT_WEBHOOK_CERT_DIR),
            tls: TlsConfig {
                min_version: DEFAULT_TLS_MIN_VERSION.to_string(),
                cipher_suites: Vec::new(),
            },
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            feature_gates: Vec::new(),
        }
    }

    /// Derive a new configuration with every field present in `layer` replaced
    pub fn with_layer(&self, layer: &ConfigLayer) -> Self {
        let mut next = self.clone();
        layer.apply_to(&mut next);
        next
    }

    /// Metrics listener address, `None` when metrics are disabled
    pub fn metrics_bind_address(&self) -> Result<Option<SocketAddr>, Error> {
        if self.metrics_addr == "0" {
            return Ok(None);
        }
        parse_bind_address(&self.metrics_addr).map(Some)
    }

    /// Health probe listener address
    pub fn probe_bind_address(&self) -> Result<SocketAddr, Error> {
        parse_bind_address(&self.probe_addr)
    }

    /// Profiling listener address, `None` when disabled
    pub fn pprof_bind_address(&self) -> Result<Option<SocketAddr>, Error> {
        if self.pprof_addr.is_empty() {
            return Ok(None);
        }
        parse_bind_address(&self.pprof_addr).map(Some)
    }

    /// Webhook listener address (all interfaces on the configured port)
    pub fn webhook_bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.webhook_port))
    }
}

/// Merge the layers on top of `defaults` and validate the result
///
/// Pure: nothing outside the returned value is touched.
pub fn resolve_layers(
    defaults: &ResolvedConfig,
    file: Option<&ConfigLayer>,
    flags: &ConfigLayer,
) -> Result<ResolvedConfig, Error> {
    let mut resolved = defaults.clone();
    if let Some(file) = file {
        resolved = resolved.with_layer(file);
    }
    resolved = resolved.with_layer(flags);

    validate(&resolved)
        .map_err(|e| Error::config(format!("controller config validation failed: {e}")))?;
    Ok(resolved)
}

/// Resolve the configuration from defaults, an optional file and flag overrides
pub fn resolve(
    defaults: &ResolvedConfig,
    file: Option<&Path>,
    flags: &ConfigLayer,
) -> Result<ResolvedConfig, Error> {
    let file_layer = file.map(ConfigLayer::from_file).transpose()?;
    resolve_layers(defaults, file_layer.as_ref(), flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ResolvedConfig {
        ResolvedConfig::defaults(&Version::get())
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&defaults()).is_ok());
    }

    #[test]
    fn test_default_images_use_version() {
        let v = Version::get();
        let images = DefaultImages::for_version(&v);
        assert!(images.collector.ends_with(&format!(":{}", v.open_telemetry_collector)));
        assert!(images
            .auto_instrumentation_go
            .starts_with("ghcr.io/open-telemetry/opentelemetry-go-instrumentation/"));
    }

    #[test]
    fn test_no_layers_yields_defaults() {
        let resolved = resolve_layers(&defaults(), None, &ConfigLayer::default()).unwrap();
        assert_eq!(resolved, defaults());
    }

    #[test]
    fn test_file_overrides_defaults_field_by_field() {
        let file = ConfigLayer {
            metrics_addr: Some(":9090".to_string()),
            webhook_port: Some(10250),
            ..Default::default()
        };
        let resolved = resolve_layers(&defaults(), Some(&file), &ConfigLayer::default()).unwrap();
        assert_eq!(resolved.metrics_addr, ":9090");
        assert_eq!(resolved.webhook_port, 10250);
        assert_eq!(resolved.probe_addr, DEFAULT_PROBE_ADDR);
        assert_eq!(resolved.images, defaults().images);
    }

    #[test]
    fn test_flags_override_file() {
        let file = ConfigLayer {
            metrics_addr: Some(":9090".to_string()),
            collector_image: Some("registry.local/collector:file".to_string()),
            ..Default::default()
        };
        let flags = ConfigLayer {
            metrics_addr: Some(":7070".to_string()),
            ..Default::default()
        };
        let resolved = resolve_layers(&defaults(), Some(&file), &flags).unwrap();
        assert_eq!(resolved.metrics_addr, ":7070");
        assert_eq!(resolved.images.collector, "registry.local/collector:file");
    }

    #[test]
    fn test_nested_tls_layer_merges_per_field() {
        let file = ConfigLayer {
            tls: Some(TlsLayer {
                min_version: None,
                cipher_suites: Some(vec!["TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".to_string()]),
            }),
            ..Default::default()
        };
        let resolved = resolve_layers(&defaults(), Some(&file), &ConfigLayer::default()).unwrap();
        assert_eq!(resolved.tls.min_version, DEFAULT_TLS_MIN_VERSION);
        assert_eq!(resolved.tls.cipher_suites.len(), 1);
    }

    #[test]
    fn test_empty_image_fails_resolution() {
        let flags = ConfigLayer {
            collector_image: Some(String::new()),
            ..Default::default()
        };
        let err = resolve_layers(&defaults(), None, &flags).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("collector"));
    }

    #[test]
    fn test_with_layer_does_not_touch_original() {
        let base = defaults();
        let layer = ConfigLayer {
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let derived = base.with_layer(&layer);
        assert_eq!(base.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(derived.log_level, "debug");
    }

    #[test]
    fn test_metrics_can_be_disabled() {
        let cfg = defaults().with_layer(&ConfigLayer {
            metrics_addr: Some("0".to_string()),
            ..Default::default()
        });
        assert_eq!(cfg.metrics_bind_address().unwrap(), None);
    }

    #[test]
    fn test_bind_addresses() {
        let cfg = defaults();
        assert_eq!(cfg.probe_bind_address().unwrap().port(), 8081);
        assert_eq!(cfg.metrics_bind_address().unwrap().unwrap().port(), 8080);
        assert_eq!(cfg.pprof_bind_address().unwrap(), None);
        assert_eq!(cfg.webhook_bind_address().port(), DEFAULT_WEBHOOK_PORT);
    }
}
