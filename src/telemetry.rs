//! Logging and tracing initialization
//!
//! Sets up JSON structured logging at the resolved log level and, when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, exports spans over OTLP with W3C
//! TraceContext propagation. `RUST_LOG` takes precedence over the configured
//! level when present.
//!
//! Failures that happen before the resolved level is known still reach the
//! log stream through [`init_fallback`].

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{OperatorEnv, ResolvedConfig};
use crate::version::Version;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configured level is not a known level name
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize the OTLP tracer
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize the tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported spans
    pub service_name: String,
    /// Verbosity, from the resolved configuration
    pub log_level: String,
    /// OTLP endpoint; spans are only logged locally when unset
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Telemetry config for the given level, reading the OTLP endpoint from env
    pub fn with_level(log_level: impl Into<String>) -> Self {
        Self {
            service_name: "opentelemetry-operator".to_string(),
            log_level: log_level.into(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Map a level name to a tracing level
///
/// Accepts the usual names plus the zap aliases `dpanic`, `panic` and `fatal`,
/// which all map to `error`.
pub fn parse_log_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" | "dpanic" | "panic" | "fatal" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging exactly once for the process
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let level = parse_log_level(&config.log_level)
        .ok_or_else(|| TelemetryError::InvalidLevel(config.log_level.clone()))?;

    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = if let Some(endpoint) = &config.otlp_endpoint {
        let provider = init_otlp_tracer(endpoint, build_resource(&config.service_name))?;
        let tracer = provider.tracer(config.service_name.clone());
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let default_directive = format!("{},kube=info,tower=warn,hyper=warn", level_name(level));
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}

/// Install a JSON subscriber at `info` unless one is already installed
///
/// Used on the failure path so errors raised before [`init_telemetry`] ran
/// are still emitted as structured lines.
pub fn init_fallback() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new("info"))
        .with_target(true)
        .try_init();
}

/// Log the startup banner
pub fn log_startup_banner(version: &Version, config: &ResolvedConfig, env: &OperatorEnv) {
    info!(
        operator = %version.operator,
        collector = %config.images.collector,
        target_allocator = %config.images.target_allocator,
        opamp_bridge = %config.images.operator_opamp_bridge,
        java = %config.images.auto_instrumentation_java,
        nodejs = %config.images.auto_instrumentation_nodejs,
        python = %config.images.auto_instrumentation_python,
        dotnet = %config.images.auto_instrumentation_dotnet,
        go = %config.images.auto_instrumentation_go,
        apache_httpd = %config.images.auto_instrumentation_apache_httpd,
        feature_gates = ?config.feature_gates,
        build_os = std::env::consts::OS,
        build_arch = std::env::consts::ARCH,
        labels_filter = ?config.labels_filter,
        watch_scope = %env.watch_scope,
        admission = %env.admission,
        "starting the OpenTelemetry Operator"
    );
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

/// Resource with service info and pod identity from the downward API
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];

    if let Ok(pod_name) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod_name));
    }
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }

    Resource::new(attributes)
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn banner_for(env: &OperatorEnv) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();

        let version = Version::get();
        let config = ResolvedConfig::defaults(&version);
        tracing::subscriber::with_default(subscriber, || {
            log_startup_banner(&version, &config, env)
        });
        captured.text()
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("info"), Some(Level::INFO));
        assert_eq!(parse_log_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_log_level("warning"), Some(Level::WARN));
        assert_eq!(parse_log_level("dpanic"), Some(Level::ERROR));
        assert_eq!(parse_log_level("fatal"), Some(Level::ERROR));
        assert_eq!(parse_log_level("verbose"), None);
    }

    #[test]
    fn test_invalid_level_rejected_before_init() {
        let config = TelemetryConfig {
            service_name: "test".to_string(),
            log_level: "loud".to_string(),
            otlp_endpoint: None,
        };
        assert!(matches!(
            init_telemetry(config),
            Err(TelemetryError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_banner_reports_admission_mode() {
        let enabled = banner_for(&OperatorEnv::from_lookup(|_| None));
        assert!(enabled.contains(r#""admission":"enabled""#));
        assert!(enabled.contains("starting the OpenTelemetry Operator"));

        let disabled = banner_for(&OperatorEnv::from_lookup(|key| match key {
            "ENABLE_WEBHOOKS" => Some("false".to_string()),
            _ => None,
        }));
        assert!(disabled.contains(r#""admission":"disabled""#));
    }

    #[test]
    fn test_fallback_tolerates_existing_subscriber() {
        init_fallback();
        init_fallback();
        tracing::error!("emitted after fallback init");
    }

    #[test]
    fn test_build_resource() {
        let resource = build_resource("test-service");
        assert!(!resource.is_empty());
    }
}
