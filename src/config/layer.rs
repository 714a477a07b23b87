//! Partial configuration layers (file and flags)

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use super::ResolvedConfig;
use crate::Error;

/// One configuration layer; `None` means "inherit from the layer below"
///
/// Keys mirror the operator's ProjectConfig document. Unknown keys, including
/// `apiVersion` and `kind`, are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigLayer {
    /// Metrics listener address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,
    /// Health probe listener address
    #[serde(
        default,
        rename = "healthProbeAddr",
        skip_serializing_if = "Option::is_none"
    )]
    pub probe_addr: Option<String>,
    /// Profiling listener address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pprof_addr: Option<String>,
    /// Enable single-active-instance election
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_leader_election: Option<bool>,
    /// Election lease name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_election_id: Option<String>,
    /// Election lease duration (Go duration syntax, e.g. `137s`)
    #[serde(default, with = "go_duration", skip_serializing_if = "Option::is_none")]
    pub lease_duration: Option<Duration>,
    /// Election renew deadline
    #[serde(default, with = "go_duration", skip_serializing_if = "Option::is_none")]
    pub renew_deadline: Option<Duration>,
    /// Election retry period
    #[serde(default, with = "go_duration", skip_serializing_if = "Option::is_none")]
    pub retry_period: Option<Duration>,
    /// Default collector image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_image: Option<String>,
    /// Default target allocator image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_allocator_image: Option<String>,
    /// Default OpAMP bridge image
    #[serde(
        default,
        rename = "operatorOpAMPBridgeImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub operator_opamp_bridge_image: Option<String>,
    /// Default Java auto-instrumentation image
    #[serde(
        default,
        rename = "autoInstrumentationJavaImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_instrumentation_java: Option<String>,
    /// Default NodeJS auto-instrumentation image
    #[serde(
        default,
        rename = "autoInstrumentationNodeJSImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_instrumentation_nodejs: Option<String>,
    /// Default Python auto-instrumentation image
    #[serde(
        default,
        rename = "autoInstrumentationPythonImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_instrumentation_python: Option<String>,
    /// Default DotNet auto-instrumentation image
    #[serde(
        default,
        rename = "autoInstrumentationDotNetImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_instrumentation_dotnet: Option<String>,
    /// Default Go auto-instrumentation image
    #[serde(
        default,
        rename = "autoInstrumentationGoImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_instrumentation_go: Option<String>,
    /// Default Apache HTTPD auto-instrumentation image
    #[serde(
        default,
        rename = "autoInstrumentationApacheHttpdImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_instrumentation_apache_httpd: Option<String>,
    /// Label keys filtered away from propagation
    #[serde(default, rename = "labels", skip_serializing_if = "Option::is_none")]
    pub labels_filter: Option<Vec<String>>,
    /// Webhook server port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_port: Option<u16>,
    /// Webhook certificate directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_cert_dir: Option<PathBuf>,
    /// Webhook TLS policy
    #[serde(default, rename = "tlsOpt", skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsLayer>,
    /// Log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Feature gates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_gates: Option<Vec<String>>,
}

/// Partial TLS policy
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsLayer {
    /// Minimum TLS version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    /// Cipher-suite allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_suites: Option<Vec<String>>,
}

fn set<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        *target = v.clone();
    }
}

impl ConfigLayer {
    /// Parse a layer from YAML (or JSON) text
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let display = path.display().to_string();
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::config_file(&display, e.to_string()))?;
        Self::from_yaml(&content).map_err(|e| Error::config_file(&display, e.to_string()))
    }

    /// Overwrite every field of `cfg` that this layer sets
    pub(super) fn apply_to(&self, cfg: &mut ResolvedConfig) {
        set(&mut cfg.metrics_addr, &self.metrics_addr);
        set(&mut cfg.probe_addr, &self.probe_addr);
        set(&mut cfg.pprof_addr, &self.pprof_addr);
        set(&mut cfg.enable_leader_election, &self.enable_leader_election);
        set(&mut cfg.leader_election.id, &self.leader_election_id);
        set(&mut cfg.leader_election.lease_duration, &self.lease_duration);
        set(&mut cfg.leader_election.renew_deadline, &self.renew_deadline);
        set(&mut cfg.leader_election.retry_period, &self.retry_period);

        let images = &mut cfg.images;
        set(&mut images.collector, &self.collector_image);
        set(&mut images.target_allocator, &self.target_allocator_image);
        set(&mut images.operator_opamp_bridge, &self.operator_opamp_bridge_image);
        set(&mut images.auto_instrumentation_java, &self.auto_instrumentation_java);
        set(&mut images.auto_instrumentation_nodejs, &self.auto_instrumentation_nodejs);
        set(&mut images.auto_instrumentation_python, &self.auto_instrumentation_python);
        set(&mut images.auto_instrumentation_dotnet, &self.auto_instrumentation_dotnet);
        set(&mut images.auto_instrumentation_go, &self.auto_instrumentation_go);
        set(
            &mut images.auto_instrumentation_apache_httpd,
            &self.auto_instrumentation_apache_httpd,
        );

        if let Some(labels) = &self.labels_filter {
            cfg.labels_filter = dedup_ordered(labels);
        }
        set(&mut cfg.webhook_port, &self.webhook_port);
        set(&mut cfg.webhook_cert_dir, &self.webhook_cert_dir);
        if let Some(tls) = &self.tls {
            set(&mut cfg.tls.min_version, &tls.min_version);
            set(&mut cfg.tls.cipher_suites, &tls.cipher_suites);
        }
        set(&mut cfg.log_level, &self.log_level);
        set(&mut cfg.feature_gates, &self.feature_gates);
    }
}

impl From<&ResolvedConfig> for ConfigLayer {
    /// A layer that sets every field to the value in `cfg`
    fn from(cfg: &ResolvedConfig) -> Self {
        let images = &cfg.images;
        Self {
            metrics_addr: Some(cfg.metrics_addr.clone()),
            probe_addr: Some(cfg.probe_addr.clone()),
            pprof_addr: Some(cfg.pprof_addr.clone()),
            enable_leader_election: Some(cfg.enable_leader_election),
            leader_election_id: Some(cfg.leader_election.id.clone()),
            lease_duration: Some(cfg.leader_election.lease_duration),
            renew_deadline: Some(cfg.leader_election.renew_deadline),
            retry_period: Some(cfg.leader_election.retry_period),
            collector_image: Some(images.collector.clone()),
            target_allocator_image: Some(images.target_allocator.clone()),
            operator_opamp_bridge_image: Some(images.operator_opamp_bridge.clone()),
            auto_instrumentation_java: Some(images.auto_instrumentation_java.clone()),
            auto_instrumentation_nodejs: Some(images.auto_instrumentation_nodejs.clone()),
            auto_instrumentation_python: Some(images.auto_instrumentation_python.clone()),
            auto_instrumentation_dotnet: Some(images.auto_instrumentation_dotnet.clone()),
            auto_instrumentation_go: Some(images.auto_instrumentation_go.clone()),
            auto_instrumentation_apache_httpd: Some(
                images.auto_instrumentation_apache_httpd.clone(),
            ),
            labels_filter: Some(cfg.labels_filter.clone()),
            webhook_port: Some(cfg.webhook_port),
            webhook_cert_dir: Some(cfg.webhook_cert_dir.clone()),
            tls: Some(TlsLayer {
                min_version: Some(cfg.tls.min_version.clone()),
                cipher_suites: Some(cfg.tls.cipher_suites.clone()),
            }),
            log_level: Some(cfg.log_level.clone()),
            feature_gates: Some(cfg.feature_gates.clone()),
        }
    }
}

fn dedup_ordered(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

/// Command-line overrides; a flag that is not given overrides nothing
#[derive(Args, Debug, Clone, Default)]
pub struct FlagOverrides {
    /// The address the metric endpoint binds to
    #[arg(long)]
    pub metrics_addr: Option<String>,

    /// The address the probe endpoint binds to
    #[arg(long = "health-probe-addr")]
    pub probe_addr: Option<String>,

    /// The address to expose the profiling server; empty disables it
    #[arg(long)]
    pub pprof_addr: Option<String>,

    /// Enable leader election, ensuring only one active controller manager
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub enable_leader_election: Option<bool>,

    /// The default OpenTelemetry collector image
    #[arg(long)]
    pub collector_image: Option<String>,

    /// The default OpenTelemetry target allocator image
    #[arg(long)]
    pub target_allocator_image: Option<String>,

    /// The default OpenTelemetry Operator OpAMP Bridge image
    #[arg(long)]
    pub operator_opamp_bridge_image: Option<String>,

    /// The default Java auto-instrumentation image
    #[arg(long = "auto-instrumentation-java-image")]
    pub auto_instrumentation_java: Option<String>,

    /// The default NodeJS auto-instrumentation image
    #[arg(long = "auto-instrumentation-nodejs-image")]
    pub auto_instrumentation_nodejs: Option<String>,

    /// The default Python auto-instrumentation image
    #[arg(long = "auto-instrumentation-python-image")]
    pub auto_instrumentation_python: Option<String>,

    /// The default DotNet auto-instrumentation image
    #[arg(long = "auto-instrumentation-dotnet-image")]
    pub auto_instrumentation_dotnet: Option<String>,

    /// The default Go auto-instrumentation image
    #[arg(long = "auto-instrumentation-go-image")]
    pub auto_instrumentation_go: Option<String>,

    /// The default Apache HTTPD auto-instrumentation image
    #[arg(long = "auto-instrumentation-apache-httpd-image")]
    pub auto_instrumentation_apache_httpd: Option<String>,

    /// Labels to filter away from propagating onto deploys (repeatable)
    #[arg(long = "labels")]
    pub labels_filter: Vec<String>,

    /// The port the webhook endpoint binds to
    #[arg(long)]
    pub webhook_port: Option<u16>,

    /// Minimum TLS version supported (VersionTLS12 or VersionTLS13)
    #[arg(long)]
    pub tls_min_version: Option<String>,

    /// Comma-separated list of allowed TLS 1.2 cipher suites
    #[arg(long, value_delimiter = ',')]
    pub tls_cipher_suites: Vec<String>,

    /// The log level for the operator
    #[arg(long)]
    pub log_level: Option<String>,

    /// Comma-separated feature gates, e.g. `+operator.autoinstrumentation.go`
    #[arg(long, value_delimiter = ',')]
    pub feature_gates: Vec<String>,
}

impl FlagOverrides {
    /// Convert the flags into the top configuration layer
    pub fn into_layer(self) -> ConfigLayer {
        let non_empty = |v: Vec<String>| if v.is_empty() { None } else { Some(v) };
        let tls = if self.tls_min_version.is_some() || !self.tls_cipher_suites.is_empty() {
            Some(TlsLayer {
                min_version: self.tls_min_version,
                cipher_suites: non_empty(self.tls_cipher_suites),
            })
        } else {
            None
        };

        ConfigLayer {
            metrics_addr: self.metrics_addr,
            probe_addr: self.probe_addr,
            pprof_addr: self.pprof_addr,
            enable_leader_election: self.enable_leader_election,
            collector_image: self.collector_image,
            target_allocator_image: self.target_allocator_image,
            operator_opamp_bridge_image: self.operator_opamp_bridge_image,
            auto_instrumentation_java: self.auto_instrumentation_java,
            auto_instrumentation_nodejs: self.auto_instrumentation_nodejs,
            auto_instrumentation_python: self.auto_instrumentation_python,
            auto_instrumentation_dotnet: self.auto_instrumentation_dotnet,
            auto_instrumentation_go: self.auto_instrumentation_go,
            auto_instrumentation_apache_httpd: self.auto_instrumentation_apache_httpd,
            labels_filter: non_empty(self.labels_filter),
            webhook_port: self.webhook_port,
            tls,
            log_level: self.log_level,
            feature_gates: non_empty(self.feature_gates),
            ..Default::default()
        }
    }
}

/// Go-style duration strings (`137s`, `2m`, `1h30m`, `500ms`) for optional fields
mod go_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) if d.subsec_millis() == 0 => s.serialize_str(&format!("{}s", d.as_secs())),
            Some(d) => s.serialize_str(&format!("{}ms", d.as_millis())),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|r| parse(&r).map_err(serde::de::Error::custom))
            .transpose()
    }

    pub fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty duration".to_string());
        }
        let mut total = Duration::ZERO;
        let mut rest = raw;
        while !rest.is_empty() {
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                return Err(format!("invalid duration {raw:?}"));
            }
            let value: u64 = rest[..digits]
                .parse()
                .map_err(|_| format!("invalid duration {raw:?}"))?;
            rest = &rest[digits..];
            let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
            let unit = &rest[..unit_len];
            rest = &rest[unit_len..];
            let overflow = || format!("duration {raw:?} is too large");
            let segment = match unit {
                "ms" => Duration::from_millis(value),
                "s" => Duration::from_secs(value),
                "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(overflow)?),
                "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(overflow)?),
                _ => return Err(format!("invalid duration unit {unit:?} in {raw:?}")),
            };
            total = total.checked_add(segment).ok_or_else(overflow)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
apiVersion: config.opentelemetry.io/v1alpha1
kind: ProjectConfig
metricsAddr: ":9090"
tlsOpt:
  minVersion: VersionTLS13
someFutureKey: ignored
"#;
        let layer = ConfigLayer::from_yaml(yaml).unwrap();
        assert_eq!(layer.metrics_addr.as_deref(), Some(":9090"));
        assert_eq!(
            layer.tls.as_ref().and_then(|t| t.min_version.as_deref()),
            Some("VersionTLS13")
        );
        assert!(layer.probe_addr.is_none());
        assert!(layer.collector_image.is_none());
    }

    #[test]
    fn test_parse_json_document() {
        let json = r#"{"healthProbeAddr": ":9091", "webhookPort": 9000, "labels": ["a", "b"]}"#;
        let layer = ConfigLayer::from_yaml(json).unwrap();
        assert_eq!(layer.probe_addr.as_deref(), Some(":9091"));
        assert_eq!(layer.webhook_port, Some(9000));
        assert_eq!(layer.labels_filter, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_empty_document_is_empty_layer() {
        assert_eq!(ConfigLayer::from_yaml("  \n").unwrap(), ConfigLayer::default());
    }

    #[test]
    fn test_malformed_yaml_is_error() {
        assert!(ConfigLayer::from_yaml("metricsAddr: [unterminated").is_err());
        assert!(ConfigLayer::from_yaml("webhookPort: not-a-port").is_err());
    }

    #[test]
    fn test_durations() {
        let layer = ConfigLayer::from_yaml("leaseDuration: 1m30s\nretryPeriod: 500ms").unwrap();
        assert_eq!(layer.lease_duration, Some(Duration::from_secs(90)));
        assert_eq!(layer.retry_period, Some(Duration::from_millis(500)));
        assert!(ConfigLayer::from_yaml("renewDeadline: 10 parsecs").is_err());
    }

    #[test]
    fn test_oversized_durations_are_errors() {
        let err = ConfigLayer::from_yaml("leaseDuration: 9999999999999999h").unwrap_err();
        assert!(err.to_string().contains("too large"));

        let err = ConfigLayer::from_yaml(
            "leaseDuration: 18446744073709551615s18446744073709551615s",
        )
        .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_oversized_duration_in_file_is_config_file_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "renewDeadline: 9999999999999999m").unwrap();

        let err = ConfigLayer::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigFile { .. }));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = ConfigLayer::from_file(Path::new("/nonexistent/operator.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/operator.yaml"));
    }

    #[test]
    fn test_flags_without_values_override_nothing() {
        assert_eq!(FlagOverrides::default().into_layer(), ConfigLayer::default());
    }

    #[test]
    fn test_flags_into_layer() {
        let flags = FlagOverrides {
            webhook_port: Some(9444),
            tls_cipher_suites: vec!["TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384".to_string()],
            labels_filter: vec!["team".to_string()],
            ..Default::default()
        };
        let layer = flags.into_layer();
        assert_eq!(layer.webhook_port, Some(9444));
        let tls = layer.tls.unwrap();
        assert!(tls.min_version.is_none());
        assert_eq!(tls.cipher_suites.unwrap().len(), 1);
        assert_eq!(layer.labels_filter, Some(vec!["team".to_string()]));
    }

    #[test]
    fn test_labels_are_deduplicated_in_order() {
        let labels = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(dedup_ordered(&labels), vec!["b".to_string(), "a".to_string()]);
    }
}
