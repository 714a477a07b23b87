//! Integration tests for operator bootstrap
//!
//! These tests walk through what happens between process start and serving:
//! configuration layering, environment interpretation, the admission decision
//! and startup task registration. None of them need a cluster.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use otel_operator::config::{
    resolve, AdmissionMode, ConfigLayer, FlagOverrides, OperatorEnv, ResolvedConfig, WatchScope,
};
use otel_operator::registry::default_registry;
use otel_operator::startup::{register_startup_tasks, StartupTask, TaskSequencer};
use otel_operator::version::Version;
use otel_operator::webhook::{AdmissionWiring, POD_MUTATE_PATH};
use otel_operator::Error;

// =============================================================================
// Test Fixtures
// =============================================================================

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    flags: FlagOverrides,
}

fn flags(args: &[&str]) -> ConfigLayer {
    let argv = std::iter::once("otel-operator").chain(args.iter().copied());
    TestCli::parse_from(argv).flags.into_layer()
}

fn defaults() -> ResolvedConfig {
    ResolvedConfig::defaults(&Version::get())
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), contents).unwrap();
    file
}

struct NamedTask(&'static str);

#[async_trait]
impl StartupTask for NamedTask {
    fn name(&self) -> &'static str {
        self.0
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<(), Error> {
        Ok(())
    }
}

// =============================================================================
// Configuration layering
// =============================================================================

/// An operator started without a file or flags runs on the defaults
#[test]
fn no_file_and_no_flags_resolves_to_defaults() {
    let resolved = resolve(&defaults(), None, &flags(&[])).unwrap();
    assert_eq!(resolved, defaults());
}

/// Writing the defaults to a file and loading it changes nothing
#[test]
fn file_holding_the_defaults_resolves_to_defaults() {
    let yaml = serde_yaml::to_string(&ConfigLayer::from(&defaults())).unwrap();
    let file = write_config(&yaml);

    let resolved = resolve(&defaults(), Some(file.path()), &flags(&[])).unwrap();
    assert_eq!(resolved, defaults());
}

/// Flags beat the file, and the file beats the defaults
#[test]
fn flags_override_file_which_overrides_defaults() {
    let file = write_config(
        r#"
apiVersion: config.opentelemetry.io/v1alpha1
kind: ProjectConfig
metricsAddr: ":9090"
collectorImage: "example.com/collector:file"
"#,
    );

    let resolved = resolve(
        &defaults(),
        Some(file.path()),
        &flags(&["--metrics-addr", ":7070"]),
    )
    .unwrap();

    assert_eq!(resolved.metrics_addr, ":7070");
    assert_eq!(resolved.images.collector, "example.com/collector:file");
    assert_eq!(resolved.probe_addr, defaults().probe_addr);
}

/// A missing file is fatal and the error names the path
#[test]
fn missing_config_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.yaml");

    let err = resolve(&defaults(), Some(&path), &flags(&[])).unwrap_err();
    assert!(matches!(err, Error::ConfigFile { .. }));
    assert!(err.to_string().contains("missing.yaml"));
}

/// Repeated label flags are deduplicated in order
#[test]
fn repeated_label_filters_keep_first_occurrence_order() {
    let resolved = resolve(
        &defaults(),
        None,
        &flags(&["--labels", "b", "--labels", "a", "--labels", "b"]),
    )
    .unwrap();
    assert_eq!(resolved.labels_filter, vec!["b", "a"]);
}

// =============================================================================
// Environment
// =============================================================================

/// A comma-separated watch list is trimmed and deduplicated
#[test]
fn watch_namespace_list_is_deduplicated() {
    let env = OperatorEnv::from_lookup(|key| match key {
        "WATCH_NAMESPACE" => Some("a, b,b,,c".to_string()),
        _ => None,
    });

    let expected: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(env.watch_scope, WatchScope::Namespaces(expected));
    assert_eq!(env.admission, AdmissionMode::Enabled);
}

/// An empty watch list means the whole cluster
#[test]
fn empty_watch_namespace_means_cluster_wide() {
    let env = OperatorEnv::from_lookup(|key| match key {
        "WATCH_NAMESPACE" => Some(" , ".to_string()),
        _ => None,
    });
    assert!(env.watch_scope.is_unrestricted());
}

// =============================================================================
// Admission decision
// =============================================================================

/// With webhooks disabled nothing is built and nothing is mounted
#[test]
fn disabled_webhooks_build_nothing() {
    let env = OperatorEnv::from_lookup(|key| match key {
        "ENABLE_WEBHOOKS" => Some("False".to_string()),
        _ => None,
    });

    let wiring = AdmissionWiring::decide(env.admission, || {
        Err(Error::webhook("must not be called when disabled"))
    })
    .unwrap();

    assert!(!wiring.is_enabled());
    assert!(wiring.router().is_none());
    assert!(!wiring.paths().contains(&POD_MUTATE_PATH));
}

/// When the admission path cannot be built the process must not start
#[test]
fn failed_webhook_construction_is_fatal() {
    let result = AdmissionWiring::decide(AdmissionMode::Enabled, || {
        Err(Error::webhook("namespace lookup unavailable"))
    });
    assert!(matches!(result, Err(Error::Webhook(_))));
}

// =============================================================================
// Startup tasks and registry
// =============================================================================

/// A registration failure names the task that could not be attached
#[test]
fn duplicate_task_registration_names_the_task() {
    let mut sequencer = TaskSequencer::new();
    let tasks: Vec<Arc<dyn StartupTask>> = vec![
        Arc::new(NamedTask("auto-detect")),
        Arc::new(NamedTask("collector-upgrade")),
        Arc::new(NamedTask("collector-upgrade")),
    ];

    let err = register_startup_tasks(&mut sequencer, tasks).unwrap_err();
    assert!(matches!(err, Error::TaskRegistration { ref task, .. } if task == "collector-upgrade"));
    assert_eq!(sequencer.names(), vec!["auto-detect", "collector-upgrade"]);
}

/// The default registry resolves every managed kind to its API resource
#[test]
fn default_registry_knows_managed_kinds() {
    let registry = default_registry().unwrap();
    let collector = registry
        .require::<otel_operator::crd::OpenTelemetryCollector>()
        .unwrap();
    assert_eq!(collector.plural, "opentelemetrycollectors");
}
