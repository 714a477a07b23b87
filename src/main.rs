//! OpenTelemetry Operator - bootstrap entry point

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use otel_operator::config::{resolve, FlagOverrides, OperatorEnv, ResolvedConfig};
use otel_operator::crd::{
    managed_by_selector, Instrumentation, OpAMPBridge, OpenTelemetryCollector,
};
use otel_operator::inject::default_chain;
use otel_operator::metrics::OperatorMetrics;
use otel_operator::registry::default_registry;
use otel_operator::runtime::{build_collector_controllers, ping, ObservingReconciler, Runtime};
use otel_operator::startup::{
    capabilities_channel, register_startup_tasks, AutoDetectTask, CollectorUpgradeTask,
    DiscoveryProbe, InstrumentationUpgradeTask, KubeInstanceStore, StartupTask,
};
use otel_operator::telemetry::{
    init_fallback, init_telemetry, log_startup_banner, TelemetryConfig,
};
use otel_operator::version::Version;
use otel_operator::webhook::tls::install_crypto_provider;
use otel_operator::webhook::{AdmissionWiring, KubeNamespaceLookup, WebhookState};

/// OpenTelemetry Operator - manages collectors and auto-instrumentation
#[derive(Parser, Debug)]
#[command(name = "opentelemetry-operator", version, about, long_about = None)]
struct Cli {
    /// Configuration file; values not set there keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the custom resource definitions and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    flags: FlagOverrides,
}

#[tokio::main]
async fn main() -> ExitCode {
    install_crypto_provider();

    match bootstrap(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            init_fallback();
            error!("operator failed: {e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn bootstrap(cli: Cli) -> anyhow::Result<()> {
    if cli.crd {
        for crd in [
            OpenTelemetryCollector::crd(),
            Instrumentation::crd(),
            OpAMPBridge::crd(),
        ] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let version = Version::get();
    let defaults = ResolvedConfig::defaults(&version);
    let config = resolve(&defaults, cli.config.as_deref(), &cli.flags.into_layer())
        .map_err(|e| anyhow::anyhow!("unable to resolve the configuration: {}", e))?;

    init_telemetry(TelemetryConfig::with_level(config.log_level.clone()))?;

    let env = OperatorEnv::from_env();
    log_startup_banner(&version, &config, &env);

    run(version, config, env).await
}

async fn run(version: Version, config: ResolvedConfig, env: OperatorEnv) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("unable to create the cluster client: {}", e))?;

    let registry = default_registry()
        .map_err(|e| anyhow::anyhow!("unable to build the type registry: {}", e))?;
    let metrics = Arc::new(OperatorMetrics::new()?);
    let images = config.images.clone();
    let scope = env.watch_scope.clone();
    let admission = env.admission;

    let mut runtime = Runtime::new(config, env, client.clone(), &registry, Arc::clone(&metrics))
        .map_err(|e| anyhow::anyhow!("unable to create the manager: {}", e))?;
    runtime.add_healthz_check("healthz", ping());
    runtime.add_readyz_check("readyz", ping());

    let (publisher, capabilities) = capabilities_channel();
    let tasks: Vec<Arc<dyn StartupTask>> = vec![
        Arc::new(AutoDetectTask::new(
            Arc::new(DiscoveryProbe::new(client.clone())),
            publisher,
        )),
        Arc::new(CollectorUpgradeTask::new(
            Arc::new(
                KubeInstanceStore::<OpenTelemetryCollector>::new(client.clone(), scope.clone())
                    .with_label_selector(managed_by_selector()),
            ),
            version.open_telemetry_collector.clone(),
            Arc::clone(&metrics),
        )),
        Arc::new(InstrumentationUpgradeTask::new(
            Arc::new(KubeInstanceStore::<Instrumentation>::new(
                client.clone(),
                scope.clone(),
            )),
            images.clone(),
            Arc::clone(&metrics),
        )),
    ];
    register_startup_tasks(&mut runtime, tasks)
        .map_err(|e| anyhow::anyhow!("unable to register startup tasks: {}", e))?;

    let controller_client = client.clone();
    let controller_scope = scope.clone();
    runtime.add_controller(
        "opentelemetrycollector",
        Arc::new(move || {
            build_collector_controllers(
                controller_client.clone(),
                &controller_scope,
                Arc::new(ObservingReconciler::default()),
            )
        }),
    );

    let wiring = AdmissionWiring::decide(admission, || {
        Ok(WebhookState {
            chain: default_chain(&images),
            namespaces: Arc::new(KubeNamespaceLookup::new(client.clone())),
            images: images.clone(),
            metrics: Arc::clone(&metrics),
        })
    })
    .map_err(|e| anyhow::anyhow!("unable to create the admission webhooks: {}", e))?;
    runtime.install_admission(wiring);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut capabilities = capabilities;
            let Some(first) = capabilities.wait(&shutdown).await else {
                return;
            };
            info!(
                openshift_routes = first.openshift_routes,
                prometheus_operator = first.prometheus_operator,
                "cluster capabilities available"
            );
            loop {
                let current = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    current = capabilities.changed() => current,
                };
                let Some(current) = current else { return };
                info!(
                    openshift_routes = current.openshift_routes,
                    prometheus_operator = current.prometheus_operator,
                    "cluster capabilities updated"
                );
            }
        }
    });

    info!("starting manager");
    runtime
        .start(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("problem running manager: {}", e))
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
