//! Operator runtime
//!
//! Owns the listeners (probes, metrics, diagnostics, webhooks), the leader
//! loop, and the work that only the active instance performs: startup tasks
//! and controllers. Construction validates everything that can be validated
//! up front; `start` blocks until shutdown and drains for [`DRAIN_TIMEOUT`].

mod controller;
mod diagnostics;
mod health;
mod leader;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::Client;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{OperatorEnv, ResolvedConfig};
use crate::crd::{Instrumentation, OpenTelemetryCollector};
use crate::metrics::{metrics_router, OperatorMetrics};
use crate::registry::TypeRegistry;
use crate::startup::{drain_tasks, StartupTask, TaskRegistrar, TaskSequencer};
use crate::webhook::tls::rustls_config;
use crate::webhook::AdmissionWiring;
use crate::Error;

pub use controller::{
    build_collector_controllers, scoped_apis, ControllerFuture, ObservingReconciler, Reconciler,
};
pub use diagnostics::{diagnostics_router, CMDLINE_PATH, CONFIG_PATH};
pub use health::{health_router, ping, Check, HealthChecks, HEALTHZ_PATH, READYZ_PATH};
pub use leader::{
    election_identity, lease_state, LeaderElector, LeaderGuard, LeaseState,
    DEFAULT_LEASE_NAMESPACE,
};

/// Grace period for in-flight work after shutdown is requested
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the controller futures for one leader term
pub type ControllerFactory = Arc<dyn Fn() -> Vec<ControllerFuture> + Send + Sync>;

struct BindAddresses {
    probe: SocketAddr,
    metrics: Option<SocketAddr>,
    pprof: Option<SocketAddr>,
    webhook: SocketAddr,
}

/// Work performed only by the active instance
struct LeaderWork {
    tasks: TaskSequencer,
    controllers: Vec<(&'static str, ControllerFactory)>,
    metrics: Arc<OperatorMetrics>,
}

impl LeaderWork {
    /// Run tasks and controllers until `term` is cancelled, then drain them
    async fn run_term(&self, term: CancellationToken) {
        let tasks = self.tasks.start(&term, Arc::clone(&self.metrics));

        let mut controllers = JoinSet::new();
        for (name, factory) in &self.controllers {
            for fut in factory() {
                let name = *name;
                let term = term.clone();
                controllers.spawn(async move {
                    tokio::select! {
                        _ = fut => warn!(controller = name, "controller stream ended"),
                        _ = term.cancelled() => {}
                    }
                });
            }
        }
        info!(
            tasks = self.tasks.len(),
            controllers = controllers.len(),
            "leader work started"
        );

        term.cancelled().await;
        drain_tasks(tasks, DRAIN_TIMEOUT).await;
        controllers.shutdown().await;
        info!("leader work stopped");
    }
}

/// The operator runtime
pub struct Runtime {
    config: Arc<ResolvedConfig>,
    env: OperatorEnv,
    client: Client,
    metrics: Arc<OperatorMetrics>,
    addresses: BindAddresses,
    tasks: TaskSequencer,
    controllers: Vec<(&'static str, ControllerFactory)>,
    admission: AdmissionWiring,
    health: HealthChecks,
}

impl Runtime {
    /// Construct the runtime from the resolved configuration
    ///
    /// Fails when the registry lacks a kind the runtime works with or when a
    /// listener address cannot be parsed.
    pub fn new(
        config: ResolvedConfig,
        env: OperatorEnv,
        client: Client,
        registry: &TypeRegistry,
        metrics: Arc<OperatorMetrics>,
    ) -> Result<Self, Error> {
        registry.require::<Pod>()?;
        registry.require::<Namespace>()?;
        registry.require::<Lease>()?;
        registry.require::<OpenTelemetryCollector>()?;
        registry.require::<Instrumentation>()?;

        let addresses = BindAddresses {
            probe: config.probe_bind_address()?,
            metrics: config.metrics_bind_address()?,
            pprof: config.pprof_bind_address()?,
            webhook: config.webhook_bind_address(),
        };

        Ok(Self {
            config: Arc::new(config),
            env,
            client,
            metrics,
            addresses,
            tasks: TaskSequencer::new(),
            controllers: Vec::new(),
            admission: AdmissionWiring::Disabled,
            health: HealthChecks::new(),
        })
    }

    /// Registered startup task names, in order
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.names()
    }

    /// Add a controller run by the active instance
    pub fn add_controller(&mut self, name: &'static str, factory: ControllerFactory) {
        self.controllers.push((name, factory));
    }

    /// Install the admission decision
    pub fn install_admission(&mut self, wiring: AdmissionWiring) {
        self.admission = wiring;
    }

    /// Whether the webhook server will be started
    pub fn admission_enabled(&self) -> bool {
        self.admission.is_enabled()
    }

    /// Install an extra liveness check
    pub fn add_healthz_check(&mut self, name: impl Into<String>, check: Check) {
        self.health.add_healthz(name, check);
    }

    /// Install an extra readiness check
    pub fn add_readyz_check(&mut self, name: impl Into<String>, check: Check) {
        self.health.add_readyz(name, check);
    }

    fn elector(&self) -> Option<Arc<LeaderElector>> {
        if !self.config.enable_leader_election {
            return None;
        }
        let namespace = self
            .env
            .pod_namespace
            .as_deref()
            .unwrap_or(DEFAULT_LEASE_NAMESPACE);
        let identity = election_identity(self.env.pod_name.as_deref());
        Some(Arc::new(LeaderElector::new(
            self.client.clone(),
            &self.config.leader_election,
            namespace,
            &identity,
        )))
    }

    /// Serve until `shutdown` is cancelled or a listener fails
    ///
    /// Registration is closed once this is called.
    pub async fn start(mut self, shutdown: CancellationToken) -> Result<(), Error> {
        self.tasks.seal();

        let mut listeners: JoinSet<Result<(), Error>> = JoinSet::new();
        serve_plain(
            &mut listeners,
            "probe",
            self.addresses.probe,
            health_router(self.health.clone()),
            &shutdown,
        )
        .await?;
        if let Some(addr) = self.addresses.metrics {
            serve_plain(
                &mut listeners,
                "metrics",
                addr,
                metrics_router(Arc::clone(&self.metrics)),
                &shutdown,
            )
            .await?;
        }
        if let Some(addr) = self.addresses.pprof {
            serve_plain(
                &mut listeners,
                "diagnostics",
                addr,
                diagnostics_router(Arc::clone(&self.config)),
                &shutdown,
            )
            .await?;
        }

        let webhook_handle = axum_server::Handle::new();
        if let Some(router) = self.admission.router() {
            let tls = rustls_config(&self.config.tls, &self.config.webhook_cert_dir)?;
            let addr = self.addresses.webhook;
            let handle = webhook_handle.clone();
            info!(%addr, paths = ?self.admission.paths(), "serving webhooks");
            listeners.spawn(async move {
                axum_server::bind_rustls(addr, tls)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
                    .map_err(|e| Error::runtime(format!("webhook listener failed: {e}")))
            });
        }

        let elector = self.elector();
        let work = Arc::new(LeaderWork {
            tasks: self.tasks,
            controllers: self.controllers,
            metrics: Arc::clone(&self.metrics),
        });
        let mut leader: JoinHandle<()> = match elector {
            Some(elector) => tokio::spawn(run_with_election(elector, work, shutdown.clone())),
            None => {
                info!("leader election disabled, running leader work directly");
                let metrics = Arc::clone(&work.metrics);
                let token = shutdown.child_token();
                tokio::spawn(async move {
                    metrics.leader_status.set(1);
                    work.run_term(token).await;
                    metrics.leader_status.set(0);
                })
            }
        };

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            Some(joined) = listeners.join_next() => match joined {
                Ok(Ok(())) => Err(Error::runtime("listener stopped unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::runtime(format!("listener task failed: {e}"))),
            },
        };
        if let Err(e) = &outcome {
            error!(error = %e, "runtime failed, shutting down");
            shutdown.cancel();
        }

        info!(grace = ?DRAIN_TIMEOUT, "draining");
        webhook_handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            if let Err(e) = (&mut leader).await {
                warn!(error = %e, "leader loop ended abnormally");
            }
            while let Some(joined) = listeners.join_next().await {
                if let Ok(Err(e)) = joined {
                    warn!(error = %e, "listener failed during drain");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("drain timed out, aborting remaining work");
            leader.abort();
            listeners.abort_all();
        }

        info!("runtime stopped");
        outcome
    }
}

impl TaskRegistrar for Runtime {
    fn register(&mut self, task: Arc<dyn StartupTask>) -> Result<(), Error> {
        self.tasks.register(task)
    }
}

async fn serve_plain(
    listeners: &mut JoinSet<Result<(), Error>>,
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::runtime(format!("failed to bind {name} listener on {addr}: {e}")))?;
    info!(listener = name, %addr, "serving");

    let shutdown = shutdown.clone();
    listeners.spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::runtime(format!("{name} listener failed: {e}")))
    });
    Ok(())
}

/// Campaign for the lease, run leader work while held, and re-enter
/// candidacy after a loss. Releases the lease on shutdown.
async fn run_with_election(
    elector: Arc<LeaderElector>,
    work: Arc<LeaderWork>,
    shutdown: CancellationToken,
) {
    loop {
        let Some(mut guard) = Arc::clone(&elector).acquire(&shutdown).await else {
            return;
        };
        work.metrics.leader_status.set(1);

        let term = shutdown.child_token();
        let running = tokio::spawn({
            let work = Arc::clone(&work);
            let term = term.clone();
            async move { work.run_term(term).await }
        });

        let lost = tokio::select! {
            _ = guard.lost() => true,
            _ = shutdown.cancelled() => false,
        };
        term.cancel();
        if let Err(e) = running.await {
            warn!(error = %e, "leader work ended abnormally");
        }
        work.metrics.leader_status.set(0);

        if lost {
            warn!(identity = %elector.identity(), "leadership lost, re-entering candidacy");
            drop(guard);
            continue;
        }

        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release lease");
        }
        return;
    }
}
