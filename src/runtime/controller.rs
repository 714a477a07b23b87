//! Controller runner for the managed collector kind
//!
//! Reconciliation itself is delegated to a [`Reconciler`]; this module only
//! builds the kube-runtime controllers for the watch scope and logs results.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::config::WatchScope;
use crate::crd::OpenTelemetryCollector;
use crate::Error;

/// Watcher timeout (seconds), kept below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Requeue delay after a reconcile error
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Reconciles one collector instance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Drive the instance towards its desired state
    async fn reconcile(&self, collector: Arc<OpenTelemetryCollector>) -> Result<Action, Error>;
}

/// Reconciler that only records what it observes
pub struct ObservingReconciler {
    requeue: Duration,
}

impl Default for ObservingReconciler {
    fn default() -> Self {
        Self {
            requeue: Duration::from_secs(300),
        }
    }
}

#[async_trait]
impl Reconciler for ObservingReconciler {
    async fn reconcile(&self, collector: Arc<OpenTelemetryCollector>) -> Result<Action, Error> {
        info!(
            collector = %collector.name_any(),
            namespace = %collector.namespace().unwrap_or_default(),
            mode = ?collector.spec.mode,
            version = collector.recorded_version(),
            "observed collector"
        );
        Ok(Action::requeue(self.requeue))
    }
}

struct Context {
    reconciler: Arc<dyn Reconciler>,
}

async fn reconcile(obj: Arc<OpenTelemetryCollector>, ctx: Arc<Context>) -> Result<Action, Error> {
    ctx.reconciler.reconcile(obj).await
}

fn error_policy(_obj: Arc<OpenTelemetryCollector>, _err: &Error, _ctx: Arc<Context>) -> Action {
    Action::requeue(ERROR_REQUEUE)
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

/// APIs to watch for the given scope, one per namespace when restricted
pub fn scoped_apis(client: &Client, scope: &WatchScope) -> Vec<Api<OpenTelemetryCollector>> {
    match scope {
        WatchScope::All => vec![Api::all(client.clone())],
        WatchScope::Namespaces(namespaces) => namespaces
            .iter()
            .map(|ns| Api::namespaced(client.clone(), ns))
            .collect(),
    }
}

/// Build collector controller futures for the watch scope
pub fn build_collector_controllers(
    client: Client,
    scope: &WatchScope,
    reconciler: Arc<dyn Reconciler>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(Context { reconciler });
    info!(scope = %scope, "- OpenTelemetryCollector controller");

    scoped_apis(&client, scope)
        .into_iter()
        .map(|api| -> ControllerFuture {
            Box::pin(
                Controller::new(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
                    .run(reconcile, error_policy, Arc::clone(&ctx))
                    .for_each(log_reconcile_result("OpenTelemetryCollector")),
            )
        })
        .collect()
}
