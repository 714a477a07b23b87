//! Startup tasks and their sequencing
//!
//! Background work that runs once the process becomes the active instance:
//! capability auto-detection and the managed-instance upgrades. Tasks are
//! collected in registration order before the runtime starts; registration
//! failures are fatal, execution failures are logged and counted.

mod autodetect;
mod upgrade;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::OperatorMetrics;
use crate::Error;

pub use autodetect::{
    capabilities_channel, AutoDetectTask, Capabilities, CapabilitiesHandle,
    CapabilitiesPublisher, CapabilityProbe, DiscoveryProbe, AUTO_DETECT_INTERVAL,
};
pub use upgrade::{
    plan_collector_upgrade, upgrade_instrumentation, CollectorUpgradePlan, CollectorUpgradeTask,
    InstanceStore, InstrumentationUpgradeTask, KubeInstanceStore,
};

/// Name of the capability auto-detection task
pub const AUTO_DETECT_TASK: &str = "auto-detect";

/// Name of the collector upgrade task
pub const COLLECTOR_UPGRADE_TASK: &str = "collector-upgrade";

/// Name of the instrumentation upgrade task
pub const INSTRUMENTATION_UPGRADE_TASK: &str = "instrumentation-upgrade";

/// A named unit of background work
///
/// `run` must return promptly once `cancel` fires.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StartupTask: Send + Sync {
    /// Name used in logs, metrics and errors
    fn name(&self) -> &'static str;

    /// Run the task to completion or until cancelled
    async fn run(&self, cancel: CancellationToken) -> Result<(), Error>;
}

/// Something startup tasks can be attached to
#[cfg_attr(test, automock)]
pub trait TaskRegistrar {
    /// Attach one task; called once per task before serving starts
    fn register(&mut self, task: Arc<dyn StartupTask>) -> Result<(), Error>;
}

/// Ordered list of registered startup tasks
#[derive(Default)]
pub struct TaskSequencer {
    tasks: Vec<Arc<dyn StartupTask>>,
    names: HashSet<&'static str>,
    sealed: bool,
}

impl TaskSequencer {
    /// Empty sequencer
    pub fn new() -> Self {
        Self::default()
    }

    /// Task names in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Reject further registrations
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Spawn every task in registration order
    ///
    /// The tasks run concurrently; each sees a child of `cancel`. Failures are
    /// logged and counted and never propagate to the caller.
    pub fn start(&self, cancel: &CancellationToken, metrics: Arc<OperatorMetrics>) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for task in &self.tasks {
            let task = Arc::clone(task);
            let token = cancel.child_token();
            let metrics = Arc::clone(&metrics);
            set.spawn(async move {
                let name = task.name();
                info!(task = name, "starting startup task");
                match task.run(token.clone()).await {
                    Ok(()) if token.is_cancelled() => {
                        info!(task = name, "startup task stopped by cancellation");
                        metrics.task_finished(name, "cancelled");
                    }
                    Ok(()) => {
                        info!(task = name, "startup task completed");
                        metrics.task_finished(name, "success");
                    }
                    Err(e) => {
                        error!(task = name, error = %e, "startup task failed");
                        metrics.task_finished(name, "error");
                    }
                }
            });
        }
        set
    }
}

impl TaskRegistrar for TaskSequencer {
    fn register(&mut self, task: Arc<dyn StartupTask>) -> Result<(), Error> {
        let name = task.name();
        if self.sealed {
            return Err(Error::task_registration(name, "runtime is already serving"));
        }
        if name.trim().is_empty() {
            return Err(Error::task_registration(name, "task name must not be empty"));
        }
        if !self.names.insert(name) {
            return Err(Error::task_registration(name, "a task with this name is already registered"));
        }
        self.tasks.push(task);
        Ok(())
    }
}

/// Register `tasks` in order, stopping at the first failure
///
/// Every error names the task that could not be registered.
pub fn register_startup_tasks<R: TaskRegistrar + ?Sized>(
    registrar: &mut R,
    tasks: Vec<Arc<dyn StartupTask>>,
) -> Result<(), Error> {
    for task in tasks {
        let name = task.name();
        registrar.register(task).map_err(|e| match e {
            Error::TaskRegistration { .. } => e,
            other => Error::task_registration(name, other.to_string()),
        })?;
        info!(task = name, "registered startup task");
    }
    Ok(())
}

/// Wait for spawned tasks to finish, abandoning them after `grace`
pub async fn drain_tasks(mut set: JoinSet<()>, grace: std::time::Duration) {
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "startup task panicked or was aborted");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = set.len(), "startup tasks did not stop in time, aborting");
        set.abort_all();
    }
}
