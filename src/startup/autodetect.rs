//! Cluster capability auto-detection
//!
//! Probes API discovery for optional platform groups and publishes the result
//! through a watch channel. Tasks that depend on detected capabilities hold a
//! [`CapabilitiesHandle`] and await it explicitly instead of relying on
//! registration order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::discovery::Discovery;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{StartupTask, AUTO_DETECT_TASK};
use crate::Error;

/// How often capabilities are re-probed after the first detection
pub const AUTO_DETECT_INTERVAL: Duration = Duration::from_secs(5);

const OPENSHIFT_ROUTE_GROUP: &str = "route.openshift.io";
const PROMETHEUS_OPERATOR_GROUP: &str = "monitoring.coreos.com";

/// Optional platform features found in the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// OpenShift routes are served
    pub openshift_routes: bool,
    /// Prometheus-operator CRDs are served
    pub prometheus_operator: bool,
}

/// Detects cluster capabilities
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    /// Probe the cluster once
    async fn detect(&self) -> Result<Capabilities, Error>;
}

/// Probe backed by API discovery of the relevant groups
pub struct DiscoveryProbe {
    client: Client,
}

impl DiscoveryProbe {
    /// Probe using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CapabilityProbe for DiscoveryProbe {
    async fn detect(&self) -> Result<Capabilities, Error> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[OPENSHIFT_ROUTE_GROUP, PROMETHEUS_OPERATOR_GROUP])
            .run()
            .await?;

        Ok(Capabilities {
            openshift_routes: discovery.has_group(OPENSHIFT_ROUTE_GROUP),
            prometheus_operator: discovery.has_group(PROMETHEUS_OPERATOR_GROUP),
        })
    }
}

/// Write side of the capabilities channel
#[derive(Clone)]
pub struct CapabilitiesPublisher {
    tx: Arc<watch::Sender<Option<Capabilities>>>,
}

impl CapabilitiesPublisher {
    /// Publish a detection result, returning whether it changed anything
    pub fn publish(&self, caps: Capabilities) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == Some(caps) {
                false
            } else {
                *current = Some(caps);
                true
            }
        })
    }
}

/// Read side of the capabilities channel
#[derive(Clone)]
pub struct CapabilitiesHandle {
    rx: watch::Receiver<Option<Capabilities>>,
}

impl CapabilitiesHandle {
    /// Latest detection result, `None` before the first probe finished
    pub fn current(&self) -> Option<Capabilities> {
        *self.rx.borrow()
    }

    /// Wait for the first detection result
    ///
    /// Returns `None` if `cancel` fires first or the publisher is gone. The
    /// returned result counts as seen by [`CapabilitiesHandle::changed`].
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Option<Capabilities> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.rx.wait_for(Option::is_some) => result.ok().and_then(|caps| *caps),
        }
    }

    /// Wait for the next published change, `None` once the publisher is gone
    pub async fn changed(&mut self) -> Option<Capabilities> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(caps) = *self.rx.borrow_and_update() {
                return Some(caps);
            }
        }
    }
}

/// Create a connected publisher and handle
pub fn capabilities_channel() -> (CapabilitiesPublisher, CapabilitiesHandle) {
    let (tx, rx) = watch::channel(None);
    (
        CapabilitiesPublisher { tx: Arc::new(tx) },
        CapabilitiesHandle { rx },
    )
}

/// Startup task running the probe and publishing its results
pub struct AutoDetectTask {
    probe: Arc<dyn CapabilityProbe>,
    publisher: CapabilitiesPublisher,
    interval: Duration,
}

impl AutoDetectTask {
    /// Task probing with `probe` every [`AUTO_DETECT_INTERVAL`]
    pub fn new(probe: Arc<dyn CapabilityProbe>, publisher: CapabilitiesPublisher) -> Self {
        Self {
            probe,
            publisher,
            interval: AUTO_DETECT_INTERVAL,
        }
    }

    /// Override the re-probe interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl StartupTask for AutoDetectTask {
    fn name(&self) -> &'static str {
        AUTO_DETECT_TASK
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        // The first probe must succeed; later failures keep the last result.
        let caps = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = self.probe.detect() => result
                .map_err(|e| Error::task(AUTO_DETECT_TASK, e.to_string()))?,
        };
        self.publisher.publish(caps);
        info!(
            openshift_routes = caps.openshift_routes,
            prometheus_operator = caps.prometheus_operator,
            "cluster capabilities detected"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.probe.detect() => result,
            };
            match result {
                Ok(caps) => {
                    if self.publisher.publish(caps) {
                        info!(
                            openshift_routes = caps.openshift_routes,
                            prometheus_operator = caps.prometheus_operator,
                            "cluster capabilities changed"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "capability re-detection failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Answers the first probe, then hangs on every later one
    struct StallingProbe {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CapabilityProbe for StallingProbe {
        async fn detect(&self) -> Result<Capabilities, Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(Capabilities::default());
            }
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_handle_waits_for_first_result() {
        let (publisher, handle) = capabilities_channel();
        assert_eq!(handle.current(), None);

        let waiter = {
            let mut handle = handle.clone();
            tokio::spawn(async move { handle.wait(&CancellationToken::new()).await })
        };
        publisher.publish(Capabilities {
            openshift_routes: true,
            prometheus_operator: false,
        });

        let caps = waiter.await.unwrap().unwrap();
        assert!(caps.openshift_routes);
    }

    #[tokio::test]
    async fn test_wait_returns_none_on_cancel() {
        let (_publisher, mut handle) = capabilities_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(handle.wait(&cancel).await, None);
    }

    #[tokio::test]
    async fn test_changed_after_wait_skips_seen_result() {
        let (publisher, mut handle) = capabilities_channel();
        publisher.publish(Capabilities::default());
        assert!(handle.wait(&CancellationToken::new()).await.is_some());

        publisher.publish(Capabilities {
            openshift_routes: true,
            prometheus_operator: false,
        });
        let next = handle.changed().await.unwrap();
        assert!(next.openshift_routes);
    }

    #[tokio::test]
    async fn test_changed_ends_when_publisher_dropped() {
        let (publisher, mut handle) = capabilities_channel();
        publisher.publish(Capabilities {
            openshift_routes: false,
            prometheus_operator: true,
        });

        let caps = handle.changed().await.unwrap();
        assert!(caps.prometheus_operator);

        drop(publisher);
        assert_eq!(handle.changed().await, None);
    }

    #[test]
    fn test_publish_reports_changes_only() {
        let (publisher, _handle) = capabilities_channel();
        let caps = Capabilities::default();
        assert!(publisher.publish(caps));
        assert!(!publisher.publish(caps));
    }

    #[tokio::test]
    async fn test_task_publishes_and_stops_on_cancel() {
        let mut probe = MockCapabilityProbe::new();
        probe.expect_detect().returning(|| {
            Ok(Capabilities {
                openshift_routes: false,
                prometheus_operator: true,
            })
        });

        let (publisher, mut handle) = capabilities_channel();
        let task = AutoDetectTask::new(Arc::new(probe), publisher)
            .with_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { task.run(cancel).await }
        });

        let caps = handle.wait(&CancellationToken::new()).await.unwrap();
        assert!(caps.prometheus_operator);

        cancel.cancel();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_hanging_reprobe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = StallingProbe { calls: Arc::clone(&calls) };
        let (publisher, _handle) = capabilities_channel();
        let task = AutoDetectTask::new(Arc::new(probe), publisher)
            .with_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { task.run(cancel).await }
        });

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(calls.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("task should stop while a re-probe is pending");
        assert!(stopped.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_first_probe_failure_fails_task() {
        let mut probe = MockCapabilityProbe::new();
        probe
            .expect_detect()
            .returning(|| Err(Error::runtime("discovery unavailable")));

        let (publisher, handle) = capabilities_channel();
        let task = AutoDetectTask::new(Arc::new(probe), publisher);
        let err = task.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Task { ref task, .. } if task == AUTO_DETECT_TASK));
        assert_eq!(handle.current(), None);
    }
}
