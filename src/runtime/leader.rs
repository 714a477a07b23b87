//! Leader election using Kubernetes Leases
//!
//! Guarantees that at most one replica runs the leader-only work (startup
//! tasks and reconcile controllers) at a time, using the
//! coordination.k8s.io/v1 Lease API.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we retry.
//!
//! # Timing
//!
//! Candidates retry every `retryPeriod`. The holder renews every
//! `retryPeriod` and gives up leadership once it has failed to renew for
//! `renewDeadline`. Other candidates take over once `leaseDuration` has
//! passed since the last renewal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;
use crate::Error;

/// Namespace used for the lease when `POD_NAMESPACE` is not set
pub const DEFAULT_LEASE_NAMESPACE: &str = "opentelemetry-operator-system";

/// Where this replica stands with respect to a lease
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// This replica holds the lease
    HeldBySelf,
    /// Another replica holds an unexpired lease
    HeldByOther(String),
    /// Nobody holds a valid lease; carries the transition count so far
    Expired(i32),
}

/// Classify `lease` from the point of view of `identity` at `now`
pub fn lease_state(lease: &Lease, identity: &str, now: DateTime<Utc>) -> LeaseState {
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());

    if holder == Some(identity) {
        return LeaseState::HeldBySelf;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let is_expired = match (holder, renew_time, duration_secs) {
        (None, _, _) => true,
        (Some(_), Some(rt), Some(duration)) => {
            now > rt.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    };

    match holder {
        Some(other) if !is_expired => LeaseState::HeldByOther(other.to_string()),
        _ => LeaseState::Expired(spec.and_then(|s| s.lease_transitions).unwrap_or(0)),
    }
}

/// Identity for this replica: the pod name, or a unique fallback
pub fn election_identity(pod_name: Option<&str>) -> String {
    match pod_name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!(
            "otel-operator-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ),
    }
}

/// Lease duration in whole seconds, saturating at the Lease field's range
pub fn lease_duration_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn missing_resource_version() -> Error {
    Error::runtime("lease is missing resourceVersion")
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaderElector {
    /// Create an elector for the lease described by `config`
    pub fn new(client: Client, config: &LeaderElectionConfig, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: config.id.clone(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
        }
    }

    /// This replica's identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Block until leadership is acquired or `cancel` fires
    ///
    /// Returns `None` when cancelled before acquiring.
    pub async fn acquire(self: Arc<Self>, cancel: &CancellationToken) -> Option<LeaderGuard> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return Some(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_period.as_secs(),
                        "lease held by another replica, waiting"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_period.as_secs(),
                        "failed to acquire lease, retrying"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => self.create_lease(&api, now).await,
            Some(lease) => match lease_state(&lease, &self.identity, now) {
                LeaseState::HeldBySelf => self.renew_lease(&api, &lease, now).await,
                LeaseState::HeldByOther(_) => Ok(false),
                LeaseState::Expired(transitions) => {
                    self.take_over_lease(&api, lease.metadata.resource_version.clone(), now, transitions)
                        .await
                }
            },
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(lease_duration_seconds(self.lease_duration)),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool, Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(&self, api: &Api<Lease>, existing: &Lease, now: DateTime<Utc>) -> Result<bool, Error> {
        if existing.metadata.resource_version.is_none() {
            return Err(missing_resource_version());
        }

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }

        match api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "lease renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(identity = %self.identity, "lease renewal conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, Error> {
        let rv = resource_version.ok_or_else(missing_resource_version)?;

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(rv),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, transitions + 1)),
        };

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew every retry period; give up after failing for the renew deadline
    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.retry_period).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "lease taken by another replica");
                    break;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "failed to renew lease");
                    if last_renewed.elapsed() >= self.renew_deadline {
                        warn!(
                            identity = %self.identity,
                            deadline_secs = self.renew_deadline.as_secs(),
                            "renew deadline exceeded"
                        );
                        break;
                    }
                }
            }
        }

        warn!(identity = %self.identity, "leadership lost");
        let _ = lost_tx.send(());
    }

    /// Release the lease by clearing the holder identity
    async fn release_lease(&self) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(identity = %self.identity, "lease not found, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if lease_state(&lease, &self.identity, Utc::now()) != LeaseState::HeldBySelf {
            debug!(identity = %self.identity, "not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "metadata": {
                "resourceVersion": lease.metadata.resource_version,
            },
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past),
            }
        });

        api.patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!(identity = %self.identity, "lease released for fast failover");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// While this guard exists the elector renews the lease. Use `lost()` to wait
/// for leadership loss. The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder
    ///
    /// Lets a standby acquire immediately instead of waiting for expiry.
    pub async fn release(self) -> Result<(), Error> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        debug!(identity = %self.elector.identity, "leader guard dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed: DateTime<Utc>, duration: i32, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("9f7554c3.opentelemetry.io".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_own_lease_is_held_by_self() {
        let now = Utc::now();
        let l = lease(Some("me"), now - chrono::Duration::seconds(500), 137, 3);
        assert_eq!(lease_state(&l, "me", now), LeaseState::HeldBySelf);
    }

    #[test]
    fn test_fresh_foreign_lease_is_respected() {
        let now = Utc::now();
        let l = lease(Some("other"), now - chrono::Duration::seconds(10), 137, 0);
        assert_eq!(
            lease_state(&l, "me", now),
            LeaseState::HeldByOther("other".to_string())
        );
    }

    #[test]
    fn test_stale_foreign_lease_is_expired() {
        let now = Utc::now();
        let l = lease(Some("other"), now - chrono::Duration::seconds(200), 137, 4);
        assert_eq!(lease_state(&l, "me", now), LeaseState::Expired(4));
    }

    #[test]
    fn test_released_lease_is_immediately_acquirable() {
        let now = Utc::now();
        let l = lease(None, now, 137, 1);
        assert_eq!(lease_state(&l, "me", now), LeaseState::Expired(1));
    }

    #[test]
    fn test_lease_without_spec_is_expired() {
        let l = Lease::default();
        assert_eq!(lease_state(&l, "me", Utc::now()), LeaseState::Expired(0));
    }

    #[test]
    fn test_lease_duration_seconds_saturates() {
        assert_eq!(lease_duration_seconds(Duration::from_secs(137)), 137);
        assert_eq!(lease_duration_seconds(Duration::from_millis(1500)), 1);
        assert_eq!(
            lease_duration_seconds(Duration::from_secs(3_000_000_000)),
            i32::MAX
        );
    }

    #[test]
    fn test_election_identity() {
        assert_eq!(election_identity(Some("operator-abc")), "operator-abc");
        assert!(election_identity(None).starts_with("otel-operator-"));
        assert!(election_identity(Some("")).starts_with("otel-operator-"));
    }
}
