//! Lease-based leader election for running several operator replicas.
//!
//! Only the holder of the `coordination.k8s.io/v1` Lease reconciles
//! RayClusters; standby replicas block in [`LeaderElector::acquire`] until
//! the holder stops renewing.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::OPERATOR_NAME;

/// Name of the Lease object shared by all replicas.
pub fn lease_name() -> String {
    format!("{}-leader", OPERATOR_NAME)
}

/// Detects the namespace for leader election.
///
/// Priority: explicit argument, then the service account file, then `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// How long a lease lives and how often it is touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl LeaseTiming {
    fn duration_secs(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

pub struct LeaderElector {
    lease_api: Api<Lease>,
    lease_name: String,
    identity: String,
    timing: LeaseTiming,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, timing: LeaseTiming) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("{}-{:08x}", OPERATOR_NAME, rand::random::<u32>()));
        let lease_name = lease_name();
        info!(identity = %identity, namespace = %namespace, lease = %lease_name, "Initialized leader elector");
        Self {
            lease_api,
            lease_name,
            identity,
            timing,
        }
    }

    /// Blocks until the lease is acquired.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting to acquire leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Lease held by another replica, retrying in {:?}", self.timing.retry_interval);
                }
                Err(e) => {
                    warn!("Lease acquisition error: {}, retrying in {:?}", e, self.timing.retry_interval);
                }
            }
            tokio::time::sleep(self.timing.retry_interval).await;
        }
    }

    /// Renews the lease. `Ok(false)` means leadership was lost.
    pub async fn renew(&self) -> anyhow::Result<bool> {
        let lease = self.lease_api.get(&self.lease_name).await?;
        if holder_of(&lease) != Some(self.identity.as_str()) {
            return Ok(false);
        }

        let mut updated = lease;
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }

        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                debug!("Renewed leader lease");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                warn!("Lease conflict during renewal, leadership lost");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clears the holder so a standby replica can take over at once.
    pub async fn release(&self) {
        info!(identity = %self.identity, "Releasing leader lease");
        let lease = match self.lease_api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                return;
            }
        };
        if holder_of(&lease) != Some(self.identity.as_str()) {
            debug!("Lease not held by this replica, skipping release");
            return;
        }

        let mut updated = lease;
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("Released leader lease"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    pub fn renew_interval(&self) -> Duration {
        self.timing.renew_interval
    }

    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        match self.lease_api.get(&self.lease_name).await {
            Ok(existing) => {
                let ours = holder_of(&existing) == Some(self.identity.as_str());
                if !ours && !is_expired(existing.spec.as_ref(), now, &self.timing) {
                    return Ok(false);
                }
                let mut updated = existing.clone();
                updated.spec = Some(claim(
                    existing.spec.as_ref(),
                    &self.identity,
                    now,
                    &self.timing,
                ));
                won(self
                    .lease_api
                    .replace(&self.lease_name, &PostParams::default(), &updated)
                    .await)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        ..Default::default()
                    },
                    spec: Some(claim(None, &self.identity, now, &self.timing)),
                };
                won(self.lease_api.create(&PostParams::default(), &lease).await)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Losing a write race to another replica is `Ok(false)`.
fn won(result: kube::Result<Lease>) -> anyhow::Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn holder_of(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
}

/// A lease without a renew time, or not renewed within its duration, is free.
fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>, timing: &LeaseTiming) -> bool {
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or_else(|| timing.duration_secs()) as i64;
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(t)) => now.signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}

/// Lease spec for `identity` holding the lease as of `now`.
fn claim(
    previous: Option<&LeaseSpec>,
    identity: &str,
    now: DateTime<Utc>,
    timing: &LeaseTiming,
) -> LeaseSpec {
    let now = MicroTime(now);
    let takeover = previous.and_then(|s| s.holder_identity.as_deref()) != Some(identity);
    let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
    let (acquire_time, transitions) = match previous {
        None => (Some(now.clone()), 0),
        Some(_) if takeover => (Some(now.clone()), transitions + 1),
        Some(prev) => (prev.acquire_time.clone(), transitions),
    };
    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(timing.duration_secs()),
        acquire_time,
        renew_time: Some(now),
        lease_transitions: Some(transitions),
        ..Default::default()
    }
}
