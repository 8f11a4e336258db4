//! Runtime tuning for the RayCluster reconciler.

use std::time::Duration;

/// Field manager and event reporter name
pub const OPERATOR_NAME: &str = "raycluster-operator";

/// Knobs that shape a reconciliation pass. Built from CLI flags in `main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Requeue interval for a converged cluster
    pub resync_interval: Duration,
    /// Requeue interval while pods are still being created or removed
    pub converge_interval: Duration,
    /// How long the head may be missing or crash-looping before the cluster is `failed`
    pub head_failure_threshold: Duration,
    /// Consecutive unconverged passes before the cluster is `unhealthy`
    pub unhealthy_pass_threshold: i32,
    /// Timeout applied to each individual platform call
    pub api_timeout: Duration,
    /// Attempts at the status write before giving up for this pass
    pub status_write_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(300),
            converge_interval: Duration::from_secs(2),
            head_failure_threshold: Duration::from_secs(300),
            unhealthy_pass_threshold: 3,
            api_timeout: Duration::from_secs(10),
            status_write_retries: 3,
        }
    }
}
