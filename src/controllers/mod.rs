//! Controllers for the RayCluster operator
//!
//! One controller watches RayCluster objects plus the pods and services they
//! own. Each pass runs the pure planning stages in order:
//!
//! 1. [`observed`] reads pods and services into a snapshot
//! 2. [`suspend`] decides whether the cluster is being suspended or resumed
//! 3. [`resolver`] plans the head pod and head service
//! 4. [`scaling`] plans worker pod creations and deletions per group
//! 5. [`status`] folds the outcome into a new status
//!
//! [`cluster`] executes the plans; [`autoscaling`] is the write path an
//! external autoscaler uses to request scale changes.

pub mod autoscaling;
pub mod cluster;
pub mod observed;
pub mod plan;
pub mod resolver;
pub mod scaling;
pub mod status;
pub mod suspend;

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::warn;

pub use autoscaling::{AutoscalerClient, AutoscalerView, ScaleRequest};
pub use cluster::{ClusterReconciler, PassReport, RayClusterController};
pub use observed::ObservedSnapshot;
pub use plan::{ActionOutcome, GroupIssue, PlannedAction, ScalingAction, TopologyAction};
pub use suspend::SuspendPhase;

use crate::crd::RayCluster;
use crate::error::OperatorError;

/// Requeue a failed reconciliation after a delay chosen by the error class.
pub(crate) fn error_policy_backoff(
    cluster: Arc<RayCluster>,
    error: &OperatorError,
    _ctx: Arc<ClusterReconciler>,
) -> Action {
    let delay = error.requeue_after();
    warn!(
        cluster = %cluster.name_any(),
        namespace = ?cluster.namespace(),
        error = %error,
        class = ?error.class(),
        requeue_secs = delay.as_secs(),
        "Reconciliation failed, requeueing"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcilerConfig;
    use crate::controllers::cluster::tests::{sample_cluster, InMemoryPlatform};
    use crate::events::RecordingEventPublisher;

    fn context() -> Arc<ClusterReconciler> {
        Arc::new(ClusterReconciler::new(
            Arc::new(InMemoryPlatform::default()),
            Arc::new(RecordingEventPublisher::default()),
            ReconcilerConfig::default(),
        ))
    }

    #[test]
    fn test_backoff_follows_error_class() {
        let cluster = Arc::new(sample_cluster());
        let conflict = OperatorError::Conflict("demo".into());
        let config = OperatorError::config("bad template");

        assert_eq!(
            error_policy_backoff(cluster.clone(), &conflict, context()),
            Action::requeue(conflict.requeue_after())
        );
        assert_eq!(
            error_policy_backoff(cluster, &config, context()),
            Action::requeue(config.requeue_after())
        );
        assert!(conflict.requeue_after() < config.requeue_after());
    }
}
