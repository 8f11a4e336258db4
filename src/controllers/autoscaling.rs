//! Autoscaler coordination
//!
//! The Ray autoscaler runs as a sidecar in the head pod. It reads a view of
//! each worker group and writes back exactly two fields per group:
//! `replicas` and `scaleStrategy.workersToDelete`. Both sides write the same
//! object, so every write goes through a resourceVersion-guarded replace and
//! a conflict means re-read and retry.
//!
//! The reconciler never overwrites an autoscaler-written `replicas` value
//! except to clamp it into bounds, and clears `workersToDelete` once it has
//! acted on the entries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, EnvVar, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crd::{ClusterState, RayCluster, RayClusterSpec, UpscalingMode};
use crate::error::{OperatorError, Result};
use crate::platform::ClusterPlatform;

/// Name of the autoscaler sidecar container in the head pod
pub const AUTOSCALER_CONTAINER_NAME: &str = "autoscaler";

const DEFAULT_AUTOSCALER_CPU: &str = "500m";
const DEFAULT_AUTOSCALER_MEMORY: &str = "512Mi";
const DEFAULT_IDLE_TIMEOUT_SECONDS: i32 = 60;

/// One worker group as the autoscaler sees it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupScaleView {
    pub group: String,
    pub replicas: i32,
    pub min_replicas: i32,
    pub max_replicas: i32,
    /// Deletion requests not yet acted on by the reconciler
    pub pending_deletions: Vec<String>,
}

/// Read model handed to the autoscaler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerView {
    pub cluster: String,
    pub namespace: String,
    pub resource_version: Option<String>,
    pub groups: Vec<GroupScaleView>,
    pub state: Option<ClusterState>,
    pub ready_worker_replicas: i32,
    pub available_worker_replicas: i32,
    pub desired_worker_replicas: i32,
    pub upscaling_mode: UpscalingMode,
    pub idle_timeout_seconds: i32,
}

impl AutoscalerView {
    pub fn from_cluster(cluster: &RayCluster) -> Self {
        let status = cluster.status.clone().unwrap_or_default();
        let options = cluster.spec.autoscaler_options.as_ref();
        AutoscalerView {
            cluster: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            resource_version: cluster.resource_version(),
            groups: cluster
                .spec
                .worker_group_specs
                .iter()
                .map(|g| GroupScaleView {
                    group: g.group_name.clone(),
                    replicas: g.desired_replicas(),
                    min_replicas: g.min_replicas,
                    max_replicas: g.max_replicas,
                    pending_deletions: g.scale_strategy.workers_to_delete.clone(),
                })
                .collect(),
            state: status.state,
            ready_worker_replicas: status.ready_worker_replicas,
            available_worker_replicas: status.available_worker_replicas,
            desired_worker_replicas: status.desired_worker_replicas,
            upscaling_mode: options.and_then(|o| o.upscaling_mode).unwrap_or_default(),
            idle_timeout_seconds: options
                .and_then(|o| o.idle_timeout_seconds)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECONDS),
        }
    }

    pub fn group(&self, name: &str) -> Option<&GroupScaleView> {
        self.groups.iter().find(|g| g.group == name)
    }
}

/// A scaling decision for one worker group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRequest {
    pub group: String,
    /// New replica target; left alone when `None`
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Specific pods to remove, appended to any pending requests
    #[serde(default)]
    pub workers_to_delete: Vec<String>,
}

impl ScaleRequest {
    pub fn replicas(group: impl Into<String>, replicas: i32) -> Self {
        Self {
            group: group.into(),
            replicas: Some(replicas),
            workers_to_delete: Vec::new(),
        }
    }

    /// Remove named pods and lower the target by the same count.
    pub fn remove_workers(group: impl Into<String>, replicas: i32, pods: Vec<String>) -> Self {
        Self {
            group: group.into(),
            replicas: Some(replicas),
            workers_to_delete: pods,
        }
    }
}

/// Apply a request to a spec. Returns whether anything changed.
///
/// Only `replicas` and `workersToDelete` are touched. Out-of-bounds replica
/// values are stored as given; the reconciler clamps them.
pub fn apply_scale_request(spec: &mut RayClusterSpec, request: &ScaleRequest) -> Result<bool> {
    let group = spec.worker_group_mut(&request.group).ok_or_else(|| {
        OperatorError::group_config(&request.group, "no such worker group in spec")
    })?;

    let mut changed = false;
    if let Some(replicas) = request.replicas {
        if group.replicas != Some(replicas) {
            group.replicas = Some(replicas);
            changed = true;
        }
    }
    for pod in &request.workers_to_delete {
        if !group.scale_strategy.workers_to_delete.contains(pod) {
            group.scale_strategy.workers_to_delete.push(pod.clone());
            changed = true;
        }
    }
    Ok(changed)
}

/// Writes scale requests with optimistic concurrency
pub struct AutoscalerClient {
    platform: Arc<dyn ClusterPlatform>,
    max_attempts: u32,
    backoff: Duration,
}

impl AutoscalerClient {
    pub fn new(platform: Arc<dyn ClusterPlatform>) -> Self {
        Self {
            platform,
            max_attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Current view of a cluster.
    pub async fn view(&self, namespace: &str, name: &str) -> Result<AutoscalerView> {
        let cluster = self.platform.get_cluster(namespace, name).await?;
        Ok(AutoscalerView::from_cluster(&cluster))
    }

    /// Apply requests atomically against the latest spec, retrying on conflict.
    pub async fn submit(
        &self,
        namespace: &str,
        name: &str,
        requests: &[ScaleRequest],
    ) -> Result<RayCluster> {
        for attempt in 1..=self.max_attempts {
            let current = self.platform.get_cluster(namespace, name).await?;
            let mut updated = current.clone();
            let mut changed = false;
            for request in requests {
                changed |= apply_scale_request(&mut updated.spec, request)?;
            }
            if !changed {
                debug!(cluster = %name, namespace = %namespace, "Scale requests already applied");
                return Ok(current);
            }

            match self.platform.replace_cluster(namespace, &updated).await {
                Ok(written) => {
                    info!(
                        cluster = %name,
                        namespace = %namespace,
                        requests = requests.len(),
                        attempt,
                        "Applied scale requests"
                    );
                    return Ok(written);
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        cluster = %name,
                        namespace = %namespace,
                        attempt,
                        "Conflict applying scale requests, retrying"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(OperatorError::Conflict(format!(
            "raycluster {}/{} after {} attempts",
            namespace, name, self.max_attempts
        )))
    }
}

/// The autoscaler sidecar injected into the head pod.
pub fn build_autoscaler_container(cluster: &RayCluster) -> Container {
    let options = cluster.spec.autoscaler_options.clone().unwrap_or_default();
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let image = options
        .image
        .unwrap_or_else(|| format!("rayproject/ray:{}", cluster.spec.ray_version));
    let resources = options.resources.unwrap_or_else(default_autoscaler_resources);

    let mut env = vec![
        EnvVar {
            name: "RAY_CLUSTER_NAME".to_string(),
            value: Some(name),
            ..Default::default()
        },
        EnvVar {
            name: "RAY_CLUSTER_NAMESPACE".to_string(),
            value: Some(namespace),
            ..Default::default()
        },
    ];
    env.extend(options.env);

    Container {
        name: AUTOSCALER_CONTAINER_NAME.to_string(),
        image: Some(image),
        image_pull_policy: Some(
            options
                .image_pull_policy
                .unwrap_or_else(|| "IfNotPresent".to_string()),
        ),
        command: Some(vec!["ray".to_string()]),
        args: Some(vec![
            "kuberay-autoscaler".to_string(),
            "--cluster-name".to_string(),
            "$(RAY_CLUSTER_NAME)".to_string(),
            "--cluster-namespace".to_string(),
            "$(RAY_CLUSTER_NAMESPACE)".to_string(),
        ]),
        env: Some(env),
        env_from: (!options.env_from.is_empty()).then_some(options.env_from),
        volume_mounts: (!options.volume_mounts.is_empty()).then_some(options.volume_mounts),
        resources: Some(resources),
        security_context: options.security_context,
        ..Default::default()
    }
}

fn default_autoscaler_resources() -> ResourceRequirements {
    let amounts: BTreeMap<String, Quantity> = [
        ("cpu".to_string(), Quantity(DEFAULT_AUTOSCALER_CPU.to_string())),
        (
            "memory".to_string(),
            Quantity(DEFAULT_AUTOSCALER_MEMORY.to_string()),
        ),
    ]
    .into_iter()
    .collect();
    ResourceRequirements {
        limits: Some(amounts.clone()),
        requests: Some(amounts),
        ..Default::default()
    }
}
