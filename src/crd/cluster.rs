//! RayCluster Custom Resource Definition
//!
//! A RayCluster is one head pod plus any number of independently scaled
//! worker groups, each with its own pod template and replica bounds.

use k8s_openapi::api::core::v1::{
    EnvFromSource, EnvVar, PodTemplateSpec, ResourceRequirements, SecurityContext, Service,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// RayCluster is the Schema for the rayclusters API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1alpha1",
    kind = "RayCluster",
    namespaced,
    status = "RayClusterStatus",
    shortname = "rc",
    category = "all",
    printcolumn = r#"{"name":"Desired Workers","type":"integer","jsonPath":".status.desiredWorkerReplicas"}"#,
    printcolumn = r#"{"name":"Available Workers","type":"integer","jsonPath":".status.availableWorkerReplicas"}"#,
    printcolumn = r#"{"name":"CPUs","type":"string","jsonPath":".status.desiredCPU"}"#,
    printcolumn = r#"{"name":"Memory","type":"string","jsonPath":".status.desiredMemory"}"#,
    printcolumn = r#"{"name":"GPUs","type":"string","jsonPath":".status.desiredGPU"}"#,
    printcolumn = r#"{"name":"TPUs","type":"string","priority":1,"jsonPath":".status.desiredTPU"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"Head Pod IP","type":"string","priority":1,"jsonPath":".status.head.podIP"}"#,
    printcolumn = r#"{"name":"Head Service IP","type":"string","priority":1,"jsonPath":".status.head.serviceIP"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterSpec {
    /// Whether the operator injects the in-tree autoscaler sidecar into the head pod
    #[serde(default)]
    pub enable_in_tree_autoscaling: Option<bool>,

    /// Passthrough configuration for the autoscaler sidecar
    #[serde(default)]
    pub autoscaler_options: Option<AutoscalerOptions>,

    /// A suspended cluster has its head and worker pods deleted
    #[serde(default)]
    pub suspend: Option<bool>,

    /// Annotations copied onto the head service
    #[serde(default)]
    pub head_service_annotations: BTreeMap<String, String>,

    /// Spec for the head pod
    pub head_group_spec: HeadGroupSpec,

    /// Ray version, used for the default autoscaler image tag
    #[serde(default)]
    pub ray_version: String,

    /// Specs for the worker pods
    #[serde(default)]
    pub worker_group_specs: Vec<WorkerGroupSpec>,
}

impl RayClusterSpec {
    pub fn is_suspended(&self) -> bool {
        self.suspend.unwrap_or(false)
    }

    pub fn autoscaling_enabled(&self) -> bool {
        self.enable_in_tree_autoscaling.unwrap_or(false)
    }

    pub fn worker_group(&self, name: &str) -> Option<&WorkerGroupSpec> {
        self.worker_group_specs.iter().find(|g| g.group_name == name)
    }

    pub fn worker_group_mut(&mut self, name: &str) -> Option<&mut WorkerGroupSpec> {
        self.worker_group_specs
            .iter_mut()
            .find(|g| g.group_name == name)
    }
}

/// Spec for the head pod
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeadGroupSpec {
    /// Pod template for the head
    pub template: PodTemplateSpec,

    /// Optional base object for the head service
    #[serde(default)]
    pub head_service: Option<Service>,

    /// Whether an ingress should front the head service (read by external tooling)
    #[serde(default)]
    pub enable_ingress: Option<bool>,

    /// Parameters appended to `ray start` on the head
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Kubernetes service type of the head service
    #[serde(default)]
    pub service_type: Option<String>,
}

/// Spec for one named pool of worker pods
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    /// Unique name of the group within the cluster
    pub group_name: String,

    /// Desired pod count, written by the user or the autoscaler
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Lower replica bound (inclusive)
    #[serde(default)]
    pub min_replicas: i32,

    /// Upper replica bound (inclusive)
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,

    /// Parameters appended to `ray start` on each worker
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Pod template for the workers
    pub template: PodTemplateSpec,

    /// One-shot targeted scale-down requests
    #[serde(default)]
    pub scale_strategy: ScaleStrategy,
}

impl WorkerGroupSpec {
    /// Replica target as stored; an absent value means the lower bound.
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(self.min_replicas)
    }
}

/// Workers to remove from a group
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStrategy {
    /// Pod names slated for deletion; cleared once processed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers_to_delete: Vec<String>,
}

/// Optional configuration for the autoscaler sidecar
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerOptions {
    /// Resource overrides for the autoscaler container (default 500m CPU, 512Mi memory)
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Autoscaler image override
    #[serde(default)]
    pub image: Option<String>,

    /// Autoscaler image pull policy override
    #[serde(default)]
    pub image_pull_policy: Option<String>,

    /// Security context for the autoscaler container
    #[serde(default)]
    pub security_context: Option<SecurityContext>,

    /// Seconds before an idle worker is scaled down (read by the autoscaler)
    #[serde(default)]
    pub idle_timeout_seconds: Option<i32>,

    /// Upscaling aggressiveness (read by the autoscaler)
    #[serde(default)]
    pub upscaling_mode: Option<UpscalingMode>,

    /// Extra environment for the autoscaler container
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Extra environment sources for the autoscaler container
    #[serde(default)]
    pub env_from: Vec<EnvFromSource>,

    /// Extra volume mounts for the autoscaler container
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// How aggressively the autoscaler adds workers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum UpscalingMode {
    /// Upscaling is not rate-limited
    #[default]
    Default,
    /// Alias of Default
    Aggressive,
    /// Pending workers are capped at the current cluster size
    Conservative,
}

impl UpscalingMode {
    pub fn is_rate_limited(self) -> bool {
        match self {
            UpscalingMode::Conservative => true,
            UpscalingMode::Default | UpscalingMode::Aggressive => false,
        }
    }
}

/// Overall state of a RayCluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Ready,
    Unhealthy,
    Failed,
    Suspended,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterState::Ready => "ready",
            ClusterState::Unhealthy => "unhealthy",
            ClusterState::Failed => "failed",
            ClusterState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Kind of Ray node a pod runs, rendered into the `ray.io/node-type` label
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RayNodeType {
    Head,
    Worker,
    /// Pod of the Job that cleans up GCS storage after a fault-tolerant cluster is deleted
    RedisCleanup,
}

impl RayNodeType {
    pub fn as_label(self) -> &'static str {
        match self {
            RayNodeType::Head => "head",
            RayNodeType::Worker => "worker",
            RayNodeType::RedisCleanup => "redis-cleanup",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "head" => Some(RayNodeType::Head),
            "worker" => Some(RayNodeType::Worker),
            "redis-cleanup" => Some(RayNodeType::RedisCleanup),
            _ => None,
        }
    }
}

/// Observed status of a RayCluster, fully rewritten each pass
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterStatus {
    /// Overall state; mirrors the `Ready`/`Suspended` conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClusterState>,

    /// Why the cluster is in its current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default)]
    pub ready_worker_replicas: i32,

    #[serde(default)]
    pub available_worker_replicas: i32,

    #[serde(default)]
    pub desired_worker_replicas: i32,

    #[serde(default)]
    pub min_worker_replicas: i32,

    #[serde(default)]
    pub max_worker_replicas: i32,

    #[serde(default, rename = "desiredCPU", skip_serializing_if = "Option::is_none")]
    pub desired_cpu: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_memory: Option<Quantity>,

    #[serde(default, rename = "desiredGPU", skip_serializing_if = "Option::is_none")]
    pub desired_gpu: Option<Quantity>,

    #[serde(default, rename = "desiredTPU", skip_serializing_if = "Option::is_none")]
    pub desired_tpu: Option<Quantity>,

    /// Head pod and service addresses
    #[serde(default)]
    pub head: HeadInfo,

    /// Head service port name to port
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, String>,

    /// Spec generation this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    /// Structured conditions, derived from the same assessment as `state`
    #[serde(default)]
    pub conditions: Vec<RayClusterCondition>,

    /// Passes in a row where some worker group's pod count missed its target
    #[serde(default)]
    pub consecutive_unconverged_passes: i32,
}

/// Addresses of the head node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct HeadInfo {
    #[serde(default, rename = "podIP", skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    #[serde(default, rename = "serviceIP", skip_serializing_if = "Option::is_none")]
    pub service_ip: Option<String>,
}

/// Condition of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

fn default_max_replicas() -> i32 {
    i32::MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cluster_json() -> &'static str {
        r#"{
            "apiVersion": "ray.io/v1alpha1",
            "kind": "RayCluster",
            "metadata": {"name": "raycluster-sample", "namespace": "default"},
            "spec": {
                "rayVersion": "2.9.0",
                "enableInTreeAutoscaling": true,
                "autoscalerOptions": {"upscalingMode": "Conservative", "idleTimeoutSeconds": 120},
                "headGroupSpec": {
                    "rayStartParams": {"dashboard-host": "0.0.0.0"},
                    "template": {"spec": {"containers": [{"name": "ray-head", "image": "rayproject/ray:2.9.0"}]}}
                },
                "workerGroupSpecs": [{
                    "groupName": "small-group",
                    "replicas": 2,
                    "minReplicas": 1,
                    "maxReplicas": 5,
                    "rayStartParams": {},
                    "template": {"spec": {"containers": [{"name": "ray-worker", "image": "rayproject/ray:2.9.0"}]}},
                    "scaleStrategy": {"workersToDelete": ["raycluster-sample-worker-small-group-abcde"]}
                }]
            }
        }"#
    }

    #[test]
    fn test_parse_sample_cluster() {
        let cluster: RayCluster = serde_json::from_str(sample_cluster_json()).unwrap();
        assert!(cluster.spec.autoscaling_enabled());
        assert!(!cluster.spec.is_suspended());
        let group = cluster.spec.worker_group("small-group").unwrap();
        assert_eq!(group.desired_replicas(), 2);
        assert_eq!(group.scale_strategy.workers_to_delete.len(), 1);
        let options = cluster.spec.autoscaler_options.unwrap();
        assert_eq!(options.upscaling_mode, Some(UpscalingMode::Conservative));
        assert!(options.upscaling_mode.unwrap().is_rate_limited());
    }

    #[test]
    fn test_worker_group_defaults() {
        let group: WorkerGroupSpec =
            serde_json::from_str(r#"{"groupName": "g", "template": {}}"#).unwrap();
        assert_eq!(group.min_replicas, 0);
        assert_eq!(group.max_replicas, i32::MAX);
        assert_eq!(group.replicas, None);
        assert_eq!(group.desired_replicas(), 0);
        assert!(group.scale_strategy.workers_to_delete.is_empty());
    }

    #[test]
    fn test_status_field_names() {
        let status = RayClusterStatus {
            state: Some(ClusterState::Ready),
            desired_cpu: Some(Quantity("3".into())),
            head: HeadInfo {
                pod_ip: Some("10.0.0.1".into()),
                service_ip: None,
            },
            observed_generation: Some(4),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "ready");
        assert_eq!(value["desiredCPU"], "3");
        assert_eq!(value["head"]["podIP"], "10.0.0.1");
        assert_eq!(value["observedGeneration"], 4);
        assert!(value.get("desiredGPU").is_none());
    }

    #[test]
    fn test_node_type_labels() {
        for node_type in [RayNodeType::Head, RayNodeType::Worker, RayNodeType::RedisCleanup] {
            assert_eq!(RayNodeType::from_label(node_type.as_label()), Some(node_type));
        }
        assert_eq!(RayNodeType::from_label("driver"), None);
    }
}
