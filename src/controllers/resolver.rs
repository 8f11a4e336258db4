//! Desired-state resolution for the head node
//!
//! Works out which head-side objects must exist (one head pod, one head
//! service), which pods must go (workers of removed groups, pods that have
//! failed or completed) and builds the Kubernetes objects the executor
//! creates.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, PodTemplateSpec, Service, ServicePort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::controllers::autoscaling::build_autoscaler_container;
use crate::controllers::observed::ObservedSnapshot;
use crate::controllers::plan::{GroupIssue, PlannedAction, ScalingAction, TopologyAction};
use crate::crd::{RayCluster, RayClusterSpec, RayNodeType, WorkerGroupSpec};
use crate::error::{OperatorError, Result};
use crate::labels;
use crate::quantity;

pub const GCS_PORT: i32 = 6379;
pub const DASHBOARD_PORT: i32 = 8265;
pub const CLIENT_PORT: i32 = 10001;

/// Env var carrying the generated `ray start` command on every Ray container
pub const RAY_START_CMD_ENV: &str = "KUBERAY_GEN_RAY_START_CMD";

/// Head-side actions and orphan cleanup for one pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyPlan {
    pub actions: Vec<PlannedAction>,
    pub issues: Vec<GroupIssue>,
}

pub fn head_service_name(cluster: &str) -> String {
    format!("{}-head-svc", cluster)
}

/// In-cluster DNS name of the head service.
pub fn head_service_fqdn(cluster: &str, namespace: &str) -> String {
    format!("{}.{}.svc.cluster.local", head_service_name(cluster), namespace)
}

/// A template the executor can turn into a pod.
pub fn validate_template(template: &PodTemplateSpec) -> std::result::Result<(), String> {
    match &template.spec {
        Some(spec) if !spec.containers.is_empty() => Ok(()),
        _ => Err("pod template has no containers".to_string()),
    }
}

/// Decide head-pod, head-service and orphan actions.
pub fn resolve(spec: &RayClusterSpec, observed: &ObservedSnapshot) -> TopologyPlan {
    let mut plan = TopologyPlan::default();

    match validate_template(&spec.head_group_spec.template) {
        Ok(()) => {
            if observed.head_pods.is_empty() {
                plan.actions
                    .push(PlannedAction::Topology(TopologyAction::CreateHeadPod));
            }
            // Keep the oldest head; any others are extras.
            for extra in observed.head_pods.iter().skip(1) {
                plan.actions
                    .push(PlannedAction::Topology(TopologyAction::DeleteHeadPod {
                        pod: extra.name.clone(),
                    }));
            }
            if observed.head_service().is_none() {
                plan.actions
                    .push(PlannedAction::Topology(TopologyAction::CreateHeadService));
            }
        }
        Err(message) => plan.issues.push(GroupIssue::new(labels::HEAD_GROUP, message)),
    }

    // Finished pods are replaced by the head check above or by scaling; remove the husks.
    for pod in &observed.finished {
        let action = match pod.node_type {
            RayNodeType::Head => PlannedAction::Topology(TopologyAction::DeleteHeadPod {
                pod: pod.name.clone(),
            }),
            RayNodeType::Worker => PlannedAction::Scaling(ScalingAction::DeletePod {
                group: pod.group.clone(),
                pod: pod.name.clone(),
            }),
            RayNodeType::RedisCleanup => continue,
        };
        plan.actions.push(action);
    }

    for (group, pods) in &observed.worker_pods_by_group {
        if spec.worker_group(group).is_some() {
            continue;
        }
        plan.actions.extend(pods.iter().map(|p| {
            PlannedAction::Scaling(ScalingAction::DeletePod {
                group: group.clone(),
                pod: p.name.clone(),
            })
        }));
    }

    plan
}

/// Owner reference making the cluster the controller of an object.
pub fn owner_reference(cluster: &RayCluster) -> OwnerReference {
    OwnerReference {
        api_version: RayCluster::api_version(&()).to_string(),
        kind: RayCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Render `ray start` flags from a parameter map.
///
/// Empty values render as bare flags (`--block`), everything else as
/// `--key=value`, in key order.
pub fn ray_start_command(head: bool, params: &BTreeMap<String, String>) -> String {
    let mut command = String::from("ray start");
    if head {
        command.push_str(" --head");
    }
    command.push_str(" --block");
    for (key, value) in params {
        if key == "block" || key == "head" {
            continue;
        }
        if value.is_empty() {
            command.push_str(&format!(" --{}", key));
        } else {
            command.push_str(&format!(" --{}={}", key, value));
        }
    }
    command
}

/// Fill in parameters Ray needs that the user did not set.
fn effective_start_params(
    user: &BTreeMap<String, String>,
    container: &Container,
    head: bool,
    head_address: &str,
) -> BTreeMap<String, String> {
    let mut params = user.clone();
    if head {
        params
            .entry("port".to_string())
            .or_insert_with(|| GCS_PORT.to_string());
        params
            .entry("dashboard-host".to_string())
            .or_insert_with(|| "0.0.0.0".to_string());
    } else {
        params
            .entry("address".to_string())
            .or_insert_with(|| format!("{}:{}", head_address, GCS_PORT));
    }

    let limits = container.resources.as_ref().and_then(|r| r.limits.as_ref());
    if let Some(cpu) = limits.and_then(|l| l.get("cpu")) {
        if let Some(milli) = quantity::parse_milli(cpu) {
            params
                .entry("num-cpus".to_string())
                .or_insert_with(|| ((milli + 999) / 1000).to_string());
        }
    }
    let gpus: i128 = limits
        .map(|l| {
            l.iter()
                .filter(|(k, _)| k.ends_with("gpu"))
                .filter_map(|(_, q)| quantity::parse_milli(q))
                .sum()
        })
        .unwrap_or(0);
    if gpus > 0 {
        params
            .entry("num-gpus".to_string())
            .or_insert_with(|| ((gpus + 999) / 1000).to_string());
    }
    params
}

fn build_pod(
    cluster: &RayCluster,
    template: &PodTemplateSpec,
    node_type: RayNodeType,
    group: &str,
    ray_start_params: &BTreeMap<String, String>,
) -> Result<Pod> {
    let config_error = |message: &str| {
        let target = if node_type == RayNodeType::Head {
            labels::HEAD_GROUP
        } else {
            group
        };
        OperatorError::group_config(target, message)
    };

    let cluster_name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| OperatorError::InvalidState("raycluster has no namespace".to_string()))?;
    let mut spec: PodSpec = template
        .spec
        .clone()
        .ok_or_else(|| config_error("pod template has no spec"))?;

    let head = node_type == RayNodeType::Head;
    let head_address = head_service_fqdn(&cluster_name, &namespace);
    let container = spec
        .containers
        .first_mut()
        .ok_or_else(|| config_error("pod template has no containers"))?;

    let params = effective_start_params(ray_start_params, container, head, &head_address);
    let start = ray_start_command(head, &params);

    let env = container.env.get_or_insert_with(Vec::new);
    env.push(EnvVar {
        name: RAY_START_CMD_ENV.to_string(),
        value: Some(start.clone()),
        ..Default::default()
    });
    env.push(EnvVar {
        name: "RAY_CLUSTER_NAME".to_string(),
        value: Some(cluster_name.clone()),
        ..Default::default()
    });
    if !head {
        env.push(EnvVar {
            name: "FQ_RAY_IP".to_string(),
            value: Some(head_address.clone()),
            ..Default::default()
        });
    }
    if container.command.is_none() {
        container.command = Some(vec!["/bin/bash".to_string(), "-lc".to_string(), "--".to_string()]);
        container.args = Some(vec![format!("ulimit -n 65536; {}", start)]);
    }

    if head && cluster.spec.autoscaling_enabled() {
        spec.containers.push(build_autoscaler_container(cluster));
    }

    let template_meta = template.metadata.clone().unwrap_or_default();
    let generate_name = if head {
        format!("{}-head-", cluster_name)
    } else {
        format!("{}-worker-{}-", cluster_name, group)
    };

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(generate_name),
            namespace: Some(namespace),
            labels: Some(labels::pod_labels(
                &cluster_name,
                node_type,
                group,
                template_meta.labels.as_ref(),
            )),
            annotations: template_meta.annotations,
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    })
}

pub fn build_head_pod(cluster: &RayCluster) -> Result<Pod> {
    let head = &cluster.spec.head_group_spec;
    build_pod(
        cluster,
        &head.template,
        RayNodeType::Head,
        labels::HEAD_GROUP,
        &head.ray_start_params,
    )
}

pub fn build_worker_pod(cluster: &RayCluster, group: &WorkerGroupSpec) -> Result<Pod> {
    build_pod(
        cluster,
        &group.template,
        RayNodeType::Worker,
        &group.group_name,
        &group.ray_start_params,
    )
}

fn default_head_ports(cluster: &RayCluster) -> Vec<ServicePort> {
    let declared: Vec<ContainerPort> = cluster
        .spec
        .head_group_spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.clone())
        .unwrap_or_default();

    let named: Vec<ServicePort> = declared
        .into_iter()
        .filter_map(|p| {
            p.name.map(|name| ServicePort {
                name: Some(name),
                port: p.container_port,
                protocol: p.protocol,
                ..Default::default()
            })
        })
        .collect();
    if !named.is_empty() {
        return named;
    }

    [("gcs", GCS_PORT), ("dashboard", DASHBOARD_PORT), ("client", CLIENT_PORT)]
        .into_iter()
        .map(|(name, port)| ServicePort {
            name: Some(name.to_string()),
            port,
            ..Default::default()
        })
        .collect()
}

/// Service fronting the head pod.
pub fn build_head_service(cluster: &RayCluster) -> Service {
    let cluster_name = cluster.name_any();
    let head = &cluster.spec.head_group_spec;
    let base = head.head_service.clone().unwrap_or_default();

    let mut service_labels = base.metadata.labels.clone().unwrap_or_default();
    service_labels.insert(labels::CLUSTER.to_string(), cluster_name.clone());
    service_labels.insert(
        labels::NODE_TYPE.to_string(),
        RayNodeType::Head.as_label().to_string(),
    );
    service_labels.insert(
        labels::CREATED_BY.to_string(),
        crate::config::OPERATOR_NAME.to_string(),
    );

    let mut annotations = base.metadata.annotations.clone().unwrap_or_default();
    annotations.extend(cluster.spec.head_service_annotations.clone());

    let selector: BTreeMap<String, String> = [
        (labels::CLUSTER.to_string(), cluster_name.clone()),
        (
            labels::NODE_TYPE.to_string(),
            RayNodeType::Head.as_label().to_string(),
        ),
    ]
    .into_iter()
    .collect();

    let mut spec = base.spec.clone().unwrap_or_default();
    if spec.ports.as_ref().map_or(true, Vec::is_empty) {
        spec.ports = Some(default_head_ports(cluster));
    }
    spec.selector = Some(selector);
    spec.type_ = head
        .service_type
        .clone()
        .or(spec.type_.take())
        .or_else(|| Some("ClusterIP".to_string()));

    Service {
        metadata: ObjectMeta {
            name: Some(
                base.metadata
                    .name
                    .clone()
                    .unwrap_or_else(|| head_service_name(&cluster_name)),
            ),
            namespace: cluster.namespace(),
            labels: Some(service_labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}
