//! Observed-state collection
//!
//! Reads the pods and services labelled as belonging to one RayCluster and
//! folds them into an [`ObservedSnapshot`]. A snapshot lives for one pass
//! and is discarded afterwards.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::crd::RayNodeType;
use crate::error::Result;
use crate::labels;
use crate::platform::ClusterPlatform;

/// Lifecycle phase reported by the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// What the reconciler needs to know about one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub node_type: RayNodeType,
    pub group: String,
    pub phase: PodPhase,
    pub ready: bool,
    pub crash_looping: bool,
    pub created: Option<DateTime<Utc>>,
    pub pod_ip: Option<String>,
}

impl PodRecord {
    /// Build a record from a pod; `None` when it carries no usable node-type label.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let pod_labels = pod.labels();
        let node_type = pod_labels
            .get(labels::NODE_TYPE)
            .and_then(|v| RayNodeType::from_label(v))?;
        let group = pod_labels.get(labels::GROUP).cloned().unwrap_or_default();

        let status = pod.status.as_ref();
        let phase = PodPhase::parse(status.and_then(|s| s.phase.as_deref()));
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            });
        let crash_looping = status
            .and_then(|s| s.container_statuses.as_ref())
            .is_some_and(|statuses| {
                statuses.iter().any(|cs| {
                    cs.state
                        .as_ref()
                        .and_then(|st| st.waiting.as_ref())
                        .and_then(|w| w.reason.as_deref())
                        == Some("CrashLoopBackOff")
                })
            });

        Some(PodRecord {
            name,
            node_type,
            group,
            phase,
            ready,
            crash_looping,
            created: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
            pod_ip: status.and_then(|s| s.pod_ip.clone()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }

    /// Failed or Succeeded: the kubelet never restarts it, so it only takes up a slot.
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, PodPhase::Failed | PodPhase::Succeeded)
    }

    /// Running and passing its readiness probe.
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.ready
    }
}

/// What the reconciler needs to know about one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub node_type: Option<RayNodeType>,
    pub cluster_ip: Option<String>,
    pub ports: BTreeMap<String, i32>,
}

impl ServiceRecord {
    pub fn from_service(service: &Service) -> Option<Self> {
        let name = service.metadata.name.clone()?;
        let node_type = service
            .labels()
            .get(labels::NODE_TYPE)
            .and_then(|v| RayNodeType::from_label(v));
        let spec = service.spec.as_ref();
        let cluster_ip = spec
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None");
        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|p| p.name.clone().map(|n| (n, p.port)))
                    .collect()
            })
            .unwrap_or_default();
        Some(ServiceRecord {
            name,
            node_type,
            cluster_ip,
            ports,
        })
    }
}

/// One pass's read of reality for a single cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedSnapshot {
    /// Live head pods, oldest first (normally zero or one)
    pub head_pods: Vec<PodRecord>,
    /// Live worker pods keyed by their group label, oldest first
    pub worker_pods_by_group: BTreeMap<String, Vec<PodRecord>>,
    pub services: Vec<ServiceRecord>,
    /// Heads and workers that ran to completion or failed; not counted as live
    pub finished: Vec<PodRecord>,
    /// Pods already being deleted; excluded from every other view
    pub terminating: usize,
}

impl ObservedSnapshot {
    pub fn from_resources(pods: &[Pod], services: &[Service]) -> Self {
        let mut snapshot = ObservedSnapshot::default();
        let mut seen = BTreeSet::new();

        for pod in pods {
            if pod.metadata.deletion_timestamp.is_some() {
                snapshot.terminating += 1;
                continue;
            }
            let Some(record) = PodRecord::from_pod(pod) else {
                continue;
            };
            if !seen.insert(record.name.clone()) {
                warn!(pod = %record.name, "Duplicate pod identity in observation, ignoring copy");
                continue;
            }
            if record.is_finished() {
                snapshot.finished.push(record);
                continue;
            }
            match record.node_type {
                RayNodeType::Head => snapshot.head_pods.push(record),
                RayNodeType::Worker => snapshot
                    .worker_pods_by_group
                    .entry(record.group.clone())
                    .or_default()
                    .push(record),
                RayNodeType::RedisCleanup => {}
            }
        }

        snapshot.head_pods.sort_by(creation_order);
        snapshot.finished.sort_by(creation_order);
        for workers in snapshot.worker_pods_by_group.values_mut() {
            workers.sort_by(creation_order);
        }
        snapshot.services = services
            .iter()
            .filter_map(ServiceRecord::from_service)
            .collect();
        snapshot
    }

    /// The head pod the cluster treats as authoritative (the oldest one).
    pub fn head_pod(&self) -> Option<&PodRecord> {
        self.head_pods.first()
    }

    pub fn workers(&self, group: &str) -> &[PodRecord] {
        self.worker_pods_by_group
            .get(group)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn worker_count(&self, group: &str) -> usize {
        self.workers(group).len()
    }

    /// Locate a worker by pod name across all groups.
    pub fn find_worker(&self, name: &str) -> Option<&PodRecord> {
        self.worker_pods_by_group
            .values()
            .flat_map(|pods| pods.iter())
            .find(|p| p.name == name)
    }

    pub fn all_workers(&self) -> impl Iterator<Item = &PodRecord> {
        self.worker_pods_by_group.values().flat_map(|pods| pods.iter())
    }

    /// Every pod that still exists, finished and terminating ones included.
    pub fn total_pods(&self) -> usize {
        self.head_pods.len()
            + self.worker_pods_by_group.values().map(Vec::len).sum::<usize>()
            + self.finished.len()
            + self.terminating
    }

    pub fn head_service(&self) -> Option<&ServiceRecord> {
        self.services
            .iter()
            .find(|s| s.node_type == Some(RayNodeType::Head))
    }
}

/// Oldest first; pods without a timestamp sort as newest, names break ties.
fn creation_order(a: &PodRecord, b: &PodRecord) -> std::cmp::Ordering {
    match (a.created, b.created) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    }
}

/// Read the cluster's pods and services from the platform.
pub async fn collect(
    platform: &dyn ClusterPlatform,
    namespace: &str,
    cluster: &str,
) -> Result<ObservedSnapshot> {
    let pods = platform.list_pods(namespace, cluster).await?;
    let services = platform.list_services(namespace, cluster).await?;
    Ok(ObservedSnapshot::from_resources(&pods, &services))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus,
        ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    pub(crate) fn worker_pod(name: &str, group: &str, age_secs: i64) -> Pod {
        labelled_pod(name, RayNodeType::Worker, group, age_secs, "Running", true)
    }

    pub(crate) fn labelled_pod(
        name: &str,
        node_type: RayNodeType,
        group: &str,
        age_secs: i64,
        phase: &str,
        ready: bool,
    ) -> Pod {
        let created = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            - chrono::Duration::seconds(age_secs);
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels::pod_labels("demo", node_type, group, None)),
                creation_timestamp: Some(Time(created)),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some("10.1.0.7".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_groups_and_orders_workers() {
        let pods = vec![
            worker_pod("w-young", "cpu", 10),
            worker_pod("w-old", "cpu", 500),
            worker_pod("g-1", "gpu", 100),
            labelled_pod("head", RayNodeType::Head, labels::HEAD_GROUP, 900, "Running", true),
        ];
        let snapshot = ObservedSnapshot::from_resources(&pods, &[]);

        assert_eq!(snapshot.head_pod().unwrap().name, "head");
        assert_eq!(snapshot.worker_count("cpu"), 2);
        assert_eq!(snapshot.workers("cpu")[0].name, "w-old");
        assert_eq!(snapshot.workers("cpu")[1].name, "w-young");
        assert_eq!(snapshot.worker_count("gpu"), 1);
        assert_eq!(snapshot.worker_count("missing"), 0);
        assert_eq!(snapshot.total_pods(), 4);
    }

    #[test]
    fn test_snapshot_skips_terminating_and_duplicates() {
        let mut terminating = worker_pod("w-gone", "cpu", 50);
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let pods = vec![
            worker_pod("w-1", "cpu", 20),
            worker_pod("w-1", "cpu", 20),
            terminating,
        ];
        let snapshot = ObservedSnapshot::from_resources(&pods, &[]);

        assert_eq!(snapshot.worker_count("cpu"), 1);
        assert_eq!(snapshot.terminating, 1);
        assert!(snapshot.find_worker("w-gone").is_none());
        assert_eq!(snapshot.total_pods(), 2);
    }

    #[test]
    fn test_finished_pods_are_not_live() {
        let pods = vec![
            labelled_pod("head-dead", RayNodeType::Head, labels::HEAD_GROUP, 900, "Failed", false),
            worker_pod("w-ok", "cpu", 50),
            labelled_pod("w-evicted", RayNodeType::Worker, "cpu", 60, "Failed", false),
            labelled_pod("w-done", RayNodeType::Worker, "cpu", 70, "Succeeded", false),
        ];
        let snapshot = ObservedSnapshot::from_resources(&pods, &[]);

        assert!(snapshot.head_pod().is_none());
        assert_eq!(snapshot.worker_count("cpu"), 1);
        assert!(snapshot.find_worker("w-evicted").is_none());
        let finished: Vec<_> = snapshot.finished.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(finished, vec!["head-dead", "w-done", "w-evicted"]);
        assert_eq!(snapshot.total_pods(), 4);
    }

    #[test]
    fn test_pod_record_flags() {
        let mut pod = labelled_pod("head", RayNodeType::Head, "headgroup", 5, "Running", false);
        if let Some(status) = pod.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "ray-head".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("CrashLoopBackOff".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
        let record = PodRecord::from_pod(&pod).unwrap();
        assert!(record.is_running());
        assert!(!record.is_ready());
        assert!(record.crash_looping);
    }

    #[test]
    fn test_unlabelled_pods_are_ignored() {
        let mut pod = worker_pod("stray", "cpu", 1);
        pod.metadata.labels = None;
        let snapshot = ObservedSnapshot::from_resources(&[pod], &[]);
        assert_eq!(snapshot.total_pods(), 0);
    }

    #[test]
    fn test_head_service_record() {
        let mut svc_labels = BTreeMap::new();
        svc_labels.insert(labels::NODE_TYPE.to_string(), "head".to_string());
        let service = Service {
            metadata: ObjectMeta {
                name: Some("demo-head-svc".to_string()),
                labels: Some(svc_labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.12".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("gcs".to_string()),
                    port: 6379,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let snapshot = ObservedSnapshot::from_resources(&[], &[service]);
        let head = snapshot.head_service().unwrap();
        assert_eq!(head.cluster_ip.as_deref(), Some("10.96.0.12"));
        assert_eq!(head.ports["gcs"], 6379);
    }
}
