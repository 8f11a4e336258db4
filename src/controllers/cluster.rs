//! RayCluster Controller
//!
//! Runs one reconciliation pass per trigger: collect what exists, decide
//! suspension, resolve the head topology, scale worker groups, execute the
//! resulting actions concurrently, write back the clamped spec and finally
//! replace the status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::EventType;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::{ReconcilerConfig, OPERATOR_NAME};
use crate::controllers::error_policy_backoff;
use crate::controllers::observed;
use crate::controllers::plan::{ActionOutcome, PlannedAction, ScalingAction, TopologyAction};
use crate::controllers::resolver;
use crate::controllers::scaling;
use crate::controllers::status::{self, AggregateInput};
use crate::controllers::suspend::{self, SuspendPhase};
use crate::crd::{RayCluster, RayClusterSpec, RayClusterStatus};
use crate::error::{OperatorError, Result};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::platform::{ClusterPlatform, KubePlatform};

/// What one pass did
#[derive(Debug, Clone)]
pub struct PassReport {
    pub suspend: SuspendPhase,
    pub outcomes: Vec<ActionOutcome>,
    pub status: RayClusterStatus,
    pub status_written: bool,
    pub requeue_after: Duration,
}

/// Shared context for reconciliation passes
pub struct ClusterReconciler {
    platform: Arc<dyn ClusterPlatform>,
    events: Arc<dyn EventPublisher>,
    config: ReconcilerConfig,
}

impl ClusterReconciler {
    pub fn new(
        platform: Arc<dyn ClusterPlatform>,
        events: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            platform,
            events,
            config,
        }
    }

    /// Reconcile a RayCluster
    pub async fn reconcile(&self, cluster: Arc<RayCluster>) -> Result<Action> {
        if cluster.metadata.deletion_timestamp.is_some() {
            info!(
                cluster = %cluster.name_any(),
                namespace = ?cluster.namespace(),
                "RayCluster is being deleted, owned pods and services are garbage collected"
            );
            return Ok(Action::await_change());
        }

        let report = self.run_pass(&cluster).await?;
        Ok(Action::requeue(report.requeue_after))
    }

    /// One full pass against the cluster as given.
    pub async fn run_pass(&self, cluster: &RayCluster) -> Result<PassReport> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| OperatorError::InvalidState(format!("raycluster {} has no namespace", name)))?;

        info!(cluster = %name, namespace = %namespace, generation = ?cluster.metadata.generation, "Reconciling RayCluster");

        let observed = observed::collect(self.platform.as_ref(), &namespace, &name).await?;

        let previous_phase = suspend::previous_phase(cluster.status.as_ref());
        let decision = suspend::evaluate(previous_phase, cluster.spec.is_suspended(), &observed);
        if decision.is_transition(previous_phase) {
            info!(
                cluster = %name,
                namespace = %namespace,
                from = ?previous_phase,
                to = ?decision.phase,
                "{}",
                decision.reason
            );
            let reason = match decision.phase {
                SuspendPhase::Suspending => Some(reasons::SUSPENDING),
                SuspendPhase::Suspended => Some(reasons::SUSPENDED),
                SuspendPhase::Resuming => Some(reasons::RESUMING),
                SuspendPhase::Active => None,
            };
            if let Some(reason) = reason {
                self.publish(cluster, EventType::Normal, reason, actions::RECONCILE, Some(decision.reason.clone()))
                    .await;
            }
        }

        let (planned, scaling_plan, issues) = if decision.phase.bypasses_scaling() {
            (decision.actions.clone(), None, Vec::new())
        } else {
            let topology = resolver::resolve(&cluster.spec, &observed);
            let plan = scaling::reconcile(&cluster.spec, &observed);
            let mut planned = topology.actions;
            planned.extend(plan.actions.iter().cloned().map(PlannedAction::Scaling));
            let mut issues = topology.issues;
            issues.extend(plan.issues.iter().cloned());
            (planned, Some(plan), issues)
        };

        for issue in &issues {
            warn!(cluster = %name, namespace = %namespace, group = %issue.group, "{}", issue.message);
            self.publish(
                cluster,
                EventType::Warning,
                reasons::RAY_CONFIG_ERROR,
                actions::RECONCILE,
                Some(issue.to_string()),
            )
            .await;
        }

        let outcomes = self.execute(cluster, &namespace, &planned).await;

        let mut base = cluster.clone();
        let mut spec_write_failed = false;
        if let Some(plan) = &scaling_plan {
            if plan.spec_changed(&cluster.spec) {
                match self.write_back_spec(cluster, &namespace, &plan.clamped_spec).await {
                    Ok(updated) => {
                        debug!(cluster = %name, namespace = %namespace, "Wrote back clamped spec");
                        base = updated;
                    }
                    Err(e) => {
                        warn!(cluster = %name, namespace = %namespace, error = %e, "Spec write-back failed, retrying next pass");
                        spec_write_failed = true;
                    }
                }
            }
        }

        let spec_for_status: &RayClusterSpec = scaling_plan
            .as_ref()
            .map(|p| &p.clamped_spec)
            .unwrap_or(&cluster.spec);
        let input = AggregateInput {
            spec: spec_for_status,
            generation: base.metadata.generation,
            observed: &observed,
            suspend: decision.phase,
            scaling: scaling_plan.as_ref(),
            issues: &issues,
            outcomes: &outcomes,
            previous: cluster.status.as_ref(),
            now: Utc::now(),
        };
        let next_status = status::aggregate(&input, &self.config);
        let status_written = self.write_status(cluster, base, &namespace, &next_status).await?;

        let converged = scaling_plan.as_ref().map_or(true, |p| p.is_converged());
        let settled = planned.is_empty()
            && converged
            && !spec_write_failed
            && outcomes.iter().all(ActionOutcome::succeeded)
            && decision.phase != SuspendPhase::Suspending;
        let requeue_after = if settled {
            self.config.resync_interval
        } else {
            self.config.converge_interval
        };

        info!(
            cluster = %name,
            namespace = %namespace,
            state = ?next_status.state,
            actions = planned.len(),
            failed = outcomes.iter().filter(|o| !o.succeeded()).count(),
            requeue_secs = requeue_after.as_secs(),
            "Reconciled RayCluster"
        );

        Ok(PassReport {
            suspend: decision.phase,
            outcomes,
            status: next_status,
            status_written,
            requeue_after,
        })
    }

    /// Execute every action concurrently; one failure never stops the rest.
    async fn execute(
        &self,
        cluster: &RayCluster,
        namespace: &str,
        planned: &[PlannedAction],
    ) -> Vec<ActionOutcome> {
        let outcomes = join_all(planned.iter().map(|action| async move {
            let result = self.apply(cluster, namespace, action).await;
            ActionOutcome {
                action: action.clone(),
                error: result.err().map(|e| e.to_string()),
            }
        }))
        .await;

        for outcome in &outcomes {
            match &outcome.error {
                None => {
                    let (reason, action) = match &outcome.action {
                        PlannedAction::Topology(TopologyAction::CreateHeadPod) => {
                            (reasons::CREATED_HEAD_POD, actions::CREATE_POD)
                        }
                        PlannedAction::Topology(TopologyAction::DeleteHeadPod { .. }) => {
                            (reasons::DELETED_HEAD_POD, actions::DELETE_POD)
                        }
                        PlannedAction::Topology(TopologyAction::CreateHeadService) => {
                            (reasons::CREATED_SERVICE, actions::CREATE_SERVICE)
                        }
                        PlannedAction::Scaling(ScalingAction::CreatePod { .. }) => {
                            (reasons::CREATED_WORKER_POD, actions::CREATE_POD)
                        }
                        PlannedAction::Scaling(ScalingAction::DeletePod { .. }) => {
                            (reasons::DELETED_WORKER_POD, actions::DELETE_POD)
                        }
                    };
                    self.publish(cluster, EventType::Normal, reason, action, Some(outcome.action.to_string()))
                        .await;
                }
                Some(e) => {
                    warn!(
                        cluster = %cluster.name_any(),
                        namespace = %namespace,
                        action = %outcome.action,
                        error = %e,
                        "Action failed, retrying next pass"
                    );
                    self.publish(
                        cluster,
                        EventType::Warning,
                        reasons::POD_RECONCILIATION_ERROR,
                        actions::RECONCILE,
                        Some(format!("{}: {}", outcome.action, e)),
                    )
                    .await;
                }
            }
        }
        outcomes
    }

    async fn apply(&self, cluster: &RayCluster, namespace: &str, action: &PlannedAction) -> Result<()> {
        match action {
            PlannedAction::Topology(TopologyAction::CreateHeadPod) => {
                let pod = resolver::build_head_pod(cluster)?;
                self.platform.create_pod(namespace, &pod).await
            }
            PlannedAction::Topology(TopologyAction::DeleteHeadPod { pod }) => {
                self.platform.delete_pod(namespace, pod).await
            }
            PlannedAction::Topology(TopologyAction::CreateHeadService) => {
                let service = resolver::build_head_service(cluster);
                self.platform.create_service(namespace, &service).await
            }
            PlannedAction::Scaling(ScalingAction::CreatePod { group }) => {
                let spec = cluster.spec.worker_group(group).ok_or_else(|| {
                    OperatorError::group_config(group, "worker group missing from spec")
                })?;
                let pod = resolver::build_worker_pod(cluster, spec)?;
                self.platform.create_pod(namespace, &pod).await
            }
            PlannedAction::Scaling(ScalingAction::DeletePod { pod, .. }) => {
                self.platform.delete_pod(namespace, pod).await
            }
        }
    }

    async fn write_back_spec(
        &self,
        cluster: &RayCluster,
        namespace: &str,
        spec: &RayClusterSpec,
    ) -> Result<RayCluster> {
        let mut updated = cluster.clone();
        updated.spec = spec.clone();
        self.platform.replace_cluster(namespace, &updated).await
    }

    /// Replace the status, re-reading on conflict. Returns whether a write happened.
    async fn write_status(
        &self,
        cluster: &RayCluster,
        base: RayCluster,
        namespace: &str,
        next: &RayClusterStatus,
    ) -> Result<bool> {
        let name = cluster.name_any();
        let mut target = base;
        let mut last_error = None;

        for attempt in 1..=self.config.status_write_retries.max(1) {
            if !status::should_write(target.status.as_ref(), next) {
                debug!(cluster = %name, namespace = %namespace, "Status unchanged or stale, skipping write");
                return Ok(false);
            }

            let mut desired = target.clone();
            desired.status = Some(next.clone());
            match self.platform.replace_status(namespace, &desired).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => {
                    debug!(cluster = %name, namespace = %namespace, attempt, "Status write conflict, re-reading");
                    let fresh = self.platform.get_cluster(namespace, &name).await?;
                    if fresh.metadata.generation != target.metadata.generation {
                        info!(
                            cluster = %name,
                            namespace = %namespace,
                            "Newer spec generation arrived, abandoning status write"
                        );
                        return Ok(false);
                    }
                    target = fresh;
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(cluster = %name, namespace = %namespace, attempt, error = %e, "Status write failed");
                    last_error = Some(e);
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        error!(cluster = %name, namespace = %namespace, error = %message, "Giving up on status write");
        self.publish(
            cluster,
            EventType::Warning,
            reasons::STATUS_UPDATE_FAILED,
            actions::UPDATE_STATUS,
            Some(message.clone()),
        )
        .await;
        Err(OperatorError::Reconciliation(format!(
            "status of raycluster {}/{} not written: {}",
            namespace, name, message
        )))
    }

    async fn publish(
        &self,
        cluster: &RayCluster,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events
            .publish(&cluster.object_ref(&()), type_, reason, action, note)
            .await;
    }
}

/// Watches RayClusters and the pods and services they own
pub struct RayClusterController {
    client: Client,
    config: ReconcilerConfig,
    namespace: Option<String>,
}

impl RayClusterController {
    /// `namespace` limits the watch; `None` watches every namespace.
    pub fn new(client: Client, config: ReconcilerConfig, namespace: Option<String>) -> Self {
        Self {
            client,
            config,
            namespace,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run the controller until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let clusters: Api<RayCluster> = self.api();
        let pods: Api<Pod> = self.api();
        let services: Api<Service> = self.api();

        let context = Arc::new(ClusterReconciler::new(
            Arc::new(KubePlatform::new(self.client.clone(), self.config.api_timeout)),
            Arc::new(KubeEventPublisher::new(self.client.clone(), OPERATOR_NAME)),
            self.config.clone(),
        ));

        info!(namespace = ?self.namespace, "Starting RayCluster controller");

        Controller::new(clusters, Config::default())
            .owns(pods, Config::default())
            .owns(services, Config::default())
            .shutdown_on_signal()
            .run(
                |cluster, ctx| async move { ctx.reconcile(cluster).await },
                error_policy_backoff,
                context,
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!(cluster = %obj.name, namespace = ?obj.namespace, "Reconciled cluster");
                    }
                    Err(e) => {
                        warn!(error = %e, "Reconciliation failed");
                    }
                }
            })
            .await;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conditions::CLUSTER_CONDITION_REPLICA_FAILURE;
    use crate::controllers::autoscaling::{AutoscalerClient, ScaleRequest};
    use crate::crd::{ClusterState, WorkerGroupSpec};
    use crate::events::RecordingEventPublisher;
    use crate::labels;
    use async_trait::async_trait;
    use chrono::DateTime;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    pub(crate) fn sample_cluster() -> RayCluster {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "ray.io/v1alpha1",
            "kind": "RayCluster",
            "metadata": {
                "name": "demo",
                "namespace": "default",
                "uid": "6b1f1f9e-0000-4000-8000-000000000001",
                "generation": 1,
                "resourceVersion": "1"
            },
            "spec": {
                "rayVersion": "2.9.0",
                "headGroupSpec": {
                    "rayStartParams": {},
                    "template": {"spec": {"containers": [{
                        "name": "ray-head",
                        "image": "rayproject/ray:2.9.0",
                        "resources": {"requests": {"cpu": "1", "memory": "2Gi"}}
                    }]}}
                },
                "workerGroupSpecs": [{
                    "groupName": "cpu",
                    "replicas": 2,
                    "minReplicas": 1,
                    "maxReplicas": 5,
                    "rayStartParams": {},
                    "template": {"spec": {"containers": [{
                        "name": "ray-worker",
                        "image": "rayproject/ray:2.9.0",
                        "resources": {"requests": {"cpu": "1", "memory": "1Gi"}}
                    }]}}
                }]
            }
        }))
        .unwrap()
    }

    #[derive(Default)]
    struct PlatformState {
        cluster: Option<RayCluster>,
        pods: Vec<Pod>,
        services: Vec<Service>,
        next_id: i64,
        resource_version: u64,
        failing_groups: BTreeSet<String>,
        cluster_replace_conflicts: u32,
        cluster_replace_attempts: u32,
        status_conflicts: u32,
        status_writes: u32,
    }

    impl PlatformState {
        fn bump(&mut self) -> String {
            self.resource_version += 1;
            self.resource_version.to_string()
        }

        fn stored_version(&self) -> Option<String> {
            self.cluster.as_ref().and_then(|c| c.resource_version())
        }
    }

    /// Platform that keeps objects in memory; created pods start Running and Ready.
    #[derive(Default)]
    pub(crate) struct InMemoryPlatform {
        state: Mutex<PlatformState>,
    }

    impl InMemoryPlatform {
        pub(crate) fn with_cluster(cluster: RayCluster) -> Self {
            let platform = Self::default();
            platform.set_cluster(cluster);
            platform
        }

        fn set_cluster(&self, mut cluster: RayCluster) {
            let mut state = self.state.lock().unwrap();
            cluster.metadata.resource_version = Some(state.bump());
            state.cluster = Some(cluster);
        }

        /// Edit the stored spec as a user would; bumps the generation.
        pub(crate) fn edit_spec(&self, edit: impl FnOnce(&mut RayClusterSpec)) {
            let mut cluster = self.stored();
            edit(&mut cluster.spec);
            cluster.metadata.generation = cluster.metadata.generation.map(|g| g + 1);
            self.set_cluster(cluster);
        }

        pub(crate) fn stored(&self) -> RayCluster {
            self.state.lock().unwrap().cluster.clone().unwrap()
        }

        pub(crate) fn fail_next_cluster_replaces(&self, n: u32) {
            self.state.lock().unwrap().cluster_replace_conflicts = n;
        }

        pub(crate) fn cluster_replace_attempts(&self) -> u32 {
            self.state.lock().unwrap().cluster_replace_attempts
        }

        pub(crate) fn fail_next_status_writes(&self, n: u32) {
            self.state.lock().unwrap().status_conflicts = n;
        }

        pub(crate) fn status_writes(&self) -> u32 {
            self.state.lock().unwrap().status_writes
        }

        /// Move a pod to a new phase, as the kubelet would on eviction or exit.
        pub(crate) fn set_pod_phase(&self, name: &str, phase: &str) {
            let mut state = self.state.lock().unwrap();
            for pod in state.pods.iter_mut().filter(|p| p.name_any() == name) {
                let status = pod.status.get_or_insert_with(PodStatus::default);
                status.phase = Some(phase.to_string());
                status.conditions = None;
            }
        }

        pub(crate) fn fail_creates_in_group(&self, group: &str) {
            self.state.lock().unwrap().failing_groups.insert(group.to_string());
        }

        fn pods_where(&self, node_type: &str, group: Option<&str>) -> Vec<String> {
            self.state
                .lock()
                .unwrap()
                .pods
                .iter()
                .filter(|p| p.labels().get(labels::NODE_TYPE).map(String::as_str) == Some(node_type))
                .filter(|p| group.map_or(true, |g| p.labels().get(labels::GROUP).map(String::as_str) == Some(g)))
                .map(|p| p.name_any())
                .collect()
        }

        /// Worker pod names in creation order.
        pub(crate) fn workers(&self, group: &str) -> Vec<String> {
            self.pods_where("worker", Some(group))
        }

        pub(crate) fn heads(&self) -> Vec<String> {
            self.pods_where("head", None)
        }

        pub(crate) fn service_count(&self) -> usize {
            self.state.lock().unwrap().services.len()
        }
    }

    fn in_cluster<K: Resource>(obj: &K, cluster: &str) -> bool {
        obj.meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::CLUSTER))
            .map(String::as_str)
            == Some(cluster)
    }

    #[async_trait]
    impl ClusterPlatform for InMemoryPlatform {
        async fn list_pods(&self, _namespace: &str, cluster: &str) -> Result<Vec<Pod>> {
            let state = self.state.lock().unwrap();
            Ok(state.pods.iter().filter(|p| in_cluster(*p, cluster)).cloned().collect())
        }

        async fn list_services(&self, _namespace: &str, cluster: &str) -> Result<Vec<Service>> {
            let state = self.state.lock().unwrap();
            Ok(state.services.iter().filter(|s| in_cluster(*s, cluster)).cloned().collect())
        }

        async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let group = pod.labels().get(labels::GROUP).cloned().unwrap_or_default();
            if state.failing_groups.contains(&group) {
                return Err(OperatorError::KubeApi("exceeded quota: pods".to_string()));
            }
            state.next_id += 1;
            let id = state.next_id;
            let created = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
                + chrono::Duration::seconds(id);

            let mut pod = pod.clone();
            pod.metadata.name = Some(format!(
                "{}{:05}",
                pod.metadata.generate_name.clone().unwrap_or_default(),
                id
            ));
            pod.metadata.creation_timestamp = Some(Time(created));
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some(format!("10.1.0.{}", id)),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
            state.pods.push(pod);
            Ok(())
        }

        async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .pods
                .retain(|p| p.metadata.name.as_deref() != Some(name));
            Ok(())
        }

        async fn create_service(&self, _namespace: &str, service: &Service) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.services.iter().any(|s| s.metadata.name == service.metadata.name) {
                return Ok(());
            }
            let mut service = service.clone();
            let spec = service.spec.get_or_insert_with(ServiceSpec::default);
            spec.cluster_ip = Some("10.96.0.10".to_string());
            state.services.push(service);
            Ok(())
        }

        async fn get_cluster(&self, _namespace: &str, name: &str) -> Result<RayCluster> {
            self.state
                .lock()
                .unwrap()
                .cluster
                .clone()
                .ok_or_else(|| OperatorError::NotFound(name.to_string()))
        }

        async fn replace_cluster(&self, _namespace: &str, cluster: &RayCluster) -> Result<RayCluster> {
            let mut state = self.state.lock().unwrap();
            state.cluster_replace_attempts += 1;
            if state.cluster_replace_conflicts > 0 {
                state.cluster_replace_conflicts -= 1;
                let version = state.bump();
                if let Some(stored) = state.cluster.as_mut() {
                    stored.metadata.resource_version = Some(version);
                }
                return Err(OperatorError::Conflict(cluster.name_any()));
            }
            if cluster.resource_version() != state.stored_version() {
                return Err(OperatorError::Conflict(cluster.name_any()));
            }
            let version = state.bump();
            let stored = state
                .cluster
                .as_mut()
                .ok_or_else(|| OperatorError::NotFound(cluster.name_any()))?;
            if stored.spec != cluster.spec {
                stored.metadata.generation = stored.metadata.generation.map(|g| g + 1);
            }
            stored.spec = cluster.spec.clone();
            stored.metadata.resource_version = Some(version);
            Ok(stored.clone())
        }

        async fn replace_status(&self, _namespace: &str, cluster: &RayCluster) -> Result<RayCluster> {
            let mut state = self.state.lock().unwrap();
            if state.status_conflicts > 0 {
                state.status_conflicts -= 1;
                let version = state.bump();
                if let Some(stored) = state.cluster.as_mut() {
                    stored.metadata.resource_version = Some(version);
                }
                return Err(OperatorError::Conflict(cluster.name_any()));
            }
            if cluster.resource_version() != state.stored_version() {
                return Err(OperatorError::Conflict(cluster.name_any()));
            }
            state.status_writes += 1;
            let version = state.bump();
            let stored = state
                .cluster
                .as_mut()
                .ok_or_else(|| OperatorError::NotFound(cluster.name_any()))?;
            stored.status = cluster.status.clone();
            stored.metadata.resource_version = Some(version);
            Ok(stored.clone())
        }
    }

    struct Harness {
        platform: Arc<InMemoryPlatform>,
        events: Arc<RecordingEventPublisher>,
        reconciler: ClusterReconciler,
    }

    impl Harness {
        fn new(cluster: RayCluster) -> Self {
            let platform = Arc::new(InMemoryPlatform::with_cluster(cluster));
            let events = Arc::new(RecordingEventPublisher::default());
            let reconciler = ClusterReconciler::new(
                platform.clone(),
                events.clone(),
                ReconcilerConfig::default(),
            );
            Self {
                platform,
                events,
                reconciler,
            }
        }

        async fn pass(&self) -> PassReport {
            self.reconciler.run_pass(&self.platform.stored()).await.unwrap()
        }

        async fn converge(&self) -> PassReport {
            let mut report = self.pass().await;
            for _ in 0..5 {
                if report.outcomes.is_empty() && !report.status_written {
                    break;
                }
                report = self.pass().await;
            }
            report
        }
    }

    #[tokio::test]
    async fn test_first_pass_builds_cluster() {
        let harness = Harness::new(sample_cluster());
        let report = harness.pass().await;

        assert_eq!(report.outcomes.len(), 4);
        assert!(report.outcomes.iter().all(ActionOutcome::succeeded));
        assert_eq!(harness.platform.heads().len(), 1);
        assert_eq!(harness.platform.workers("cpu").len(), 2);
        assert_eq!(harness.platform.service_count(), 1);
        assert_eq!(report.requeue_after, Duration::from_secs(2));

        let reasons = harness.events.reasons();
        assert!(reasons.contains(&reasons::CREATED_HEAD_POD.to_string()));
        assert!(reasons.contains(&reasons::CREATED_SERVICE.to_string()));
        assert_eq!(
            reasons.iter().filter(|r| *r == reasons::CREATED_WORKER_POD).count(),
            2
        );

        let stored = harness.platform.stored();
        assert_eq!(stored.status.as_ref().unwrap().observed_generation, Some(1));
    }

    #[tokio::test]
    async fn test_converged_cluster_is_quiet() {
        let harness = Harness::new(sample_cluster());
        harness.converge().await;

        let writes = harness.platform.status_writes();
        let report = harness.pass().await;
        assert!(report.outcomes.is_empty());
        assert!(!report.status_written);
        assert_eq!(harness.platform.status_writes(), writes);
        assert_eq!(report.requeue_after, Duration::from_secs(300));

        let status = harness.platform.stored().status.unwrap();
        assert_eq!(status.state, Some(ClusterState::Ready));
        assert_eq!(status.ready_worker_replicas, 2);
        assert_eq!(status.head.service_ip.as_deref(), Some("10.96.0.10"));
    }

    #[tokio::test]
    async fn test_workers_to_delete_removes_named_pod() {
        let harness = Harness::new(sample_cluster());
        harness.converge().await;
        let workers = harness.platform.workers("cpu");
        let victim = workers[0].clone();

        harness.platform.edit_spec(|spec| {
            let group = spec.worker_group_mut("cpu").unwrap();
            group.replicas = Some(1);
            group.scale_strategy.workers_to_delete = vec![victim.clone()];
        });
        let report = harness.pass().await;

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(harness.platform.workers("cpu"), vec![workers[1].clone()]);
        let stored = harness.platform.stored();
        let group = stored.spec.worker_group("cpu").unwrap();
        assert!(group.scale_strategy.workers_to_delete.is_empty());
        assert_eq!(group.replicas, Some(1));
    }

    #[tokio::test]
    async fn test_out_of_bounds_replicas_clamped_and_written_back() {
        let harness = Harness::new(sample_cluster());
        harness.converge().await;

        harness
            .platform
            .edit_spec(|spec| spec.worker_group_mut("cpu").unwrap().replicas = Some(10));
        let generation = harness.platform.stored().metadata.generation;
        harness.pass().await;

        assert_eq!(harness.platform.workers("cpu").len(), 5);
        let stored = harness.platform.stored();
        assert_eq!(stored.spec.worker_group("cpu").unwrap().replicas, Some(5));
        assert_eq!(stored.metadata.generation, generation.map(|g| g + 1));
        assert_eq!(
            stored.status.unwrap().observed_generation,
            stored.metadata.generation
        );
    }

    #[tokio::test]
    async fn test_conflicting_write_back_retried_next_pass() {
        let harness = Harness::new(sample_cluster());
        harness.converge().await;

        harness
            .platform
            .edit_spec(|spec| spec.worker_group_mut("cpu").unwrap().replicas = Some(10));
        harness.platform.fail_next_cluster_replaces(1);
        let report = harness.pass().await;

        assert!(report.status_written);
        assert_eq!(report.requeue_after, Duration::from_secs(2));
        assert_eq!(harness.platform.workers("cpu").len(), 5);
        assert_eq!(
            harness.platform.stored().spec.worker_group("cpu").unwrap().replicas,
            Some(10)
        );

        harness.pass().await;
        assert_eq!(
            harness.platform.stored().spec.worker_group("cpu").unwrap().replicas,
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_autoscaler_write_after_conflict_is_kept() {
        let harness = Harness::new(sample_cluster());
        harness.converge().await;

        harness
            .platform
            .edit_spec(|spec| spec.worker_group_mut("cpu").unwrap().replicas = Some(10));
        harness.platform.fail_next_cluster_replaces(1);
        harness.pass().await;

        let autoscaler = AutoscalerClient::new(harness.platform.clone());
        autoscaler
            .submit("default", "demo", &[ScaleRequest::replicas("cpu", 4)])
            .await
            .unwrap();
        let report = harness.pass().await;

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(harness.platform.workers("cpu").len(), 4);
        assert_eq!(
            harness.platform.stored().spec.worker_group("cpu").unwrap().replicas,
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_evicted_worker_replaced() {
        let harness = Harness::new(sample_cluster());
        harness.converge().await;
        let workers = harness.platform.workers("cpu");
        harness.platform.set_pod_phase(&workers[0], "Failed");

        let report = harness.pass().await;

        assert_eq!(report.outcomes.len(), 2);
        let remaining = harness.platform.workers("cpu");
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains(&workers[0]));
        assert!(harness
            .events
            .reasons()
            .contains(&reasons::DELETED_WORKER_POD.to_string()));

        let report = harness.converge().await;
        assert_eq!(report.status.state, Some(ClusterState::Ready));
    }

    #[tokio::test]
    async fn test_failed_head_recreated() {
        let harness = Harness::new(sample_cluster());
        harness.converge().await;
        let old_head = harness.platform.heads()[0].clone();
        harness.platform.set_pod_phase(&old_head, "Failed");

        harness.pass().await;

        let heads = harness.platform.heads();
        assert_eq!(heads.len(), 1);
        assert_ne!(heads[0], old_head);
        let report = harness.converge().await;
        assert_eq!(report.status.state, Some(ClusterState::Ready));
    }

    #[tokio::test]
    async fn test_suspend_round_trip_restores_topology() {
        let harness = Harness::new(sample_cluster());
        harness.converge().await;

        harness.platform.edit_spec(|spec| spec.suspend = Some(true));
        let report = harness.pass().await;
        assert_eq!(report.suspend, SuspendPhase::Suspending);
        assert!(harness.platform.heads().is_empty());
        assert!(harness.platform.workers("cpu").is_empty());
        assert_eq!(report.status.state, Some(ClusterState::Suspended));

        let report = harness.pass().await;
        assert_eq!(report.suspend, SuspendPhase::Suspended);
        assert!(report.outcomes.is_empty());
        assert_eq!(report.status.desired_worker_replicas, 0);
        assert_eq!(
            harness.platform.stored().spec.worker_group("cpu").unwrap().replicas,
            Some(2)
        );

        harness.platform.edit_spec(|spec| spec.suspend = Some(false));
        let report = harness.pass().await;
        assert_eq!(report.suspend, SuspendPhase::Resuming);
        assert_eq!(harness.platform.heads().len(), 1);
        assert_eq!(harness.platform.workers("cpu").len(), 2);

        let reasons = harness.events.reasons();
        for expected in [reasons::SUSPENDING, reasons::SUSPENDED, reasons::RESUMING] {
            assert!(reasons.contains(&expected.to_string()), "missing {}", expected);
        }

        let report = harness.pass().await;
        assert_eq!(report.suspend, SuspendPhase::Active);
        assert_eq!(report.status.state, Some(ClusterState::Ready));
    }

    #[tokio::test]
    async fn test_failed_creates_reported_and_other_actions_proceed() {
        let harness = Harness::new(sample_cluster());
        harness.platform.fail_creates_in_group("cpu");
        let report = harness.pass().await;

        assert_eq!(report.outcomes.iter().filter(|o| !o.succeeded()).count(), 2);
        assert_eq!(harness.platform.heads().len(), 1);
        assert_eq!(harness.platform.service_count(), 1);
        assert!(harness
            .events
            .events()
            .iter()
            .any(|e| e.warning && e.reason == reasons::POD_RECONCILIATION_ERROR));

        let failure = report
            .status
            .conditions
            .iter()
            .find(|c| c.r#type == CLUSTER_CONDITION_REPLICA_FAILURE)
            .unwrap();
        assert_eq!(failure.status, "True");
        assert_eq!(report.requeue_after, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_config_error_isolated_to_group() {
        let mut cluster = sample_cluster();
        let mut broken: WorkerGroupSpec = cluster.spec.worker_group_specs[0].clone();
        broken.group_name = "broken".to_string();
        broken.min_replicas = 4;
        broken.max_replicas = 2;
        cluster.spec.worker_group_specs.push(broken);
        let harness = Harness::new(cluster);

        harness.pass().await;

        assert_eq!(harness.platform.workers("cpu").len(), 2);
        assert!(harness.platform.workers("broken").is_empty());
        let config_errors: Vec<_> = harness
            .events
            .events()
            .into_iter()
            .filter(|e| e.reason == reasons::RAY_CONFIG_ERROR)
            .collect();
        assert_eq!(config_errors.len(), 1);
        assert!(config_errors[0].note.as_deref().unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn test_status_conflict_is_retried() {
        let harness = Harness::new(sample_cluster());
        harness.platform.fail_next_status_writes(1);
        let report = harness.pass().await;

        assert!(report.status_written);
        assert_eq!(harness.platform.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_status_write_gives_up_after_retries() {
        let harness = Harness::new(sample_cluster());
        harness.platform.fail_next_status_writes(10);
        let result = harness.reconciler.run_pass(&harness.platform.stored()).await;

        assert!(matches!(result, Err(OperatorError::Reconciliation(_))));
        assert!(harness
            .events
            .reasons()
            .contains(&reasons::STATUS_UPDATE_FAILED.to_string()));
    }

    #[tokio::test]
    async fn test_fresher_status_is_not_overwritten() {
        let mut cluster = sample_cluster();
        cluster.status = Some(RayClusterStatus {
            observed_generation: Some(7),
            ..Default::default()
        });
        let harness = Harness::new(cluster);
        let report = harness.pass().await;

        assert!(!report.status_written);
        assert_eq!(harness.platform.status_writes(), 0);
    }

    #[tokio::test]
    async fn test_deleted_cluster_awaits_change() {
        let mut cluster = sample_cluster();
        cluster.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let harness = Harness::new(cluster.clone());

        let action = harness.reconciler.reconcile(Arc::new(cluster)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(harness.platform.heads().is_empty());
    }
}
