//! Status aggregation
//!
//! Folds one pass's observations and outcomes into a complete
//! [`RayClusterStatus`]. `state` and every condition are rendered from a
//! single [`HealthAssessment`], so the two views cannot disagree.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::{BTreeMap, BTreeSet};

use crate::conditions::{
    build_condition_at, find_condition, set_condition, status_of, ConditionFields,
    CLUSTER_CONDITION_HEAD_POD_HEALTHY, CLUSTER_CONDITION_HEAD_POD_READY,
    CLUSTER_CONDITION_READY, CLUSTER_CONDITION_REPLICA_FAILURE, CLUSTER_CONDITION_SUSPENDED,
    CLUSTER_CONDITION_SUSPENDING, CONDITION_FALSE, CONDITION_UNKNOWN,
};
use crate::config::ReconcilerConfig;
use crate::controllers::observed::{ObservedSnapshot, PodPhase};
use crate::controllers::plan::{ActionOutcome, GroupIssue};
use crate::controllers::scaling::{self, ScalingPlan};
use crate::controllers::suspend::SuspendPhase;
use crate::crd::{ClusterState, HeadInfo, RayClusterSpec, RayClusterStatus, WorkerGroupSpec};
use crate::quantity;

const CONDITION_ORDER: [&str; 6] = [
    CLUSTER_CONDITION_READY,
    CLUSTER_CONDITION_HEAD_POD_READY,
    CLUSTER_CONDITION_HEAD_POD_HEALTHY,
    CLUSTER_CONDITION_REPLICA_FAILURE,
    CLUSTER_CONDITION_SUSPENDING,
    CLUSTER_CONDITION_SUSPENDED,
];

const TPU_RESOURCE: &str = "google.com/tpu";

/// Everything the aggregator reads
pub struct AggregateInput<'a> {
    /// Spec as written back this pass (clamped)
    pub spec: &'a RayClusterSpec,
    pub generation: Option<i64>,
    pub observed: &'a ObservedSnapshot,
    pub suspend: SuspendPhase,
    /// `None` when scaling was bypassed
    pub scaling: Option<&'a ScalingPlan>,
    pub issues: &'a [GroupIssue],
    pub outcomes: &'a [ActionOutcome],
    pub previous: Option<&'a RayClusterStatus>,
    pub now: DateTime<Utc>,
}

/// Single source for `state`, `reason` and the conditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthAssessment {
    pub state: ClusterState,
    pub reason: String,
    pub suspend: SuspendPhase,
    pub head_present: bool,
    pub head_ready: bool,
    pub head_healthy: bool,
    /// When the head was first seen unhealthy, carried across passes
    pub head_failure_onset: Option<DateTime<Utc>>,
    pub replica_failures: Vec<String>,
    pub unconverged_passes: i32,
}

/// Resource totals in milli-units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ResourceTotals {
    cpu: i128,
    memory: i128,
    gpu: i128,
    tpu: i128,
}

impl ResourceTotals {
    fn add_scaled(&mut self, other: ResourceTotals, factor: i128) {
        self.cpu += other.cpu * factor;
        self.memory += other.memory * factor;
        self.gpu += other.gpu * factor;
        self.tpu += other.tpu * factor;
    }
}

fn container_amount(container: &Container, matches: impl Fn(&str) -> bool) -> i128 {
    let Some(resources) = container.resources.as_ref() else {
        return 0;
    };
    let requests = resources.requests.as_ref();
    let limits = resources.limits.as_ref();

    let keys: BTreeSet<&String> = requests
        .into_iter()
        .flat_map(|r| r.keys())
        .chain(limits.into_iter().flat_map(|l| l.keys()))
        .filter(|k| matches(k))
        .collect();

    keys.into_iter()
        .filter_map(|key| {
            requests
                .and_then(|r| r.get(key))
                .or_else(|| limits.and_then(|l| l.get(key)))
        })
        .filter_map(quantity::parse_milli)
        .sum()
}

/// Per-pod request of a template; requests win over limits.
fn template_request(template: &PodTemplateSpec) -> ResourceTotals {
    let containers = template
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[]);
    let mut totals = ResourceTotals::default();
    for c in containers {
        totals.cpu += container_amount(c, |k| k == "cpu");
        totals.memory += container_amount(c, |k| k == "memory");
        totals.gpu += container_amount(c, |k| k.ends_with("gpu"));
        totals.tpu += container_amount(c, |k| k == TPU_RESOURCE);
    }
    totals
}

/// Groups that contribute to totals, paired with their clamped target.
fn counted_groups<'a>(
    spec: &'a RayClusterSpec,
    scaling: Option<&ScalingPlan>,
) -> Vec<(&'a WorkerGroupSpec, i32)> {
    match scaling {
        Some(plan) => plan
            .groups
            .iter()
            .filter_map(|g| spec.worker_group(&g.group).map(|spec_group| (spec_group, g.desired)))
            .collect(),
        None => {
            let mut seen = BTreeSet::new();
            spec.worker_group_specs
                .iter()
                .filter(|g| seen.insert(g.group_name.as_str()))
                .filter(|g| scaling::validate_group(g).is_ok())
                .map(|g| {
                    let desired =
                        scaling::clamp_replicas(g.desired_replicas(), g.min_replicas, g.max_replicas);
                    (g, desired)
                })
                .collect()
        }
    }
}

/// Decide the cluster's health for this pass.
pub fn assess(input: &AggregateInput<'_>, config: &ReconcilerConfig) -> HealthAssessment {
    let previous_conditions: Vec<ConditionFields> = input
        .previous
        .map(|s| s.conditions.iter().map(ConditionFields::from).collect())
        .unwrap_or_default();

    let mut replica_failures: Vec<String> = input.issues.iter().map(ToString::to_string).collect();
    replica_failures.extend(input.outcomes.iter().filter_map(|o| {
        o.error
            .as_ref()
            .map(|e| format!("{} failed: {}", o.action, e))
    }));

    let head = input.observed.head_pod();
    let head_present = head.is_some();
    let head_ready = head.is_some_and(|h| h.is_ready());
    let head_healthy = head.is_some_and(|h| !h.crash_looping && h.phase != PodPhase::Failed);

    if input.suspend.bypasses_scaling() {
        let reason = match input.suspend {
            SuspendPhase::Suspending => "Cluster is suspending",
            _ => "Cluster is suspended",
        };
        return HealthAssessment {
            state: ClusterState::Suspended,
            reason: reason.to_string(),
            suspend: input.suspend,
            head_present,
            head_ready,
            head_healthy,
            head_failure_onset: None,
            replica_failures,
            unconverged_passes: 0,
        };
    }

    let head_failure_onset = if head_healthy {
        None
    } else {
        let carried = find_condition(&previous_conditions, CLUSTER_CONDITION_HEAD_POD_HEALTHY)
            .filter(|c| c.status == CONDITION_FALSE)
            .and_then(ConditionFields::transition_time);
        Some(carried.unwrap_or(input.now))
    };

    let converged = input.scaling.map_or(true, ScalingPlan::is_converged);
    let unconverged_passes = if converged {
        0
    } else {
        input
            .previous
            .map_or(0, |s| s.consecutive_unconverged_passes)
            .saturating_add(1)
    };

    let head_failed_for = head_failure_onset
        .map(|onset| input.now.signed_duration_since(onset))
        .and_then(|d| d.to_std().ok());

    let (state, reason) = match head_failed_for {
        Some(elapsed) if elapsed >= config.head_failure_threshold => (
            ClusterState::Failed,
            format!(
                "Head pod {} for {}s",
                if head_present { "unhealthy" } else { "missing" },
                elapsed.as_secs()
            ),
        ),
        _ if unconverged_passes >= config.unhealthy_pass_threshold => (
            ClusterState::Unhealthy,
            format!(
                "Worker groups have not reached their targets for {} consecutive passes",
                unconverged_passes
            ),
        ),
        _ => (ClusterState::Ready, "Cluster is reconciled".to_string()),
    };

    HealthAssessment {
        state,
        reason,
        suspend: input.suspend,
        head_present,
        head_ready,
        head_healthy,
        head_failure_onset,
        replica_failures,
        unconverged_passes,
    }
}

fn render_conditions(
    assessment: &HealthAssessment,
    previous: Option<&RayClusterStatus>,
    now: DateTime<Utc>,
) -> Vec<ConditionFields> {
    let mut conditions: Vec<ConditionFields> = previous
        .map(|s| s.conditions.iter().map(ConditionFields::from).collect())
        .unwrap_or_default();
    conditions.retain(|c| CONDITION_ORDER.contains(&c.condition_type.as_str()));

    let suspended = assessment.state == ClusterState::Suspended;

    set_condition(
        &mut conditions,
        build_condition_at(
            CLUSTER_CONDITION_READY,
            status_of(assessment.state == ClusterState::Ready),
            &format!("Cluster{}", capitalize(&assessment.state.to_string())),
            &assessment.reason,
            now,
        ),
    );

    let (status, reason, message) = if suspended {
        (CONDITION_FALSE, "Suspended", "Head pod is deleted while suspended")
    } else if assessment.head_ready {
        (status_of(true), "HeadPodRunningAndReady", "Head pod is running and ready")
    } else if assessment.head_present {
        (CONDITION_FALSE, "HeadPodNotReady", "Head pod is not ready")
    } else {
        (CONDITION_FALSE, "HeadPodNotFound", "Head pod does not exist")
    };
    set_condition(
        &mut conditions,
        build_condition_at(CLUSTER_CONDITION_HEAD_POD_READY, status, reason, message, now),
    );

    // Unknown while suspended so a later resume starts a fresh failure onset.
    let head_health = if suspended {
        build_condition_at(
            CLUSTER_CONDITION_HEAD_POD_HEALTHY,
            CONDITION_UNKNOWN,
            "Suspended",
            "Head pod is deleted while suspended",
            now,
        )
    } else if assessment.head_healthy {
        build_condition_at(
            CLUSTER_CONDITION_HEAD_POD_HEALTHY,
            status_of(true),
            "HeadPodHealthy",
            "Head pod is healthy",
            now,
        )
    } else {
        let onset = assessment.head_failure_onset.unwrap_or(now);
        build_condition_at(
            CLUSTER_CONDITION_HEAD_POD_HEALTHY,
            CONDITION_FALSE,
            if assessment.head_present {
                "HeadPodUnhealthy"
            } else {
                "HeadPodMissing"
            },
            "Head pod is missing, crash-looping or failed",
            onset,
        )
    };
    set_condition(&mut conditions, head_health);

    let failures = &assessment.replica_failures;
    set_condition(
        &mut conditions,
        build_condition_at(
            CLUSTER_CONDITION_REPLICA_FAILURE,
            status_of(!failures.is_empty()),
            if failures.is_empty() {
                "NoFailures"
            } else {
                "FailedReconciliation"
            },
            &failures.join("; "),
            now,
        ),
    );

    set_condition(
        &mut conditions,
        build_condition_at(
            CLUSTER_CONDITION_SUSPENDING,
            status_of(assessment.suspend == SuspendPhase::Suspending),
            "SuspendPhase",
            &format!("{:?}", assessment.suspend),
            now,
        ),
    );
    set_condition(
        &mut conditions,
        build_condition_at(
            CLUSTER_CONDITION_SUSPENDED,
            status_of(assessment.suspend == SuspendPhase::Suspended),
            "SuspendPhase",
            &format!("{:?}", assessment.suspend),
            now,
        ),
    );

    conditions.sort_by_key(|c| {
        CONDITION_ORDER
            .iter()
            .position(|t| *t == c.condition_type)
            .unwrap_or(CONDITION_ORDER.len())
    });
    conditions
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Build the full status for this pass.
pub fn aggregate(input: &AggregateInput<'_>, config: &ReconcilerConfig) -> RayClusterStatus {
    let assessment = assess(input, config);
    let suspended = assessment.state == ClusterState::Suspended;
    let groups = counted_groups(input.spec, input.scaling);

    let mut ready = 0;
    let mut available = 0;
    let mut desired = 0i32;
    let mut min = 0i32;
    let mut max = 0i32;
    let mut totals = ResourceTotals::default();

    if !suspended {
        totals.add_scaled(template_request(&input.spec.head_group_spec.template), 1);
    }
    for (group, target) in &groups {
        let pods = input.observed.workers(&group.group_name);
        ready += pods.iter().filter(|p| p.is_ready()).count() as i32;
        available += pods.iter().filter(|p| p.is_running()).count() as i32;
        min = min.saturating_add(group.min_replicas);
        max = max.saturating_add(group.max_replicas);
        if !suspended {
            desired = desired.saturating_add(*target);
            totals.add_scaled(template_request(&group.template), *target as i128);
        }
    }

    let head_service = input.observed.head_service();
    let endpoints: BTreeMap<String, String> = head_service
        .map(|s| {
            s.ports
                .iter()
                .map(|(name, port)| (name.clone(), port.to_string()))
                .collect()
        })
        .unwrap_or_default();

    RayClusterStatus {
        state: Some(assessment.state),
        reason: Some(assessment.reason.clone()),
        ready_worker_replicas: ready,
        available_worker_replicas: available,
        desired_worker_replicas: desired,
        min_worker_replicas: min,
        max_worker_replicas: max,
        desired_cpu: Some(quantity::format_cpu(totals.cpu)),
        desired_memory: Some(quantity::format_bytes(totals.memory)),
        desired_gpu: Some(quantity::format_count(totals.gpu)),
        desired_tpu: Some(quantity::format_count(totals.tpu)),
        head: HeadInfo {
            pod_ip: input.observed.head_pod().and_then(|h| h.pod_ip.clone()),
            service_ip: head_service.and_then(|s| s.cluster_ip.clone()),
        },
        endpoints,
        observed_generation: input.generation,
        last_update_time: Some(Time(input.now)),
        conditions: render_conditions(&assessment, input.previous, input.now)
            .into_iter()
            .map(ConditionFields::into_cluster_condition)
            .collect(),
        consecutive_unconverged_passes: assessment.unconverged_passes,
    }
}

/// Whether two statuses differ in anything but `lastUpdateTime`.
pub fn status_changed(previous: Option<&RayClusterStatus>, next: &RayClusterStatus) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let strip = |s: &RayClusterStatus| RayClusterStatus {
        last_update_time: None,
        ..s.clone()
    };
    strip(previous) != strip(next)
}

/// Whether `next` may replace `stored`: never regress the generation, never write a no-op.
pub fn should_write(stored: Option<&RayClusterStatus>, next: &RayClusterStatus) -> bool {
    let stored_generation = stored.and_then(|s| s.observed_generation);
    if let (Some(stored_generation), Some(next_generation)) =
        (stored_generation, next.observed_generation)
    {
        if stored_generation > next_generation {
            return false;
        }
    }
    status_changed(stored, next)
}
