//! Worker-group scaling decisions
//!
//! Diffs each worker group's desired replica count against the observed
//! pods and emits the create/delete actions that converge them. Groups are
//! planned independently of one another.
//!
//! Per group:
//! 1. `replicas` is clamped into `[minReplicas, maxReplicas]`; an
//!    out-of-range stored value is corrected in the returned spec.
//! 2. Every `scaleStrategy.workersToDelete` entry still observed in the
//!    group is deleted; entries already gone are dropped. The list is
//!    cleared in the returned spec.
//! 3. The remaining shortfall is created, or the remaining excess is
//!    deleted newest-first.

use std::collections::BTreeSet;

use crate::controllers::observed::ObservedSnapshot;
use crate::controllers::plan::{GroupIssue, ScalingAction};
use crate::controllers::resolver::validate_template;
use crate::crd::{RayClusterSpec, WorkerGroupSpec};

/// Per-group view of the decision, kept for status and logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    pub group: String,
    /// Replica target after clamping
    pub desired: i32,
    /// The stored value, when clamping changed it
    pub clamped_from: Option<i32>,
    /// Live pods observed in the group
    pub current: usize,
    pub explicit_deletes: Vec<String>,
    pub excess_deletes: Vec<String>,
    pub creates: usize,
}

impl GroupPlan {
    pub fn is_converged(&self) -> bool {
        self.current == self.desired.max(0) as usize && self.explicit_deletes.is_empty()
    }

    pub fn actions(&self) -> impl Iterator<Item = ScalingAction> + '_ {
        let deletes = self
            .explicit_deletes
            .iter()
            .chain(self.excess_deletes.iter())
            .map(|pod| ScalingAction::DeletePod {
                group: self.group.clone(),
                pod: pod.clone(),
            });
        let creates = (0..self.creates).map(|_| ScalingAction::CreatePod {
            group: self.group.clone(),
        });
        deletes.chain(creates)
    }
}

/// Everything the scaling reconciler decided for one pass
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPlan {
    /// Explicit deletions first, then excess deletions, then creates
    pub actions: Vec<ScalingAction>,
    /// Spec with clamped replicas and processed deletion lists cleared
    pub clamped_spec: RayClusterSpec,
    pub groups: Vec<GroupPlan>,
    /// Groups skipped because their spec is unusable
    pub issues: Vec<GroupIssue>,
}

impl ScalingPlan {
    pub fn group(&self, name: &str) -> Option<&GroupPlan> {
        self.groups.iter().find(|g| g.group == name)
    }

    pub fn is_converged(&self) -> bool {
        self.groups.iter().all(GroupPlan::is_converged)
    }

    /// Whether the clamped spec must be written back.
    pub fn spec_changed(&self, original: &RayClusterSpec) -> bool {
        &self.clamped_spec != original
    }
}

/// Clamp a replica target into inclusive bounds.
pub fn clamp_replicas(replicas: i32, min: i32, max: i32) -> i32 {
    replicas.max(min).min(max)
}

/// Structural checks that must pass before a group is touched.
pub fn validate_group(group: &WorkerGroupSpec) -> Result<(), String> {
    if group.group_name.is_empty() {
        return Err("groupName must not be empty".to_string());
    }
    if group.min_replicas < 0 || group.max_replicas < 0 {
        return Err(format!(
            "replica bounds must be non-negative (minReplicas {}, maxReplicas {})",
            group.min_replicas, group.max_replicas
        ));
    }
    if group.min_replicas > group.max_replicas {
        return Err(format!(
            "minReplicas {} exceeds maxReplicas {}",
            group.min_replicas, group.max_replicas
        ));
    }
    validate_template(&group.template)
}

/// Plan one group in isolation.
pub fn plan_group(
    group: &WorkerGroupSpec,
    observed: &ObservedSnapshot,
) -> Result<GroupPlan, GroupIssue> {
    validate_group(group).map_err(|msg| GroupIssue::new(&group.group_name, msg))?;

    let name = group.group_name.as_str();
    let pods = observed.workers(name);
    let stored = group.desired_replicas();
    let desired = clamp_replicas(stored, group.min_replicas, group.max_replicas);

    let mut marked = BTreeSet::new();
    let mut explicit_deletes = Vec::new();
    for target in &group.scale_strategy.workers_to_delete {
        if !marked.insert(target.as_str()) {
            continue;
        }
        if pods.iter().any(|p| &p.name == target) {
            explicit_deletes.push(target.clone());
        } else if let Some(other) = observed.find_worker(target) {
            return Err(GroupIssue::new(
                name,
                format!(
                    "workersToDelete lists pod {} which belongs to group {}",
                    target, other.group
                ),
            ));
        }
    }

    let desired_count = desired as usize;
    let remaining = pods.len() - explicit_deletes.len();
    let mut excess_deletes = Vec::new();
    let mut creates = 0;
    if remaining < desired_count {
        creates = desired_count - remaining;
    } else if remaining > desired_count {
        // Newest first: pods are held oldest-first in the snapshot.
        excess_deletes = pods
            .iter()
            .rev()
            .filter(|p| !explicit_deletes.contains(&p.name))
            .take(remaining - desired_count)
            .map(|p| p.name.clone())
            .collect();
    }

    Ok(GroupPlan {
        group: name.to_string(),
        desired,
        clamped_from: (group.replicas.is_some() && stored != desired).then_some(stored),
        current: pods.len(),
        explicit_deletes,
        excess_deletes,
        creates,
    })
}

/// Plan every worker group of a cluster.
pub fn reconcile(spec: &RayClusterSpec, observed: &ObservedSnapshot) -> ScalingPlan {
    let mut clamped_spec = spec.clone();
    let mut groups = Vec::new();
    let mut issues = Vec::new();
    let mut seen = BTreeSet::new();

    for (index, group) in spec.worker_group_specs.iter().enumerate() {
        if !seen.insert(group.group_name.as_str()) {
            issues.push(GroupIssue::new(
                &group.group_name,
                format!(
                    "duplicate groupName {} at workerGroupSpecs[{}]",
                    group.group_name, index
                ),
            ));
            continue;
        }

        match plan_group(group, observed) {
            Ok(plan) => {
                let target = &mut clamped_spec.worker_group_specs[index];
                if plan.clamped_from.is_some() {
                    target.replicas = Some(plan.desired);
                }
                target.scale_strategy.workers_to_delete.clear();
                groups.push(plan);
            }
            Err(issue) => issues.push(issue),
        }
    }

    let mut explicit = Vec::new();
    let mut excess = Vec::new();
    let mut creates = Vec::new();
    for plan in &groups {
        for action in plan.actions() {
            match &action {
                ScalingAction::CreatePod { .. } => creates.push(action),
                ScalingAction::DeletePod { pod, .. } if plan.explicit_deletes.contains(pod) => {
                    explicit.push(action)
                }
                ScalingAction::DeletePod { .. } => excess.push(action),
            }
        }
    }

    let mut actions = explicit;
    actions.append(&mut excess);
    actions.append(&mut creates);

    ScalingPlan {
        actions,
        clamped_spec,
        groups,
        issues,
    }
}
