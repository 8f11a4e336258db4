//! Suspend and resume
//!
//! A cluster with `spec.suspend = true` has every pod deleted while the
//! spec is left intact, so clearing the flag restores the same topology.
//!
//! ```text
//! Active ──suspend──> Suspending ──pods gone──> Suspended
//!   ^                     │                         │
//!   └─────── Resuming <───┴────────unsuspend────────┘
//! ```
//!
//! The phase is derived each pass from the flag, the observed pods and the
//! conditions of the previous status; nothing else is persisted.

use serde::{Deserialize, Serialize};

use crate::conditions::{
    ConditionFields, CLUSTER_CONDITION_SUSPENDED, CLUSTER_CONDITION_SUSPENDING,
};
use crate::controllers::observed::ObservedSnapshot;
use crate::controllers::plan::{PlannedAction, ScalingAction, TopologyAction};
use crate::crd::{RayClusterStatus, RayNodeType};

/// Where a cluster sits in the suspend lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SuspendPhase {
    Active,
    /// Suspend requested; pods are being removed
    Suspending,
    /// Suspend requested and no pods remain
    Suspended,
    /// First pass after the flag was cleared
    Resuming,
}

impl SuspendPhase {
    /// Whether scaling and spec write-back are bypassed this pass.
    pub fn bypasses_scaling(self) -> bool {
        matches!(self, SuspendPhase::Suspending | SuspendPhase::Suspended)
    }
}

/// What to do about suspension in one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendDecision {
    pub phase: SuspendPhase,
    pub reason: String,
    /// Pod deletions; only populated while suspending
    pub actions: Vec<PlannedAction>,
}

impl SuspendDecision {
    /// True when the phase differs from the one recorded last pass.
    pub fn is_transition(&self, previous: SuspendPhase) -> bool {
        self.phase != previous
    }
}

/// Recover the phase recorded by the previous pass.
pub fn previous_phase(status: Option<&RayClusterStatus>) -> SuspendPhase {
    let Some(status) = status else {
        return SuspendPhase::Active;
    };
    let is_true = |condition_type: &str| {
        status
            .conditions
            .iter()
            .map(ConditionFields::from)
            .any(|c| c.condition_type == condition_type && c.is_true())
    };
    if is_true(CLUSTER_CONDITION_SUSPENDED) {
        SuspendPhase::Suspended
    } else if is_true(CLUSTER_CONDITION_SUSPENDING) {
        SuspendPhase::Suspending
    } else {
        SuspendPhase::Active
    }
}

/// Decide the suspend phase for this pass.
pub fn evaluate(
    previous: SuspendPhase,
    suspend_requested: bool,
    observed: &ObservedSnapshot,
) -> SuspendDecision {
    if suspend_requested {
        let remaining = observed.total_pods();
        if remaining == 0 {
            return SuspendDecision {
                phase: SuspendPhase::Suspended,
                reason: "All pods deleted; cluster is suspended".to_string(),
                actions: Vec::new(),
            };
        }

        let (finished_heads, finished_workers): (Vec<_>, Vec<_>) = observed
            .finished
            .iter()
            .partition(|p| p.node_type == RayNodeType::Head);
        let mut actions: Vec<PlannedAction> = observed
            .head_pods
            .iter()
            .chain(finished_heads)
            .map(|p| PlannedAction::Topology(TopologyAction::DeleteHeadPod { pod: p.name.clone() }))
            .collect();
        actions.extend(observed.all_workers().chain(finished_workers).map(|p| {
            PlannedAction::Scaling(ScalingAction::DeletePod {
                group: p.group.clone(),
                pod: p.name.clone(),
            })
        }));

        return SuspendDecision {
            phase: SuspendPhase::Suspending,
            reason: format!(
                "Suspend requested; {} pod(s) remaining, {} already terminating",
                remaining, observed.terminating
            ),
            actions,
        };
    }

    match previous {
        SuspendPhase::Suspended | SuspendPhase::Suspending => SuspendDecision {
            phase: SuspendPhase::Resuming,
            reason: "Suspend cleared; recreating pods from spec".to_string(),
            actions: Vec::new(),
        },
        SuspendPhase::Active | SuspendPhase::Resuming => SuspendDecision {
            phase: SuspendPhase::Active,
            reason: "Cluster is not suspended".to_string(),
            actions: Vec::new(),
        },
    }
}
