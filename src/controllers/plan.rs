//! Actions a reconciliation pass decides on, and what became of them.

use std::fmt;

/// Create or delete one worker pod
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalingAction {
    CreatePod { group: String },
    DeletePod { group: String, pod: String },
}

impl ScalingAction {
    pub fn group(&self) -> &str {
        match self {
            ScalingAction::CreatePod { group } | ScalingAction::DeletePod { group, .. } => group,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, ScalingAction::CreatePod { .. })
    }
}

/// Head-side topology changes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopologyAction {
    CreateHeadPod,
    DeleteHeadPod { pod: String },
    CreateHeadService,
}

/// Anything a pass may ask the platform to do
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlannedAction {
    Topology(TopologyAction),
    Scaling(ScalingAction),
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedAction::Topology(TopologyAction::CreateHeadPod) => write!(f, "create head pod"),
            PlannedAction::Topology(TopologyAction::DeleteHeadPod { pod }) => {
                write!(f, "delete head pod {}", pod)
            }
            PlannedAction::Topology(TopologyAction::CreateHeadService) => {
                write!(f, "create head service")
            }
            PlannedAction::Scaling(ScalingAction::CreatePod { group }) => {
                write!(f, "create worker pod in group {}", group)
            }
            PlannedAction::Scaling(ScalingAction::DeletePod { group, pod }) => {
                write!(f, "delete worker pod {} in group {}", pod, group)
            }
        }
    }
}

/// Result of executing one planned action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub action: PlannedAction,
    /// `None` on success
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A group (or the head, as `headgroup`) that was skipped because its spec is unusable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIssue {
    pub group: String,
    pub message: String,
}

impl GroupIssue {
    pub fn new(group: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for GroupIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.group, self.message)
    }
}
