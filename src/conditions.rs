//! RayCluster status conditions
//!
//! A condition keeps its `lastTransitionTime` until its status flips, so the
//! stamp on `HeadPodHealthy=False` marks when the head first went bad.

use chrono::{DateTime, Utc};

use crate::crd::RayClusterCondition;

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// RayCluster condition types
pub const CLUSTER_CONDITION_READY: &str = "Ready";
pub const CLUSTER_CONDITION_HEAD_POD_READY: &str = "HeadPodReady";
pub const CLUSTER_CONDITION_HEAD_POD_HEALTHY: &str = "HeadPodHealthy";
pub const CLUSTER_CONDITION_REPLICA_FAILURE: &str = "ReplicaFailure";
pub const CLUSTER_CONDITION_SUSPENDING: &str = "RayClusterSuspending";
pub const CLUSTER_CONDITION_SUSPENDED: &str = "RayClusterSuspended";

/// Build a condition stamped with the current time.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ConditionFields {
    build_condition_at(condition_type, status, reason, message, Utc::now())
}

/// Build a condition stamped with an explicit time.
pub fn build_condition_at(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> ConditionFields {
    ConditionFields {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(now.to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Condition status string for a boolean.
pub fn status_of(value: bool) -> &'static str {
    if value {
        CONDITION_TRUE
    } else {
        CONDITION_FALSE
    }
}

/// Generic condition fields, convertible to and from the CRD condition type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionFields {
    pub condition_type: String,
    pub status: String,
    pub last_transition_time: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ConditionFields {
    pub fn into_cluster_condition(self) -> RayClusterCondition {
        RayClusterCondition {
            r#type: self.condition_type,
            status: self.status,
            last_transition_time: self.last_transition_time,
            reason: self.reason,
            message: self.message,
        }
    }

    pub fn transition_time(&self) -> Option<DateTime<Utc>> {
        self.last_transition_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

impl From<&RayClusterCondition> for ConditionFields {
    fn from(c: &RayClusterCondition) -> Self {
        ConditionFields {
            condition_type: c.r#type.clone(),
            status: c.status.clone(),
            last_transition_time: c.last_transition_time.clone(),
            reason: c.reason.clone(),
            message: c.message.clone(),
        }
    }
}

/// Insert or update by type; only a status change moves the transition time.
pub fn set_condition(conditions: &mut Vec<ConditionFields>, new: ConditionFields) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// Find a condition by type.
pub fn find_condition<'a>(
    conditions: &'a [ConditionFields],
    condition_type: &str,
) -> Option<&'a ConditionFields> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::seconds(secs)
    }

    fn head_unhealthy(secs: i64, message: &str) -> ConditionFields {
        build_condition_at(
            CLUSTER_CONDITION_HEAD_POD_HEALTHY,
            CONDITION_FALSE,
            "HeadPodMissing",
            message,
            at(secs),
        )
    }

    #[test]
    fn test_failure_onset_survives_repeated_passes() {
        let mut conditions = vec![head_unhealthy(0, "head pod not found")];
        set_condition(&mut conditions, head_unhealthy(60, "head pod still not found"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].transition_time(), Some(at(0)));
        assert_eq!(conditions[0].message.as_deref(), Some("head pod still not found"));
    }

    #[test]
    fn test_recovery_restamps_transition() {
        let mut conditions = vec![head_unhealthy(0, "head pod not found")];
        set_condition(
            &mut conditions,
            build_condition_at(
                CLUSTER_CONDITION_HEAD_POD_HEALTHY,
                CONDITION_TRUE,
                "HeadPodRunning",
                "",
                at(90),
            ),
        );

        assert!(conditions[0].is_true());
        assert_eq!(conditions[0].transition_time(), Some(at(90)));
    }

    #[test]
    fn test_new_types_are_appended() {
        let mut conditions = vec![head_unhealthy(0, "")];
        set_condition(
            &mut conditions,
            build_condition(CLUSTER_CONDITION_SUSPENDED, status_of(true), "SuspendPhase", ""),
        );

        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, CLUSTER_CONDITION_SUSPENDED).is_some_and(|c| c.is_true()));
        assert!(find_condition(&conditions, CLUSTER_CONDITION_READY).is_none());
    }

    #[test]
    fn test_crd_condition_conversion() {
        let fields = head_unhealthy(5, "crash looping");
        let crd = fields.clone().into_cluster_condition();
        assert_eq!(crd.r#type, "HeadPodHealthy");
        assert_eq!(ConditionFields::from(&crd), fields);
    }

    #[test]
    fn test_unparseable_transition_time() {
        let mut fields = head_unhealthy(0, "");
        fields.last_transition_time = Some("yesterday".into());
        assert_eq!(fields.transition_time(), None);
        assert_eq!(status_of(false), CONDITION_FALSE);
    }
}
