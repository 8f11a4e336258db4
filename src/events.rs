//! Kubernetes Event recording for the RayCluster controller.
//!
//! Events are fire-and-forget: failures are logged and never propagate.
//! A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use std::sync::Mutex;
use tracing::warn;

/// Publishes Kubernetes Events about a RayCluster.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production publisher wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// A published event, as kept by [`RecordingEventPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// Publisher that keeps events in memory instead of sending them.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                action: action.to_string(),
                note,
            });
        }
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`.
pub mod reasons {
    /// Spec is malformed or contradictory for a group or the head
    pub const RAY_CONFIG_ERROR: &str = "RayConfigError";
    /// A pod or service create/delete failed at the platform
    pub const POD_RECONCILIATION_ERROR: &str = "PodReconciliationError";
    pub const CREATED_HEAD_POD: &str = "CreatedHeadPod";
    pub const CREATED_WORKER_POD: &str = "CreatedWorkerPod";
    pub const DELETED_HEAD_POD: &str = "DeletedHeadPod";
    pub const DELETED_WORKER_POD: &str = "DeletedWorkerPod";
    pub const CREATED_SERVICE: &str = "CreatedService";
    pub const SUSPENDING: &str = "Suspending";
    pub const SUSPENDED: &str = "Suspended";
    pub const RESUMING: &str = "Resuming";
    /// Status could not be written after all retries
    pub const STATUS_UPDATE_FAILED: &str = "StatusUpdateFailed";
}

/// Event actions, shown in the ACTION column.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CREATE_POD: &str = "CreatePod";
    pub const DELETE_POD: &str = "DeletePod";
    pub const CREATE_SERVICE: &str = "CreateService";
    pub const UPDATE_STATUS: &str = "UpdateStatus";
}
