//! Error types for the RayCluster operator

use std::time::Duration;
use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),

    /// Optimistic-concurrency conflict on a write (stale resourceVersion)
    #[error("Conflict writing {0}: object was modified concurrently")]
    Conflict(String),

    /// A collaborator call exceeded its timeout
    #[error("Timed out after {elapsed:?} during {operation}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Malformed or contradictory cluster spec
    #[error("Configuration error{}: {message}", group.as_deref().map(|g| format!(" in group {g}")).unwrap_or_default())]
    Configuration {
        group: Option<String>,
        message: String,
    },

    /// Reconciliation error
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Coarse classes that decide how a failed pass is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The spec must change before a retry can succeed
    Config,
    /// Timeouts, conflicts and API hiccups; the next pass re-diffs
    Transient,
    /// Anything else; retried slowly, forever
    Fatal,
}

impl OperatorError {
    pub fn config(message: impl Into<String>) -> Self {
        OperatorError::Configuration {
            group: None,
            message: message.into(),
        }
    }

    pub fn group_config(group: impl Into<String>, message: impl Into<String>) -> Self {
        OperatorError::Configuration {
            group: Some(group.into()),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            OperatorError::Configuration { .. } => ErrorClass::Config,
            OperatorError::KubeApi(_)
            | OperatorError::Conflict(_)
            | OperatorError::Timeout { .. }
            | OperatorError::NotFound(_) => ErrorClass::Transient,
            OperatorError::Reconciliation(_)
            | OperatorError::Serialization(_)
            | OperatorError::InvalidState(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict(_))
    }

    /// Requeue delay used by the controller's error policy.
    pub fn requeue_after(&self) -> Duration {
        match self.class() {
            ErrorClass::Transient if self.is_conflict() => Duration::from_secs(1),
            ErrorClass::Transient => Duration::from_secs(5),
            ErrorClass::Config => Duration::from_secs(60),
            ErrorClass::Fatal => Duration::from_secs(30),
        }
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(ae.message.clone()),
            _ => OperatorError::KubeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}
