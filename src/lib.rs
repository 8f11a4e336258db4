//! RayCluster Kubernetes Operator
//!
//! Reconciles `RayCluster` custom resources into a head pod, a head service
//! and any number of worker groups, each scaled between its own bounds.
//!
//! ## Custom Resources
//!
//! - `RayCluster`: one head group and named worker groups, optionally
//!   suspended or driven by the Ray autoscaler
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: ray.io/v1alpha1
//! kind: RayCluster
//! metadata:
//!   name: demo
//! spec:
//!   rayVersion: "2.9.0"
//!   headGroupSpec:
//!     rayStartParams: {}
//!     template:
//!       spec:
//!         containers:
//!           - name: ray-head
//!             image: rayproject/ray:2.9.0
//!   workerGroupSpecs:
//!     - groupName: cpu
//!       replicas: 2
//!       minReplicas: 1
//!       maxReplicas: 5
//!       rayStartParams: {}
//!       template:
//!         spec:
//!           containers:
//!             - name: ray-worker
//!               image: rayproject/ray:2.9.0
//! ```

pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod labels;
pub mod leader_election;
pub mod platform;
pub mod quantity;

pub use config::{ReconcilerConfig, OPERATOR_NAME};
pub use controllers::{AutoscalerClient, ClusterReconciler, RayClusterController};
pub use crd::{
    ClusterState, HeadGroupSpec, RayCluster, RayClusterCondition, RayClusterSpec,
    RayClusterStatus, WorkerGroupSpec,
};
pub use error::{OperatorError, Result};
