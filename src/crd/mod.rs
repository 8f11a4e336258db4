//! Custom Resource Definitions for the RayCluster operator
//!
//! - RayCluster: one head pod plus named worker groups

mod cluster;

pub use cluster::{
    AutoscalerOptions, ClusterState, HeadGroupSpec, HeadInfo, RayCluster, RayClusterCondition,
    RayClusterSpec, RayClusterStatus, RayNodeType, ScaleStrategy, UpscalingMode, WorkerGroupSpec,
};
