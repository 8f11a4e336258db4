//! Label keys shared by the pods and services a RayCluster owns.

use std::collections::BTreeMap;

use crate::crd::RayNodeType;

pub const CLUSTER: &str = "ray.io/cluster";
pub const GROUP: &str = "ray.io/group";
pub const NODE_TYPE: &str = "ray.io/node-type";
pub const IDENTIFIER: &str = "ray.io/identifier";
pub const CREATED_BY: &str = "app.kubernetes.io/created-by";

/// Value of `ray.io/group` on head pods
pub const HEAD_GROUP: &str = "headgroup";

/// Label selector matching everything owned by a cluster.
pub fn cluster_selector(cluster: &str) -> String {
    format!("{}={}", CLUSTER, cluster)
}

/// Labels stamped onto a pod of the given node type and group.
pub fn pod_labels(
    cluster: &str,
    node_type: RayNodeType,
    group: &str,
    template_labels: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut labels = template_labels.cloned().unwrap_or_default();
    labels.insert(CLUSTER.to_string(), cluster.to_string());
    labels.insert(GROUP.to_string(), group.to_string());
    labels.insert(NODE_TYPE.to_string(), node_type.as_label().to_string());
    labels.insert(
        IDENTIFIER.to_string(),
        format!("{}-{}", cluster, node_type.as_label()),
    );
    labels.insert(
        CREATED_BY.to_string(),
        crate::config::OPERATOR_NAME.to_string(),
    );
    labels
}
