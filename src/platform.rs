//! Boundary to the Kubernetes API.
//!
//! The reconciler decides what to create and delete; implementations of
//! [`ClusterPlatform`] carry it out. Every call is idempotent under retry:
//! creating an object that already exists and deleting one that is already
//! gone both succeed.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::crd::RayCluster;
use crate::error::{OperatorError, Result};
use crate::labels;

#[async_trait]
pub trait ClusterPlatform: Send + Sync {
    /// Pods labelled as belonging to the cluster.
    async fn list_pods(&self, namespace: &str, cluster: &str) -> Result<Vec<Pod>>;

    /// Services labelled as belonging to the cluster.
    async fn list_services(&self, namespace: &str, cluster: &str) -> Result<Vec<Service>>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<RayCluster>;

    /// Replace the whole object; fails with `Conflict` on a stale resourceVersion.
    async fn replace_cluster(&self, namespace: &str, cluster: &RayCluster) -> Result<RayCluster>;

    /// Replace the status sub-resource; fails with `Conflict` on a stale resourceVersion.
    async fn replace_status(&self, namespace: &str, cluster: &RayCluster) -> Result<RayCluster>;
}

/// [`ClusterPlatform`] backed by a kube client.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    timeout: Duration,
}

impl KubePlatform {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(OperatorError::from),
            Err(_) => Err(OperatorError::Timeout {
                operation: operation.to_string(),
                elapsed: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl ClusterPlatform for KubePlatform {
    async fn list_pods(&self, namespace: &str, cluster: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&labels::cluster_selector(cluster));
        let list = self.timed("list pods", pods.list(&lp)).await?;
        Ok(list.items)
    }

    async fn list_services(&self, namespace: &str, cluster: &str) -> Result<Vec<Service>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&labels::cluster_selector(cluster));
        let list = self.timed("list services", services.list(&lp)).await?;
        Ok(list.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match self
            .timed("create pod", pods.create(&PostParams::default(), pod))
            .await
        {
            Ok(_) => Ok(()),
            Err(OperatorError::Conflict(_)) => {
                debug!(pod = %pod.name_any(), "Pod already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match self
            .timed("delete pod", pods.delete(name, &DeleteParams::default()))
            .await
        {
            Ok(_) => Ok(()),
            Err(OperatorError::NotFound(_)) => {
                debug!(pod = %name, "Pod already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match self
            .timed(
                "create service",
                services.create(&PostParams::default(), service),
            )
            .await
        {
            Ok(_) | Err(OperatorError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<RayCluster> {
        let clusters: Api<RayCluster> = Api::namespaced(self.client.clone(), namespace);
        self.timed("get raycluster", clusters.get(name)).await
    }

    async fn replace_cluster(&self, namespace: &str, cluster: &RayCluster) -> Result<RayCluster> {
        let clusters: Api<RayCluster> = Api::namespaced(self.client.clone(), namespace);
        let name = cluster.name_any();
        self.timed(
            "replace raycluster",
            clusters.replace(&name, &PostParams::default(), cluster),
        )
        .await
    }

    async fn replace_status(&self, namespace: &str, cluster: &RayCluster) -> Result<RayCluster> {
        let clusters: Api<RayCluster> = Api::namespaced(self.client.clone(), namespace);
        let name = cluster.name_any();
        let body = serde_json::to_vec(cluster)?;
        self.timed(
            "replace raycluster status",
            clusters.replace_status(&name, &PostParams::default(), body),
        )
        .await
    }
}
