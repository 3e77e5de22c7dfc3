//! Cluster API calls made by the node controller
//!
//! [`NodeClient`] is the seam tests mock; [`KubeNodeClient`] is the real
//! implementation over a kube `Client`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::capacity::{capacity_patch, CapacityChange};
use crate::crd::{MigNode, MigNodeStatus};
use crate::Error;

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "migslicer";

/// Trait abstracting the Kubernetes calls of the node controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch the node record, `None` if it does not exist yet
    async fn get_record(&self, name: &str) -> Result<Option<MigNode>, Error>;

    /// Create the node record
    async fn create_record(&self, record: &MigNode) -> Result<MigNode, Error>;

    /// Replace the node record's spec
    ///
    /// The record's resourceVersion is sent along, so a concurrent writer
    /// makes this fail with a conflict instead of being overwritten.
    async fn replace_record(&self, record: &MigNode) -> Result<MigNode, Error>;

    /// Set `status.processed` on the node record
    async fn mark_processed(&self, name: &str) -> Result<(), Error>;

    /// Create or update a ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Delete a ConfigMap; a missing ConfigMap is not an error
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Add or remove one extended resource in the Node's status capacity
    async fn patch_node_capacity(
        &self,
        node: &str,
        resource: &str,
        change: CapacityChange,
    ) -> Result<(), Error>;

    /// Current labels of the Node
    async fn node_labels(&self, node: &str) -> Result<BTreeMap<String, String>, Error>;

    /// Merge the given labels into the Node's labels
    async fn patch_node_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeNodeClient {
    client: Client,
    namespace: String,
}

impl KubeNodeClient {
    /// Create a client for records in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn records(&self) -> Api<MigNode> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn get_record(&self, name: &str) -> Result<Option<MigNode>, Error> {
        Ok(self.records().get_opt(name).await?)
    }

    async fn create_record(&self, record: &MigNode) -> Result<MigNode, Error> {
        Ok(self.records().create(&PostParams::default(), record).await?)
    }

    async fn replace_record(&self, record: &MigNode) -> Result<MigNode, Error> {
        let name = record.name_any();
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.records().replace(&name, &params, record).await?)
    }

    async fn mark_processed(&self, name: &str) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": MigNodeStatus::processed() });
        self.records()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map
            .namespace()
            .ok_or_else(|| Error::validation("ConfigMap has no namespace"))?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &config_map.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(config_map),
        )
        .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace, name, "ConfigMap already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_node_capacity(
        &self,
        node: &str,
        resource: &str,
        change: CapacityChange,
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = capacity_patch(resource, change)?;
        api.patch_status(node, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        Ok(())
    }

    async fn node_labels(&self, node: &str) -> Result<BTreeMap<String, String>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = api.get(node).await?;
        Ok(node.metadata.labels.unwrap_or_default())
    }

    async fn patch_node_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
