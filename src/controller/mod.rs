//! MigNode controller
//!
//! One reconcile pass walks the node record: allocations in `creating` get a
//! partition carved and advertised, allocations in `deleted` get their
//! partitions destroyed and are dropped from the record. Hardware failures
//! leave the allocation as it was; the pass requeues itself while anything is
//! still `creating`.

mod allocation;
mod client;
mod teardown;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

pub use allocation::{device_config_map, realize, RealizedPartition, VISIBLE_DEVICES_KEYS};
pub use client::{KubeNodeClient, NodeClient, FIELD_MANAGER};
#[cfg(test)]
pub use client::MockNodeClient;
pub use teardown::teardown;

use crate::capacity::{resource_name, sync_capacity_labels, CapacityChange};
use crate::config::ControllerConfig;
use crate::crd::{Allocation, AllocationStatus, MigNode};
use crate::gpu::MigBackend;
use crate::Error;

/// Shared state of every reconcile pass
pub struct Context {
    /// Cluster API calls (trait object for testability)
    pub client: Arc<dyn NodeClient>,
    /// Partitioning hardware
    pub backend: Arc<dyn MigBackend>,
    /// Process configuration
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        backend: Arc<dyn MigBackend>,
        config: ControllerConfig,
    ) -> ContextBuilder {
        ContextBuilder {
            client,
            node_client: None,
            backend,
            config,
        }
    }

    /// Create a context for testing with a mock cluster client
    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn NodeClient>,
        backend: Arc<dyn MigBackend>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            backend,
            config,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    node_client: Option<Arc<dyn NodeClient>>,
    backend: Arc<dyn MigBackend>,
    config: ControllerConfig,
}

impl ContextBuilder {
    /// Override the cluster client
    pub fn node_client(mut self, node_client: Arc<dyn NodeClient>) -> Self {
        self.node_client = Some(node_client);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let namespace = self.config.namespace.clone();
        Context {
            client: self
                .node_client
                .unwrap_or_else(|| Arc::new(KubeNodeClient::new(self.client, namespace))),
            backend: self.backend,
            config: self.config,
        }
    }
}

/// Reconcile the node record
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile(node: Arc<MigNode>, ctx: Arc<Context>) -> Result<Action, Error> {
    if node.name_any() != ctx.config.node_name {
        debug!("record belongs to another node");
        return Ok(Action::await_change());
    }

    let mut record = (*node).clone();

    // one walk in key order, so a placement freed by an earlier deletion is
    // already available to a later creation
    let pending: Vec<Allocation> = record.spec.pending().cloned().collect();
    for allocation in pending {
        record = match allocation.allocation_status {
            AllocationStatus::Creating => create(&ctx, record, &allocation).await?,
            AllocationStatus::Deleted => delete(&ctx, record, &allocation).await?,
            AllocationStatus::Created => record,
        };
    }

    if record.spec.has_creating() {
        Ok(Action::requeue(ctx.config.requeue_interval))
    } else {
        Ok(Action::await_change())
    }
}

/// Carve and advertise a partition for a `creating` allocation. Hardware
/// failures leave the record untouched.
async fn create(ctx: &Context, mut record: MigNode, allocation: &Allocation) -> Result<MigNode, Error> {
    if let Err(e) = allocation.validate() {
        warn!(pod = %allocation.pod_uuid, error = %e, "skipping malformed allocation");
        return Ok(record);
    }

    let realized = match realize(ctx.backend.as_ref(), &record.spec, allocation) {
        Ok(realized) => realized,
        Err(e) => {
            warn!(
                pod = %allocation.pod_name,
                gpu = %allocation.gpu_uuid,
                profile = %allocation.profile,
                error = %e,
                "failed to carve partition, allocation stays creating"
            );
            return Ok(record);
        }
    };

    let partition = realized.uuid.clone();
    record
        .spec
        .complete_creation(&allocation.pod_uuid, realized.uuid, realized.prepared);
    let record = ctx.client.replace_record(&record).await?;
    info!(
        pod = %allocation.pod_name,
        partition = %partition,
        adopted = realized.adopted,
        "allocation created"
    );

    advertise(ctx, allocation, &partition, record.spec.prepared.len()).await;
    Ok(record)
}

/// Tear down a `deleted` allocation and drop it from the record
async fn delete(ctx: &Context, mut record: MigNode, allocation: &Allocation) -> Result<MigNode, Error> {
    let keys = teardown(ctx, &record.spec, allocation).await;
    record.spec.complete_deletion(&allocation.pod_uuid, &keys);
    let record = ctx.client.replace_record(&record).await?;
    info!(pod = %allocation.pod_name, partitions = keys.len(), "allocation removed");

    if let Err(e) =
        sync_capacity_labels(ctx.client.as_ref(), &ctx.config, record.spec.prepared.len()).await
    {
        warn!(error = %e, "failed to update node capacity labels");
    }
    Ok(record)
}

/// Make a carved slice consumable: labels, ConfigMap, then node capacity.
/// Failures are logged; the slice stays recorded either way.
async fn advertise(ctx: &Context, allocation: &Allocation, partition: &str, prepared: usize) {
    if let Err(e) = sync_capacity_labels(ctx.client.as_ref(), &ctx.config, prepared).await {
        warn!(error = %e, "failed to update node capacity labels");
    }

    let config_map = device_config_map(allocation, partition);
    if let Err(e) = ctx.client.apply_config_map(&config_map).await {
        warn!(pod = %allocation.pod_name, error = %e, "failed to create device ConfigMap");
    }

    let resource = resource_name(&ctx.config.resource_prefix, &allocation.pod_name);
    if let Err(e) = ctx
        .client
        .patch_node_capacity(&ctx.config.node_name, &resource, CapacityChange::Add)
        .await
    {
        warn!(resource = %resource, error = %e, "failed to add node capacity");
    }
}

/// Requeue a failed pass after a delay
pub fn error_policy(node: Arc<MigNode>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, node = %node.name_any(), "reconciliation failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
