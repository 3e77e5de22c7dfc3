//! Tearing down the partitions of a deleted allocation
//!
//! Teardown is best-effort: every step is attempted for every prepared entry
//! of the pod and failures are only logged. The allocation and its entries
//! are dropped from the record afterwards regardless.

use tracing::{info, warn};

use crate::capacity::{resource_name, CapacityChange};
use crate::crd::{Allocation, MigNodeSpec, PreparedPartition};
use crate::gpu::MigBackend;

use super::allocation::{adoptable, target_device};
use super::Context;

/// Destroy every partition the pod owns and withdraw what was advertised for
/// it. Returns the prepared keys to remove from the record.
pub async fn teardown(ctx: &Context, spec: &MigNodeSpec, allocation: &Allocation) -> Vec<String> {
    let mut keys = spec.prepared_for_pod(&allocation.pod_uuid);
    for key in &keys {
        if let Some(entry) = spec.prepared.get(key) {
            destroy_partition(ctx.backend.as_ref(), key, entry);
        }
    }
    if keys.is_empty() {
        keys.extend(destroy_unrecorded(ctx.backend.as_ref(), spec, allocation));
    }

    if let Err(e) = ctx
        .client
        .delete_config_map(&allocation.namespace, &allocation.pod_name)
        .await
    {
        warn!(pod = %allocation.pod_name, error = %e, "failed to delete device ConfigMap");
    }

    let resource = resource_name(&ctx.config.resource_prefix, &allocation.pod_name);
    if let Err(e) = ctx
        .client
        .patch_node_capacity(&ctx.config.node_name, &resource, CapacityChange::Remove)
        .await
    {
        warn!(resource = %resource, error = %e, "failed to remove node capacity");
    }

    keys
}

/// Destroy a partition carved for the allocation whose record write never
/// landed. Returns its UUID when one was found.
fn destroy_unrecorded(
    backend: &dyn MigBackend,
    spec: &MigNodeSpec,
    allocation: &Allocation,
) -> Option<String> {
    let found = target_device(backend, allocation)
        .and_then(|device| adoptable(backend, spec, &device, allocation));
    let mig = match found {
        Ok(Some(mig)) => mig,
        Ok(None) => {
            info!(pod = %allocation.pod_name, "no partitions to destroy");
            return None;
        }
        Err(e) => {
            warn!(pod = %allocation.pod_name, error = %e, "failed to look for unrecorded partition");
            return None;
        }
    };

    warn!(pod = %allocation.pod_name, partition = %mig.uuid, "destroying unrecorded partition");
    destroy_instances(
        backend,
        &allocation.gpu_uuid,
        &mig.uuid,
        mig.gpu_instance_id,
        mig.compute_instance_id,
    );
    // an orphan entry for it may still sit in the registry
    spec.prepared.contains_key(&mig.uuid).then_some(mig.uuid)
}

/// Destroy a recorded partition, unless its instance ids now belong to a
/// different partition
fn destroy_partition(backend: &dyn MigBackend, key: &str, entry: &PreparedPartition) {
    let migs = match backend.mig_devices(&entry.parent) {
        Ok(migs) => migs,
        Err(e) => {
            warn!(partition = %key, gpu = %entry.parent, error = %e, "failed to list partitions, not destroying");
            return;
        }
    };
    if let Some(other) = migs
        .iter()
        .find(|m| m.gpu_instance_id == entry.gi_info_id && m.uuid != key)
    {
        warn!(
            partition = %key,
            current = %other.uuid,
            gi = entry.gi_info_id,
            "GPU instance id now belongs to another partition, not destroying"
        );
        return;
    }
    destroy_instances(backend, &entry.parent, key, entry.gi_info_id, entry.ci_info_id);
}

fn destroy_instances(backend: &dyn MigBackend, device: &str, key: &str, gi: u32, ci: u32) {
    if let Err(e) = backend.destroy_compute_instance(device, gi, ci) {
        warn!(partition = %key, gi, ci, error = %e, "failed to destroy compute instance");
    }
    match backend.destroy_gpu_instance(device, gi) {
        Ok(()) => info!(partition = %key, gpu = %device, "destroyed partition"),
        Err(e) => warn!(partition = %key, gi, error = %e, "failed to destroy GPU instance"),
    }
}
