//! Dangling slice recovery
//!
//! Partitions survive a controller restart. Before the controller handles any
//! allocation, every realized partition is read back from the hardware so
//! the node record's prepared set matches what is actually on the cards.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::crd::{MigNodeSpec, PreparedPartition};
use crate::gpu::MigBackend;
use crate::Error;

/// Read every realized partition on every device.
///
/// Recovered entries have no owning pod. Any hardware read failure is fatal.
pub fn recover_existing_partitions(
    backend: &dyn MigBackend,
) -> Result<BTreeMap<String, PreparedPartition>, Error> {
    let mut recovered = BTreeMap::new();
    for device in backend.devices()? {
        for mig in backend.mig_devices(&device.uuid)? {
            let profile = mig.profile(device.memory_total_bytes);
            info!(
                gpu = %device.uuid,
                partition = %mig.uuid,
                profile = %profile,
                gi = mig.gpu_instance_id,
                ci = mig.compute_instance_id,
                "found existing partition"
            );
            recovered.insert(
                mig.uuid,
                PreparedPartition {
                    profile: profile.to_string(),
                    start: mig.placement.start,
                    size: mig.placement.size,
                    parent: device.uuid.clone(),
                    pod_uuid: String::new(),
                    gi_info_id: mig.gpu_instance_id,
                    ci_info_id: mig.compute_instance_id,
                },
            );
        }
    }
    Ok(recovered)
}

/// Fold recovered partitions into a node record.
///
/// Partitions already in the record keep their owner. New ones are added
/// without an owner. Entries whose partition no longer exists are dropped.
pub fn merge_recovered(spec: &mut MigNodeSpec, recovered: BTreeMap<String, PreparedPartition>) {
    let stale: Vec<String> = spec
        .prepared
        .keys()
        .filter(|k| !recovered.contains_key(*k))
        .cloned()
        .collect();
    for key in stale {
        if let Some(entry) = spec.prepared.remove(&key) {
            warn!(
                partition = %key,
                pod = %entry.pod_uuid,
                "prepared partition no longer exists on the device, dropping it"
            );
        }
    }

    for (key, mut found) in recovered {
        if let Some(known) = spec.prepared.get(&key) {
            found.pod_uuid = known.pod_uuid.clone();
        }
        spec.prepared.insert(key, found);
    }
}
