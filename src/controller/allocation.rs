//! Carving a partition for one allocation
//!
//! Creation is two-phase: a GPU instance at the scheduler's placement, then a
//! compute instance inside it. If the second phase or the confirmation scan
//! fails, whatever the first phase created is destroyed again so no
//! half-built partition outlives the attempt.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::crd::{Allocation, MigNodeSpec, PreparedPartition};
use crate::gpu::{GpuDevice, MigBackend, MigDeviceInfo};
use crate::Error;

/// Environment keys through which a container sees its slice
pub const VISIBLE_DEVICES_KEYS: [&str; 2] = ["NVIDIA_VISIBLE_DEVICES", "CUDA_VISIBLE_DEVICES"];

/// A partition backing an allocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealizedPartition {
    /// Partition UUID
    pub uuid: String,
    /// Registry entry to record for it
    pub prepared: PreparedPartition,
    /// Whether an existing partition was taken over instead of created
    pub adopted: bool,
}

/// Make sure a partition exists for a `creating` allocation.
///
/// A partition already on the device with the allocation's profile and
/// placement that no other pod owns is adopted. Otherwise one is created.
pub fn realize(
    backend: &dyn MigBackend,
    spec: &MigNodeSpec,
    allocation: &Allocation,
) -> Result<RealizedPartition, Error> {
    let device = target_device(backend, allocation)?;

    if let Some(existing) = adoptable(backend, spec, &device, allocation)? {
        info!(partition = %existing.uuid, "adopting existing partition");
        return Ok(realized(&device, allocation, existing, true));
    }

    let profile = backend.gpu_instance_profile(&device.uuid, allocation.gi_profile_id)?;
    let gi = backend.create_gpu_instance(&device.uuid, &profile, allocation.placement())?;
    debug!(gi, start = allocation.start, size = allocation.size, "created GPU instance");

    let ci = match backend.create_compute_instance(
        &device.uuid,
        gi,
        allocation.ci_profile_id,
        allocation.ci_eng_profile_id,
    ) {
        Ok(ci) => ci,
        Err(e) => {
            compensate(backend, &device.uuid, gi, None);
            return Err(e.into());
        }
    };
    debug!(gi, ci, "created compute instance");

    match confirm(backend, &device, allocation, gi, ci) {
        Ok(mig) => Ok(realized(&device, allocation, mig, false)),
        Err(e) => {
            compensate(backend, &device.uuid, gi, Some(ci));
            Err(e)
        }
    }
}

fn realized(
    device: &GpuDevice,
    allocation: &Allocation,
    mig: MigDeviceInfo,
    adopted: bool,
) -> RealizedPartition {
    RealizedPartition {
        prepared: PreparedPartition {
            profile: allocation.profile.clone(),
            start: mig.placement.start,
            size: mig.placement.size,
            parent: device.uuid.clone(),
            pod_uuid: allocation.pod_uuid.clone(),
            gi_info_id: mig.gpu_instance_id,
            ci_info_id: mig.compute_instance_id,
        },
        uuid: mig.uuid,
        adopted,
    }
}

/// The device an allocation was scheduled onto
pub(super) fn target_device(backend: &dyn MigBackend, allocation: &Allocation) -> Result<GpuDevice, Error> {
    backend
        .devices()?
        .into_iter()
        .find(|d| d.uuid == allocation.gpu_uuid)
        .ok_or_else(|| Error::not_found(format!("GPU {}", allocation.gpu_uuid)))
}

/// A partition with the allocation's profile and placement that no other pod
/// owns in the registry
pub(super) fn adoptable(
    backend: &dyn MigBackend,
    spec: &MigNodeSpec,
    device: &GpuDevice,
    allocation: &Allocation,
) -> Result<Option<MigDeviceInfo>, Error> {
    let placement = allocation.placement();
    Ok(backend.mig_devices(&device.uuid)?.into_iter().find(|mig| {
        mig.placement == placement
            && mig.profile(device.memory_total_bytes).to_string() == allocation.profile
            && !spec.claimed_by_other(&mig.uuid, &allocation.pod_uuid)
    }))
}

/// Find the partition just created and check it carries the requested profile
fn confirm(
    backend: &dyn MigBackend,
    device: &GpuDevice,
    allocation: &Allocation,
    gi: u32,
    ci: u32,
) -> Result<MigDeviceInfo, Error> {
    let mig = backend
        .mig_devices(&device.uuid)?
        .into_iter()
        .find(|m| m.gpu_instance_id == gi && m.compute_instance_id == ci)
        .ok_or_else(|| {
            Error::not_found(format!("partition for GPU instance {} on {}", gi, device.uuid))
        })?;

    let realized = mig.profile(device.memory_total_bytes).to_string();
    if realized != allocation.profile {
        return Err(Error::validation(format!(
            "realized partition has profile {} but {} was requested",
            realized, allocation.profile
        )));
    }
    Ok(mig)
}

/// Undo a partial creation; failures here are only logged
fn compensate(backend: &dyn MigBackend, device: &str, gi: u32, ci: Option<u32>) {
    if let Some(ci) = ci {
        if let Err(e) = backend.destroy_compute_instance(device, gi, ci) {
            warn!(gpu = %device, gi, ci, error = %e, "failed to destroy compute instance of failed partition");
        }
    }
    match backend.destroy_gpu_instance(device, gi) {
        Ok(()) => info!(gpu = %device, gi, "destroyed GPU instance of failed partition"),
        Err(e) => warn!(gpu = %device, gi, error = %e, "failed to destroy GPU instance of failed partition"),
    }
}

/// ConfigMap exposing the partition to the pod's containers
pub fn device_config_map(allocation: &Allocation, partition_uuid: &str) -> ConfigMap {
    let data: BTreeMap<String, String> = VISIBLE_DEVICES_KEYS
        .iter()
        .map(|k| (k.to_string(), partition_uuid.to_string()))
        .collect();
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(allocation.pod_name.clone()),
            namespace: Some(allocation.namespace.clone()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}
