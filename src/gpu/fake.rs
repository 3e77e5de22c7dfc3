//! In-memory MIG card for tests
//!
//! Models A100-40GB profiles and enforces placement validity and overlap the
//! way the driver does, so discovery, recovery and the reconciler can run
//! end-to-end without hardware.

use std::collections::HashSet;
use std::sync::Mutex;

use super::{
    GpuDevice, GpuError, GpuInstanceProfileInfo, MigBackend, MigDeviceInfo, SlicePlacement,
    GPU_INSTANCE_PROFILE_1_SLICE_REV1,
};

pub(crate) const A100_40GB_BYTES: u64 = 42_949_672_960;

struct FakeProfile {
    id: u32,
    slice_count: u32,
    memory_size_mb: u64,
    placements: Vec<SlicePlacement>,
}

fn a100_profiles() -> Vec<FakeProfile> {
    let p = |id, slice_count, memory_size_mb, size, starts: &[u32]| FakeProfile {
        id,
        slice_count,
        memory_size_mb,
        placements: starts
            .iter()
            .map(|s| SlicePlacement::new(*s, size))
            .collect(),
    };
    vec![
        p(0, 1, 4864, 1, &[0, 1, 2, 3, 4, 5, 6]),
        p(1, 2, 9856, 2, &[0, 2, 4]),
        p(2, 3, 19968, 4, &[0, 4]),
        p(3, 4, 19968, 4, &[0]),
        p(4, 7, 40192, 8, &[0]),
        p(GPU_INSTANCE_PROFILE_1_SLICE_REV1, 1, 4864, 1, &[0, 1, 2, 3, 4, 5, 6]),
        p(9, 1, 9856, 2, &[0, 2, 4, 6]),
    ]
}

#[derive(Clone)]
struct FakeGpuInstance {
    device: String,
    id: u32,
    profile_id: u32,
    placement: SlicePlacement,
    compute_instances: Vec<(u32, u32, u32)>,
}

struct FakeDevice {
    info: GpuDevice,
    profiles: Vec<FakeProfile>,
}

#[derive(Default)]
struct FakeState {
    instances: Vec<FakeGpuInstance>,
    next_gi_id: u32,
    fail_compute_instance: bool,
    fail_destroy_gi: HashSet<u32>,
    fail_profile_query: Option<(u32, GpuError)>,
    created: Vec<(String, SlicePlacement)>,
    destroyed_ci: Vec<(String, u32, u32)>,
    destroyed_gi: Vec<(String, u32)>,
}

/// A node with one or more fake A100 cards
pub(crate) struct FakeGpu {
    devices: Vec<FakeDevice>,
    state: Mutex<FakeState>,
}

impl FakeGpu {
    /// A node with `count` identical A100-40GB cards named `GPU-<n>`
    pub(crate) fn a100s(count: usize) -> Self {
        let devices = (0..count)
            .map(|i| FakeDevice {
                info: GpuDevice {
                    uuid: format!("GPU-{}", i),
                    name: "NVIDIA A100-PCIE-40GB".to_string(),
                    memory_total_bytes: A100_40GB_BYTES,
                },
                profiles: a100_profiles(),
            })
            .collect();
        Self {
            devices,
            state: Mutex::new(FakeState {
                next_gi_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Drop every profile but the 1-slice one from a device
    pub(crate) fn restrict_profiles(&mut self, device_uuid: &str) {
        if let Some(dev) = self.devices.iter_mut().find(|d| d.info.uuid == device_uuid) {
            dev.profiles.retain(|p| p.id == 0);
        }
    }

    pub(crate) fn fail_compute_instance(&self, fail: bool) {
        self.state.lock().unwrap().fail_compute_instance = fail;
    }

    pub(crate) fn fail_destroy_gpu_instance(&self, gi_id: u32) {
        self.state.lock().unwrap().fail_destroy_gi.insert(gi_id);
    }

    pub(crate) fn fail_profile_query(&self, index: u32, error: GpuError) {
        self.state.lock().unwrap().fail_profile_query = Some((index, error));
    }

    /// Placements passed to successful GPU instance creations
    pub(crate) fn created(&self) -> Vec<(String, SlicePlacement)> {
        self.state.lock().unwrap().created.clone()
    }

    pub(crate) fn destroyed_gpu_instances(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().destroyed_gi.clone()
    }

    pub(crate) fn destroyed_compute_instances(&self) -> Vec<(String, u32, u32)> {
        self.state.lock().unwrap().destroyed_ci.clone()
    }

    /// Number of live GPU instances across all devices
    pub(crate) fn live_gpu_instances(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    fn device(&self, uuid: &str) -> Result<&FakeDevice, GpuError> {
        self.devices
            .iter()
            .find(|d| d.info.uuid == uuid)
            .ok_or_else(|| GpuError::call("nvmlDeviceGetHandleByUUID", "not found"))
    }

    fn mig_uuid(device: &str, gi: u32, ci: u32) -> String {
        format!("MIG-{}-{}-{}", device.trim_start_matches("GPU-"), gi, ci)
    }
}

impl MigBackend for FakeGpu {
    fn devices(&self) -> Result<Vec<GpuDevice>, GpuError> {
        Ok(self.devices.iter().map(|d| d.info.clone()).collect())
    }

    fn gpu_instance_profile(
        &self,
        device_uuid: &str,
        profile_index: u32,
    ) -> Result<GpuInstanceProfileInfo, GpuError> {
        if let Some((index, err)) = &self.state.lock().unwrap().fail_profile_query {
            if *index == profile_index {
                return Err(err.clone());
            }
        }
        let dev = self.device(device_uuid)?;
        if profile_index > 9 {
            return Err(GpuError::InvalidArgument(format!("profile {}", profile_index)));
        }
        dev.profiles
            .iter()
            .find(|p| p.id == profile_index)
            .map(|p| GpuInstanceProfileInfo {
                id: p.id,
                slice_count: p.slice_count,
                memory_size_mb: p.memory_size_mb,
            })
            .ok_or_else(|| GpuError::NotSupported(format!("profile {}", profile_index)))
    }

    fn possible_placements(
        &self,
        device_uuid: &str,
        profile: &GpuInstanceProfileInfo,
    ) -> Result<Vec<SlicePlacement>, GpuError> {
        let dev = self.device(device_uuid)?;
        dev.profiles
            .iter()
            .find(|p| p.id == profile.id)
            .map(|p| p.placements.clone())
            .ok_or_else(|| GpuError::NotSupported(format!("profile {}", profile.id)))
    }

    fn create_gpu_instance(
        &self,
        device_uuid: &str,
        profile: &GpuInstanceProfileInfo,
        placement: SlicePlacement,
    ) -> Result<u32, GpuError> {
        let valid = self.possible_placements(device_uuid, profile)?;
        if !valid.contains(&placement) {
            return Err(GpuError::InvalidArgument(format!(
                "placement {}:{} for profile {}",
                placement.start, placement.size, profile.id
            )));
        }
        let mut state = self.state.lock().unwrap();
        let end = placement.start + placement.size;
        let overlaps = state.instances.iter().any(|gi| {
            gi.device == device_uuid
                && gi.placement.start < end
                && placement.start < gi.placement.start + gi.placement.size
        });
        if overlaps {
            return Err(GpuError::call(
                "nvmlDeviceCreateGpuInstanceWithPlacement",
                "insufficient resources",
            ));
        }
        let id = state.next_gi_id;
        state.next_gi_id += 1;
        state.instances.push(FakeGpuInstance {
            device: device_uuid.to_string(),
            id,
            profile_id: profile.id,
            placement,
            compute_instances: Vec::new(),
        });
        state.created.push((device_uuid.to_string(), placement));
        Ok(id)
    }

    fn create_compute_instance(
        &self,
        device_uuid: &str,
        gpu_instance_id: u32,
        ci_profile_id: u32,
        ci_eng_profile_id: u32,
    ) -> Result<u32, GpuError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_compute_instance {
            return Err(GpuError::call(
                "nvmlGpuInstanceCreateComputeInstance",
                "insufficient resources",
            ));
        }
        let gi = state
            .instances
            .iter_mut()
            .find(|gi| gi.device == device_uuid && gi.id == gpu_instance_id)
            .ok_or_else(|| GpuError::call("nvmlDeviceGetGpuInstanceById", "not found"))?;
        let ci_id = gi.compute_instances.len() as u32;
        gi.compute_instances
            .push((ci_id, ci_profile_id, ci_eng_profile_id));
        Ok(ci_id)
    }

    fn mig_devices(&self, device_uuid: &str) -> Result<Vec<MigDeviceInfo>, GpuError> {
        let dev = self.device(device_uuid)?;
        let state = self.state.lock().unwrap();
        let mut migs = Vec::new();
        for gi in state.instances.iter().filter(|gi| gi.device == device_uuid) {
            let gi_profile = dev
                .profiles
                .iter()
                .find(|p| p.id == gi.profile_id)
                .ok_or_else(|| GpuError::call("nvmlGpuInstanceGetInfo", "unknown profile"))?;
            for (ci_id, ci_profile_id, ci_eng) in &gi.compute_instances {
                let ci_slices = dev
                    .profiles
                    .iter()
                    .find(|p| p.id == *ci_profile_id)
                    .map(|p| p.slice_count.min(gi_profile.slice_count))
                    .unwrap_or(gi_profile.slice_count);
                migs.push(MigDeviceInfo {
                    uuid: Self::mig_uuid(device_uuid, gi.id, *ci_id),
                    gpu_instance_id: gi.id,
                    compute_instance_id: *ci_id,
                    gi_profile_id: gi.profile_id,
                    ci_profile_id: *ci_profile_id,
                    ci_eng_profile_id: *ci_eng,
                    gi_slice_count: gi_profile.slice_count,
                    ci_slice_count: ci_slices,
                    memory_size_mb: gi_profile.memory_size_mb,
                    placement: gi.placement,
                });
            }
        }
        Ok(migs)
    }

    fn destroy_compute_instance(
        &self,
        device_uuid: &str,
        gpu_instance_id: u32,
        compute_instance_id: u32,
    ) -> Result<(), GpuError> {
        let mut state = self.state.lock().unwrap();
        let gi = state
            .instances
            .iter_mut()
            .find(|gi| gi.device == device_uuid && gi.id == gpu_instance_id)
            .ok_or_else(|| GpuError::call("nvmlDeviceGetGpuInstanceById", "not found"))?;
        let before = gi.compute_instances.len();
        gi.compute_instances
            .retain(|(id, _, _)| *id != compute_instance_id);
        if gi.compute_instances.len() == before {
            return Err(GpuError::call(
                "nvmlGpuInstanceGetComputeInstanceById",
                "not found",
            ));
        }
        state.destroyed_ci.push((
            device_uuid.to_string(),
            gpu_instance_id,
            compute_instance_id,
        ));
        Ok(())
    }

    fn destroy_gpu_instance(
        &self,
        device_uuid: &str,
        gpu_instance_id: u32,
    ) -> Result<(), GpuError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_destroy_gi.contains(&gpu_instance_id) {
            return Err(GpuError::call("nvmlGpuInstanceDestroy", "in use"));
        }
        let pos = state
            .instances
            .iter()
            .position(|gi| gi.device == device_uuid && gi.id == gpu_instance_id)
            .ok_or_else(|| GpuError::call("nvmlDeviceGetGpuInstanceById", "not found"))?;
        if !state.instances[pos].compute_instances.is_empty() {
            return Err(GpuError::call("nvmlGpuInstanceDestroy", "in use"));
        }
        state.instances.remove(pos);
        state
            .destroyed_gi
            .push((device_uuid.to_string(), gpu_instance_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlapping_placements() {
        let gpu = FakeGpu::a100s(1);
        let one_slice = gpu.gpu_instance_profile("GPU-0", 0).unwrap();
        let two_slice = gpu.gpu_instance_profile("GPU-0", 1).unwrap();
        gpu.create_gpu_instance("GPU-0", &one_slice, SlicePlacement::new(1, 1))
            .unwrap();
        assert!(gpu
            .create_gpu_instance("GPU-0", &two_slice, SlicePlacement::new(0, 2))
            .is_err());
    }

    #[test]
    fn gpu_instance_with_compute_instances_cannot_be_destroyed() {
        let gpu = FakeGpu::a100s(1);
        let profile = gpu.gpu_instance_profile("GPU-0", 0).unwrap();
        let gi = gpu
            .create_gpu_instance("GPU-0", &profile, SlicePlacement::new(0, 1))
            .unwrap();
        let ci = gpu.create_compute_instance("GPU-0", gi, 0, 0).unwrap();
        assert!(gpu.destroy_gpu_instance("GPU-0", gi).is_err());
        gpu.destroy_compute_instance("GPU-0", gi, ci).unwrap();
        gpu.destroy_gpu_instance("GPU-0", gi).unwrap();
        assert_eq!(gpu.live_gpu_instances(), 0);
    }
}
