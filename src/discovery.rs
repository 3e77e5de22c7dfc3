//! Placement discovery
//!
//! Walks every GPU instance profile index on every device and records which
//! profiles the device supports and where instances of each may be placed.
//! The scheduler picks placements from this catalog, so the profile names
//! here must be exactly the names the reconciler later matches on realized
//! partitions.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crd::{MigNodeSpec, PlacementCatalogEntry};
use crate::gpu::{
    describe_profile, GpuDevice, GpuError, MigBackend, COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
    GPU_INSTANCE_PROFILE_COUNT,
};
use crate::Error;

/// Catalog of one physical device
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCatalog {
    /// Device UUID
    pub uuid: String,
    /// Model name
    pub model: String,
    /// Total device memory in bytes
    pub memory_total_bytes: u64,
    /// Supported profiles and their placements
    pub placements: Vec<PlacementCatalogEntry>,
}

/// Result of discovery across all devices of the node
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Discovery {
    /// Per-device catalogs in device index order
    pub devices: Vec<DeviceCatalog>,
}

impl Discovery {
    /// Device UUID to model name
    pub fn gpu_models(&self) -> BTreeMap<String, String> {
        self.devices
            .iter()
            .map(|d| (d.uuid.clone(), d.model.clone()))
            .collect()
    }

    /// Whether every device reported the same catalog
    pub fn is_homogeneous(&self) -> bool {
        self.devices
            .windows(2)
            .all(|pair| pair[0].placements == pair[1].placements)
    }

    /// Catalog advertised in `migPlacement`: the first device's
    pub fn shared_catalog(&self) -> Vec<PlacementCatalogEntry> {
        self.devices
            .first()
            .map(|d| d.placements.clone())
            .unwrap_or_default()
    }

    /// Write the catalog and model map into a node record
    pub fn apply_to(&self, spec: &mut MigNodeSpec) {
        spec.mig_placement = self.shared_catalog();
        spec.mig_gpu_uuid = self.gpu_models();
        spec.mig_placement_by_gpu = if self.is_homogeneous() {
            BTreeMap::new()
        } else {
            warn!(
                devices = self.devices.len(),
                "GPUs on this node support different placements; publishing per-device catalogs"
            );
            self.devices
                .iter()
                .map(|d| (d.uuid.clone(), d.placements.clone()))
                .collect()
        };
    }
}

/// Enumerate supported profiles and placements on every device.
///
/// Profiles a device reports as unsupported or invalid are skipped. Any other
/// hardware error aborts discovery.
pub fn discover_placements(backend: &dyn MigBackend) -> Result<Discovery, Error> {
    let devices = backend.devices()?;
    if devices.is_empty() {
        return Err(Error::not_found("no GPUs visible to the management library"));
    }

    let mut discovery = Discovery::default();
    for device in devices {
        let placements = device_catalog(backend, &device)?;
        info!(
            gpu = %device.uuid,
            model = %device.name,
            profiles = placements.len(),
            "discovered MIG placements"
        );
        discovery.devices.push(DeviceCatalog {
            uuid: device.uuid,
            model: device.name,
            memory_total_bytes: device.memory_total_bytes,
            placements,
        });
    }
    Ok(discovery)
}

fn device_catalog(
    backend: &dyn MigBackend,
    device: &GpuDevice,
) -> Result<Vec<PlacementCatalogEntry>, GpuError> {
    let mut entries = Vec::new();
    for index in 0..GPU_INSTANCE_PROFILE_COUNT {
        let info = match backend.gpu_instance_profile(&device.uuid, index) {
            Ok(info) => info,
            Err(e) if e.is_skippable() => {
                debug!(gpu = %device.uuid, index, error = %e, "skipping profile");
                continue;
            }
            Err(e) => return Err(e),
        };

        let profile = describe_profile(
            index,
            index,
            COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
            info.slice_count,
            info.slice_count,
            info.memory_size_mb,
            device.memory_total_bytes,
        );
        let placements = backend.possible_placements(&device.uuid, &info)?;

        entries.push(PlacementCatalogEntry {
            placements,
            profile: profile.to_string(),
            gi_profile_id: profile.gi_profile_id,
            ci_profile_id: profile.ci_profile_id,
            ci_eng_profile_id: profile.ci_eng_profile_id,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::fake::FakeGpu;
    use crate::gpu::{MockMigBackend, SlicePlacement};

    fn names(catalog: &[PlacementCatalogEntry]) -> Vec<&str> {
        catalog.iter().map(|e| e.profile.as_str()).collect()
    }

    #[test]
    fn a100_catalog_lists_supported_profiles_only() {
        let gpu = FakeGpu::a100s(1);
        let discovery = discover_placements(&gpu).unwrap();

        assert_eq!(discovery.devices.len(), 1);
        let catalog = &discovery.devices[0].placements;
        assert_eq!(
            names(catalog),
            vec!["1g.5gb", "2g.10gb", "3g.20gb", "4g.20gb", "7g.40gb", "1g.5gb+me", "1g.10gb"]
        );
        assert_eq!(catalog[0].placements.len(), 7);
        assert_eq!(catalog[2].placements, vec![SlicePlacement::new(0, 4), SlicePlacement::new(4, 4)]);
    }

    #[test]
    fn catalog_ids_use_profile_index_and_shared_engine() {
        let gpu = FakeGpu::a100s(1);
        let discovery = discover_placements(&gpu).unwrap();
        for entry in &discovery.devices[0].placements {
            assert_eq!(entry.gi_profile_id, entry.ci_profile_id);
            assert_eq!(entry.ci_eng_profile_id, COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED);
        }
    }

    #[test]
    fn unexpected_hardware_error_is_fatal() {
        let gpu = FakeGpu::a100s(1);
        gpu.fail_profile_query(3, GpuError::call("nvmlDeviceGetGpuInstanceProfileInfo", "GPU is lost"));
        let err = discover_placements(&gpu).unwrap_err();
        assert!(matches!(err, Error::Gpu(GpuError::Call { .. })));
    }

    #[test]
    fn placement_query_failure_is_fatal() {
        let mut backend = MockMigBackend::new();
        backend.expect_devices().returning(|| {
            Ok(vec![GpuDevice {
                uuid: "GPU-0".to_string(),
                name: "NVIDIA A100-PCIE-40GB".to_string(),
                memory_total_bytes: 42_949_672_960,
            }])
        });
        backend.expect_gpu_instance_profile().returning(|_, index| {
            Ok(crate::gpu::GpuInstanceProfileInfo {
                id: index,
                slice_count: 1,
                memory_size_mb: 4864,
            })
        });
        backend
            .expect_possible_placements()
            .returning(|_, _| Err(GpuError::call("nvmlDeviceGetGpuInstancePossiblePlacements_v2", "unknown")));

        assert!(discover_placements(&backend).is_err());
    }

    #[test]
    fn node_without_gpus_is_an_error() {
        let mut backend = MockMigBackend::new();
        backend.expect_devices().returning(|| Ok(vec![]));
        assert!(matches!(discover_placements(&backend), Err(Error::NotFound(_))));
    }

    #[test]
    fn identical_devices_share_one_catalog() {
        let gpu = FakeGpu::a100s(2);
        let discovery = discover_placements(&gpu).unwrap();
        assert!(discovery.is_homogeneous());

        let mut spec = MigNodeSpec::default();
        discovery.apply_to(&mut spec);
        assert_eq!(spec.mig_placement.len(), 7);
        assert!(spec.mig_placement_by_gpu.is_empty());
        assert_eq!(spec.mig_gpu_uuid.len(), 2);
        assert_eq!(spec.mig_gpu_uuid["GPU-1"], "NVIDIA A100-PCIE-40GB");
    }

    #[test]
    fn differing_devices_get_per_device_catalogs() {
        let mut gpu = FakeGpu::a100s(2);
        gpu.restrict_profiles("GPU-1");
        let discovery = discover_placements(&gpu).unwrap();
        assert!(!discovery.is_homogeneous());

        let mut spec = MigNodeSpec::default();
        discovery.apply_to(&mut spec);
        assert_eq!(spec.mig_placement.len(), 7);
        assert_eq!(spec.mig_placement_by_gpu["GPU-0"].len(), 7);
        assert_eq!(names(&spec.mig_placement_by_gpu["GPU-1"]), vec!["1g.5gb"]);
    }

    #[test]
    fn catalog_names_match_realized_partition_names() {
        let gpu = FakeGpu::a100s(1);
        let discovery = discover_placements(&gpu).unwrap();
        let device = &discovery.devices[0];

        for entry in &device.placements {
            let info = gpu.gpu_instance_profile("GPU-0", entry.gi_profile_id).unwrap();
            let placement = entry.placements[0];
            let gi = gpu.create_gpu_instance("GPU-0", &info, placement).unwrap();
            let ci = gpu
                .create_compute_instance("GPU-0", gi, entry.ci_profile_id, entry.ci_eng_profile_id)
                .unwrap();

            let realized = gpu
                .mig_devices("GPU-0")
                .unwrap()
                .into_iter()
                .find(|m| m.gpu_instance_id == gi)
                .expect("partition should be listed");
            assert_eq!(realized.profile(device.memory_total_bytes).to_string(), entry.profile);

            gpu.destroy_compute_instance("GPU-0", gi, ci).unwrap();
            gpu.destroy_gpu_instance("GPU-0", gi).unwrap();
        }
    }
}
