//! GPU partitioning seam
//!
//! [`MigBackend`] lists every hardware call the controller makes. The
//! production implementation talks to NVML ([`nvml::NvmlBackend`]); tests use
//! an in-memory card.

pub mod nvml;
pub mod profile;

#[cfg(test)]
pub(crate) mod fake;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use profile::{describe_profile, memory_size_gb, MigProfile};

/// Number of GPU instance profile indices the hardware can report
pub const GPU_INSTANCE_PROFILE_COUNT: u32 = 13;

/// GPU instance profile id of the 1-slice media extension variant
pub const GPU_INSTANCE_PROFILE_1_SLICE_REV1: u32 = 7;

/// Compute instance engine profile shared by all compute instances
pub const COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED: u32 = 0;

/// Hardware errors reported by the partitioning engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GpuError {
    /// The device does not support the requested profile or operation
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The device rejected an argument (e.g. an unknown profile index)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A hardware call failed
    #[error("{operation} failed: {message}")]
    Call {
        /// Name of the failing call
        operation: String,
        /// Reason reported by the driver
        message: String,
    },

    /// The management library could not be loaded or initialized
    #[error("management library unavailable: {0}")]
    Library(String),
}

impl GpuError {
    /// Create a call failure for the named operation
    pub fn call(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Call {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Unsupported and invalid-argument answers mean "this profile does not
    /// apply here" during enumeration and are skipped rather than fatal.
    pub fn is_skippable(&self) -> bool {
        matches!(self, GpuError::NotSupported(_) | GpuError::InvalidArgument(_))
    }
}

/// A physical GPU visible to the partitioning engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuDevice {
    /// Hardware UUID (`GPU-...`)
    pub uuid: String,
    /// Marketing model name
    pub name: String,
    /// Total device memory in bytes
    pub memory_total_bytes: u64,
}

/// Offset/size pair locating a GPU instance in the device's slice space
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct SlicePlacement {
    /// First memory slice occupied
    pub start: u32,
    /// Number of memory slices occupied
    pub size: u32,
}

impl SlicePlacement {
    /// Create a placement
    pub fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }
}

/// GPU instance profile info as reported by the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuInstanceProfileInfo {
    /// Profile id as accepted by GPU instance creation
    pub id: u32,
    /// GPU slices covered by one instance of this profile
    pub slice_count: u32,
    /// Memory assigned to one instance in MiB
    pub memory_size_mb: u64,
}

/// A realized partition (MIG device) found on a physical GPU
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigDeviceInfo {
    /// Partition UUID (`MIG-...`)
    pub uuid: String,
    /// Id of the GPU instance backing the partition
    pub gpu_instance_id: u32,
    /// Id of the compute instance inside the GPU instance
    pub compute_instance_id: u32,
    /// Profile id of the GPU instance
    pub gi_profile_id: u32,
    /// Profile id of the compute instance
    pub ci_profile_id: u32,
    /// Engine profile id of the compute instance
    pub ci_eng_profile_id: u32,
    /// GPU slices of the GPU instance
    pub gi_slice_count: u32,
    /// Compute slices of the compute instance
    pub ci_slice_count: u32,
    /// Memory of the GPU instance in MiB
    pub memory_size_mb: u64,
    /// Placement of the GPU instance
    pub placement: SlicePlacement,
}

impl MigDeviceInfo {
    /// Canonical profile descriptor of this partition on a device with the
    /// given total memory
    pub fn profile(&self, memory_total_bytes: u64) -> MigProfile {
        describe_profile(
            self.gi_profile_id,
            self.ci_profile_id,
            self.ci_eng_profile_id,
            self.gi_slice_count,
            self.ci_slice_count,
            self.memory_size_mb,
            memory_total_bytes,
        )
    }
}

/// Hardware calls used by discovery, recovery and the reconciler.
///
/// Devices are addressed by UUID, GPU and compute instances by their numeric
/// ids on that device. Implementations must not run two mutating calls
/// (create/destroy) at the same time.
#[cfg_attr(test, automock)]
pub trait MigBackend: Send + Sync {
    /// List the physical devices in index order
    fn devices(&self) -> Result<Vec<GpuDevice>, GpuError>;

    /// Get GPU instance profile info for a profile index
    fn gpu_instance_profile(
        &self,
        device_uuid: &str,
        profile_index: u32,
    ) -> Result<GpuInstanceProfileInfo, GpuError>;

    /// List every placement a GPU instance of the profile may occupy
    fn possible_placements(
        &self,
        device_uuid: &str,
        profile: &GpuInstanceProfileInfo,
    ) -> Result<Vec<SlicePlacement>, GpuError>;

    /// Create a GPU instance at an exact placement, returning its id
    fn create_gpu_instance(
        &self,
        device_uuid: &str,
        profile: &GpuInstanceProfileInfo,
        placement: SlicePlacement,
    ) -> Result<u32, GpuError>;

    /// Create a compute instance inside a GPU instance, returning its id
    fn create_compute_instance(
        &self,
        device_uuid: &str,
        gpu_instance_id: u32,
        ci_profile_id: u32,
        ci_eng_profile_id: u32,
    ) -> Result<u32, GpuError>;

    /// List realized partitions on a device
    fn mig_devices(&self, device_uuid: &str) -> Result<Vec<MigDeviceInfo>, GpuError>;

    /// Destroy a compute instance
    fn destroy_compute_instance(
        &self,
        device_uuid: &str,
        gpu_instance_id: u32,
        compute_instance_id: u32,
    ) -> Result<(), GpuError>;

    /// Destroy a GPU instance; its compute instances must already be gone
    fn destroy_gpu_instance(&self, device_uuid: &str, gpu_instance_id: u32)
        -> Result<(), GpuError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_skips_only_unsupported_and_invalid() {
        assert!(GpuError::NotSupported("profile 5".into()).is_skippable());
        assert!(GpuError::InvalidArgument("profile 12".into()).is_skippable());
        assert!(!GpuError::call("nvmlDeviceGetGpuInstanceProfileInfo", "unknown").is_skippable());
        assert!(!GpuError::Library("libnvidia-ml.so.1 missing".into()).is_skippable());
    }

    #[test]
    fn realized_partition_profile_matches_catalog_name() {
        let mig = MigDeviceInfo {
            uuid: "MIG-1".into(),
            gpu_instance_id: 7,
            compute_instance_id: 0,
            gi_profile_id: 0,
            ci_profile_id: 0,
            ci_eng_profile_id: COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
            gi_slice_count: 1,
            ci_slice_count: 1,
            memory_size_mb: 4864,
            placement: SlicePlacement::new(0, 1),
        };
        assert_eq!(mig.profile(42_949_672_960).to_string(), "1g.5gb");
    }
}
