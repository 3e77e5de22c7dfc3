//! Shared types for the MigNode CRD

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::gpu::SlicePlacement;

/// Lifecycle state of an allocation
///
/// The scheduler writes `creating` and `deleted`; only the controller moves an
/// allocation to `created`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// Waiting for the partition to be carved
    #[default]
    Creating,
    /// Partition realized and advertised
    Created,
    /// Pod is gone, partition must be torn down
    Deleted,
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationStatus::Creating => write!(f, "creating"),
            AllocationStatus::Created => write!(f, "created"),
            AllocationStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// One slice request for one pod
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// UID of the requesting pod
    #[serde(rename = "podUUID")]
    pub pod_uuid: String,

    /// Device the scheduler placed the slice on
    #[serde(rename = "gpuUUID")]
    pub gpu_uuid: String,

    /// Name of the requesting pod
    pub pod_name: String,

    /// Namespace of the requesting pod
    pub namespace: String,

    /// Profile name, e.g. `1g.5gb`
    pub profile: String,

    /// GPU instance profile index
    pub gi_profile_id: u32,

    /// Compute instance profile index
    pub ci_profile_id: u32,

    /// Compute instance engine profile
    pub ci_eng_profile_id: u32,

    /// First memory slice of the chosen placement
    pub start: u32,

    /// Number of memory slices of the chosen placement
    pub size: u32,

    /// Lifecycle state
    #[serde(default)]
    pub allocation_status: AllocationStatus,
}

impl Allocation {
    /// The placement the scheduler chose for this allocation
    pub fn placement(&self) -> SlicePlacement {
        SlicePlacement::new(self.start, self.size)
    }

    /// Check the fields the reconciler depends on
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.pod_uuid.is_empty() {
            return Err(crate::Error::validation("allocation has no pod UUID"));
        }
        if self.pod_name.is_empty() || self.namespace.is_empty() {
            return Err(crate::Error::validation(format!(
                "allocation {} has no pod name or namespace",
                self.pod_uuid
            )));
        }
        if self.gpu_uuid.is_empty() {
            return Err(crate::Error::validation(format!(
                "allocation {} has no target GPU",
                self.pod_uuid
            )));
        }
        if self.size == 0 {
            return Err(crate::Error::validation(format!(
                "allocation {} has an empty placement",
                self.pod_uuid
            )));
        }
        self.profile
            .parse::<crate::gpu::profile::ProfileShape>()
            .map(|_| ())
    }
}

/// A realized partition and the pod it backs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreparedPartition {
    /// Profile name of the partition
    pub profile: String,

    /// First memory slice of the GPU instance
    pub start: u32,

    /// Number of memory slices of the GPU instance
    pub size: u32,

    /// UUID of the physical device
    pub parent: String,

    /// Owning pod; empty for partitions found at startup that nobody claimed
    #[serde(rename = "podUUID", default)]
    pub pod_uuid: String,

    /// GPU instance id on the parent device
    pub gi_info_id: u32,

    /// Compute instance id inside the GPU instance
    pub ci_info_id: u32,
}

impl PreparedPartition {
    /// Placement of the backing GPU instance
    pub fn placement(&self) -> SlicePlacement {
        SlicePlacement::new(self.start, self.size)
    }

    /// Whether no pod owns this partition yet
    pub fn is_orphan(&self) -> bool {
        self.pod_uuid.is_empty()
    }
}

/// A profile the node can carve and every placement it may take
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementCatalogEntry {
    /// Valid placements for this profile
    pub placements: Vec<SlicePlacement>,

    /// Profile name
    pub profile: String,

    /// GPU instance profile index
    pub gi_profile_id: u32,

    /// Compute instance profile index
    pub ci_profile_id: u32,

    /// Compute instance engine profile
    pub ci_eng_profile_id: u32,
}

/// Status of a MigNode
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigNodeStatus {
    /// `"true"` once discovery and recovery have run for this node
    #[serde(default)]
    pub processed: String,
}

impl MigNodeStatus {
    /// Status value written after startup discovery
    pub fn processed() -> Self {
        Self {
            processed: "true".to_string(),
        }
    }

    /// Whether startup discovery has already populated the record
    pub fn is_processed(&self) -> bool {
        self.processed == "true"
    }
}
