//! MigNode Custom Resource Definition
//!
//! One MigNode exists per GPU node, named after the node. The scheduler writes
//! allocations into it; the node's controller records the partitions it carves
//! (`prepared`) and, once at startup, the catalog of profiles and placements
//! the node's devices support.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Allocation, AllocationStatus, MigNodeStatus, PlacementCatalogEntry, PreparedPartition,
};

/// Specification for a MigNode
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "migslicer.dev",
    version = "v1alpha1",
    kind = "MigNode",
    plural = "mignodes",
    shortname = "mn",
    status = "MigNodeStatus",
    namespaced,
    printcolumn = r#"{"name":"Processed","type":"string","jsonPath":".status.processed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigNodeSpec {
    /// Slice requests keyed by pod UID
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocations: BTreeMap<String, Allocation>,

    /// Realized partitions keyed by partition UUID
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prepared: BTreeMap<String, PreparedPartition>,

    /// Profiles and placements the node supports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mig_placement: Vec<PlacementCatalogEntry>,

    /// Per-device catalogs, only present when devices differ
    #[serde(
        rename = "migPlacementByGPU",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub mig_placement_by_gpu: BTreeMap<String, Vec<PlacementCatalogEntry>>,

    /// Device UUID to model name
    #[serde(rename = "migGPUUUID", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mig_gpu_uuid: BTreeMap<String, String>,
}

impl MigNodeSpec {
    /// Allocations waiting for a partition, in key order
    pub fn creating(&self) -> impl Iterator<Item = &Allocation> {
        self.with_status(AllocationStatus::Creating)
    }

    /// Allocations the reconciler still has to act on, in key order
    pub fn pending(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values().filter(|a| {
            matches!(
                a.allocation_status,
                AllocationStatus::Creating | AllocationStatus::Deleted
            )
        })
    }

    fn with_status(&self, status: AllocationStatus) -> impl Iterator<Item = &Allocation> {
        self.allocations
            .values()
            .filter(move |a| a.allocation_status == status)
    }

    /// Whether any allocation still needs a partition
    pub fn has_creating(&self) -> bool {
        self.creating().next().is_some()
    }

    /// Prepared partition keys owned by a pod
    pub fn prepared_for_pod(&self, pod_uuid: &str) -> Vec<String> {
        self.prepared
            .iter()
            .filter(|(_, p)| p.pod_uuid == pod_uuid)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Whether a partition is recorded as backing a different pod
    pub fn claimed_by_other(&self, partition_uuid: &str, pod_uuid: &str) -> bool {
        self.prepared
            .get(partition_uuid)
            .is_some_and(|p| !p.is_orphan() && p.pod_uuid != pod_uuid)
    }

    /// Record a realized partition and promote its allocation to `created`
    pub fn complete_creation(
        &mut self,
        pod_uuid: &str,
        partition_uuid: String,
        prepared: PreparedPartition,
    ) {
        if let Some(allocation) = self.allocations.get_mut(pod_uuid) {
            allocation.allocation_status = AllocationStatus::Created;
        }
        self.prepared.insert(partition_uuid, prepared);
    }

    /// Drop an allocation and the prepared entries torn down for it
    pub fn complete_deletion(&mut self, pod_uuid: &str, prepared_keys: &[String]) {
        for key in prepared_keys {
            self.prepared.remove(key);
        }
        self.allocations.remove(pod_uuid);
    }
}
