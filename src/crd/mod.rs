//! Custom Resource Definitions for migslicer
//!
//! The MigNode record is the only resource the controller owns.

mod mig_node;
mod types;

pub use mig_node::{MigNode, MigNodeSpec};
pub use types::{
    Allocation, AllocationStatus, MigNodeStatus, PlacementCatalogEntry, PreparedPartition,
};
