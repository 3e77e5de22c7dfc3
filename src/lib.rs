//! migslicer - per-node MIG slicing controller
//!
//! A cluster scheduler decides which pod gets which MIG slice on which GPU
//! and writes that decision into the node's [`crd::MigNode`] record. The
//! controller running on the node turns those allocations into real GPU and
//! compute instances, advertises them to the pod, and destroys them when the
//! pod is gone.
//!
//! # Modules
//!
//! - [`crd`] - MigNode record and the prepared-partition registry
//! - [`gpu`] - partitioning seam, profile naming, NVML backend
//! - [`discovery`] - supported profiles and placements per device
//! - [`recovery`] - partitions that already exist at startup
//! - [`controller`] - allocation reconciler and teardown
//! - [`capacity`] - node labels and per-pod extended resources
//! - [`startup`] - one-time node preparation
//! - [`config`] - process configuration
//! - [`retry`] - backoff for startup cluster calls
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod capacity;
pub mod config;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod gpu;
pub mod recovery;
pub mod retry;
pub mod startup;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
