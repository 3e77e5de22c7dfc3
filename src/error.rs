//! Error types for the MIG slicing controller
//!
//! Cluster API failures, hardware failures and record validation problems are
//! kept apart so callers can decide which ones are worth a retry.

use thiserror::Error;

use crate::gpu::GpuError;

/// Main error type for migslicer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Partitioning hardware error
    #[error("gpu error: {0}")]
    Gpu(#[from] GpuError),

    /// The node record or an allocation in it is malformed
    #[error("validation error: {0}")]
    Validation(String),

    /// A device, partition or record the operation needs does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if retrying the failed step can succeed without outside changes
    ///
    /// Validation and configuration errors need a fixed record or flag.
    /// Kubernetes 4xx errors other than conflicts are treated the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409 || !(400..500).contains(&ae.code),
            Error::Kube(_) => true,
            Error::Gpu(e) => !e.is_skippable(),
            Error::Validation(_) => false,
            Error::NotFound(_) => true,
            Error::Serialization(_) => false,
            Error::Config(_) => false,
        }
    }
}
