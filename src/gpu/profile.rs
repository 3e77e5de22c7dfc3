//! MIG profile descriptors
//!
//! A profile name such as `1g.5gb` or `1c.2g.10gb+me` is the key the scheduler
//! uses to pick a slice shape. The same function builds it on the discovery
//! path and when confirming a realized partition, so both sides always agree.

use std::fmt;
use std::str::FromStr;

use super::GPU_INSTANCE_PROFILE_1_SLICE_REV1;
use crate::Error;

/// Memory shares are bucketed into eighths of the device
const MEMORY_FRACTION_DENOMINATOR: f64 = 8.0;
const ONE_MIB: u64 = 1024 * 1024;
const ONE_GIB: u64 = 1024 * 1024 * 1024;

/// Attribute suffix of the media extension profile variant
pub const ATTRIBUTE_MEDIA_EXTENSIONS: &str = "me";

/// Memory size in GB advertised for a partition.
///
/// The partition's share of device memory is rounded *up* to the next eighth,
/// then scaled by the device size rounded up to whole GiB and rounded to the
/// nearest integer.
pub fn memory_size_gb(total_device_memory_bytes: u64, partition_memory_mb: u64) -> u64 {
    if total_device_memory_bytes == 0 {
        return 0;
    }
    let share =
        (partition_memory_mb as f64 * ONE_MIB as f64) / total_device_memory_bytes as f64;
    let share = (share * MEMORY_FRACTION_DENOMINATOR).ceil() / MEMORY_FRACTION_DENOMINATOR;
    let total_gb = total_device_memory_bytes.div_ceil(ONE_GIB) as f64;
    (share * total_gb).round() as u64
}

/// Build the descriptor of a profile from raw hardware metadata
pub fn describe_profile(
    gi_profile_id: u32,
    ci_profile_id: u32,
    ci_eng_profile_id: u32,
    gi_slice_count: u32,
    ci_slice_count: u32,
    partition_memory_mb: u64,
    total_device_memory_bytes: u64,
) -> MigProfile {
    MigProfile {
        compute_slices: ci_slice_count,
        gpu_slices: gi_slice_count,
        memory_gb: memory_size_gb(total_device_memory_bytes, partition_memory_mb),
        gi_profile_id,
        ci_profile_id,
        ci_eng_profile_id,
    }
}

/// A slice profile together with its partitioning engine identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigProfile {
    /// Compute slices (C)
    pub compute_slices: u32,
    /// GPU slices (G)
    pub gpu_slices: u32,
    /// Memory in GB
    pub memory_gb: u64,
    /// GPU instance profile id
    pub gi_profile_id: u32,
    /// Compute instance profile id
    pub ci_profile_id: u32,
    /// Compute instance engine profile id
    pub ci_eng_profile_id: u32,
}

impl MigProfile {
    /// The name-level shape of this profile
    pub fn shape(&self) -> ProfileShape {
        ProfileShape {
            compute_slices: self.compute_slices,
            gpu_slices: self.gpu_slices,
            memory_gb: self.memory_gb,
            media_extensions: self.gi_profile_id == GPU_INSTANCE_PROFILE_1_SLICE_REV1,
        }
    }
}

impl fmt::Display for MigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shape().fmt(f)
    }
}

/// What a profile name says about a slice, without hardware ids
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileShape {
    /// Compute slices (C)
    pub compute_slices: u32,
    /// GPU slices (G)
    pub gpu_slices: u32,
    /// Memory in GB
    pub memory_gb: u64,
    /// `+me` variant
    pub media_extensions: bool,
}

impl fmt::Display for ProfileShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.compute_slices != self.gpu_slices {
            write!(f, "{}c.", self.compute_slices)?;
        }
        write!(f, "{}g.{}gb", self.gpu_slices, self.memory_gb)?;
        if self.media_extensions {
            write!(f, "+{}", ATTRIBUTE_MEDIA_EXTENSIONS)?;
        }
        Ok(())
    }
}

impl FromStr for ProfileShape {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::validation(format!("invalid MIG profile name '{}'", name));

        let (body, attributes) = match name.split_once('+') {
            Some((body, attrs)) => (body, Some(attrs)),
            None => (name, None),
        };
        let media_extensions = match attributes {
            None => false,
            Some(ATTRIBUTE_MEDIA_EXTENSIONS) => true,
            Some(_) => return Err(invalid()),
        };

        let parts: Vec<&str> = body.split('.').collect();
        let (compute, gpu, memory) = match parts.as_slice() {
            [c, g, m] => (Some(*c), *g, *m),
            [g, m] => (None, *g, *m),
            _ => return Err(invalid()),
        };

        let gpu_slices: u32 = gpu
            .strip_suffix('g')
            .and_then(|g| g.parse().ok())
            .ok_or_else(invalid)?;
        let memory_gb: u64 = memory
            .strip_suffix("gb")
            .and_then(|m| m.parse().ok())
            .ok_or_else(invalid)?;
        let compute_slices = match compute {
            Some(c) => c
                .strip_suffix('c')
                .and_then(|c| c.parse().ok())
                .ok_or_else(invalid)?,
            None => gpu_slices,
        };

        Ok(ProfileShape {
            compute_slices,
            gpu_slices,
            memory_gb,
            media_extensions,
        })
    }
}
