//! NVML implementation of [`MigBackend`]
//!
//! Device enumeration goes through `nvml-wrapper`. The MIG calls it does not
//! wrap (placement queries, instance create/destroy, MIG handle walking) use
//! the raw bindings from `nvml-wrapper-sys`, loaded from the same library.
//!
//! Profile ids stored in the node record are NVML profile *indices*
//! (`NVML_GPU_INSTANCE_PROFILE_*`, `NVML_COMPUTE_INSTANCE_PROFILE_*`). The
//! hardware ids returned in the profile info structs are only used to talk
//! back to the driver.

use std::ffi::{CStr, OsStr};
use std::mem;
use std::os::raw::{c_char, c_uint};
use std::sync::Mutex;

use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use nvml_wrapper_sys::bindings::*;
use tracing::{debug, info, warn};

use super::{
    GpuDevice, GpuError, GpuInstanceProfileInfo, MigBackend, MigDeviceInfo, SlicePlacement,
    COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED, GPU_INSTANCE_PROFILE_COUNT,
};

/// Default shared object loaded when no library path is configured
pub const DEFAULT_NVML_LIBRARY: &str = "libnvidia-ml.so.1";

/// Number of compute instance profile indices (`NVML_COMPUTE_INSTANCE_PROFILE_COUNT`)
const COMPUTE_INSTANCE_PROFILE_COUNT: u32 = 8;

/// `NVML_DEVICE_UUID_V2_BUFFER_SIZE`
const UUID_BUFFER_SIZE: usize = 96;

/// Upper bound on placements one profile can report
const MAX_PLACEMENTS: usize = 16;

/// NVML-backed partitioning engine
pub struct NvmlBackend {
    nvml: Nvml,
    lib: NvmlLib,
    /// Held across every create/destroy call
    mutation: Mutex<()>,
}

impl NvmlBackend {
    /// Load and initialize the management library at `library_path`
    pub fn new(library_path: &str) -> Result<Self, GpuError> {
        let nvml = Nvml::builder()
            .lib_path(OsStr::new(library_path))
            .init()
            .map_err(|e| GpuError::Library(format!("{}: {}", library_path, e)))?;
        // SAFETY: loading the same shared object nvml-wrapper just initialized.
        // Symbols are resolved at load time; the generated call wrappers panic
        // on a missing one, so the MIG entry points are checked right here.
        let lib = unsafe { NvmlLib::new(library_path) }
            .map_err(|e| GpuError::Library(format!("{}: {}", library_path, e)))?;
        require_symbols(library_path, &mig_symbols(&lib))?;

        let driver = nvml
            .sys_driver_version()
            .unwrap_or_else(|_| "unknown".to_string());
        info!(library = %library_path, driver = %driver, "NVML initialized");

        Ok(Self {
            nvml,
            lib,
            mutation: Mutex::new(()),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, GpuError> {
        self.mutation
            .lock()
            .map_err(|_| GpuError::call("mutex", "hardware mutation lock poisoned"))
    }

    #[allow(non_upper_case_globals)]
    fn check(&self, operation: &str, ret: nvmlReturn_t) -> Result<(), GpuError> {
        match ret {
            nvmlReturn_enum_NVML_SUCCESS => Ok(()),
            nvmlReturn_enum_NVML_ERROR_NOT_SUPPORTED => {
                Err(GpuError::NotSupported(self.error_string(operation, ret)))
            }
            nvmlReturn_enum_NVML_ERROR_INVALID_ARGUMENT => {
                Err(GpuError::InvalidArgument(self.error_string(operation, ret)))
            }
            _ => Err(GpuError::call(operation, self.error_string(operation, ret))),
        }
    }

    fn error_string(&self, operation: &str, ret: nvmlReturn_t) -> String {
        // SAFETY: nvmlErrorString returns a pointer to a static string
        let message = unsafe {
            let ptr = self.lib.nvmlErrorString(ret);
            if ptr.is_null() {
                None
            } else {
                Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
            }
        };
        match message {
            Some(m) => format!("{}: {}", operation, m),
            None => format!("{}: code {}", operation, ret),
        }
    }

    fn device_handle(&self, uuid: &str) -> Result<nvmlDevice_t, GpuError> {
        let device = self
            .nvml
            .device_by_uuid(uuid)
            .map_err(|e| wrapper_error("nvmlDeviceGetHandleByUUID", e))?;
        // SAFETY: the handle stays valid for as long as `self.nvml` is alive
        Ok(unsafe { device.handle() })
    }

    fn gpu_instance(&self, device: nvmlDevice_t, id: u32) -> Result<nvmlGpuInstance_t, GpuError> {
        let mut gi: nvmlGpuInstance_t = unsafe { mem::zeroed() };
        let ret = unsafe { self.lib.nvmlDeviceGetGpuInstanceById(device, id, &mut gi) };
        self.check("nvmlDeviceGetGpuInstanceById", ret)?;
        Ok(gi)
    }

    fn compute_instance(
        &self,
        gi: nvmlGpuInstance_t,
        id: u32,
    ) -> Result<nvmlComputeInstance_t, GpuError> {
        let mut ci: nvmlComputeInstance_t = unsafe { mem::zeroed() };
        let ret = unsafe { self.lib.nvmlGpuInstanceGetComputeInstanceById(gi, id, &mut ci) };
        self.check("nvmlGpuInstanceGetComputeInstanceById", ret)?;
        Ok(ci)
    }

    fn raw_gi_profile(
        &self,
        device: nvmlDevice_t,
        index: u32,
    ) -> Result<nvmlGpuInstanceProfileInfo_t, GpuError> {
        let mut info: nvmlGpuInstanceProfileInfo_t = unsafe { mem::zeroed() };
        let ret = unsafe { self.lib.nvmlDeviceGetGpuInstanceProfileInfo(device, index, &mut info) };
        self.check("nvmlDeviceGetGpuInstanceProfileInfo", ret)?;
        Ok(info)
    }

    fn raw_ci_profile(
        &self,
        gi: nvmlGpuInstance_t,
        index: u32,
        engine: u32,
    ) -> Result<nvmlComputeInstanceProfileInfo_t, GpuError> {
        let mut info: nvmlComputeInstanceProfileInfo_t = unsafe { mem::zeroed() };
        let ret = unsafe {
            self.lib
                .nvmlGpuInstanceGetComputeInstanceProfileInfo(gi, index, engine, &mut info)
        };
        self.check("nvmlGpuInstanceGetComputeInstanceProfileInfo", ret)?;
        Ok(info)
    }

    /// Map a hardware GI profile id back to its profile index
    fn gi_profile_index(
        &self,
        device: nvmlDevice_t,
        profile_id: u32,
    ) -> Result<(u32, nvmlGpuInstanceProfileInfo_t), GpuError> {
        for index in 0..GPU_INSTANCE_PROFILE_COUNT {
            match self.raw_gi_profile(device, index) {
                Ok(info) if info.id == profile_id => return Ok((index, info)),
                Ok(_) => {}
                Err(e) if e.is_skippable() => {}
                Err(e) => return Err(e),
            }
        }
        Err(GpuError::call(
            "nvmlDeviceGetGpuInstanceProfileInfo",
            format!("no profile index for GPU instance profile id {}", profile_id),
        ))
    }

    /// Map a hardware CI profile id back to its profile index
    fn ci_profile_index(
        &self,
        gi: nvmlGpuInstance_t,
        profile_id: u32,
    ) -> Result<(u32, nvmlComputeInstanceProfileInfo_t), GpuError> {
        for index in 0..COMPUTE_INSTANCE_PROFILE_COUNT {
            match self.raw_ci_profile(gi, index, COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED) {
                Ok(info) if info.id == profile_id => return Ok((index, info)),
                Ok(_) => {}
                Err(e) if e.is_skippable() => {}
                Err(e) => return Err(e),
            }
        }
        Err(GpuError::call(
            "nvmlGpuInstanceGetComputeInstanceProfileInfo",
            format!("no profile index for compute instance profile id {}", profile_id),
        ))
    }

    fn mig_uuid(&self, mig: nvmlDevice_t) -> Result<String, GpuError> {
        let mut buf = [0 as c_char; UUID_BUFFER_SIZE];
        let ret = unsafe {
            self.lib
                .nvmlDeviceGetUUID(mig, buf.as_mut_ptr(), UUID_BUFFER_SIZE as c_uint)
        };
        self.check("nvmlDeviceGetUUID", ret)?;
        // SAFETY: NVML writes a NUL-terminated string into the buffer
        let uuid = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(uuid.to_string_lossy().into_owned())
    }

    fn describe_mig(&self, device: nvmlDevice_t, mig: nvmlDevice_t) -> Result<MigDeviceInfo, GpuError> {
        let uuid = self.mig_uuid(mig)?;

        let mut gi_id: c_uint = 0;
        let ret = unsafe { self.lib.nvmlDeviceGetGpuInstanceId(mig, &mut gi_id) };
        self.check("nvmlDeviceGetGpuInstanceId", ret)?;
        let mut ci_id: c_uint = 0;
        let ret = unsafe { self.lib.nvmlDeviceGetComputeInstanceId(mig, &mut ci_id) };
        self.check("nvmlDeviceGetComputeInstanceId", ret)?;

        let gi = self.gpu_instance(device, gi_id)?;
        let mut gi_info: nvmlGpuInstanceInfo_t = unsafe { mem::zeroed() };
        let ret = unsafe { self.lib.nvmlGpuInstanceGetInfo(gi, &mut gi_info) };
        self.check("nvmlGpuInstanceGetInfo", ret)?;

        let ci = self.compute_instance(gi, ci_id)?;
        let mut ci_info: nvmlComputeInstanceInfo_t = unsafe { mem::zeroed() };
        let ret = unsafe { self.lib.nvmlComputeInstanceGetInfo_v2(ci, &mut ci_info) };
        self.check("nvmlComputeInstanceGetInfo_v2", ret)?;

        let (gi_index, gi_profile) = self.gi_profile_index(device, gi_info.profileId)?;
        let (ci_index, ci_profile) = self.ci_profile_index(gi, ci_info.profileId)?;

        Ok(MigDeviceInfo {
            uuid,
            gpu_instance_id: gi_info.id,
            compute_instance_id: ci_info.id,
            gi_profile_id: gi_index,
            ci_profile_id: ci_index,
            ci_eng_profile_id: COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
            gi_slice_count: gi_profile.sliceCount,
            ci_slice_count: ci_profile.sliceCount,
            memory_size_mb: gi_profile.memorySizeMB,
            placement: SlicePlacement::new(gi_info.placement.start, gi_info.placement.size),
        })
    }
}

/// Whether each raw entry point this backend calls was found in the library
fn mig_symbols(lib: &NvmlLib) -> [(&'static str, bool); 17] {
    [
        ("nvmlErrorString", lib.nvmlErrorString.is_ok()),
        ("nvmlDeviceGetUUID", lib.nvmlDeviceGetUUID.is_ok()),
        ("nvmlDeviceGetGpuInstanceById", lib.nvmlDeviceGetGpuInstanceById.is_ok()),
        ("nvmlDeviceGetGpuInstanceId", lib.nvmlDeviceGetGpuInstanceId.is_ok()),
        ("nvmlDeviceGetComputeInstanceId", lib.nvmlDeviceGetComputeInstanceId.is_ok()),
        ("nvmlDeviceGetGpuInstanceProfileInfo", lib.nvmlDeviceGetGpuInstanceProfileInfo.is_ok()),
        (
            "nvmlDeviceGetGpuInstancePossiblePlacements_v2",
            lib.nvmlDeviceGetGpuInstancePossiblePlacements_v2.is_ok(),
        ),
        (
            "nvmlDeviceCreateGpuInstanceWithPlacement",
            lib.nvmlDeviceCreateGpuInstanceWithPlacement.is_ok(),
        ),
        ("nvmlDeviceGetMaxMigDeviceCount", lib.nvmlDeviceGetMaxMigDeviceCount.is_ok()),
        ("nvmlDeviceGetMigDeviceHandleByIndex", lib.nvmlDeviceGetMigDeviceHandleByIndex.is_ok()),
        ("nvmlGpuInstanceGetInfo", lib.nvmlGpuInstanceGetInfo.is_ok()),
        ("nvmlGpuInstanceDestroy", lib.nvmlGpuInstanceDestroy.is_ok()),
        (
            "nvmlGpuInstanceGetComputeInstanceById",
            lib.nvmlGpuInstanceGetComputeInstanceById.is_ok(),
        ),
        (
            "nvmlGpuInstanceGetComputeInstanceProfileInfo",
            lib.nvmlGpuInstanceGetComputeInstanceProfileInfo.is_ok(),
        ),
        (
            "nvmlGpuInstanceCreateComputeInstance",
            lib.nvmlGpuInstanceCreateComputeInstance.is_ok(),
        ),
        ("nvmlComputeInstanceGetInfo_v2", lib.nvmlComputeInstanceGetInfo_v2.is_ok()),
        ("nvmlComputeInstanceDestroy", lib.nvmlComputeInstanceDestroy.is_ok()),
    ]
}

/// Refuse a library that lacks any of the MIG entry points
fn require_symbols(library_path: &str, symbols: &[(&'static str, bool)]) -> Result<(), GpuError> {
    let missing: Vec<&str> = symbols
        .iter()
        .filter(|(_, found)| !found)
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GpuError::Library(format!(
            "{}: driver lacks MIG support ({} not found)",
            library_path,
            missing.join(", ")
        )))
    }
}

/// Run `undo` when a follow-up call on a freshly created instance failed
fn undo_on_error<T>(result: Result<T, GpuError>, undo: impl FnOnce()) -> Result<T, GpuError> {
    if result.is_err() {
        undo();
    }
    result
}

fn wrapper_error(operation: &str, e: NvmlError) -> GpuError {
    match e {
        NvmlError::NotSupported => GpuError::NotSupported(operation.to_string()),
        NvmlError::InvalidArg => GpuError::InvalidArgument(operation.to_string()),
        other => GpuError::call(operation, other.to_string()),
    }
}

impl MigBackend for NvmlBackend {
    fn devices(&self) -> Result<Vec<GpuDevice>, GpuError> {
        let count = self
            .nvml
            .device_count()
            .map_err(|e| wrapper_error("nvmlDeviceGetCount", e))?;
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .map_err(|e| wrapper_error("nvmlDeviceGetHandleByIndex", e))?;
            let uuid = device
                .uuid()
                .map_err(|e| wrapper_error("nvmlDeviceGetUUID", e))?;
            let name = device
                .name()
                .map_err(|e| wrapper_error("nvmlDeviceGetName", e))?;
            let memory = device
                .memory_info()
                .map_err(|e| wrapper_error("nvmlDeviceGetMemoryInfo", e))?;
            debug!(index, uuid = %uuid, name = %name, "found GPU");
            devices.push(GpuDevice {
                uuid,
                name,
                memory_total_bytes: memory.total,
            });
        }
        Ok(devices)
    }

    fn gpu_instance_profile(
        &self,
        device_uuid: &str,
        profile_index: u32,
    ) -> Result<GpuInstanceProfileInfo, GpuError> {
        let device = self.device_handle(device_uuid)?;
        let info = self.raw_gi_profile(device, profile_index)?;
        Ok(GpuInstanceProfileInfo {
            id: info.id,
            slice_count: info.sliceCount,
            memory_size_mb: info.memorySizeMB,
        })
    }

    fn possible_placements(
        &self,
        device_uuid: &str,
        profile: &GpuInstanceProfileInfo,
    ) -> Result<Vec<SlicePlacement>, GpuError> {
        let device = self.device_handle(device_uuid)?;
        let mut raw: [nvmlGpuInstancePlacement_t; MAX_PLACEMENTS] = unsafe { mem::zeroed() };
        let mut count = MAX_PLACEMENTS as c_uint;
        let ret = unsafe {
            self.lib.nvmlDeviceGetGpuInstancePossiblePlacements_v2(
                device,
                profile.id,
                raw.as_mut_ptr(),
                &mut count,
            )
        };
        self.check("nvmlDeviceGetGpuInstancePossiblePlacements_v2", ret)?;
        Ok(raw
            .iter()
            .take(count as usize)
            .map(|p| SlicePlacement::new(p.start, p.size))
            .collect())
    }

    fn create_gpu_instance(
        &self,
        device_uuid: &str,
        profile: &GpuInstanceProfileInfo,
        placement: SlicePlacement,
    ) -> Result<u32, GpuError> {
        let device = self.device_handle(device_uuid)?;
        let raw_placement = nvmlGpuInstancePlacement_t {
            start: placement.start,
            size: placement.size,
        };
        let _guard = self.lock()?;
        let mut gi: nvmlGpuInstance_t = unsafe { mem::zeroed() };
        let ret = unsafe {
            self.lib.nvmlDeviceCreateGpuInstanceWithPlacement(
                device,
                profile.id,
                &raw_placement,
                &mut gi,
            )
        };
        self.check("nvmlDeviceCreateGpuInstanceWithPlacement", ret)?;

        let mut info: nvmlGpuInstanceInfo_t = unsafe { mem::zeroed() };
        let ret = unsafe { self.lib.nvmlGpuInstanceGetInfo(gi, &mut info) };
        undo_on_error(self.check("nvmlGpuInstanceGetInfo", ret), || {
            let ret = unsafe { self.lib.nvmlGpuInstanceDestroy(gi) };
            if let Err(e) = self.check("nvmlGpuInstanceDestroy", ret) {
                warn!(gpu = %device_uuid, error = %e, "failed to destroy unidentified GPU instance");
            }
        })?;
        Ok(info.id)
    }

    fn create_compute_instance(
        &self,
        device_uuid: &str,
        gpu_instance_id: u32,
        ci_profile_id: u32,
        ci_eng_profile_id: u32,
    ) -> Result<u32, GpuError> {
        let device = self.device_handle(device_uuid)?;
        let _guard = self.lock()?;
        let gi = self.gpu_instance(device, gpu_instance_id)?;
        let profile = self.raw_ci_profile(gi, ci_profile_id, ci_eng_profile_id)?;

        let mut ci: nvmlComputeInstance_t = unsafe { mem::zeroed() };
        let ret = unsafe { self.lib.nvmlGpuInstanceCreateComputeInstance(gi, profile.id, &mut ci) };
        self.check("nvmlGpuInstanceCreateComputeInstance", ret)?;

        let mut info: nvmlComputeInstanceInfo_t = unsafe { mem::zeroed() };
        let ret = unsafe { self.lib.nvmlComputeInstanceGetInfo_v2(ci, &mut info) };
        undo_on_error(self.check("nvmlComputeInstanceGetInfo_v2", ret), || {
            let ret = unsafe { self.lib.nvmlComputeInstanceDestroy(ci) };
            if let Err(e) = self.check("nvmlComputeInstanceDestroy", ret) {
                warn!(gpu = %device_uuid, gi = gpu_instance_id, error = %e, "failed to destroy unidentified compute instance");
            }
        })?;
        Ok(info.id)
    }

    fn mig_devices(&self, device_uuid: &str) -> Result<Vec<MigDeviceInfo>, GpuError> {
        let device = self.device_handle(device_uuid)?;
        let mut max: c_uint = 0;
        let ret = unsafe { self.lib.nvmlDeviceGetMaxMigDeviceCount(device, &mut max) };
        self.check("nvmlDeviceGetMaxMigDeviceCount", ret)?;

        let mut migs = Vec::new();
        for index in 0..max {
            let mut mig: nvmlDevice_t = unsafe { mem::zeroed() };
            let ret = unsafe { self.lib.nvmlDeviceGetMigDeviceHandleByIndex(device, index, &mut mig) };
            if ret == nvmlReturn_enum_NVML_ERROR_NOT_FOUND {
                continue;
            }
            self.check("nvmlDeviceGetMigDeviceHandleByIndex", ret)?;
            migs.push(self.describe_mig(device, mig)?);
        }
        Ok(migs)
    }

    fn destroy_compute_instance(
        &self,
        device_uuid: &str,
        gpu_instance_id: u32,
        compute_instance_id: u32,
    ) -> Result<(), GpuError> {
        let device = self.device_handle(device_uuid)?;
        let _guard = self.lock()?;
        let gi = self.gpu_instance(device, gpu_instance_id)?;
        let ci = self.compute_instance(gi, compute_instance_id)?;
        let ret = unsafe { self.lib.nvmlComputeInstanceDestroy(ci) };
        self.check("nvmlComputeInstanceDestroy", ret)
    }

    fn destroy_gpu_instance(&self, device_uuid: &str, gpu_instance_id: u32) -> Result<(), GpuError> {
        let device = self.device_handle(device_uuid)?;
        let _guard = self.lock()?;
        let gi = self.gpu_instance(device, gpu_instance_id)?;
        let ret = unsafe { self.lib.nvmlGpuInstanceDestroy(gi) };
        self.check("nvmlGpuInstanceDestroy", ret)
    }
}
