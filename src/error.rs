use ash::vk;

/// Error kinds surfaced at the crate boundary (spec §7).
///
/// `DeviceLost` and `SurfaceLost` are sticky: once a `Device`/`Swapchain`
/// observes them it keeps returning the same kind from then on rather than
/// re-querying the driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("surface lost")]
    SurfaceLost,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("vulkan error: {0}")]
    RuntimeError(#[from] vk::Result),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classifies a raw `vk::Result` the way §7 requires: out-of-memory and
    /// lost-device codes get their own kinds, everything else is preserved
    /// verbatim under `RuntimeError`.
    pub fn from_vk_result(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::OutOfHostMemory,
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::ERROR_SURFACE_LOST_KHR => Error::SurfaceLost,
            other => Error::RuntimeError(other),
        }
    }

    /// Classifies a `gpu_allocator::AllocationError` the same way §7
    /// requires for raw `vk::Result`s: the sub-allocator's own
    /// out-of-memory signal (returned even after this crate's
    /// overallocation behaviour already tried to satisfy the request)
    /// surfaces as `OutOfDeviceMemory` rather than the catch-all `Other`,
    /// since every `MemoryPreference` progression used here (§6) only ever
    /// targets device-local or device-local-host-visible heaps.
    pub fn from_allocator_error(error: gpu_allocator::AllocationError) -> Self {
        match error {
            gpu_allocator::AllocationError::OutOfMemory => Error::OutOfDeviceMemory,
            other => Error::Other(other.into()),
        }
    }
}
