//! Buffer and buffer-view resources (spec §2 data model, §6).
//!
//! Grounded on the teacher's `vulkan/resource.rs` `Buffer`/`BufferDescriptor`
//! and `Device::create_buffer`/`destroy_buffer`; generalized to route
//! allocation through [`crate::device::lifeguard`] instead of the teacher's
//! per-frame `ResourceHub` draining, and to carry the usage mask needed by
//! the job-local aliasing allocator (C2) to compute view alignment.

use std::mem::{align_of, size_of_val};
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};

use crate::device::lifeguard::{DeferredDestructionQueue, LastUse};
use crate::device::DeviceShared;
use crate::error::{Error, Result};
use crate::types::MemoryPreference;

/// Job-local usage masks reuse `vk::BufferUsageFlags` directly rather than
/// introducing a parallel bitmask type: the flag type already provides
/// bitwise `|`/`contains`, and buffer usage here only ever affects required
/// view alignment (spec §4.2), never descriptor binding, so there's nothing
/// a wrapper type would add.
pub type BufferUsage = vk::BufferUsageFlags;

/// Every usage a job-local backing buffer might need to serve, used when
/// allocating a backing buffer whose exact logical usage isn't known ahead
/// of time (spec §4.2's "buffer usage only affects alignment" rule: it's
/// fine to over-declare usage on the backing allocation as long as it's
/// large enough).
pub fn backing_buffer_usage_superset(device_address_supported: bool) -> BufferUsage {
    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
        | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
        | vk::BufferUsageFlags::UNIFORM_BUFFER
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDIRECT_BUFFER;
    if device_address_supported {
        usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    usage
}

#[derive(Debug, Clone)]
pub struct BufferSetup {
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferSetup {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self { size, usage }
    }
}

pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
    allocation: Option<Allocation>,
    device: Arc<DeviceShared>,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Writes `data` at byte offset 0 into a host-visible buffer. Caller is
    /// responsible for ensuring no in-flight GPU read overlaps this write.
    pub fn write_data<T: Copy>(&self, data: &[T]) -> Result<()> {
        self.write_data_at_offset(data, 0)
    }

    pub fn write_data_at_offset<T: Copy>(&self, data: &[T], byte_offset: u64) -> Result<()> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| Error::UnsupportedOperation("buffer has no live allocation".into()))?;
        let mapped_ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| Error::UnsupportedOperation("buffer is not host-mapped".into()))?
            .as_ptr();

        unsafe {
            let dst = (mapped_ptr as *mut u8).add(byte_offset as usize);
            let mut align =
                ash::util::Align::new(dst.cast(), align_of::<T>() as u64, size_of_val(data) as u64);
            align.copy_from_slice(data);
        }
        Ok(())
    }

    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        setup: &BufferSetup,
        memory_preference: &MemoryPreference,
    ) -> Result<Self> {
        let create_info = vk::BufferCreateInfo::default()
            .size(setup.size)
            .usage(setup.usage);

        let raw = unsafe { device.raw.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.raw.get_buffer_memory_requirements(raw) };

        let location = device.resolve_memory_location(&requirements, memory_preference)?;
        let allocation = device
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "tephra buffer",
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(Error::from_allocator_error)?;

        unsafe {
            device
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }

        Ok(Self {
            raw,
            size: setup.size,
            usage: setup.usage,
            allocation: Some(allocation),
            device: device.clone(),
        })
    }

    pub(crate) fn vk_handle(&self) -> vk::Buffer {
        self.raw
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        let raw = self.raw;
        let device = self.device.clone();
        let mut last_use = LastUse::new();
        for (queue, timestamp) in self.device.timeline.snapshot_assigned() {
            last_use.record(queue, timestamp);
        }
        self.device
            .destruction_queue_buffers
            .push(raw, last_use, Box::new(move |raw| {
                unsafe { device.raw.destroy_buffer(raw, None) };
                if let Err(e) = device.allocator.lock().free(allocation) {
                    log::warn!("failed to free buffer allocation: {e}");
                }
            }));
    }
}

pub(crate) type BufferDestructionQueue = DeferredDestructionQueue<vk::Buffer>;
