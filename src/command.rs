//! Command pool/buffer wrappers used to compile a job's command stream into
//! real Vulkan commands (C6/C10, spec §4.6, §4.10).
//!
//! Grounded on the teacher's `vulkan::command::{CommandPool, CommandBuffer}`
//! (`vulkan/command.rs`): same pool-allocates-buffers, buffer-wraps-a-raw-handle
//! shape. Narrowed to the subset a job compiler actually needs — barriers,
//! buffer/image copies, clears and a debug label hook — since recording
//! inside a render or compute pass's body stays the caller's own code, not
//! this crate's (spec.md §1 Non-goals).

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceShared;
use crate::error::Result;

/// One `VkCommandPool` bound to a single queue family, reused across jobs
/// submitted against the same logical queue (spec §4.7's "acquired command
/// pools, returned to the pool on job destruction").
pub struct CommandPool {
    device: Arc<DeviceShared>,
    raw: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    pub fn new(device: Arc<DeviceShared>, queue_family_index: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let raw = unsafe { device.raw.create_command_pool(&create_info, None)? };
        Ok(Self {
            device,
            raw,
            queue_family_index,
        })
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn allocate_primary(&self) -> Result<CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.raw)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let raw = unsafe { self.device.raw.allocate_command_buffers(&alloc_info)? }[0];
        Ok(CommandBuffer {
            device: self.device.clone(),
            raw,
        })
    }

    /// Resets every command buffer ever allocated from this pool so it can
    /// be handed back to the job-command-pool cache for reuse.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .raw
                .reset_command_pool(self.raw, vk::CommandPoolResetFlags::empty())?
        };
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.raw.destroy_command_pool(self.raw, None) };
    }
}

/// A single primary `VkCommandBuffer`. Freed implicitly when its owning
/// [`CommandPool`] is reset or destroyed — never individually.
pub struct CommandBuffer {
    device: Arc<DeviceShared>,
    raw: vk::CommandBuffer,
}

impl CommandBuffer {
    pub fn vk_handle(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn begin(&self) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.raw.begin_command_buffer(self.raw, &info)? };
        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.raw.end_command_buffer(self.raw)? };
        Ok(())
    }

    pub fn pipeline_barrier(
        &self,
        buffer_barriers: &[vk::BufferMemoryBarrier2],
        image_barriers: &[vk::ImageMemoryBarrier2],
    ) {
        let dependency_info = vk::DependencyInfo::default()
            .buffer_memory_barriers(buffer_barriers)
            .image_memory_barriers(image_barriers);
        unsafe { self.device.raw.cmd_pipeline_barrier2(self.raw, &dependency_info) };
    }

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.raw.cmd_copy_buffer(self.raw, src, dst, regions) };
    }

    pub fn copy_image(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.device
                .raw
                .cmd_copy_image(self.raw, src, src_layout, dst, dst_layout, regions)
        };
    }

    pub fn fill_buffer(&self, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        unsafe { self.device.raw.cmd_fill_buffer(self.raw, buffer, offset, size, data) };
    }

    pub fn clear_color_image(
        &self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device
                .raw
                .cmd_clear_color_image(self.raw, image, layout, &color, ranges)
        };
    }
}
