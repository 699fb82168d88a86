//! Image and image-view resources (spec §2 data model, §6).
//!
//! Grounded on the teacher's `vulkan/resource.rs` `Image`/`ImageDescriptor`
//! and `Device::create_image`/`destroy_image`, generalized the same way as
//! [`crate::resource::buffer`]: allocation routes through
//! [`crate::device::lifeguard`] rather than the teacher's per-frame drain.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};

use crate::device::lifeguard::{DeferredDestructionQueue, LastUse};
use crate::device::DeviceShared;
use crate::error::{Error, Result};
use crate::types::MemoryPreference;

/// As with [`crate::resource::buffer::BufferUsage`], reuse
/// `vk::ImageUsageFlags` rather than a parallel bitmask type.
pub type ImageUsage = vk::ImageUsageFlags;

#[derive(Debug, Clone, Copy)]
pub struct ImageSetup {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub image_type: vk::ImageType,
    pub mip_level_count: u32,
    pub array_layer_count: u32,
    pub sample_count: vk::SampleCountFlags,
    pub usage: ImageUsage,
}

impl ImageSetup {
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: ImageUsage) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            image_type: vk::ImageType::TYPE_2D,
            mip_level_count: 1,
            array_layer_count: 1,
            sample_count: vk::SampleCountFlags::TYPE_1,
            usage,
        }
    }
}

fn format_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn view_type_for(image_type: vk::ImageType, array_layer_count: u32) -> vk::ImageViewType {
    match (image_type, array_layer_count) {
        (vk::ImageType::TYPE_1D, 1) => vk::ImageViewType::TYPE_1D,
        (vk::ImageType::TYPE_1D, _) => vk::ImageViewType::TYPE_1D_ARRAY,
        (vk::ImageType::TYPE_2D, 1) => vk::ImageViewType::TYPE_2D,
        (vk::ImageType::TYPE_2D, _) => vk::ImageViewType::TYPE_2D_ARRAY,
        (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
        _ => vk::ImageViewType::TYPE_2D,
    }
}

pub struct Image {
    pub(crate) raw: vk::Image,
    pub(crate) raw_view: vk::ImageView,
    allocation: Option<Allocation>,
    device: Arc<DeviceShared>,
    pub(crate) setup: ImageSetup,
}

impl Image {
    pub fn extent(&self) -> vk::Extent3D {
        self.setup.extent
    }

    pub fn format(&self) -> vk::Format {
        self.setup.format
    }

    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        setup: &ImageSetup,
        memory_preference: &MemoryPreference,
    ) -> Result<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(setup.image_type)
            .format(setup.format)
            .extent(setup.extent)
            .mip_levels(setup.mip_level_count)
            .array_layers(setup.array_layer_count)
            .samples(setup.sample_count)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(setup.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = unsafe { device.raw.create_image(&create_info, None)? };
        let requirements = unsafe { device.raw.get_image_memory_requirements(raw) };

        let location = device.resolve_memory_location(&requirements, memory_preference)?;
        let allocation = device
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "tephra image",
                requirements,
                location,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(Error::from_allocator_error)?;

        unsafe {
            device
                .raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
        }

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(format_aspect_mask(setup.format))
            .base_mip_level(0)
            .level_count(setup.mip_level_count)
            .base_array_layer(0)
            .layer_count(setup.array_layer_count);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(view_type_for(setup.image_type, setup.array_layer_count))
            .format(setup.format)
            .subresource_range(subresource_range);
        let raw_view = unsafe { device.raw.create_image_view(&view_info, None)? };

        Ok(Self {
            raw,
            raw_view,
            allocation: Some(allocation),
            device: device.clone(),
            setup: *setup,
        })
    }

    pub(crate) fn vk_handle(&self) -> vk::Image {
        self.raw
    }

    pub(crate) fn vk_view_handle(&self) -> vk::ImageView {
        self.raw_view
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        let raw = self.raw;
        let raw_view = self.raw_view;
        let device = self.device.clone();
        let mut last_use = LastUse::new();
        for (queue, timestamp) in self.device.timeline.snapshot_assigned() {
            last_use.record(queue, timestamp);
        }
        self.device
            .destruction_queue_images
            .push((raw, raw_view), last_use, Box::new(move |(raw, raw_view)| {
                unsafe {
                    device.raw.destroy_image_view(raw_view, None);
                    device.raw.destroy_image(raw, None);
                }
                if let Err(e) = device.allocator.lock().free(allocation) {
                    log::warn!("failed to free image allocation: {e}");
                }
            }));
    }
}

pub(crate) type ImageDestructionQueue = DeferredDestructionQueue<(vk::Image, vk::ImageView)>;
