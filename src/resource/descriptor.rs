//! Descriptor values and deferred ("future") descriptors bindable into a
//! [`crate::resource::sampler_pipeline::DescriptorSetLayout`] (spec §4.5,
//! grounded on `include/tephra/descriptor.hpp`'s `Descriptor` /
//! `FutureDescriptor`).
//!
//! The original's `FutureDescriptor` stores a `BufferView`/`ImageView` by
//! value and resolves it lazily because those views may refer to job-local
//! resources that don't have a real Vulkan handle yet at the point a
//! descriptor set is prepared. This crate doesn't have a `BufferView`/
//! `ImageView` indirection of its own (buffers and images resolve directly
//! to `vk::Buffer`/`vk::ImageView` once [`crate::job::local_buffer`] or
//! [`crate::job::local_image`] assigns them), so the same laziness is
//! expressed directly as a resolver closure.

use ash::vk;

/// A fully resolved descriptor, ready to be written into a `VkDescriptorSet`.
#[derive(Debug, Clone, Copy)]
pub enum Descriptor {
    Null,
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    TexelBufferView(vk::BufferView),
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    ImageSampler {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
    Sampler(vk::Sampler),
}

impl Descriptor {
    pub fn is_null(&self) -> bool {
        matches!(self, Descriptor::Null)
    }

    pub(crate) fn vk_descriptor_buffer_info(&self) -> Option<vk::DescriptorBufferInfo> {
        match *self {
            Descriptor::Buffer { buffer, offset, range } => Some(
                vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range),
            ),
            _ => None,
        }
    }

    pub(crate) fn vk_descriptor_image_info(&self) -> Option<vk::DescriptorImageInfo> {
        match *self {
            Descriptor::Image { view, layout } => {
                Some(vk::DescriptorImageInfo::default().image_view(view).image_layout(layout))
            }
            Descriptor::ImageSampler { view, layout, sampler } => Some(
                vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(layout)
                    .sampler(sampler),
            ),
            Descriptor::Sampler(sampler) => Some(vk::DescriptorImageInfo::default().sampler(sampler)),
            _ => None,
        }
    }

    pub(crate) fn vk_texel_buffer_view(&self) -> Option<vk::BufferView> {
        match *self {
            Descriptor::TexelBufferView(view) => Some(view),
            _ => None,
        }
    }
}

/// A descriptor that may not be resolvable to a real handle yet — the job
/// system resolves these right before the descriptor sets that reference
/// them are allocated (spec §4.5: job-local descriptor set preparation with
/// deferred resolution).
pub enum FutureDescriptor {
    Null,
    Resolved(Descriptor),
    /// Resolved lazily, once the referenced job-local buffer or image has
    /// been assigned a backing allocation.
    Deferred(Box<dyn FnOnce() -> Descriptor + Send>),
}

impl FutureDescriptor {
    pub fn is_null(&self) -> bool {
        matches!(self, FutureDescriptor::Null)
    }

    pub fn resolve(self) -> Descriptor {
        match self {
            FutureDescriptor::Null => Descriptor::Null,
            FutureDescriptor::Resolved(descriptor) => descriptor,
            FutureDescriptor::Deferred(resolver) => resolver(),
        }
    }
}

impl From<Descriptor> for FutureDescriptor {
    fn from(descriptor: Descriptor) -> Self {
        FutureDescriptor::Resolved(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_future_descriptor_passes_through_unchanged() {
        let descriptor = Descriptor::Buffer {
            buffer: vk::Buffer::null(),
            offset: 16,
            range: 256,
        };
        let future: FutureDescriptor = descriptor.into();
        match future.resolve() {
            Descriptor::Buffer { offset, range, .. } => {
                assert_eq!(offset, 16);
                assert_eq!(range, 256);
            }
            _ => panic!("expected buffer descriptor"),
        }
    }

    #[test]
    fn deferred_future_descriptor_resolves_on_demand() {
        let future = FutureDescriptor::Deferred(Box::new(|| Descriptor::Sampler(vk::Sampler::null())));
        assert!(matches!(future.resolve(), Descriptor::Sampler(_)));
    }

    #[test]
    fn null_future_descriptor_resolves_to_null() {
        assert!(FutureDescriptor::Null.resolve().is_null());
    }
}
