//! Growable descriptor pool (spec §4.5, grounded on
//! `descriptor_pool_impl.cpp`'s `DescriptorPoolImpl`): allocates
//! `VkDescriptorSet`s in batches per layout, recycling freed sets and
//! growing by allocating an additional `VkDescriptorPool` once the current
//! one runs out of room for a layout.
//!
//! The original keys its per-layout bookkeeping off the descriptor set
//! layout's Vulkan handle and recycles update templates
//! (`VkDescriptorUpdateTemplate`) for fast writes; this port writes
//! descriptors with a plain `vkUpdateDescriptorSets` call per set instead —
//! functionally identical, just without that write-path optimization (noted
//! in DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::device::lifeguard::LastUse;
use crate::device::DeviceShared;
use crate::error::Result;
use crate::resource::descriptor::Descriptor;
use crate::resource::sampler_pipeline::DescriptorSetLayout;
use crate::types::OverallocationBehavior;

struct PendingFree {
    set: vk::DescriptorSet,
    last_use: LastUse,
}

struct PoolEntry {
    free_sets: Vec<vk::DescriptorSet>,
    pending_free: Vec<PendingFree>,
    allocated_count: u32,
}

impl PoolEntry {
    fn new() -> Self {
        Self {
            free_sets: Vec::new(),
            pending_free: Vec::new(),
            allocated_count: 0,
        }
    }
}

struct Inner {
    // `None` only for the test-only stub constructor below, which never
    // allocates a set and so never needs a live device.
    device: Option<Arc<DeviceShared>>,
    overallocation_behavior: OverallocationBehavior,
    backing_pools: Vec<vk::DescriptorPool>,
    entries: HashMap<vk::DescriptorSetLayout, PoolEntry>,
}

impl Inner {
    fn device(&self) -> &Arc<DeviceShared> {
        self.device.as_ref().expect("descriptor pool stub used outside of tests")
    }
}

/// Descriptor-set allocator shared by every job recorded against a resource
/// pool (spec §4.5, §4.7).
pub struct DescriptorPool {
    inner: Mutex<Inner>,
}

impl DescriptorPool {
    pub fn new(device: Arc<DeviceShared>, overallocation_behavior: OverallocationBehavior) -> Self {
        Self {
            inner: Mutex::new(Inner {
                device: Some(device),
                overallocation_behavior,
                backing_pools: Vec::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// A descriptor pool with no backing device, for tests that only need a
    /// `Job` to exist and never allocate a descriptor set against it.
    #[cfg(test)]
    pub(crate) fn new_stub() -> Self {
        Self {
            inner: Mutex::new(Inner {
                device: None,
                overallocation_behavior: OverallocationBehavior::default(),
                backing_pools: Vec::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Allocates `descriptors_per_set.len()` descriptor sets using `layout`,
    /// writing the provided descriptors into each. Reuses freed sets before
    /// allocating new ones; grows the pool when more room is needed.
    pub fn allocate_descriptor_sets(
        &self,
        layout: &DescriptorSetLayout,
        descriptors_per_set: &[Vec<Descriptor>],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(layout.raw).or_insert_with(PoolEntry::new);

        let mut allocated = Vec::with_capacity(descriptors_per_set.len());
        while allocated.len() < descriptors_per_set.len() {
            if let Some(set) = entry.free_sets.pop() {
                allocated.push(set);
            } else {
                break;
            }
        }

        let remaining = descriptors_per_set.len() - allocated.len();
        if remaining > 0 {
            let size_to_alloc = inner
                .overallocation_behavior
                .apply(remaining as u64, entry.allocated_count as u64)
                .max(remaining as u64) as u32;
            let new_pool = create_backing_pool(inner.device(), layout, size_to_alloc)?;
            let layouts = vec![layout.raw; remaining];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(new_pool)
                .set_layouts(&layouts);
            let mut new_sets = unsafe { inner.device().raw.allocate_descriptor_sets(&alloc_info)? };
            entry.allocated_count += size_to_alloc;
            inner.backing_pools.push(new_pool);

            // Stash any extra sets the grown pool could provide for future reuse.
            if new_sets.len() > remaining {
                entry.free_sets.extend(new_sets.split_off(remaining));
            }
            allocated.extend(new_sets);
        }

        for (set, descriptors) in allocated.iter().zip(descriptors_per_set) {
            write_descriptor_set(inner.device(), *set, layout, descriptors);
        }

        Ok(allocated)
    }

    /// Queues a previously allocated descriptor set to return to its
    /// layout's free list once `last_use` has been reached.
    pub fn queue_free_descriptor_set(&self, layout: vk::DescriptorSetLayout, set: vk::DescriptorSet, last_use: LastUse) {
        let mut inner = self.inner.lock();
        inner
            .entries
            .entry(layout)
            .or_insert_with(PoolEntry::new)
            .pending_free
            .push(PendingFree { set, last_use });
    }

    /// Moves descriptor sets whose `last_use` has been reached from the
    /// pending-free list back into the reusable free list.
    pub fn reclaim_freed_sets(&self, last_reached: impl Fn(crate::types::DeviceQueue) -> u64 + Copy) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.values_mut() {
            let (ready, pending): (Vec<_>, Vec<_>) = entry
                .pending_free
                .drain(..)
                .partition(|pf| pf.last_use.is_reached(last_reached));
            entry.pending_free = pending;
            entry.free_sets.extend(ready.into_iter().map(|pf| pf.set));
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.backing_pools.is_empty() {
            return;
        }
        let device = inner.device().clone();
        for pool in inner.backing_pools.drain(..) {
            unsafe { device.raw.destroy_descriptor_pool(pool, None) };
        }
    }
}

fn create_backing_pool(
    device: &Arc<DeviceShared>,
    layout: &DescriptorSetLayout,
    set_count: u32,
) -> Result<vk::DescriptorPool> {
    let mut counts: HashMap<vk::DescriptorType, u32> = HashMap::new();
    for binding in layout.bindings.values() {
        *counts.entry(binding.descriptor_type).or_insert(0) += binding.descriptor_count * set_count;
    }
    let pool_sizes: Vec<vk::DescriptorPoolSize> = counts
        .into_iter()
        .map(|(ty, count)| vk::DescriptorPoolSize { ty, descriptor_count: count.max(1) })
        .collect();

    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(set_count)
        .pool_sizes(&pool_sizes)
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

    Ok(unsafe { device.raw.create_descriptor_pool(&create_info, None)? })
}

fn write_descriptor_set(
    device: &Arc<DeviceShared>,
    set: vk::DescriptorSet,
    layout: &DescriptorSetLayout,
    descriptors: &[Descriptor],
) {
    // Reserved up front: `writes` below borrows from these via `slice::from_ref`,
    // so none of them may reallocate once that borrow starts.
    let mut buffer_infos = Vec::with_capacity(descriptors.len());
    let mut image_infos = Vec::with_capacity(descriptors.len());
    let mut texel_views = Vec::with_capacity(descriptors.len());
    let mut writes = Vec::new();

    let mut descriptor_index = 0usize;
    let mut bindings: Vec<_> = layout.bindings.values().collect();
    bindings.sort_by_key(|b| b.binding);

    for binding in bindings {
        for array_index in 0..binding.descriptor_count {
            let Some(descriptor) = descriptors.get(descriptor_index) else {
                descriptor_index += 1;
                continue;
            };
            descriptor_index += 1;
            if descriptor.is_null() {
                continue;
            }

            let mut write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding.binding)
                .dst_array_element(array_index)
                .descriptor_type(binding.descriptor_type);

            if let Some(info) = descriptor.vk_descriptor_buffer_info() {
                buffer_infos.push(info);
                write = write.buffer_info(std::slice::from_ref(buffer_infos.last().unwrap()));
            } else if let Some(info) = descriptor.vk_descriptor_image_info() {
                image_infos.push(info);
                write = write.image_info(std::slice::from_ref(image_infos.last().unwrap()));
            } else if let Some(view) = descriptor.vk_texel_buffer_view() {
                texel_views.push(view);
                write = write.texel_buffer_view(std::slice::from_ref(texel_views.last().unwrap()));
            }
            writes.push(write);
        }
    }

    if !writes.is_empty() {
        unsafe { device.raw.update_descriptor_sets(&writes, &[]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_entry_starts_empty() {
        let entry = PoolEntry::new();
        assert!(entry.free_sets.is_empty());
        assert!(entry.pending_free.is_empty());
        assert_eq!(entry.allocated_count, 0);
    }
}
