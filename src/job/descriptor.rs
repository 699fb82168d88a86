//! Job-local descriptor set preparation with deferred resolution (C5, spec
//! §4.5).
//!
//! Ported in spirit from
//! `original_source/src/tephra/job/local_descriptor_sets.cpp`'s
//! `JobLocalDescriptorSets`: a job can prepare descriptor sets that
//! reference resources (including its own job-local buffers/images) before
//! those resources have real Vulkan handles. The sets are only actually
//! allocated and written once the job is enqueued and every job-local
//! resource it references has been assigned a backing allocation, at which
//! point [`FutureDescriptor`]s are resolved and consecutive requests
//! sharing a layout are batched into one [`DescriptorPool::allocate_descriptor_sets`]
//! call — same grouping rule as the original's "layout changed" scan.

use std::ops::Range;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::device::lifeguard::LastUse;
use crate::error::Result;
use crate::resource::descriptor::FutureDescriptor;
use crate::resource::descriptor_pool::DescriptorPool;
use crate::resource::sampler_pipeline::DescriptorSetLayout;

/// A handle to a descriptor set that may not exist yet. Resolves to a real
/// `VkDescriptorSet` only after [`JobLocalDescriptorSets::allocate_prepared_descriptor_sets`]
/// has run for the job that prepared it.
#[derive(Clone)]
pub struct DescriptorSetView {
    cell: Arc<Mutex<Option<vk::DescriptorSet>>>,
}

impl DescriptorSetView {
    pub fn vk_resolve_descriptor_set_handle(&self) -> Option<vk::DescriptorSet> {
        *self.cell.lock()
    }
}

struct SetToAllocate {
    layout: Arc<DescriptorSetLayout>,
    descriptor_range: Range<usize>,
    cell: Arc<Mutex<Option<vk::DescriptorSet>>>,
}

/// Collects descriptor set requests made while recording a single job and
/// resolves them all at once when the job is enqueued.
pub struct JobLocalDescriptorSets {
    descriptor_pool: Arc<DescriptorPool>,
    sets_to_allocate: Vec<SetToAllocate>,
    local_descriptors: Vec<FutureDescriptor>,
    allocated_sets: Vec<(vk::DescriptorSetLayout, vk::DescriptorSet)>,
}

impl JobLocalDescriptorSets {
    pub fn new(descriptor_pool: Arc<DescriptorPool>) -> Self {
        Self {
            descriptor_pool,
            sets_to_allocate: Vec::new(),
            local_descriptors: Vec::new(),
            allocated_sets: Vec::new(),
        }
    }

    /// Registers a descriptor set to be allocated later, returning a view
    /// that resolves once [`allocate_prepared_descriptor_sets`] runs.
    pub fn prepare_new_descriptor_set(
        &mut self,
        layout: Arc<DescriptorSetLayout>,
        descriptors: Vec<FutureDescriptor>,
    ) -> DescriptorSetView {
        let start = self.local_descriptors.len();
        let count = descriptors.len();
        self.local_descriptors.extend(descriptors);

        let cell = Arc::new(Mutex::new(None));
        self.sets_to_allocate.push(SetToAllocate {
            layout,
            descriptor_range: start..start + count,
            cell: cell.clone(),
        });

        DescriptorSetView { cell }
    }

    /// Resolves every prepared set's descriptors and allocates the real
    /// `VkDescriptorSet`s, grouped into one pool call per consecutive run of
    /// requests sharing a layout.
    pub fn allocate_prepared_descriptor_sets(&mut self) -> Result<()> {
        if self.sets_to_allocate.is_empty() {
            return Ok(());
        }

        let resolved: Vec<_> = self
            .local_descriptors
            .drain(..)
            .map(FutureDescriptor::resolve)
            .collect();

        let mut i = 0;
        while i < self.sets_to_allocate.len() {
            let mut j = i;
            while j + 1 < self.sets_to_allocate.len()
                && Arc::ptr_eq(&self.sets_to_allocate[j + 1].layout, &self.sets_to_allocate[i].layout)
            {
                j += 1;
            }

            let layout = self.sets_to_allocate[i].layout.clone();
            let descriptors_per_set: Vec<Vec<_>> = self.sets_to_allocate[i..=j]
                .iter()
                .map(|s| resolved[s.descriptor_range.clone()].to_vec())
                .collect();

            let handles = self.descriptor_pool.allocate_descriptor_sets(&layout, &descriptors_per_set)?;
            for (set_info, handle) in self.sets_to_allocate[i..=j].iter().zip(handles) {
                *set_info.cell.lock() = Some(handle);
                self.allocated_sets.push((layout.raw, handle));
            }

            i = j + 1;
        }

        self.sets_to_allocate.clear();
        Ok(())
    }

    /// Called once the job using these sets has finished on the GPU: frees
    /// them back to the pool immediately, since by this point nothing can
    /// still be referencing them.
    pub fn free_allocated_descriptor_sets(&mut self) {
        for (layout, set) in self.allocated_sets.drain(..) {
            self.descriptor_pool.queue_free_descriptor_set(layout, set, LastUse::new());
        }
    }

    pub fn clear(&mut self) {
        self.sets_to_allocate.clear();
        self.local_descriptors.clear();
        self.allocated_sets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::descriptor::Descriptor;

    #[test]
    fn unresolved_view_returns_none() {
        let view = DescriptorSetView {
            cell: Arc::new(Mutex::new(None)),
        };
        assert!(view.vk_resolve_descriptor_set_handle().is_none());
    }

    #[test]
    fn resolved_view_returns_the_written_handle() {
        let cell = Arc::new(Mutex::new(None));
        let view = DescriptorSetView { cell: cell.clone() };
        *cell.lock() = Some(vk::DescriptorSet::null());
        assert_eq!(view.vk_resolve_descriptor_set_handle(), Some(vk::DescriptorSet::null()));
    }

    #[test]
    fn deferred_descriptor_is_resolved_before_grouping() {
        let resolved = FutureDescriptor::Deferred(Box::new(|| Descriptor::Sampler(vk::Sampler::null())));
        assert!(matches!(resolved.resolve(), Descriptor::Sampler(_)));
    }
}
