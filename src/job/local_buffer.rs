//! Job-local buffer allocation (C2, spec §4.2).
//!
//! Ported in spirit from
//! `original_source/src/tephra/job/local_buffer_allocator.cpp`'s
//! `JobLocalBufferAllocator`: buffers requested by a job are either
//! suballocated with aliasing (via [`crate::job::aliasing`]) across a pool
//! of backing buffers sorted largest-first, or — if the pool disables
//! suballocation — each gets its own backing buffer sized exactly to the
//! request. Backing buffers are kept around and reused across jobs,
//! trimmed once their last use falls behind the caller's retirement
//! timestamp.

use crate::device::DeviceShared;
use crate::error::Result;
use crate::job::aliasing::{AliasingSuballocator, ResourceUsageRange};
use crate::resource::buffer::{backing_buffer_usage_superset, Buffer, BufferSetup, BufferUsage};
use crate::types::{MemoryPreference, OverallocationBehavior};
use std::sync::Arc;

/// A single buffer a job wants to allocate, plus the usage range computed
/// from the job's recorded commands that reference it.
pub struct BufferRequest {
    pub size: u64,
    pub usage: BufferUsage,
    pub usage_range: ResourceUsageRange,
}

/// Where a requested buffer ended up: an index into the allocator's backing
/// buffer list, plus the byte offset into that backing buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferAssignment {
    pub backing_index: usize,
    pub offset: u64,
}

/// Alignment required by a job-local buffer view's usage mask, maximum
/// taken over every usage bit set (spec §4.2). `host_mapped`'s
/// `non_coherent_atom_size` bit isn't applied here since it depends on the
/// backing buffer's memory location rather than its usage mask alone —
/// callers that place a usage range in non-coherent host-visible memory are
/// expected to round flush ranges to it separately.
fn required_view_alignment(limits: &ash::vk::PhysicalDeviceLimits, usage: BufferUsage) -> u64 {
    use ash::vk::BufferUsageFlags as U;
    let mut alignment = 4u64;
    if usage.contains(U::TRANSFER_SRC) || usage.contains(U::TRANSFER_DST) {
        alignment = alignment.max(32).max(limits.optimal_buffer_copy_offset_alignment);
    }
    if usage.contains(U::UNIFORM_TEXEL_BUFFER) || usage.contains(U::STORAGE_TEXEL_BUFFER) {
        alignment = alignment.max(limits.min_texel_buffer_offset_alignment);
    }
    if usage.contains(U::UNIFORM_BUFFER) {
        alignment = alignment.max(limits.min_uniform_buffer_offset_alignment);
    }
    if usage.contains(U::STORAGE_BUFFER) {
        alignment = alignment.max(limits.min_storage_buffer_offset_alignment);
    }
    if usage.contains(U::VERTEX_BUFFER) {
        alignment = alignment.max(8);
    }
    alignment
}

struct AssignInfo {
    usage_range: ResourceUsageRange,
    size: u64,
    alignment: u64,
    request_index: usize,
}

pub struct JobLocalBufferAllocator {
    device: Arc<DeviceShared>,
    overallocation_behavior: OverallocationBehavior,
    disable_suballocation: bool,
    backing_buffers: Vec<(Buffer, u64)>,
    total_allocation_size: u64,
    total_allocation_count: u32,
}

impl JobLocalBufferAllocator {
    pub fn new(
        device: Arc<DeviceShared>,
        overallocation_behavior: OverallocationBehavior,
        disable_suballocation: bool,
    ) -> Self {
        Self {
            device,
            overallocation_behavior,
            disable_suballocation,
            backing_buffers: Vec::new(),
            total_allocation_size: 0,
            total_allocation_count: 0,
        }
    }

    pub fn allocation_count(&self) -> u32 {
        self.total_allocation_count
    }

    pub fn total_size(&self) -> u64 {
        self.total_allocation_size
    }

    /// Frees every backing buffer last used at or before `up_to_timestamp`.
    pub fn trim(&mut self, up_to_timestamp: u64) {
        let (keep, removed): (Vec<_>, Vec<_>) = self
            .backing_buffers
            .drain(..)
            .partition(|(_, last_used)| *last_used > up_to_timestamp);
        self.backing_buffers = keep;
        for (buffer, _) in removed {
            self.total_allocation_size -= buffer.size();
            self.total_allocation_count -= 1;
            // Dropping `buffer` enqueues its destruction; it's already
            // known unused so the deferred queue drains it immediately.
        }
    }

    /// Allocates every buffer in `requests` never used in the job (empty
    /// usage range) is skipped. Returns one assignment per request, `None`
    /// for skipped/unused requests, in the same order as `requests`.
    pub fn allocate_job_buffers(
        &mut self,
        requests: &[BufferRequest],
        current_timestamp: u64,
    ) -> Result<Vec<Option<BufferAssignment>>> {
        let limits = self.device.limits;
        let mut assign_infos: Vec<AssignInfo> = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            if request.usage_range.is_empty() {
                continue;
            }
            assign_infos.push(AssignInfo {
                usage_range: request.usage_range,
                size: request.size,
                alignment: required_view_alignment(&limits, request.usage),
                request_index: i,
            });
        }

        let mut results = vec![None; requests.len()];
        if assign_infos.is_empty() {
            return Ok(results);
        }

        if self.disable_suballocation {
            self.allocate_group_no_alias(&mut assign_infos, current_timestamp, &mut results)?;
        } else {
            self.allocate_group_aliased(&mut assign_infos, current_timestamp, &mut results)?;
        }

        Ok(results)
    }

    fn allocate_backing_buffer(&self, size: u64) -> Result<Buffer> {
        let device_address_supported = self.device.supports_buffer_device_address;
        let usage = backing_buffer_usage_superset(device_address_supported);
        let setup = BufferSetup::new(size, usage);
        Buffer::create(&self.device, &setup, &MemoryPreference::device())
    }

    fn allocate_group_aliased(
        &mut self,
        assign_infos: &mut [AssignInfo],
        current_timestamp: u64,
        results: &mut [Option<BufferAssignment>],
    ) -> Result<()> {
        let backing_sizes: Vec<u64> = self.backing_buffers.iter().map(|(b, _)| b.size()).collect();
        let mut suballocator = AliasingSuballocator::new(&backing_sizes);

        // Sort largest-first: a large buffer should claim a backing buffer
        // before small ones fragment it.
        assign_infos.sort_by(|a, b| b.size.cmp(&a.size));

        let mut leftover: Vec<(usize, u64)> = Vec::new();
        let mut leftover_size = 0u64;

        for info in assign_infos.iter() {
            let placement = suballocator.allocate(info.size, info.usage_range, info.alignment);
            if (placement.backing_index as usize) < self.backing_buffers.len() {
                self.backing_buffers[placement.backing_index as usize].1 = current_timestamp;
                results[info.request_index] = Some(BufferAssignment {
                    backing_index: placement.backing_index as usize,
                    offset: placement.offset,
                });
            } else {
                leftover.push((info.request_index, placement.offset));
                leftover_size = leftover_size.max(placement.offset + info.size);
            }
        }

        if leftover.is_empty() {
            return Ok(());
        }

        let current_group_size: u64 = self.backing_buffers.iter().map(|(b, _)| b.size()).sum();
        let size_to_alloc = self.overallocation_behavior.apply(leftover_size, current_group_size);
        let new_backing = self.allocate_backing_buffer(size_to_alloc)?;
        self.total_allocation_size += new_backing.size();
        self.total_allocation_count += 1;
        let new_index = self.insert_backing_buffer_sorted(new_backing, current_timestamp);

        for (request_index, offset) in leftover {
            results[request_index] = Some(BufferAssignment {
                backing_index: new_index,
                offset,
            });
        }

        Ok(())
    }

    fn allocate_group_no_alias(
        &mut self,
        assign_infos: &mut [AssignInfo],
        current_timestamp: u64,
        results: &mut [Option<BufferAssignment>],
    ) -> Result<()> {
        assign_infos.sort_by(|a, b| b.size.cmp(&a.size));

        let mut cursor = 0usize;
        for info in assign_infos.iter() {
            let backing_index = if cursor < self.backing_buffers.len()
                && info.size <= self.backing_buffers[cursor].0.size()
            {
                self.backing_buffers[cursor].1 = current_timestamp;
                let idx = cursor;
                cursor += 1;
                idx
            } else {
                let new_backing = self.allocate_backing_buffer(info.size)?;
                self.total_allocation_size += new_backing.size();
                self.total_allocation_count += 1;
                self.insert_backing_buffer_sorted(new_backing, current_timestamp)
            };

            results[info.request_index] = Some(BufferAssignment {
                backing_index,
                offset: 0,
            });
        }

        Ok(())
    }

    /// Appends a freshly allocated backing buffer and returns its index.
    /// Unlike the original's "insert sorted, largest first" step — which
    /// only optimizes future reuse-scan order and never affects which
    /// buffer a resource is assigned to, since the original identifies
    /// backing buffers by pointer, not index — appending keeps indices
    /// handed out earlier in this same call stable.
    fn insert_backing_buffer_sorted(&mut self, buffer: Buffer, last_used: u64) -> usize {
        self.backing_buffers.push((buffer, last_used));
        self.backing_buffers.len() - 1
    }

    pub fn backing_buffer(&self, index: usize) -> &Buffer {
        &self.backing_buffers[index].0
    }
}
