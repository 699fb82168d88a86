//! Preinitialized ("job-owned but host-uploadable") buffer allocation (C4,
//! spec §4.4).
//!
//! Ported in spirit from
//! `original_source/src/tephra/job/preinit_buffer_allocator.cpp`'s
//! `PreinitializedBufferAllocator`: requests are grouped by `(usage mask,
//! memory preference)`, suballocated from a growable backing segment per
//! group, and every allocation made for a job is released together once
//! that job finishes. The original's `GrowableRingBuffer` implements true
//! ring wraparound across a chain of backing buffers; this keeps the
//! externally visible contract — bump-allocate within a job, release the
//! whole job's allocations at once, reclaim a segment once nothing
//! references it — but replaces literal address-space wraparound with
//! simple per-segment refcounting, since nothing in spec §4.4 depends on
//! reused bytes landing at a particular address (an Open Question
//! decision, see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use crate::device::DeviceShared;
use crate::error::Result;
use crate::resource::buffer::{Buffer, BufferSetup, BufferUsage};
use crate::types::{MemoryPreference, MemoryPreferenceKey, OverallocationBehavior};

/// A preinitialized buffer's real handle, available immediately since C4
/// allocates eagerly rather than resolving after a compile-time pass (spec
/// §4.4), so the host can write into it before the owning job's commands run.
#[derive(Debug, Clone, Copy)]
pub struct PreinitBufferHandle {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

fn round_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) / alignment * alignment
}

/// Whether `aligned_size` more bytes fit after `bump_offset` in a segment of
/// `capacity` bytes.
fn fits(bump_offset: u64, capacity: u64, aligned_size: u64) -> bool {
    bump_offset + aligned_size <= capacity
}

/// Advances a segment's bump cursor past a new allocation of `aligned_size`
/// bytes. Allocation order within a job is never reordered, so this is
/// simple forward bump allocation — no free list within a still-recording
/// job's segment.
fn bump_allocate(bump_offset: u64, aligned_size: u64) -> u64 {
    bump_offset + aligned_size
}

/// Releases one allocation from a segment with `live_allocation_count`
/// allocations outstanding. Once the last one is gone the segment's bump
/// cursor resets to the start, so the next job to claim this group bump-
/// allocates from offset 0 instead of growing a new segment (spec §4.4's
/// ring-buffer reuse) — a segment is only ever reused once fully vacated,
/// not address-stably mid-flight.
fn release_allocation(live_allocation_count: u32, bump_offset: u64) -> (u32, u64) {
    let remaining = live_allocation_count - 1;
    let bump_offset = if remaining == 0 { 0 } else { bump_offset };
    (remaining, bump_offset)
}

/// Clears a group's recording claim if `job_id` is the one holding it —
/// a job finalizing never releases a claim some other, still-recording job
/// took after stealing the group (can't happen under §5's one-writer-per-
/// group rule, but this keeps the check honest regardless).
fn finalize_claim(recording_job_id: &mut Option<u64>, job_id: u64) {
    if *recording_job_id == Some(job_id) {
        *recording_job_id = None;
    }
}

struct Segment {
    buffer: Buffer,
    capacity: u64,
    bump_offset: u64,
    live_allocation_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreinitBufferAllocation {
    group_key: GroupKey,
    segment_index: usize,
    pub offset: u64,
    aligned_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    usage: u32,
    memory_preference: u64, // hashed MemoryPreferenceKey
}

fn hash_preference_key(key: &MemoryPreferenceKey) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

struct Group {
    usage: BufferUsage,
    memory_preference: MemoryPreference,
    segments: Vec<Segment>,
    recording_job_id: Option<u64>,
}

/// Suballocates host-uploadable buffers shared across jobs in a pool,
/// releasing each job's share in one call once the job is done recording
/// (spec §4.4).
pub struct PreinitBufferAllocator {
    device: Arc<DeviceShared>,
    overallocation_behavior: OverallocationBehavior,
    disable_suballocation: bool,
    groups: HashMap<GroupKey, Group>,
    job_allocations: HashMap<u64, Vec<PreinitBufferAllocation>>,
    total_allocation_size: u64,
    total_allocation_count: u32,
}

impl PreinitBufferAllocator {
    pub fn new(
        device: Arc<DeviceShared>,
        overallocation_behavior: OverallocationBehavior,
        disable_suballocation: bool,
    ) -> Self {
        // No suballocation means every allocation needs an exactly-sized
        // backing buffer of its own (spec §4.4's DisableSuballocation flag).
        let overallocation_behavior = if disable_suballocation {
            OverallocationBehavior::none()
        } else {
            overallocation_behavior
        };

        Self {
            device,
            overallocation_behavior,
            disable_suballocation,
            groups: HashMap::new(),
            job_allocations: HashMap::new(),
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

    /// Allocates `setup.size` bytes for `job_id`. A group is claimed
    /// exclusively by one recording job at a time so its current segment's
    /// bump cursor is only ever advanced by one job concurrently — matching
    /// spec §5's "ResourcePool+Jobs are one synchronization domain".
    pub fn allocate_job_buffer(
        &mut self,
        job_id: u64,
        setup: &BufferSetup,
        memory_preference: &MemoryPreference,
    ) -> Result<PreinitBufferAllocation> {
        let key = GroupKey {
            usage: setup.usage.as_raw(),
            memory_preference: hash_preference_key(&memory_preference.key()),
        };

        if !self.groups.contains_key(&key) {
            self.groups.insert(
                key,
                Group {
                    usage: setup.usage,
                    memory_preference: memory_preference.clone(),
                    segments: Vec::new(),
                    recording_job_id: None,
                },
            );
        }

        let aligned_size = round_up(setup.size, 16);
        let disable_suballocation = self.disable_suballocation;
        let overallocation_behavior = self.overallocation_behavior;
        let device = self.device.clone();

        let group = self.groups.get_mut(&key).unwrap();
        group.recording_job_id = Some(job_id);

        let segment_index = find_or_grow_segment(
            group,
            &device,
            aligned_size,
            disable_suballocation,
            overallocation_behavior,
            &mut self.total_allocation_count,
            &mut self.total_allocation_size,
        )?;

        let segment = &mut group.segments[segment_index];
        let offset = segment.bump_offset;
        segment.bump_offset = bump_allocate(segment.bump_offset, aligned_size);
        segment.live_allocation_count += 1;

        let allocation = PreinitBufferAllocation {
            group_key: key,
            segment_index,
            offset,
            aligned_size,
        };
        self.job_allocations.entry(job_id).or_default().push(allocation);

        Ok(allocation)
    }

    /// The job has finished recording; its claimed groups may now accept
    /// allocations from other jobs (spec §4.4: `finalizeJobAllocations`).
    pub fn finalize_job_allocations(&mut self, job_id: u64) {
        for group in self.groups.values_mut() {
            finalize_claim(&mut group.recording_job_id, job_id);
        }
    }

    /// Releases every allocation made for `job_id`, letting its segments be
    /// reused or trimmed.
    pub fn free_job_allocations(&mut self, job_id: u64) {
        let Some(allocations) = self.job_allocations.remove(&job_id) else {
            return;
        };
        for allocation in allocations {
            if let Some(group) = self.groups.get_mut(&allocation.group_key) {
                let segment = &mut group.segments[allocation.segment_index];
                let (live, bump_offset) = release_allocation(segment.live_allocation_count, segment.bump_offset);
                segment.live_allocation_count = live;
                segment.bump_offset = bump_offset;
            }
        }
    }

    /// Frees backing buffers for segments with no live allocations, skipping
    /// groups currently claimed by a recording job.
    pub fn trim(&mut self) {
        for group in self.groups.values_mut() {
            if group.recording_job_id.is_some() {
                continue;
            }
            let mut i = 0;
            while i < group.segments.len() {
                if group.segments[i].live_allocation_count == 0 && group.segments[i].bump_offset == 0 {
                    let removed = group.segments.remove(i);
                    self.total_allocation_size -= removed.capacity;
                    self.total_allocation_count -= 1;
                } else {
                    i += 1;
                }
            }
        }
    }

    pub fn resolve(&self, allocation: &PreinitBufferAllocation) -> (&Buffer, u64) {
        let group = &self.groups[&allocation.group_key];
        let segment = &group.segments[allocation.segment_index];
        (&segment.buffer, allocation.offset)
    }
}

#[allow(clippy::too_many_arguments)]
fn find_or_grow_segment(
    group: &mut Group,
    device: &Arc<DeviceShared>,
    aligned_size: u64,
    disable_suballocation: bool,
    overallocation_behavior: OverallocationBehavior,
    total_allocation_count: &mut u32,
    total_allocation_size: &mut u64,
) -> Result<usize> {
    if !disable_suballocation {
        if let Some(last) = group.segments.last() {
            if fits(last.bump_offset, last.capacity, aligned_size) {
                return Ok(group.segments.len() - 1);
            }
        }
    }

    let current_total: u64 = group.segments.iter().map(|s| s.capacity).sum();
    let size_to_alloc = if disable_suballocation {
        aligned_size
    } else {
        overallocation_behavior.apply(aligned_size, current_total)
    };

    let backing_setup = BufferSetup::new(size_to_alloc, group.usage);
    let buffer = Buffer::create(device, &backing_setup, &group.memory_preference)?;

    *total_allocation_count += 1;
    *total_allocation_size += buffer.size();

    group.segments.push(Segment {
        buffer,
        capacity: size_to_alloc,
        bump_offset: 0,
        live_allocation_count: 0,
    });
    Ok(group.segments.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_bump_allocate_within_a_segment() {
        let offset_a = 0u64;
        let after_a = bump_allocate(offset_a, 64);
        assert_eq!(after_a, 64);
        let after_b = bump_allocate(after_a, 32);
        assert_eq!(after_b, 96);
    }

    #[test]
    fn a_request_that_no_longer_fits_needs_a_new_segment() {
        assert!(fits(0, 128, 128));
        assert!(!fits(96, 128, 64));
    }

    #[test]
    fn a_segment_is_reusable_only_once_every_allocation_is_freed() {
        // Two allocations made into a segment at offsets 0 and 64.
        let (live, bump_offset) = release_allocation(2, 96);
        // One freed: the segment still has a live allocation, so its bump
        // cursor must not move out from under it.
        assert_eq!((live, bump_offset), (1, 96));

        // The second (and last) is freed: the segment is fully vacated, so
        // the next job to claim this group starts bump-allocating from 0
        // again instead of growing another segment (spec §4.4's ring reuse).
        let (live, bump_offset) = release_allocation(live, bump_offset);
        assert_eq!((live, bump_offset), (0, 0));
    }

    #[test]
    fn finalizing_a_different_job_does_not_release_the_recording_claim() {
        let mut claim = Some(1u64);
        finalize_claim(&mut claim, 2);
        assert_eq!(claim, Some(1));

        finalize_claim(&mut claim, 1);
        assert_eq!(claim, None);
    }
}
