//! Job resource pool (C7, spec §4.7): the object applications acquire jobs
//! from. Owns every job-local allocator (C2-C5) plus a pool of reusable
//! [`Job`] slots, and is the thing that eventually frees a job's resources
//! once the GPU has finished with it.
//!
//! Grounded on `resource_pool_container.hpp`'s `JobResourcePoolContainer`:
//! same four owned allocators (`localBufferPool`, `localImagePool`,
//! `preinitBufferPool`, `localDescriptorPool`), the same monotonically
//! incrementing acquired-job counter, and the same "submission/destruction
//! is externally synchronized, but releasing a finished job must still be
//! thread-safe" split — realized here as a `Mutex`-protected release queue
//! drained at the start of every `acquire_job` call, exactly like the
//! original's `tryFreeSubmittedJobs`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::lifeguard::LastUse;
use crate::device::DeviceShared;
use crate::error::Result;
use crate::job::descriptor::JobLocalDescriptorSets;
use crate::job::local_buffer::{BufferAssignment, JobLocalBufferAllocator};
use crate::job::local_image::{ImageAssignment, ImageClass, JobLocalImageAllocator};
use crate::job::preinit::{PreinitBufferAllocator, PreinitBufferHandle};
use crate::job::record::{Job, PreinitBufferRouter, ResolvedBufferRef, ResolvedImageRef};
use crate::resource::buffer::BufferSetup;
use crate::resource::descriptor_pool::DescriptorPool;
use crate::types::{MemoryPreference, OverallocationBehavior};

/// The next id in `acquire_job`'s monotonic sequence, given the count of jobs
/// acquired so far.
fn next_job_id(jobs_acquired_count: u64) -> u64 {
    jobs_acquired_count + 1
}

/// Where every resource a job requested ended up, once C2/C3 have run their
/// allocation pass over the job's recorded requests.
pub struct JobResourceAssignments {
    pub buffers: Vec<Option<BufferAssignment>>,
    pub images: Vec<Option<ImageAssignment>>,
}

/// Construction parameters for a [`ResourcePool`] (spec §4.7, §6).
pub struct JobResourcePoolSetup {
    pub overallocation_behavior: OverallocationBehavior,
    pub disable_suballocation: bool,
}

impl Default for JobResourcePoolSetup {
    fn default() -> Self {
        Self {
            overallocation_behavior: OverallocationBehavior::default(),
            disable_suballocation: false,
        }
    }
}

/// A job that finished recording and is waiting for its resources to be
/// released once the work it was submitted as has retired.
struct RetiredJob {
    job: Job,
    last_use: LastUse,
}

struct Inner {
    buffers: JobLocalBufferAllocator,
    images: JobLocalImageAllocator,
    preinit: PreinitBufferAllocator,
    jobs_acquired_count: u64,
}

/// Owns every job-local allocator and hands out [`Job`]s to record against
/// (spec §4.7). A single pool may have many jobs recorded against it
/// concurrently, but releasing a finished job is the only operation that
/// needs to be safe to call from another thread while that's happening —
/// matching the original's synchronization contract.
pub struct ResourcePool {
    inner: Mutex<Inner>,
    descriptor_pool: Arc<DescriptorPool>,
    release_queue: Mutex<Vec<RetiredJob>>,
}

impl ResourcePool {
    pub fn new(device: Arc<DeviceShared>, setup: &JobResourcePoolSetup) -> Self {
        let descriptor_pool = Arc::new(DescriptorPool::new(device.clone(), setup.overallocation_behavior));
        Self {
            inner: Mutex::new(Inner {
                buffers: JobLocalBufferAllocator::new(
                    device.clone(),
                    setup.overallocation_behavior,
                    setup.disable_suballocation,
                ),
                images: JobLocalImageAllocator::new(device.clone(), setup.disable_suballocation),
                preinit: PreinitBufferAllocator::new(device, setup.overallocation_behavior, setup.disable_suballocation),
                jobs_acquired_count: 0,
            }),
            descriptor_pool,
            release_queue: Mutex::new(Vec::new()),
        }
    }

    /// Returns a fresh, monotonically numbered [`Job`] to record commands
    /// against. Drains the release queue first, same as the original's
    /// `tryFreeSubmittedJobs` call at the top of `acquireJob`. `self_handle`
    /// must be the same pool this method is called on — it's threaded
    /// through so the returned job can route preinitialized-buffer requests
    /// (C4) back to this pool's allocator without `Job` borrowing from it.
    pub fn acquire_job(
        &self,
        self_handle: &Arc<Self>,
        last_reached: impl Fn(crate::types::DeviceQueue) -> u64 + Copy,
    ) -> Job {
        self.release_finished_jobs(last_reached);

        let mut inner = self.inner.lock();
        inner.jobs_acquired_count = next_job_id(inner.jobs_acquired_count);
        let pool = self_handle.clone();
        let router: PreinitBufferRouter =
            Arc::new(move |job_id, setup, memory_preference| pool.allocate_preinit_buffer(job_id, setup, memory_preference));
        Job::new(inner.jobs_acquired_count, self.descriptor_pool.clone(), router)
    }

    /// Allocates a preinitialized buffer (C4) for `job_id`, returning its
    /// real handle immediately since these allocations are bump-allocated
    /// eagerly rather than resolved after a compile-time pass (spec §4.4).
    pub fn allocate_preinit_buffer(
        &self,
        job_id: u64,
        setup: &BufferSetup,
        memory_preference: &MemoryPreference,
    ) -> Result<PreinitBufferHandle> {
        let mut inner = self.inner.lock();
        let allocation = inner.preinit.allocate_job_buffer(job_id, setup, memory_preference)?;
        let (buffer, offset) = inner.preinit.resolve(&allocation);
        Ok(PreinitBufferHandle {
            buffer: buffer.vk_handle(),
            offset,
            size: setup.size,
        })
    }

    pub fn local_descriptor_sets(&self) -> JobLocalDescriptorSets {
        JobLocalDescriptorSets::new(self.descriptor_pool.clone())
    }

    /// Runs the job-local buffer (C2) and image (C3) allocation passes over
    /// `job`'s recorded requests, matching the original's
    /// `allocateJobResources` compile-time step.
    pub fn allocate_job_resources(&self, job: &Job, current_timestamp: u64) -> Result<JobResourceAssignments> {
        let mut inner = self.inner.lock();
        let buffers = inner.buffers.allocate_job_buffers(job.buffer_requests(), current_timestamp)?;
        let images = inner.images.allocate_job_images(job.image_requests(), current_timestamp)?;
        Ok(JobResourceAssignments { buffers, images })
    }

    /// Writes each assigned job-local buffer/image's real handle into the
    /// job's resolved cells, so every [`crate::resource::descriptor::FutureDescriptor`]
    /// prepared against it and the job's own compiled commands can read a
    /// concrete `vk::Buffer`/`vk::Image` (spec §4.10's "resolve job-local
    /// resources" step, between allocation and compilation).
    pub fn resolve_job_resources(&self, job: &Job, assignments: &JobResourceAssignments) {
        let inner = self.inner.lock();
        for (index, assignment) in assignments.buffers.iter().enumerate() {
            let Some(assignment) = assignment else { continue };
            let buffer = inner.buffers.backing_buffer(assignment.backing_index);
            *job.buffer_resolved_cell(index).lock() = Some(ResolvedBufferRef {
                buffer: buffer.vk_handle(),
                base_offset: assignment.offset,
            });
        }
        for (index, assignment) in assignments.images.iter().enumerate() {
            let Some(assignment) = assignment else { continue };
            let class = ImageClass::of(&job.image_requests()[index].setup);
            let image = inner.images.backing_image(&class, assignment.backing_index);
            *job.image_resolved_cell(index).lock() = Some(ResolvedImageRef {
                image: image.vk_handle(),
                view: image.vk_view_handle(),
                base_array_layer: assignment.layer_offset,
            });
        }
    }

    /// Finalizes `job_id`'s preinitialized-buffer claims (C4's "finalize on
    /// enqueue" step, spec §4.4), letting other jobs allocate from the same
    /// group once this job is no longer recording.
    pub fn finalize_preinit_allocations(&self, job_id: u64) {
        self.inner.lock().preinit.finalize_job_allocations(job_id);
    }

    /// Queues `job`'s resources to be released once `last_use` is reached —
    /// called once the job has been submitted and its retirement point on
    /// every queue it touched is known.
    pub fn queue_release_job(&self, job: Job, last_use: LastUse) {
        self.release_queue.lock().push(RetiredJob { job, last_use });
    }

    fn release_finished_jobs(&self, last_reached: impl Fn(crate::types::DeviceQueue) -> u64 + Copy) {
        let finished: Vec<RetiredJob> = {
            let mut queue = self.release_queue.lock();
            let mut finished = Vec::new();
            let mut still_pending = Vec::new();
            for retired in queue.drain(..) {
                if retired.last_use.is_reached(last_reached) {
                    finished.push(retired);
                } else {
                    still_pending.push(retired);
                }
            }
            *queue = still_pending;
            finished
        };

        if finished.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for mut retired in finished {
            inner.preinit.free_job_allocations(retired.job.id());
            retired.job.descriptor_sets_mut().free_allocated_descriptor_sets();
        }
        drop(inner);
        // Sets just freed above moved into `pending_free`; move whichever of
        // those (from this and any earlier release) have also reached their
        // `last_use` into the reusable free list (spec §4.5's recycle step).
        self.descriptor_pool.reclaim_freed_sets(last_reached);
    }

    /// Forwards to every owned allocator's own `trim`, retiring backing
    /// allocations last used at or before `up_to_timestamp` (spec §4.7).
    pub fn trim(&self, up_to_timestamp: u64) {
        let mut inner = self.inner.lock();
        inner.buffers.trim(up_to_timestamp);
        inner.images.trim(up_to_timestamp);
        inner.preinit.trim();
    }

    pub fn statistics(&self) -> ResourcePoolStatistics {
        let inner = self.inner.lock();
        ResourcePoolStatistics {
            buffer_allocation_count: inner.buffers.allocation_count(),
            buffer_allocation_size: inner.buffers.total_size(),
            preinit_allocation_count: inner.preinit.allocation_count(),
            preinit_allocation_size: inner.preinit.total_size(),
            jobs_acquired_count: inner.jobs_acquired_count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourcePoolStatistics {
    pub buffer_allocation_count: u32,
    pub buffer_allocation_size: u64,
    pub preinit_allocation_count: u32,
    pub preinit_allocation_size: u64,
    pub jobs_acquired_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_reached(_: crate::types::DeviceQueue) -> u64 {
        u64::MAX
    }

    #[test]
    fn acquired_job_ids_are_monotonically_increasing() {
        // A real pool needs a Vulkan device to construct; this exercises
        // the exact sequence function `acquire_job` drives `jobs_acquired_count`
        // through, rather than a disconnected counter.
        let mut jobs_acquired_count = 0u64;
        for expected in 1..=3u64 {
            jobs_acquired_count = next_job_id(jobs_acquired_count);
            assert_eq!(jobs_acquired_count, expected);
        }
        let _ = always_reached;
    }
}
