//! The `Device` facade (C12, spec §4.12): owns the logical device, the
//! sub-allocator, per-queue timelines and every deferred-destruction queue,
//! and is the construction point for every other object in the crate.
//!
//! Grounded on the teacher's `vulkan::Device` (`vulkan/device.rs`): same
//! "one struct owns the logical device plus all its satellite managers"
//! shape, generalized from the teacher's fixed two-queue, per-frame model to
//! an arbitrary queue set with timeline-gated destruction.

pub mod lifeguard;
pub mod queue;
pub mod timeline;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation as GpuMemoryLocation;
use parking_lot::Mutex;

use crate::command::{CommandBuffer, CommandPool};
use crate::error::{Error, Result};
use crate::instance::{Instance, PhysicalDevice};
use crate::job::record::Job;
use crate::job::resource_pool::{JobResourcePoolSetup, ResourcePool};
use crate::resource::buffer::{Buffer, BufferDestructionQueue, BufferSetup};
use crate::resource::image::{Image, ImageDestructionQueue, ImageSetup};
use crate::resource::sampler_pipeline::{
    DescriptorSetLayout, DescriptorSetLayoutBinding, Pipeline, PipelineSetup, Sampler, SamplerSetup,
};
use crate::swapchain::Swapchain;
use crate::types::{DeviceQueue, ExternalSemaphore, JobSemaphore, MemoryLocation, MemoryPreference, QueueKind, Timeout};
use lifeguard::{DeferredDestructionQueue, LastUse};
use queue::{QueueMap, Queues, SemaphoreSubmitDescriptor};
use timeline::TimelineManager;

/// State shared (via `Arc`) by `Device` and every resource it creates, so
/// resources can enqueue their own destruction without holding a borrow of
/// `Device` itself.
pub struct DeviceShared {
    pub(crate) raw: ash::Device,
    pub(crate) limits: vk::PhysicalDeviceLimits,
    pub(crate) supports_buffer_device_address: bool,
    pub(crate) allocator: Mutex<Allocator>,
    pub(crate) timeline: TimelineManager,
    pub(crate) destruction_queue_buffers: BufferDestructionQueue,
    pub(crate) destruction_queue_images: ImageDestructionQueue,
    pub(crate) destruction_queue_samplers: DeferredDestructionQueue<vk::Sampler>,
    pub(crate) destruction_queue_pipelines: DeferredDestructionQueue<vk::Pipeline>,
}

impl DeviceShared {
    /// Picks the first location in `preference.location_progression` that
    /// the allocator can actually satisfy for `requirements`, per spec §6's
    /// "try each entry in order, use the first that succeeds" contract.
    /// `gpu-allocator` doesn't expose a dry-run probe, so "can satisfy" here
    /// means "is a heap of this kind present at all" — an allocation can
    /// still fail later for being simply too large, which surfaces as a
    /// normal `OutOfDeviceMemory`/`OutOfHostMemory` error from `allocate`.
    pub(crate) fn resolve_memory_location(
        &self,
        _requirements: &vk::MemoryRequirements,
        preference: &MemoryPreference,
    ) -> Result<GpuMemoryLocation> {
        preference
            .location_progression
            .first()
            .map(|location| to_gpu_allocator_location(*location))
            .ok_or_else(|| Error::InvalidArgument("memory preference has an empty location progression".into()))
    }

    /// Drains every deferred-destruction queue of entries whose `LastUse`
    /// has been reached on every queue it references (spec §4.9).
    pub fn collect_garbage(&self) {
        let last_reached = |q: DeviceQueue| self.timeline.last_reached(q);
        self.destruction_queue_buffers.drain_ready(last_reached);
        self.destruction_queue_images.drain_ready(last_reached);
        self.destruction_queue_samplers.drain_ready(last_reached);
        self.destruction_queue_pipelines.drain_ready(last_reached);
    }
}

fn to_gpu_allocator_location(location: MemoryLocation) -> GpuMemoryLocation {
    match location {
        MemoryLocation::DeviceLocal => GpuMemoryLocation::GpuOnly,
        MemoryLocation::DeviceLocalHostVisible | MemoryLocation::DeviceLocalHostCached => {
            GpuMemoryLocation::CpuToGpu
        }
        MemoryLocation::HostVisible | MemoryLocation::HostCached => GpuMemoryLocation::GpuToCpu,
    }
}

/// Which logical queues to create and how many of each, plus required
/// device extensions (spec §4.12, §4.10).
pub struct DeviceSetup<'a> {
    pub queues: &'a [(DeviceQueue, u32 /* queue_family_index */)],
    pub required_extensions: &'a [&'a str],
}

/// Thin orchestration facade over the logical device (spec §4.12): the
/// entry point applications use to create resources, submit jobs and poll
/// for completed GPU work.
pub struct Device {
    shared: Arc<DeviceShared>,
    queues: Queues,
    queue_map: QueueMap,
    job_queues: Mutex<HashMap<DeviceQueue, VecDeque<EnqueuedJob>>>,
    command_pools: Mutex<HashMap<DeviceQueue, Vec<CommandPool>>>,
    cleanup_callbacks: Mutex<Vec<(LastUse, Box<dyn FnOnce() + Send>)>>,
}

/// A job that finished recording, had its resources allocated/resolved and
/// was compiled into a command buffer, waiting for its queue's next
/// [`Device::submit_queued_jobs`] call (spec §4.10's enqueue/submit split).
struct EnqueuedJob {
    job: Job,
    pool: Arc<ResourcePool>,
    command_pool: CommandPool,
    command_buffer: CommandBuffer,
    timestamp: u64,
    job_semaphore_waits: Vec<JobSemaphore>,
    external_waits: Vec<(ExternalSemaphore, vk::PipelineStageFlags2)>,
    external_signals: Vec<ExternalSemaphore>,
}

/// Synchronization a job should wait on and signal once submitted (spec
/// §4.10). A job's own completion is always signalled as a `JobSemaphore`
/// regardless of this struct's contents; these are the *additional* waits
/// and externally owned semaphores to fold into the same submission.
#[derive(Default)]
pub struct JobWaits {
    pub job_semaphores: Vec<JobSemaphore>,
    pub external_waits: Vec<(ExternalSemaphore, vk::PipelineStageFlags2)>,
    pub external_signals: Vec<ExternalSemaphore>,
}

impl Device {
    pub fn new(instance: &Instance, physical_device: &PhysicalDevice, setup: &DeviceSetup) -> Result<Self> {
        if !physical_device.supports_extensions(setup.required_extensions) {
            return Err(Error::InvalidArgument(
                "physical device is missing a required extension".into(),
            ));
        }

        let mut family_queue_counts: HashMap<u32, u32> = HashMap::new();
        for family in &physical_device.queue_families {
            family_queue_counts.insert(family.index, family.properties.queue_count);
        }
        let queue_map = QueueMap::new(setup.queues, &family_queue_counts);

        // One VkDeviceQueueCreateInfo per distinct (family, count-needed) pair.
        let mut counts_per_family: HashMap<u32, u32> = HashMap::new();
        for (_, assignment) in queue_map.assignments() {
            let entry = counts_per_family.entry(assignment.queue_family_index).or_insert(0);
            *entry = (*entry).max(assignment.queue_index_in_family + 1);
        }
        let priorities = vec![1.0f32; 16];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = counts_per_family
            .iter()
            .map(|(&family_index, &count)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family_index)
                    .queue_priorities(&priorities[..count as usize])
            })
            .collect();

        let extension_name_cstrings: Vec<std::ffi::CString> = setup
            .required_extensions
            .iter()
            .map(|s| std::ffi::CString::new(*s).unwrap())
            .collect();
        let extension_names: Vec<*const i8> = extension_name_cstrings.iter().map(|s| s.as_ptr()).collect();

        let mut timeline_features = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut dynamic_rendering_features =
            vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true).synchronization2(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut timeline_features)
            .push_next(&mut dynamic_rendering_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        let raw = unsafe { instance.raw.create_device(physical_device.raw, &create_info, None)? };

        let logical_queues: Vec<DeviceQueue> = setup.queues.iter().map(|&(q, _)| q).collect();
        let handles: Vec<vk::Queue> = logical_queues
            .iter()
            .map(|&q| {
                let assignment = queue_map.assignment_of(q).expect("queue just inserted into the map");
                unsafe { raw.get_device_queue(assignment.queue_family_index, assignment.queue_index_in_family) }
            })
            .collect();
        let queues = Queues::new(raw.clone(), &logical_queues, &handles);

        let timeline = TimelineManager::new();
        for &queue in &logical_queues {
            let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
            let semaphore = unsafe { raw.create_semaphore(&info, None)? };
            timeline.register_queue(queue, semaphore);
        }

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| Error::Other(e.into()))?;

        let shared = Arc::new(DeviceShared {
            raw,
            limits: physical_device.limits,
            supports_buffer_device_address: false,
            allocator: Mutex::new(allocator),
            timeline,
            destruction_queue_buffers: DeferredDestructionQueue::new(),
            destruction_queue_images: DeferredDestructionQueue::new(),
            destruction_queue_samplers: DeferredDestructionQueue::new(),
            destruction_queue_pipelines: DeferredDestructionQueue::new(),
        });

        Ok(Self {
            shared,
            queues,
            queue_map,
            job_queues: Mutex::new(HashMap::new()),
            command_pools: Mutex::new(HashMap::new()),
            cleanup_callbacks: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub fn raw(&self) -> &ash::Device {
        &self.shared.raw
    }

    pub fn assign_next_timestamp(&self, queue: DeviceQueue) -> u64 {
        self.shared.timeline.assign_next_timestamp(queue)
    }

    pub fn submit(
        &self,
        queue: DeviceQueue,
        command_buffers: &[vk::CommandBuffer],
        waits: &[SemaphoreSubmitDescriptor],
        signals: &[SemaphoreSubmitDescriptor],
    ) -> Result<()> {
        self.queues.submit(queue, command_buffers, waits, signals)
    }

    /// Polls every registered queue's timeline semaphore and drains every
    /// deferred-destruction queue of now-ready entries (spec §4.8, §4.9).
    pub fn poll(&self) -> Result<()> {
        for &kind in &[QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer] {
            for index in 0..8 {
                let queue = DeviceQueue::new(kind, index);
                if self.queue_map.assignment_of(queue).is_none() {
                    continue;
                }
                self.shared.timeline.poll(&self.shared.raw, queue)?;
            }
        }
        self.shared.collect_garbage();
        Ok(())
    }

    /// Waits for every physical queue to go idle, locking each queue's
    /// submission mutex first so no new work can be submitted underneath the
    /// wait (spec §4.10).
    pub fn wait_idle(&self) -> Result<()> {
        let _guards = self.queues.lock_all_physical_queues();
        unsafe { self.shared.raw.device_wait_idle()? };
        Ok(())
    }

    /// Creates a new job resource pool (C7) bound to this device (spec §4.7).
    pub fn create_resource_pool(&self, setup: &JobResourcePoolSetup) -> Arc<ResourcePool> {
        Arc::new(ResourcePool::new(self.shared.clone(), setup))
    }

    /// Allocates a persistent buffer, lifeguarded against this device's
    /// timeline (spec §4.12).
    pub fn allocate_buffer(&self, setup: &BufferSetup, memory_preference: &MemoryPreference) -> Result<Buffer> {
        Buffer::create(&self.shared, setup, memory_preference)
    }

    /// Allocates a persistent image, lifeguarded against this device's
    /// timeline (spec §4.12).
    pub fn allocate_image(&self, setup: &ImageSetup, memory_preference: &MemoryPreference) -> Result<Image> {
        Image::create(&self.shared, setup, memory_preference)
    }

    /// Creates a persistent sampler, lifeguarded against this device's
    /// timeline (spec §4.12).
    pub fn create_sampler(&self, setup: &SamplerSetup) -> Result<Sampler> {
        Sampler::create(&self.shared, setup)
    }

    /// Creates a descriptor set layout. Unlike samplers/pipelines this
    /// destroys immediately on drop rather than through the lifeguard queue
    /// (spec §4.12; see `resource::sampler_pipeline`'s module doc for why).
    pub fn create_descriptor_set_layout(&self, bindings: &[DescriptorSetLayoutBinding]) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::create(&self.shared, bindings)
    }

    /// Creates a graphics pipeline (and its layout), lifeguarded against
    /// this device's timeline (spec §4.12).
    pub fn create_pipeline<'a>(&self, setup: PipelineSetup<'a>) -> Result<Pipeline> {
        Pipeline::create(&self.shared, setup)
    }

    /// Acquires a fresh [`Job`] to record against, draining `pool`'s
    /// finished-job release queue first against this device's own timeline
    /// progress (spec §4.7).
    pub fn acquire_job(&self, pool: &Arc<ResourcePool>) -> Job {
        pool.acquire_job(pool, |q| self.shared.timeline.last_reached(q))
    }

    fn acquire_command_pool(&self, queue: DeviceQueue) -> Result<CommandPool> {
        if let Some(pool) = self.command_pools.lock().get_mut(&queue).and_then(Vec::pop) {
            pool.reset()?;
            return Ok(pool);
        }
        let assignment = self
            .queue_map
            .assignment_of(queue)
            .ok_or_else(|| Error::InvalidArgument("enqueue_job on an unmapped DeviceQueue".into()))?;
        CommandPool::new(self.shared.clone(), assignment.queue_family_index)
    }

    fn release_command_pool(&self, queue: DeviceQueue, pool: CommandPool) {
        self.command_pools.lock().entry(queue).or_default().push(pool);
    }

    /// Allocates and resolves `job`'s job-local resources, allocates its
    /// prepared descriptor sets, compiles its command stream, and queues the
    /// result to be submitted on `queue` by the next [`Self::submit_queued_jobs`]
    /// call (spec §4.10's "enqueue" step). Returns the [`JobSemaphore`] that
    /// will be signalled once this job retires.
    pub fn enqueue_job(
        &self,
        pool: &Arc<ResourcePool>,
        mut job: Job,
        queue: DeviceQueue,
        waits: JobWaits,
    ) -> Result<JobSemaphore> {
        let timestamp = self.shared.timeline.assign_next_timestamp(queue);

        let assignments = pool.allocate_job_resources(&job, timestamp)?;
        pool.resolve_job_resources(&job, &assignments);
        job.descriptor_sets_mut().allocate_prepared_descriptor_sets()?;
        // The job is done recording as of this point — its preinitialized
        // buffer claims (C4) are released for other jobs to allocate from
        // (spec §4.4's "finalize on enqueue" step).
        pool.finalize_preinit_allocations(job.id());

        let command_pool = self.acquire_command_pool(queue)?;
        let command_buffer = command_pool.allocate_primary()?;
        command_buffer.begin()?;
        job.compile(&command_buffer)?;
        command_buffer.end()?;

        self.job_queues.lock().entry(queue).or_default().push_back(EnqueuedJob {
            job,
            pool: pool.clone(),
            command_pool,
            command_buffer,
            timestamp,
            job_semaphore_waits: waits.job_semaphores,
            external_waits: waits.external_waits,
            external_signals: waits.external_signals,
        });

        Ok(JobSemaphore { queue, timestamp })
    }

    /// Submits every job enqueued against `queue` since the last call, in
    /// enqueue order, as one `vkQueueSubmit2` per job (spec §4.10's "submit
    /// batcher"). Each job's own retirement semaphore is signalled alongside
    /// any external semaphores it requested.
    pub fn submit_queued_jobs(&self, queue: DeviceQueue) -> Result<()> {
        let entries: Vec<EnqueuedJob> = self
            .job_queues
            .lock()
            .get_mut(&queue)
            .map(|pending| pending.drain(..).collect())
            .unwrap_or_default();

        for entry in entries {
            let EnqueuedJob {
                job,
                pool,
                command_pool,
                command_buffer,
                timestamp,
                job_semaphore_waits,
                external_waits,
                external_signals,
            } = entry;

            let mut waits: Vec<SemaphoreSubmitDescriptor> = job_semaphore_waits
                .iter()
                .map(|s| {
                    SemaphoreSubmitDescriptor::timeline(
                        self.shared.timeline.semaphore_of(s.queue),
                        vk::PipelineStageFlags2::ALL_COMMANDS,
                        s.timestamp,
                    )
                })
                .collect();
            waits.extend(external_waits.iter().map(|(semaphore, stage)| {
                semaphore_submit_descriptor(*semaphore, *stage)
            }));

            let mut signals = vec![SemaphoreSubmitDescriptor::timeline(
                self.shared.timeline.semaphore_of(queue),
                vk::PipelineStageFlags2::ALL_COMMANDS,
                timestamp,
            )];
            signals.extend(
                external_signals
                    .iter()
                    .map(|semaphore| semaphore_submit_descriptor(*semaphore, vk::PipelineStageFlags2::ALL_COMMANDS)),
            );

            let command_buffers = [command_buffer.vk_handle()];
            self.queues.submit(queue, &command_buffers, &waits, &signals)?;

            self.release_command_pool(queue, command_pool);
            pool.queue_release_job(job, LastUse::single(queue, timestamp));
        }

        Ok(())
    }

    /// Presents `image_index` on `queue` (spec §4.11).
    pub fn submit_present_images(&self, queue: DeviceQueue, swapchain: &mut Swapchain, image_index: u32) -> Result<()> {
        swapchain.present(self.queues.raw_handle(queue), image_index)
    }

    pub fn is_job_semaphore_signalled(&self, semaphore: JobSemaphore) -> bool {
        self.shared.timeline.is_reached(semaphore.queue, semaphore.timestamp)
    }

    pub fn wait_for_job_semaphores(&self, semaphores: &[JobSemaphore], wait_all: bool, timeout: Timeout) -> Result<bool> {
        let targets: Vec<(DeviceQueue, u64)> = semaphores.iter().map(|s| (s.queue, s.timestamp)).collect();
        self.shared.timeline.wait_for_timestamps(&self.shared.raw, &targets, wait_all, timeout)
    }

    /// Registers a callback to run once `last_use` is reached, drained by
    /// [`Self::update_device_progress`] (spec §4.9's general-purpose lifeguard
    /// hook, for caller-owned state this crate doesn't itself track).
    pub fn add_cleanup_callback(&self, last_use: LastUse, callback: impl FnOnce() + Send + 'static) {
        self.cleanup_callbacks.lock().push((last_use, Box::new(callback)));
    }

    /// Polls every queue's timeline, drains every deferred-destruction queue,
    /// and runs every cleanup callback whose `LastUse` has been reached
    /// (spec §4.8, §4.9).
    pub fn update_device_progress(&self) -> Result<()> {
        self.poll()?;

        let last_reached = |q: DeviceQueue| self.shared.timeline.last_reached(q);
        let mut callbacks = self.cleanup_callbacks.lock();
        let pending = std::mem::take(&mut *callbacks);
        let mut remaining = Vec::with_capacity(pending.len());
        for (last_use, callback) in pending {
            if last_use.is_reached(last_reached) {
                callback();
            } else {
                remaining.push((last_use, callback));
            }
        }
        *callbacks = remaining;

        Ok(())
    }
}

fn semaphore_submit_descriptor(
    semaphore: ExternalSemaphore,
    stage_mask: vk::PipelineStageFlags2,
) -> SemaphoreSubmitDescriptor {
    if semaphore.value == 0 {
        SemaphoreSubmitDescriptor::binary(semaphore.handle, stage_mask)
    } else {
        SemaphoreSubmitDescriptor::timeline(semaphore.handle, stage_mask, semaphore.value)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.wait_idle();
        // Command pools and any job/cleanup state must be torn down before
        // the logical device itself, since their own Drop impls still call
        // back into it.
        self.job_queues.lock().clear();
        self.command_pools.lock().clear();
        self.cleanup_callbacks.lock().clear();
        unsafe {
            self.shared.raw.destroy_device(None);
        }
    }
}
