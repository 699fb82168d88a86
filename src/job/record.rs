//! Job command recording and per-resource usage-range tracking (C6, spec
//! §4.6).
//!
//! The original's `JobRecord` keeps an intrusive singly-linked command
//! chain (`first_command_ptr`/`last_command_ptr`) so a command can be
//! revisited in place during compilation. Rust ownership makes that
//! encoding awkward for no benefit here — a plain `Vec<RecordedCommand>`
//! gives the same ordered-traversal guarantee the usage-range tracker
//! needs (an Open Question decision, see DESIGN.md), so that's what's kept.
//! Each command still carries its own index the same way the original's
//! chain nodes do, since [`crate::job::aliasing::ResourceUsageRange`]
//! widens around command indices rather than pointers.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::command::CommandBuffer;
use crate::error::Result;
use crate::job::aliasing::ResourceUsageRange;
use crate::job::descriptor::{DescriptorSetView, JobLocalDescriptorSets};
use crate::job::local_buffer::BufferRequest;
use crate::job::local_image::ImageRequest;
use crate::job::preinit::PreinitBufferHandle;
use crate::resource::buffer::{BufferSetup, BufferUsage};
use crate::resource::descriptor::{Descriptor, FutureDescriptor};
use crate::resource::descriptor_pool::DescriptorPool;
use crate::resource::image::ImageSetup;
use crate::resource::sampler_pipeline::DescriptorSetLayout;
use crate::types::{DeviceQueue, MemoryPreference, QueueKind};

/// Routes a job's [`Job::allocate_preinitialized_buffer`] calls back to the
/// owning resource pool's C4 allocator. A closure rather than a direct
/// `Arc<ResourcePool>` field, so `Job` doesn't need to name (or create a
/// cycle with) `ResourcePool`'s concrete type.
pub(crate) type PreinitBufferRouter =
    Arc<dyn Fn(u64, &BufferSetup, &MemoryPreference) -> Result<PreinitBufferHandle> + Send + Sync>;

/// A resource a command can reference: either one of this job's own
/// transient allocations, or an externally owned, already-resolved handle.
#[derive(Debug, Clone, Copy)]
pub enum JobResource {
    LocalBuffer(usize),
    LocalImage(usize),
    ExternalBuffer(vk::Buffer),
    ExternalImage(vk::Image),
    /// A preinitialized buffer (C4): already has a real handle since these
    /// are allocated eagerly rather than resolved after a compile-time pass.
    PreinitBuffer { buffer: vk::Buffer, offset: u64 },
}

/// Where a job-local buffer request ended up once C2 has run, written by
/// [`crate::job::resource_pool::ResourcePool::resolve_job_resources`] after
/// allocation and read back by every [`FutureDescriptor`] or compiled
/// command that references the same `JobResource::LocalBuffer`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedBufferRef {
    pub buffer: vk::Buffer,
    pub base_offset: u64,
}

/// Same role as [`ResolvedBufferRef`], for job-local images assigned by C3.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedImageRef {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub base_array_layer: u32,
}

/// One entry in the job's command stream (spec §4.6's tagged union).
/// Payloads are intentionally thin — this crate treats compute/render pass
/// *content* (shader dispatch parameters, attachments, etc.) as owned by
/// the caller's own render-graph-adjacent code; this type's job is to drive
/// usage-range tracking, queue-ownership transitions, and the handful of
/// transfer-style commands (copy/clear/discard) the crate compiles itself.
pub enum RecordedCommand {
    CopyBuffer {
        src: JobResource,
        src_offset: u64,
        dst: JobResource,
        dst_offset: u64,
        size: u64,
    },
    CopyImage {
        src: JobResource,
        dst: JobResource,
        extent: vk::Extent3D,
    },
    ClearBuffer {
        target: JobResource,
        size: u64,
    },
    ClearImage {
        target: JobResource,
    },
    Discard {
        target: JobResource,
    },
    Export {
        target: JobResource,
        target_queue: QueueKind,
    },
    ImportExternal {
        target: JobResource,
        source_queue: QueueKind,
    },
    BuildAccelerationStructure {
        scratch: JobResource,
        output: JobResource,
    },
    ExecuteComputePass {
        accessed: Vec<JobResource>,
        callback: Box<dyn FnOnce(&CommandBuffer) + Send>,
    },
    ExecuteRenderPass {
        accessed: Vec<JobResource>,
        callback: Box<dyn FnOnce(&CommandBuffer) + Send>,
    },
    DebugLabel {
        name: String,
    },
    TimestampWrite {
        query_index: u32,
    },
}

/// A requested queue-ownership transition recorded by an export or import
/// command, resolved later during job compilation.
pub struct QueueOwnershipTransition {
    pub target: JobResource,
    pub target_queue: QueueKind,
    pub command_index: u64,
}

/// A single job's command stream plus its own transient buffer/image
/// requests. Acquired from a [`crate::job::resource_pool::ResourcePool`]
/// and enqueued once recording is done.
pub struct Job {
    pub(crate) id: u64,
    commands: Vec<RecordedCommand>,
    buffer_requests: Vec<BufferRequest>,
    image_requests: Vec<ImageRequest>,
    buffer_resolved: Vec<Arc<Mutex<Option<ResolvedBufferRef>>>>,
    image_resolved: Vec<Arc<Mutex<Option<ResolvedImageRef>>>>,
    queue_ownership_transitions: Vec<QueueOwnershipTransition>,
    descriptor_sets: JobLocalDescriptorSets,
    preinit_router: PreinitBufferRouter,
}

impl Job {
    pub(crate) fn new(id: u64, descriptor_pool: Arc<DescriptorPool>, preinit_router: PreinitBufferRouter) -> Self {
        Self {
            id,
            commands: Vec::new(),
            buffer_requests: Vec::new(),
            image_requests: Vec::new(),
            buffer_resolved: Vec::new(),
            image_resolved: Vec::new(),
            queue_ownership_transitions: Vec::new(),
            descriptor_sets: JobLocalDescriptorSets::new(descriptor_pool),
            preinit_router,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests a transient buffer local to this job. Returns a handle that
    /// resolves to a real `vk::Buffer` only after the job's resource pool
    /// has run its local buffer allocation pass.
    pub fn allocate_local_buffer(&mut self, size: u64, usage: BufferUsage) -> JobResource {
        let index = self.buffer_requests.len();
        self.buffer_requests.push(BufferRequest {
            size,
            usage,
            usage_range: ResourceUsageRange::empty(),
        });
        self.buffer_resolved.push(Arc::new(Mutex::new(None)));
        JobResource::LocalBuffer(index)
    }

    pub fn allocate_local_image(&mut self, setup: ImageSetup) -> JobResource {
        let index = self.image_requests.len();
        self.image_requests.push(ImageRequest {
            setup,
            usage_range: ResourceUsageRange::empty(),
        });
        self.image_resolved.push(Arc::new(Mutex::new(None)));
        JobResource::LocalImage(index)
    }

    /// Allocates a job-local buffer whose storage is available immediately,
    /// so the host can write into it before this job's commands run (C4,
    /// spec §4.4) — unlike [`Self::allocate_local_buffer`], no aliasing pass
    /// is needed since the real handle is already known once this returns.
    pub fn allocate_preinitialized_buffer(
        &mut self,
        setup: &BufferSetup,
        memory_preference: &MemoryPreference,
    ) -> Result<JobResource> {
        let handle = (self.preinit_router)(self.id, setup, memory_preference)?;
        Ok(JobResource::PreinitBuffer {
            buffer: handle.buffer,
            offset: handle.offset,
        })
    }

    pub fn buffer_requests(&self) -> &[BufferRequest] {
        &self.buffer_requests
    }

    pub fn image_requests(&self) -> &[ImageRequest] {
        &self.image_requests
    }

    pub fn queue_ownership_transitions(&self) -> &[QueueOwnershipTransition] {
        &self.queue_ownership_transitions
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub(crate) fn buffer_resolved_cell(&self, index: usize) -> Arc<Mutex<Option<ResolvedBufferRef>>> {
        self.buffer_resolved[index].clone()
    }

    pub(crate) fn image_resolved_cell(&self, index: usize) -> Arc<Mutex<Option<ResolvedImageRef>>> {
        self.image_resolved[index].clone()
    }

    pub(crate) fn descriptor_sets_mut(&mut self) -> &mut JobLocalDescriptorSets {
        &mut self.descriptor_sets
    }

    fn next_command_index(&self) -> u64 {
        self.commands.len() as u64
    }

    /// Widens `resource`'s usage range to cover the command about to be
    /// appended, for every job-local resource the command touches.
    fn record_usage(&mut self, resources: &[JobResource], command_index: u64) {
        for resource in resources {
            match *resource {
                JobResource::LocalBuffer(index) => {
                    self.buffer_requests[index].usage_range.update(command_index);
                }
                JobResource::LocalImage(index) => {
                    self.image_requests[index].usage_range.update(command_index);
                }
                JobResource::ExternalBuffer(_)
                | JobResource::ExternalImage(_)
                | JobResource::PreinitBuffer { .. } => {}
            }
        }
    }

    pub fn cmd_copy_buffer(
        &mut self,
        src: JobResource,
        src_offset: u64,
        dst: JobResource,
        dst_offset: u64,
        size: u64,
    ) {
        let index = self.next_command_index();
        self.record_usage(&[src, dst], index);
        self.commands.push(RecordedCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn cmd_copy_image(&mut self, src: JobResource, dst: JobResource, extent: vk::Extent3D) {
        let index = self.next_command_index();
        self.record_usage(&[src, dst], index);
        self.commands.push(RecordedCommand::CopyImage { src, dst, extent });
    }

    pub fn cmd_clear_buffer(&mut self, target: JobResource, size: u64) {
        let index = self.next_command_index();
        self.record_usage(&[target], index);
        self.commands.push(RecordedCommand::ClearBuffer { target, size });
    }

    pub fn cmd_clear_image(&mut self, target: JobResource) {
        let index = self.next_command_index();
        self.record_usage(&[target], index);
        self.commands.push(RecordedCommand::ClearImage { target });
    }

    pub fn cmd_discard(&mut self, target: JobResource) {
        let index = self.next_command_index();
        self.record_usage(&[target], index);
        self.commands.push(RecordedCommand::Discard { target });
    }

    /// Records a queue-ownership release: the resource is exported for use
    /// on `target_queue` after this job finishes (spec §4.6).
    pub fn cmd_export(&mut self, target: JobResource, target_queue: QueueKind) {
        let index = self.next_command_index();
        self.record_usage(&[target], index);
        self.queue_ownership_transitions.push(QueueOwnershipTransition {
            target,
            target_queue,
            command_index: index,
        });
        self.commands.push(RecordedCommand::Export { target, target_queue });
    }

    /// Records a queue-ownership acquire: the resource was exported from
    /// `source_queue` by an earlier job and is now imported into this one.
    pub fn cmd_import_external(&mut self, target: JobResource, source_queue: QueueKind) {
        let index = self.next_command_index();
        self.record_usage(&[target], index);
        self.queue_ownership_transitions.push(QueueOwnershipTransition {
            target,
            target_queue: source_queue,
            command_index: index,
        });
        self.commands.push(RecordedCommand::ImportExternal { target, source_queue });
    }

    pub fn cmd_build_acceleration_structure(&mut self, scratch: JobResource, output: JobResource) {
        let index = self.next_command_index();
        self.record_usage(&[scratch, output], index);
        self.commands
            .push(RecordedCommand::BuildAccelerationStructure { scratch, output });
    }

    /// Records a compute pass: `record` is invoked with this job's compiled
    /// command buffer, in recording order, once the job is enqueued and
    /// every job-local resource it `accessed` has a real handle (spec §4.10
    /// step "execute any inline compute/render-pass callbacks now"). `record`
    /// may only record into the command buffer it's given.
    pub fn cmd_execute_compute_pass(
        &mut self,
        accessed: Vec<JobResource>,
        record: impl FnOnce(&CommandBuffer) + Send + 'static,
    ) {
        let index = self.next_command_index();
        self.record_usage(&accessed, index);
        self.commands.push(RecordedCommand::ExecuteComputePass {
            accessed,
            callback: Box::new(record),
        });
    }

    pub fn cmd_execute_render_pass(
        &mut self,
        accessed: Vec<JobResource>,
        record: impl FnOnce(&CommandBuffer) + Send + 'static,
    ) {
        let index = self.next_command_index();
        self.record_usage(&accessed, index);
        self.commands.push(RecordedCommand::ExecuteRenderPass {
            accessed,
            callback: Box::new(record),
        });
    }

    pub fn cmd_debug_label(&mut self, name: impl Into<String>) {
        self.commands.push(RecordedCommand::DebugLabel { name: name.into() });
    }

    pub fn cmd_timestamp_write(&mut self, query_index: u32) {
        self.commands.push(RecordedCommand::TimestampWrite { query_index });
    }

    /// Registers a descriptor set to allocate once the job is enqueued,
    /// returning a view that resolves to a real `VkDescriptorSet` at that
    /// point (C5, spec §4.5).
    pub fn prepare_descriptor_set(
        &mut self,
        layout: Arc<DescriptorSetLayout>,
        descriptors: Vec<FutureDescriptor>,
    ) -> DescriptorSetView {
        self.descriptor_sets.prepare_new_descriptor_set(layout, descriptors)
    }

    /// A [`FutureDescriptor`] that resolves to `resource` once it has a real
    /// buffer handle — for `LocalBuffer`, only after this job's resource
    /// pool has run its allocation pass; for `ExternalBuffer`, immediately.
    pub fn local_buffer_descriptor(&self, resource: JobResource, offset: u64, range: u64) -> FutureDescriptor {
        match resource {
            JobResource::LocalBuffer(index) => {
                let cell = self.buffer_resolved[index].clone();
                FutureDescriptor::Deferred(Box::new(move || {
                    let guard = cell.lock();
                    let resolved = guard
                        .as_ref()
                        .expect("job-local buffer resolved before descriptor allocation");
                    Descriptor::Buffer {
                        buffer: resolved.buffer,
                        offset: resolved.base_offset + offset,
                        range,
                    }
                }))
            }
            JobResource::ExternalBuffer(buffer) => Descriptor::Buffer { buffer, offset, range }.into(),
            JobResource::PreinitBuffer { buffer, offset: base_offset } => Descriptor::Buffer {
                buffer,
                offset: base_offset + offset,
                range,
            }
            .into(),
            _ => panic!("local_buffer_descriptor called with a non-buffer JobResource"),
        }
    }

    /// Same as [`Self::local_buffer_descriptor`] for job-local images.
    /// `ExternalImage` isn't supported here since this crate never resolves
    /// a view for an externally owned image handle on its own; callers
    /// holding one should build a `Descriptor::Image` directly.
    pub fn local_image_descriptor(&self, resource: JobResource, layout: vk::ImageLayout) -> FutureDescriptor {
        match resource {
            JobResource::LocalImage(index) => {
                let cell = self.image_resolved[index].clone();
                FutureDescriptor::Deferred(Box::new(move || {
                    let guard = cell.lock();
                    let resolved = guard
                        .as_ref()
                        .expect("job-local image resolved before descriptor allocation");
                    Descriptor::Image {
                        view: resolved.view,
                        layout,
                    }
                }))
            }
            _ => panic!("local_image_descriptor called with a non-job-local JobResource"),
        }
    }

    /// Compiles this job's command stream into `command_buffer`, which must
    /// already be in the recording state (spec §4.10's "compile the job
    /// into one or more command buffers" step). Queue-ownership transitions
    /// recorded by export/import commands are left for the submit batcher
    /// to fold into its per-queue barrier pass; acceleration-structure and
    /// pass content stay the caller's own responsibility, executed here only
    /// via the stored callback.
    pub(crate) fn compile(&mut self, command_buffer: &CommandBuffer) -> Result<()> {
        for command in self.commands.drain(..) {
            match command {
                RecordedCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let (src_buffer, src_base) = Self::resolve_buffer_static(&self.buffer_resolved, src);
                    let (dst_buffer, dst_base) = Self::resolve_buffer_static(&self.buffer_resolved, dst);
                    let region = vk::BufferCopy {
                        src_offset: src_base + src_offset,
                        dst_offset: dst_base + dst_offset,
                        size,
                    };
                    command_buffer.copy_buffer(src_buffer, dst_buffer, &[region]);
                }
                RecordedCommand::CopyImage { src, dst, extent } => {
                    let (src_image, _) = Self::resolve_image_static(&self.image_resolved, src);
                    let (dst_image, _) = Self::resolve_image_static(&self.image_resolved, dst);
                    let region = vk::ImageCopy {
                        src_subresource: whole_color_subresource_layer(),
                        dst_subresource: whole_color_subresource_layer(),
                        extent,
                        ..Default::default()
                    };
                    command_buffer.copy_image(
                        src_image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                RecordedCommand::ClearBuffer { target, size } => {
                    let (buffer, base_offset) = Self::resolve_buffer_static(&self.buffer_resolved, target);
                    command_buffer.fill_buffer(buffer, base_offset, size, 0);
                }
                RecordedCommand::ClearImage { target } => {
                    let (image, _) = Self::resolve_image_static(&self.image_resolved, target);
                    let range = vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(vk::REMAINING_MIP_LEVELS)
                        .layer_count(vk::REMAINING_ARRAY_LAYERS);
                    command_buffer.clear_color_image(
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ClearColorValue::default(),
                        &[range],
                    );
                }
                // A discard's only effect is widening the usage range
                // already applied at record time; it carries no content of
                // its own without knowing the resource's next real layout,
                // which lives in pass content this crate doesn't own.
                RecordedCommand::Discard { .. } => {}
                // Folded into the submit batcher's per-queue barrier pass
                // (spec §4.10); this step only has to preserve command
                // order, already guaranteed by draining `commands` in place.
                RecordedCommand::Export { .. } | RecordedCommand::ImportExternal { .. } => {}
                // Acceleration-structure build content is the caller's own,
                // same as pass bodies.
                RecordedCommand::BuildAccelerationStructure { .. } => {}
                RecordedCommand::ExecuteComputePass { callback, .. }
                | RecordedCommand::ExecuteRenderPass { callback, .. } => {
                    callback(command_buffer);
                }
                RecordedCommand::DebugLabel { name } => {
                    log::trace!("job {}: {name}", self.id);
                }
                RecordedCommand::TimestampWrite { .. } => {}
            }
        }
        Ok(())
    }

    fn resolve_buffer_static(
        resolved: &[Arc<Mutex<Option<ResolvedBufferRef>>>],
        resource: JobResource,
    ) -> (vk::Buffer, u64) {
        match resource {
            JobResource::LocalBuffer(index) => {
                let guard = resolved[index].lock();
                let resolved = guard.as_ref().expect("job-local buffer resolved before compilation");
                (resolved.buffer, resolved.base_offset)
            }
            JobResource::ExternalBuffer(buffer) => (buffer, 0),
            JobResource::PreinitBuffer { buffer, offset } => (buffer, offset),
            _ => panic!("expected a buffer JobResource"),
        }
    }

    fn resolve_image_static(
        resolved: &[Arc<Mutex<Option<ResolvedImageRef>>>],
        resource: JobResource,
    ) -> (vk::Image, vk::ImageView) {
        match resource {
            JobResource::LocalImage(index) => {
                let guard = resolved[index].lock();
                let resolved = guard.as_ref().expect("job-local image resolved before compilation");
                (resolved.image, resolved.view)
            }
            JobResource::ExternalImage(image) => (image, vk::ImageView::null()),
            _ => panic!("expected an image JobResource"),
        }
    }
}

fn whole_color_subresource_layer() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

/// Equivalent of [`DeviceQueue`] but naming only the kind a job was
/// submitted against; kept separate since a job is recorded against a
/// `QueueKind` and only resolved to a concrete `DeviceQueue` at submit time.
pub type SubmitQueue = DeviceQueue;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::descriptor_pool::DescriptorPool;

    fn job_without_device(id: u64) -> Job {
        // Descriptor allocation and preinit routing are never exercised by
        // these tests, so neither needs to point at a live device/pool.
        let pool = Arc::new(DescriptorPool::new_stub());
        let router: PreinitBufferRouter =
            Arc::new(|_, _, _| panic!("preinit allocation not exercised by this test"));
        Job::new(id, pool, router)
    }

    #[test]
    fn command_recording_widens_referenced_resources_usage_range() {
        let mut job = job_without_device(1);
        let buffer = job.allocate_local_buffer(256, vk::BufferUsageFlags::TRANSFER_DST);
        let other = job.allocate_local_buffer(256, vk::BufferUsageFlags::TRANSFER_SRC);

        job.cmd_copy_buffer(other, 0, buffer, 0, 256);
        job.cmd_clear_buffer(buffer, 256);

        assert!(!job.buffer_requests()[0].usage_range.is_empty());
        assert!(!job.buffer_requests()[1].usage_range.is_empty());
    }

    #[test]
    fn unreferenced_resource_keeps_an_empty_usage_range() {
        let mut job = job_without_device(1);
        let touched = job.allocate_local_buffer(64, vk::BufferUsageFlags::TRANSFER_DST);
        let untouched = job.allocate_local_buffer(64, vk::BufferUsageFlags::TRANSFER_DST);

        job.cmd_clear_buffer(touched, 64);

        assert!(!job.buffer_requests()[0].usage_range.is_empty());
        assert!(job.buffer_requests()[1].usage_range.is_empty());
        let _ = untouched;
    }

    #[test]
    fn export_and_import_record_a_queue_ownership_transition() {
        let mut job = job_without_device(1);
        let image = job.allocate_local_image(ImageSetup::new_2d(
            64,
            64,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::TRANSFER_DST,
        ));

        job.cmd_export(image, QueueKind::Transfer);

        assert_eq!(job.queue_ownership_transitions().len(), 1);
        assert_eq!(job.queue_ownership_transitions()[0].target_queue, QueueKind::Transfer);
    }
}
