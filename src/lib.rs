//! Tephra: a thin orchestration layer over Vulkan for job-based transient
//! resource aliasing, barrier tracking and timeline-semaphore queue
//! scheduling.
//!
//! Applications create an [`Instance`], a [`Device`], one or more
//! [`job::resource_pool::ResourcePool`]s, and record [`Job`]s against them;
//! the device compiles and submits recorded jobs, gating destruction of
//! every job-local resource on the timeline semaphore value that marks the
//! job's retirement.

pub mod command;
pub mod device;
pub mod error;
pub mod instance;
pub mod job;
pub mod resource;
pub mod swapchain;
pub mod types;

pub use device::queue::SemaphoreSubmitDescriptor;
pub use device::{Device, DeviceSetup, DeviceShared, JobWaits};
pub use error::{Error, Result};
pub use instance::{select_preferred_gpu, Instance, PhysicalDevice, QueueFamily, Surface};
pub use job::descriptor::{DescriptorSetView, JobLocalDescriptorSets};
pub use job::record::{Job, JobResource, RecordedCommand};
pub use job::resource_pool::{JobResourceAssignments, JobResourcePoolSetup, ResourcePool, ResourcePoolStatistics};
pub use resource::buffer::{Buffer, BufferSetup, BufferUsage};
pub use resource::descriptor::{Descriptor, FutureDescriptor};
pub use resource::descriptor_pool::DescriptorPool;
pub use resource::image::{Image, ImageSetup, ImageUsage};
pub use resource::sampler_pipeline::{
    DescriptorSetLayout, DescriptorSetLayoutBinding, Pipeline, PipelineSetup, Sampler, SamplerSetup,
};
pub use swapchain::{AcquiredImageInfo, Swapchain, SwapchainSetup};
pub use types::*;
