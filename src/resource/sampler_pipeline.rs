//! Long-lived pool resources: samplers, pipelines and descriptor-set layouts
//! (spec §2 data model).
//!
//! Grounded on the teacher's `Sampler`/`Pipeline`/`DescriptorSetLayout`
//! wrappers (`vulkan/resource.rs`) and `Device::create_sampler` /
//! `create_pipeline` / `create_descriptor_set_layout`. Like persistent
//! buffers and images, these go through the same deferred-destruction queue
//! gated on a snapshot of every queue's latest assigned timestamp at drop
//! time (spec §3's lifeguard invariant), since a sampler or pipeline can
//! still be referenced by a job that was enqueued but not yet submitted when
//! the Rust-side handle was dropped. `DescriptorSetLayout` is the exception:
//! Vulkan only requires it to outlive the descriptor sets and pipelines
//! created from it, both of which already hold their own lifeguards, so it
//! destroys immediately.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use crate::device::lifeguard::LastUse;
use crate::device::DeviceShared;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct SamplerSetup {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerSetup {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

pub struct Sampler {
    pub(crate) raw: vk::Sampler,
    device: Arc<DeviceShared>,
}

impl Sampler {
    pub(crate) fn create(device: &Arc<DeviceShared>, setup: &SamplerSetup) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::default()
            .min_filter(setup.min_filter)
            .mag_filter(setup.mag_filter)
            .mipmap_mode(setup.mipmap_mode)
            .address_mode_u(setup.address_mode)
            .address_mode_v(setup.address_mode)
            .address_mode_w(setup.address_mode)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .unnormalized_coordinates(false);

        let raw = unsafe { device.raw.create_sampler(&create_info, None)? };
        Ok(Self {
            raw,
            device: device.clone(),
        })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        let raw = self.raw;
        let device = self.device.clone();
        let mut last_use = LastUse::new();
        for (queue, timestamp) in self.device.timeline.snapshot_assigned() {
            last_use.record(queue, timestamp);
        }
        self.device.destruction_queue_samplers.push(
            raw,
            last_use,
            Box::new(move |raw| unsafe { device.raw.destroy_sampler(raw, None) }),
        );
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

pub struct DescriptorSetLayout {
    pub(crate) raw: vk::DescriptorSetLayout,
    pub(crate) bindings: HashMap<u32, DescriptorSetLayoutBinding>,
    device: Arc<DeviceShared>,
}

impl DescriptorSetLayout {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<Self> {
        let vulkan_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(b.stage_flags)
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vulkan_bindings);
        let raw = unsafe { device.raw.create_descriptor_set_layout(&create_info, None)? };

        let bindings_map = bindings.iter().cloned().map(|b| (b.binding, b)).collect();

        Ok(Self {
            raw,
            bindings: bindings_map,
            device: device.clone(),
        })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .raw
                .destroy_descriptor_set_layout(self.raw, None);
        }
    }
}

pub struct PipelineSetup<'a> {
    pub descriptor_set_layouts: &'a [Arc<DescriptorSetLayout>],
    pub shader_stages: &'a [vk::PipelineShaderStageCreateInfo<'a>],
    pub vertex_input: vk::PipelineVertexInputStateCreateInfo<'a>,
    pub input_assembly: vk::PipelineInputAssemblyStateCreateInfo<'a>,
    pub rasterization: vk::PipelineRasterizationStateCreateInfo<'a>,
    pub color_blend_attachments: &'a [vk::PipelineColorBlendAttachmentState],
    pub color_attachment_formats: &'a [vk::Format],
    pub depth_attachment_format: vk::Format,
}

pub struct Pipeline {
    pub(crate) raw: vk::Pipeline,
    pub(crate) raw_layout: vk::PipelineLayout,
    _descriptor_set_layouts: Vec<Arc<DescriptorSetLayout>>,
    device: Arc<DeviceShared>,
}

impl Pipeline {
    pub(crate) fn create(device: &Arc<DeviceShared>, setup: PipelineSetup) -> Result<Self> {
        let set_layouts: Vec<vk::DescriptorSetLayout> = setup
            .descriptor_set_layouts
            .iter()
            .map(|l| l.raw)
            .collect();
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let raw_layout = unsafe { device.raw.create_pipeline_layout(&layout_info, None)? };

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(setup.color_blend_attachments);
        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(setup.color_attachment_formats)
            .depth_attachment_format(setup.depth_attachment_format);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(setup.shader_stages)
            .vertex_input_state(&setup.vertex_input)
            .input_assembly_state(&setup.input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&setup.rasterization)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(raw_layout)
            .push_next(&mut rendering_info);

        let raw = unsafe {
            device
                .raw
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|(_, e)| e)?[0]
        };

        Ok(Self {
            raw,
            raw_layout,
            _descriptor_set_layouts: setup.descriptor_set_layouts.to_vec(),
            device: device.clone(),
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let raw = self.raw;
        let raw_layout = self.raw_layout;
        let device = self.device.clone();
        unsafe {
            self.device.raw.destroy_pipeline_layout(raw_layout, None);
        }
        let mut last_use = LastUse::new();
        for (queue, timestamp) in self.device.timeline.snapshot_assigned() {
            last_use.record(queue, timestamp);
        }
        self.device.destruction_queue_pipelines.push(
            raw,
            last_use,
            Box::new(move |raw| unsafe { device.raw.destroy_pipeline(raw, None) }),
        );
    }
}
