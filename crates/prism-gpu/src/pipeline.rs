//! Pipeline layouts, shader modules, and raster/compute pipelines.

use crate::descriptors::DescriptorSetLayout;
use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::render_pass::RenderPass;
use ash::vk;
use std::sync::Arc;

/// Common surface of every pipeline kind, used when binding.
pub trait Pipeline {
    fn handle(&self) -> vk::Pipeline;
    fn layout(&self) -> vk::PipelineLayout;
    fn bind_point(&self) -> vk::PipelineBindPoint;
}

/// Descriptor set layouts plus push-constant ranges.
pub struct PipelineLayout {
    raw: Arc<RawDevice>,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    pub fn new(
        raw: &Arc<RawDevice>,
        set_layouts: &[&DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let max = raw.limits().max_push_constants_size;
        if let Some(range) = push_constant_ranges
            .iter()
            .find(|r| max > 0 && r.offset + r.size > max)
        {
            return Err(GpuError::PipelineCreation(format!(
                "push constant range ends at {} but the device allows {max} bytes",
                range.offset + range.size
            )));
        }
        let handles: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|l| l.handle()).collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&handles)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe { raw.device.create_pipeline_layout(&info, None) }.map_err(|err| {
            tracing::error!(%err, "vkCreatePipelineLayout failed");
            GpuError::PipelineCreation(err.to_string())
        })?;
        Ok(Self {
            raw: Arc::clone(raw),
            layout,
        })
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// A SPIR-V shader module.
pub struct ShaderModule {
    raw: Arc<RawDevice>,
    module: vk::ShaderModule,
}

impl ShaderModule {
    pub fn new(raw: &Arc<RawDevice>, code: &[u32]) -> Result<Self> {
        if code.is_empty() {
            return Err(GpuError::ShaderModule("empty SPIR-V code".into()));
        }
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { raw.device.create_shader_module(&info, None) }.map_err(|err| {
            tracing::error!(%err, "vkCreateShaderModule failed");
            GpuError::ShaderModule(err.to_string())
        })?;
        Ok(Self {
            raw: Arc::clone(raw),
            module,
        })
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    pub(crate) fn stage(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(stage)
            .module(self.module)
            .name(c"main")
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    raw: Arc<RawDevice>,
    pipeline: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl ComputePipeline {
    pub fn new(raw: &Arc<RawDevice>, layout: Arc<PipelineLayout>, shader: &ShaderModule) -> Result<Self> {
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(shader.stage(vk::ShaderStageFlags::COMPUTE))
            .layout(layout.handle());

        let pipelines = unsafe {
            raw.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, err)| {
            tracing::error!(%err, "vkCreateComputePipelines failed");
            GpuError::PipelineCreation(err.to_string())
        })?;

        Ok(Self {
            raw: Arc::clone(raw),
            pipeline: first_pipeline(pipelines)?,
            layout,
        })
    }
}

impl Pipeline for ComputePipeline {
    fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle()
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::COMPUTE
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

/// Raster pipeline configuration.
#[derive(Clone)]
pub struct RasterPipelineDesc<'a> {
    pub vertex_shader: &'a ShaderModule,
    pub fragment_shader: &'a ShaderModule,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
    pub color_attachment_count: u32,
}

impl<'a> RasterPipelineDesc<'a> {
    /// Full-screen style pipeline: no vertex input, no culling, no depth.
    pub fn new(vertex_shader: &'a ShaderModule, fragment_shader: &'a ShaderModule) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            alpha_blend: false,
            color_attachment_count: 1,
        }
    }
}

/// Graphics pipeline for subpass 0 of a render pass.
pub struct RasterPipeline {
    raw: Arc<RawDevice>,
    pipeline: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl RasterPipeline {
    pub fn new(
        raw: &Arc<RawDevice>,
        layout: Arc<PipelineLayout>,
        render_pass: &RenderPass,
        desc: &RasterPipelineDesc<'_>,
    ) -> Result<Self> {
        let shader_stages = [
            desc.vertex_shader.stage(vk::ShaderStageFlags::VERTEX),
            desc.fragment_shader.stage(vk::ShaderStageFlags::FRAGMENT),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(desc.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS);

        let blend = if desc.alpha_blend {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        } else {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        };
        let blend_attachments = vec![blend; desc.color_attachment_count as usize];
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout.handle())
            .render_pass(render_pass.handle())
            .subpass(0);

        let pipelines = unsafe {
            raw.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, err)| {
            tracing::error!(%err, "vkCreateGraphicsPipelines failed");
            GpuError::PipelineCreation(err.to_string())
        })?;

        Ok(Self {
            raw: Arc::clone(raw),
            pipeline: first_pipeline(pipelines)?,
            layout,
        })
    }
}

impl Pipeline for RasterPipeline {
    fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle()
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::GRAPHICS
    }
}

impl Drop for RasterPipeline {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

pub(crate) fn first_pipeline(pipelines: Vec<vk::Pipeline>) -> Result<vk::Pipeline> {
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".into()))
}
