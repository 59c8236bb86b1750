//! Shader-driven passes: ray tracing or compute kernels over the render
//! targets, and the raster composition pass.

use crate::error::Result;
use crate::graph::{PassDecl, PassFlags};
use crate::pass::{FramePass, PassContext};
use crate::passes::bindings::PassBindings;
use crate::resources::FrameResources;
use ash::vk;
use prism_gpu::{
    CommandBuffer, ComputePipeline, DescriptorAllocator, DescriptorSet, DescriptorSetLayout,
    DeviceContext, Pipeline, RasterPipeline, RayTracingPipeline,
};

/// Shader stages that see a ray tracing kernel's descriptor set.
pub const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw(),
);

/// The work a [`KernelPass`] dispatches.
pub enum Kernel {
    /// One ray per target pixel.
    RayTracing(RayTracingPipeline),
    /// One invocation per target pixel, in `workgroup`-sized groups.
    Compute {
        pipeline: ComputePipeline,
        workgroup: [u32; 2],
    },
}

impl Kernel {
    fn pipeline(&self) -> &dyn Pipeline {
        match self {
            Self::RayTracing(pipeline) => pipeline,
            Self::Compute { pipeline, .. } => pipeline,
        }
    }

    fn stage(&self) -> vk::PipelineStageFlags {
        match self {
            Self::RayTracing(_) => vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            Self::Compute { .. } => vk::PipelineStageFlags::COMPUTE_SHADER,
        }
    }

    fn shader_stages(&self) -> vk::ShaderStageFlags {
        match self {
            Self::RayTracing(_) => RAY_TRACING_STAGES,
            Self::Compute { .. } => vk::ShaderStageFlags::COMPUTE,
        }
    }

    fn dispatch(&self, cmd: &CommandBuffer, extent: vk::Extent2D) -> Result<()> {
        match self {
            Self::RayTracing(pipeline) => cmd.trace_rays(pipeline, extent)?,
            Self::Compute { workgroup, .. } => {
                let [x, y] = group_counts(extent, *workgroup);
                cmd.dispatch(x, y, 1)?;
            }
        }
        Ok(())
    }
}

/// Workgroups covering every pixel of `extent`.
pub fn group_counts(extent: vk::Extent2D, workgroup: [u32; 2]) -> [u32; 2] {
    [
        extent.width.div_ceil(workgroup[0].max(1)),
        extent.height.div_ceil(workgroup[1].max(1)),
    ]
}

/// A descriptor set with the pool and layout it came from.
struct BoundSet {
    set: DescriptorSet,
    _allocator: DescriptorAllocator,
    _layout: DescriptorSetLayout,
}

impl BoundSet {
    fn new(
        device: &DeviceContext,
        bindings: &PassBindings,
        stages: vk::ShaderStageFlags,
        layout: DescriptorSetLayout,
    ) -> Result<Self> {
        let allocator =
            device.create_descriptor_allocator(1, &bindings.layout(stages).pool_sizes(1))?;
        let set = allocator.allocate(&layout)?;
        Ok(Self {
            set,
            _allocator: allocator,
            _layout: layout,
        })
    }
}

/// Runs one kernel over the render targets it writes.
pub struct KernelPass {
    name: String,
    kernel: Kernel,
    bindings: PassBindings,
    bound: BoundSet,
}

impl KernelPass {
    /// `layout` must be the set layout the kernel's pipeline was created with.
    pub fn new(
        device: &DeviceContext,
        name: impl Into<String>,
        kernel: Kernel,
        bindings: PassBindings,
        layout: DescriptorSetLayout,
    ) -> Result<Self> {
        let bound = BoundSet::new(device, &bindings, kernel.shader_stages(), layout)?;
        Ok(Self {
            name: name.into(),
            kernel,
            bindings,
            bound,
        })
    }
}

impl FramePass for KernelPass {
    fn declaration(&self) -> PassDecl {
        self.bindings.declare(PassDecl::new(self.name.clone()))
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn record(&mut self, ctx: &mut PassContext<'_, '_>) -> Result<()> {
        let extent = ctx.extent();
        let stage = self.kernel.stage();
        // Without a TLAS there is nothing to trace against
        let clear_only = self.bindings.traces_rays() && ctx.resources.tlas().is_none();

        let mut barriers = Vec::with_capacity(self.bindings.writes.len());
        for id in self.bindings.written_targets() {
            let mut barrier = ctx.resources.storage_barrier(id)?;
            if clear_only {
                barrier.dst_access = vk::AccessFlags::TRANSFER_WRITE;
            }
            barriers.push(barrier);
        }
        let dst_stage = if clear_only {
            vk::PipelineStageFlags::TRANSFER
        } else {
            stage
        };
        ctx.cmd.pipeline_barrier(stage, dst_stage, &[], &barriers)?;

        if clear_only {
            for id in self.bindings.written_targets() {
                let target = ctx.resources.target(id)?;
                ctx.cmd
                    .clear_color_image(target.image.handle(), vk::ImageLayout::GENERAL, [0.0; 4])?;
            }
            tracing::trace!(pass = %self.name, "No TLAS, cleared outputs");
            return Ok(());
        }

        self.bindings
            .refresh(ctx.device, self.bound.set, ctx.resources)?;
        let pipeline = self.kernel.pipeline();
        ctx.cmd.bind_pipeline(pipeline)?;
        ctx.cmd
            .bind_descriptor_sets(pipeline, 0, &[self.bound.set.handle()])?;
        self.kernel.dispatch(ctx.cmd, extent)
    }

    fn on_resize(&mut self, _device: &DeviceContext, resources: &FrameResources) -> Result<()> {
        tracing::debug!(
            pass = %self.name,
            generation = resources.target_generation(),
            "Targets recreated, descriptors rewritten on next record"
        );
        Ok(())
    }
}

/// Full-screen raster pass into the destination image.
///
/// Draws three vertices inside the forward render pass; the vertex shader
/// is expected to generate a covering triangle from the vertex index.
pub struct CompositionPass {
    pipeline: RasterPipeline,
    bindings: PassBindings,
    bound: BoundSet,
}

impl CompositionPass {
    /// `pipeline` must be built for the renderer's forward pass.
    pub fn new(
        device: &DeviceContext,
        pipeline: RasterPipeline,
        bindings: PassBindings,
        layout: DescriptorSetLayout,
    ) -> Result<Self> {
        let bound = BoundSet::new(device, &bindings, vk::ShaderStageFlags::FRAGMENT, layout)?;
        Ok(Self {
            pipeline,
            bindings,
            bound,
        })
    }
}

impl FramePass for CompositionPass {
    fn declaration(&self) -> PassDecl {
        self.bindings
            .declare(PassDecl::new("composition"))
            .flags(PassFlags::DESTINATION)
    }

    fn record(&mut self, ctx: &mut PassContext<'_, '_>) -> Result<()> {
        self.bindings
            .refresh(ctx.device, self.bound.set, ctx.resources)?;
        ctx.cmd.bind_pipeline(&self.pipeline)?;
        ctx.cmd
            .bind_descriptor_sets(&self.pipeline, 0, &[self.bound.set.handle()])?;
        ctx.cmd.draw(3, 1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_counts_round_up() {
        let extent = vk::Extent2D {
            width: 1920,
            height: 1081,
        };
        assert_eq!(group_counts(extent, [8, 8]), [240, 136]);
        assert_eq!(group_counts(extent, [0, 1]), [1920, 1081]);
    }
}
