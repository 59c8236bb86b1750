//! Ray tracing pipelines and their shader binding tables.
//!
//! Shader groups are laid out as one ray generation group, then every miss
//! group, then every hit group. The binding table mirrors that order with
//! each region aligned to the adapter's base alignment.

use crate::command::CommandBuffer;
use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::memory::{Buffer, BufferDesc};
use crate::pipeline::{first_pipeline, Pipeline, PipelineLayout, ShaderModule};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Triangle hit group shaders.
#[derive(Clone, Copy)]
pub struct HitGroup<'a> {
    pub closest_hit: Option<&'a ShaderModule>,
    pub any_hit: Option<&'a ShaderModule>,
}

/// Ray tracing pipeline configuration.
pub struct RayTracingPipelineDesc<'a> {
    pub raygen: &'a ShaderModule,
    pub misses: Vec<&'a ShaderModule>,
    pub hit_groups: Vec<HitGroup<'a>>,
    pub max_recursion_depth: u32,
}

/// Align a value up to a power-of-two alignment.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Byte layout of a shader binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub stride: u32,
    pub raygen_size: u32,
    pub miss_offset: u32,
    pub miss_size: u32,
    pub hit_offset: u32,
    pub hit_size: u32,
    pub total_size: u32,
    pub miss_count: u32,
    pub hit_count: u32,
}

impl SbtLayout {
    pub fn new(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        miss_count: u32,
        hit_count: u32,
    ) -> Self {
        let stride = align_up(handle_size, handle_alignment);
        let raygen_size = align_up(stride, base_alignment);
        let miss_size = align_up(stride * miss_count, base_alignment);
        let hit_size = align_up(stride * hit_count, base_alignment);
        Self {
            handle_size,
            stride,
            raygen_size,
            miss_offset: raygen_size,
            miss_size,
            hit_offset: raygen_size + miss_size,
            hit_size,
            total_size: raygen_size + miss_size + hit_size,
            miss_count,
            hit_count,
        }
    }

    pub fn group_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    /// Destination offset of each group handle, in group order.
    pub fn handle_offsets(&self) -> Vec<u32> {
        let mut offsets = vec![0];
        offsets.extend((0..self.miss_count).map(|i| self.miss_offset + i * self.stride));
        offsets.extend((0..self.hit_count).map(|i| self.hit_offset + i * self.stride));
        offsets
    }
}

/// Shader binding table buffer plus its strided regions.
pub struct ShaderBindingTable {
    buffer: Buffer,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    fn new(raw: &Arc<RawDevice>, pipeline: vk::Pipeline, layout: SbtLayout) -> Result<Self> {
        let loaders = raw.ray_tracing()?;
        let handle_size = layout.handle_size as usize;
        let handles = unsafe {
            loaders.ray_tracing_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                layout.group_count(),
                handle_size * layout.group_count() as usize,
            )
        }
        .map_err(|err| {
            tracing::error!(%err, "vkGetRayTracingShaderGroupHandlesKHR failed");
            GpuError::from(err)
        })?;

        let buffer = Buffer::new(
            raw,
            &BufferDesc {
                name: "shader_binding_table",
                size: u64::from(layout.total_size),
                usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::CpuToGpu,
            },
        )?;
        for (group, offset) in layout.handle_offsets().into_iter().enumerate() {
            let start = group * handle_size;
            buffer.write_bytes(u64::from(offset), &handles[start..start + handle_size])?;
        }

        let address = buffer.device_address();
        let stride = u64::from(layout.stride);
        Ok(Self {
            // Raygen region size must equal its stride
            raygen_region: vk::StridedDeviceAddressRegionKHR {
                device_address: address,
                stride,
                size: stride,
            },
            miss_region: vk::StridedDeviceAddressRegionKHR {
                device_address: address + u64::from(layout.miss_offset),
                stride,
                size: u64::from(layout.miss_size),
            },
            hit_region: vk::StridedDeviceAddressRegionKHR {
                device_address: address + u64::from(layout.hit_offset),
                stride,
                size: u64::from(layout.hit_size),
            },
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
            buffer,
        })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

/// A ray tracing pipeline with its binding table.
pub struct RayTracingPipeline {
    raw: Arc<RawDevice>,
    pipeline: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    sbt: ShaderBindingTable,
}

impl RayTracingPipeline {
    pub fn new(
        raw: &Arc<RawDevice>,
        layout: Arc<PipelineLayout>,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> Result<Self> {
        let loaders = raw.ray_tracing()?;
        let caps = raw.adapter().ray_tracing;
        if desc.max_recursion_depth > caps.max_ray_recursion_depth {
            return Err(GpuError::PipelineCreation(format!(
                "recursion depth {} exceeds device limit {}",
                desc.max_recursion_depth, caps.max_ray_recursion_depth
            )));
        }

        let mut stages = vec![desc.raygen.stage(vk::ShaderStageFlags::RAYGEN_KHR)];
        let mut groups = vec![general_group(0)];
        for miss in &desc.misses {
            groups.push(general_group(stages.len() as u32));
            stages.push(miss.stage(vk::ShaderStageFlags::MISS_KHR));
        }
        for hit in &desc.hit_groups {
            let mut group = vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR);
            if let Some(closest_hit) = hit.closest_hit {
                group = group.closest_hit_shader(stages.len() as u32);
                stages.push(closest_hit.stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
            }
            if let Some(any_hit) = hit.any_hit {
                group = group.any_hit_shader(stages.len() as u32);
                stages.push(any_hit.stage(vk::ShaderStageFlags::ANY_HIT_KHR));
            }
            groups.push(group);
        }

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(layout.handle());

        let pipelines = unsafe {
            loaders.ray_tracing_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        }
        .map_err(|(_pipelines, err)| {
            tracing::error!(%err, "vkCreateRayTracingPipelinesKHR failed");
            GpuError::PipelineCreation(format!("Ray tracing pipeline: {err}"))
        })?;
        let pipeline = first_pipeline(pipelines)?;

        let sbt_layout = SbtLayout::new(
            caps.shader_group_handle_size,
            caps.shader_group_handle_alignment,
            caps.shader_group_base_alignment,
            desc.misses.len() as u32,
            desc.hit_groups.len() as u32,
        );
        let sbt = match ShaderBindingTable::new(raw, pipeline, sbt_layout) {
            Ok(sbt) => sbt,
            Err(err) => {
                unsafe { raw.device.destroy_pipeline(pipeline, None) };
                return Err(err);
            }
        };

        Ok(Self {
            raw: Arc::clone(raw),
            pipeline,
            layout,
            sbt,
        })
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }
}

fn general_group(shader: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(shader)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

impl Pipeline for RayTracingPipeline {
    fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle()
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::RAY_TRACING_KHR
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

impl CommandBuffer {
    /// Dispatch rays over `extent` using the pipeline's binding table.
    pub fn trace_rays(&self, pipeline: &RayTracingPipeline, extent: vk::Extent2D) -> Result<()> {
        let cmd = self.recording_handle()?;
        let loaders = pipeline.raw.ray_tracing()?;
        let sbt = pipeline.sbt();
        unsafe {
            loaders.ray_tracing_pipeline.cmd_trace_rays(
                cmd,
                &sbt.raygen_region,
                &sbt.miss_region,
                &sbt.hit_region,
                &sbt.callable_region,
                extent.width,
                extent.height,
                1,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn sbt_regions_are_base_aligned() {
        // Typical NVIDIA values: 32-byte handles, 64-byte base alignment
        let layout = SbtLayout::new(32, 32, 64, 2, 3);
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.raygen_size, 64);
        assert_eq!(layout.miss_offset, 64);
        assert_eq!(layout.miss_size, 64);
        assert_eq!(layout.hit_offset, 128);
        assert_eq!(layout.hit_size, 128);
        assert_eq!(layout.total_size, 256);
        assert_eq!(layout.group_count(), 6);
        assert_eq!(layout.handle_offsets(), vec![0, 64, 96, 128, 160, 192]);
    }

    #[test]
    fn handle_alignment_widens_stride() {
        let layout = SbtLayout::new(24, 32, 64, 1, 1);
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.handle_offsets(), vec![0, 64, 128]);
    }
}
