//! Built-in frame passes and the standard ray tracing frame.
//!
//! The standard frame is
//! `BLAS -> TLAS -> primary rays -> (AO | shadows | reflections) -> temporal -> composition`.
//! Kernel descriptor sets follow one convention: binding 0 is the camera
//! uniform buffer, binding 1 the TLAS for ray kernels, then the targets a
//! pass reads, then the targets it writes.

pub mod acceleration;
pub mod bindings;
pub mod closure;
pub mod kernel;

pub use acceleration::{BlasBuildPass, TlasBuildPass};
pub use bindings::PassBindings;
pub use closure::FnPass;
pub use kernel::{group_counts, CompositionPass, Kernel, KernelPass, RAY_TRACING_STAGES};

use crate::error::Result;
use crate::graph::{PassDecl, PassFlags, ResourceId};
use crate::pass::FramePass;
use crate::resources::TargetDesc;
use ash::vk;
use prism_gpu::{
    DeviceContext, RasterPipelineDesc, RayTracingPipelineDesc, RenderPass, ShaderModule,
};

/// Resource names of the standard frame.
pub mod ids {
    use crate::graph::ResourceId;

    pub const BLAS: ResourceId = ResourceId("blas");
    pub const TLAS: ResourceId = ResourceId("tlas");
    pub const GBUFFER: ResourceId = ResourceId("gbuffer");
    pub const AO: ResourceId = ResourceId("ao");
    pub const SHADOWS: ResourceId = ResourceId("shadows");
    pub const REFLECTIONS: ResourceId = ResourceId("reflections");
    pub const FILTERED: ResourceId = ResourceId("filtered");
}

/// Render targets of the standard frame.
pub fn standard_targets() -> Vec<TargetDesc> {
    vec![
        TargetDesc::storage(ids::GBUFFER, vk::Format::R32G32B32A32_SFLOAT),
        TargetDesc::storage(ids::AO, vk::Format::R16G16B16A16_SFLOAT),
        TargetDesc::storage(ids::SHADOWS, vk::Format::R16G16B16A16_SFLOAT),
        TargetDesc::storage(ids::REFLECTIONS, vk::Format::R16G16B16A16_SFLOAT),
        TargetDesc::storage(ids::FILTERED, vk::Format::R16G16B16A16_SFLOAT),
    ]
}

/// Shaders of the standard frame.
pub struct StandardShaders<'a> {
    pub primary: RayTracingPipelineDesc<'a>,
    pub ambient_occlusion: RayTracingPipelineDesc<'a>,
    pub shadows: RayTracingPipelineDesc<'a>,
    pub reflections: RayTracingPipelineDesc<'a>,
    pub temporal: &'a ShaderModule,
    pub composition_vertex: &'a ShaderModule,
    pub composition_fragment: &'a ShaderModule,
}

pub fn primary_bindings() -> PassBindings {
    PassBindings::new().camera(0).tlas(1).write(2, ids::GBUFFER)
}

/// Bindings of a secondary ray kernel that writes `output`.
pub fn secondary_bindings(output: ResourceId) -> PassBindings {
    PassBindings::new()
        .camera(0)
        .tlas(1)
        .read(2, ids::GBUFFER)
        .write(3, output)
}

pub fn temporal_bindings() -> PassBindings {
    PassBindings::new()
        .camera(0)
        .read(1, ids::AO)
        .read(2, ids::SHADOWS)
        .read(3, ids::REFLECTIONS)
        .write(4, ids::FILTERED)
}

pub fn composition_bindings() -> PassBindings {
    PassBindings::new()
        .camera(0)
        .read(1, ids::GBUFFER)
        .read(2, ids::FILTERED)
}

/// Build every pass of the standard frame, in no particular order.
///
/// `forward_pass` is the renderer's forward render pass.
pub fn standard_passes(
    device: &DeviceContext,
    forward_pass: &RenderPass,
    shaders: &StandardShaders<'_>,
) -> Result<Vec<Box<dyn FramePass>>> {
    let ray_kernels = [
        ("primary_rays", &shaders.primary, primary_bindings()),
        (
            "ambient_occlusion",
            &shaders.ambient_occlusion,
            secondary_bindings(ids::AO),
        ),
        ("shadows", &shaders.shadows, secondary_bindings(ids::SHADOWS)),
        (
            "reflections",
            &shaders.reflections,
            secondary_bindings(ids::REFLECTIONS),
        ),
    ];

    let mut passes: Vec<Box<dyn FramePass>> = vec![
        Box::new(BlasBuildPass::new()),
        Box::new(TlasBuildPass::new()),
    ];
    for (name, desc, bindings) in ray_kernels {
        let layout = device.create_descriptor_set_layout(&bindings.layout(RAY_TRACING_STAGES))?;
        let pipeline_layout = device.create_pipeline_layout(&[&layout], &[])?;
        let pipeline = device.create_ray_tracing_pipeline(pipeline_layout, desc)?;
        passes.push(Box::new(KernelPass::new(
            device,
            name,
            Kernel::RayTracing(pipeline),
            bindings,
            layout,
        )?));
    }

    let bindings = temporal_bindings();
    let layout =
        device.create_descriptor_set_layout(&bindings.layout(vk::ShaderStageFlags::COMPUTE))?;
    let pipeline_layout = device.create_pipeline_layout(&[&layout], &[])?;
    let pipeline = device.create_compute_pipeline(pipeline_layout, shaders.temporal)?;
    passes.push(Box::new(KernelPass::new(
        device,
        "temporal",
        Kernel::Compute {
            pipeline,
            workgroup: [8, 8],
        },
        bindings,
        layout,
    )?));

    let bindings = composition_bindings();
    let layout =
        device.create_descriptor_set_layout(&bindings.layout(vk::ShaderStageFlags::FRAGMENT))?;
    let pipeline_layout = device.create_pipeline_layout(&[&layout], &[])?;
    let pipeline = device.create_raster_pipeline(
        pipeline_layout,
        forward_pass,
        &RasterPipelineDesc::new(shaders.composition_vertex, shaders.composition_fragment),
    )?;
    passes.push(Box::new(CompositionPass::new(device, pipeline, bindings, layout)?));

    Ok(passes)
}

/// The standard frame with every kernel replaced by a clear of its outputs
/// and a composition that leaves the forward pass clear color in place.
///
/// Exercises ordering, synchronization and target layouts without shaders.
pub fn clearing_passes() -> Vec<Box<dyn FramePass>> {
    let kernels = [
        ("primary_rays", primary_bindings(), [0.5, 0.5, 0.5, 1.0]),
        ("ambient_occlusion", secondary_bindings(ids::AO), [1.0; 4]),
        ("shadows", secondary_bindings(ids::SHADOWS), [1.0; 4]),
        ("reflections", secondary_bindings(ids::REFLECTIONS), [0.0; 4]),
        ("temporal", temporal_bindings(), [1.0; 4]),
    ];

    let mut passes: Vec<Box<dyn FramePass>> = vec![
        Box::new(BlasBuildPass::new()),
        Box::new(TlasBuildPass::new()),
    ];
    for (name, bindings, color) in kernels {
        passes.push(Box::new(FnPass::clearing(
            bindings.declare(PassDecl::new(name)),
            color,
        )));
    }
    passes.push(Box::new(FnPass::new(
        composition_bindings()
            .declare(PassDecl::new("composition"))
            .flags(PassFlags::DESTINATION),
        |_| Ok(()),
    )));
    passes
}
