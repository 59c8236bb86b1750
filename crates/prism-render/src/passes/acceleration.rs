//! Acceleration structure build passes.
//!
//! Both run only on frames whose scene revision is newer than the last
//! completed build.

use crate::error::{RenderError, Result};
use crate::graph::{PassDecl, PassFlags};
use crate::pass::{FramePass, PassContext};
use crate::passes::ids;
use prism_gpu::acceleration::create_scratch_buffer;
use prism_gpu::{Blas, Buffer, DeviceContext, TlasInstance};

/// Scratch memory kept between builds, grown on demand.
#[derive(Default)]
struct Scratch(Option<Buffer>);

impl Scratch {
    fn at_least(&mut self, device: &DeviceContext, size: u64) -> Result<&Buffer> {
        let reuse = self.0.as_ref().is_some_and(|buffer| buffer.size() >= size);
        if !reuse {
            self.0 = None;
            self.0 = Some(create_scratch_buffer(device.raw()?, size)?);
            tracing::debug!(size, "Grew acceleration structure scratch");
        }
        self.0
            .as_ref()
            .ok_or(RenderError::MissingResource("as_scratch"))
    }
}

/// One bottom-level structure per scene mesh.
#[derive(Default)]
pub struct BlasBuildPass {
    scratch: Scratch,
}

impl BlasBuildPass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FramePass for BlasBuildPass {
    fn declaration(&self) -> PassDecl {
        PassDecl::new("blas_build")
            .writes([ids::BLAS])
            .flags(PassFlags::ON_GEOMETRY_CHANGE)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn record(&mut self, ctx: &mut PassContext<'_, '_>) -> Result<()> {
        let blas = ctx
            .scene
            .meshes
            .iter()
            .map(|mesh| ctx.device.create_blas(&[mesh.geometry()]))
            .collect::<prism_gpu::Result<Vec<Blas>>>()?;

        let scratch_size = blas
            .iter()
            .map(|b| b.structure().build_scratch_size())
            .max()
            .unwrap_or(0);
        if scratch_size > 0 {
            let scratch = self.scratch.at_least(ctx.device, scratch_size)?;
            for (index, structure) in blas.iter().enumerate() {
                // Builds share the scratch buffer
                if index > 0 {
                    ctx.cmd.acceleration_structure_barrier()?;
                }
                structure.record_build(ctx.cmd, scratch)?;
            }
        }

        tracing::debug!(meshes = blas.len(), "Recorded BLAS builds");
        ctx.resources.set_blas(blas);
        Ok(())
    }
}

/// Single top-level structure over every scene instance.
#[derive(Default)]
pub struct TlasBuildPass {
    scratch: Scratch,
}

impl TlasBuildPass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FramePass for TlasBuildPass {
    fn declaration(&self) -> PassDecl {
        PassDecl::new("tlas_build")
            .reads([ids::BLAS])
            .writes([ids::TLAS])
            .flags(PassFlags::ON_GEOMETRY_CHANGE)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn record(&mut self, ctx: &mut PassContext<'_, '_>) -> Result<()> {
        let instances = build_instances(ctx)?;
        if instances.is_empty() {
            tracing::debug!("Scene has no instances, clearing TLAS");
            ctx.resources.set_tlas(None);
            return Ok(());
        }

        let tlas = ctx.device.create_tlas(&instances)?;
        let scratch = self
            .scratch
            .at_least(ctx.device, tlas.structure().build_scratch_size())?;
        tlas.record_build(ctx.cmd, scratch)?;

        tracing::debug!(instances = instances.len(), "Recorded TLAS build");
        ctx.resources.set_tlas(Some(tlas));
        Ok(())
    }
}

fn build_instances(ctx: &PassContext<'_, '_>) -> Result<Vec<TlasInstance>> {
    let blas = ctx.resources.blas();
    ctx.scene
        .instances
        .iter()
        .map(|placement| {
            let structure = blas.get(placement.mesh).ok_or_else(|| {
                RenderError::InvalidScene(format!(
                    "instance references mesh {} of {}",
                    placement.mesh,
                    blas.len()
                ))
            })?;
            let mut instance = TlasInstance::new(structure, placement.transform);
            instance.custom_index = placement.custom_index;
            Ok(instance)
        })
        .collect()
}
