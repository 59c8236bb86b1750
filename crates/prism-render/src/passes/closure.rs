//! Passes recorded by a closure.

use crate::error::Result;
use crate::graph::PassDecl;
use crate::pass::{FramePass, PassContext};
use ash::vk;

type RecordFn = dyn FnMut(&mut PassContext<'_, '_>) -> Result<()>;

/// A pass whose recording is a boxed closure.
///
/// Handy for collaborator-owned work and for tests that only exercise
/// ordering and synchronization.
pub struct FnPass {
    decl: PassDecl,
    record: Box<RecordFn>,
}

impl FnPass {
    pub fn new<F>(decl: PassDecl, record: F) -> Self
    where
        F: FnMut(&mut PassContext<'_, '_>) -> Result<()> + 'static,
    {
        Self {
            decl,
            record: Box::new(record),
        }
    }

    /// A pass that fills every render target it writes with `color`.
    ///
    /// Stands in for a kernel whose shaders are not available. Every
    /// resource in `decl.writes` must be a render target.
    pub fn clearing(decl: PassDecl, color: [f32; 4]) -> Self {
        let writes = decl.writes.clone();
        Self::new(decl, move |ctx| {
            let mut barriers = Vec::with_capacity(writes.len());
            for &id in &writes {
                let mut barrier = ctx.resources.storage_barrier(id)?;
                barrier.dst_access = vk::AccessFlags::TRANSFER_WRITE;
                barriers.push(barrier);
            }
            ctx.cmd.pipeline_barrier(
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                &[],
                &barriers,
            )?;
            for &id in &writes {
                let image = ctx.resources.target(id)?.image.handle();
                ctx.cmd
                    .clear_color_image(image, vk::ImageLayout::GENERAL, color)?;
            }
            Ok(())
        })
    }
}

impl FramePass for FnPass {
    fn declaration(&self) -> PassDecl {
        self.decl.clone()
    }

    fn record(&mut self, ctx: &mut PassContext<'_, '_>) -> Result<()> {
        (self.record)(ctx)
    }
}
