//! The frame pass interface.

use crate::camera::CameraUniforms;
use crate::error::Result;
use crate::graph::PassDecl;
use crate::resources::FrameResources;
use crate::scene::FrameState;
use ash::vk;
use prism_gpu::{CommandBuffer, DeviceContext, SyncPrimitive};

/// The swapchain image a frame is rendered into.
///
/// Swapchain images are owned by the presentation layer; only native
/// handles cross this boundary.
#[derive(Clone, Copy)]
pub struct SwapchainFrame<'a> {
    pub image_index: usize,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Signaled when the image has been acquired.
    pub image_available: Option<&'a SyncPrimitive>,
    /// Signaled by the destination submission, waited on by presentation.
    pub render_finished: Option<&'a SyncPrimitive>,
}

impl<'a> SwapchainFrame<'a> {
    /// A frame with no presentation primitives, for off-screen targets.
    pub fn offscreen(
        image_index: usize,
        image: vk::Image,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            image_index,
            image,
            view,
            extent,
            image_available: None,
            render_finished: None,
        }
    }
}

/// Everything a pass sees while recording.
pub struct PassContext<'f, 's> {
    pub device: &'f DeviceContext,
    pub cmd: &'f CommandBuffer,
    pub scene: &'f FrameState<'s>,
    pub camera: &'f CameraUniforms,
    pub resources: &'f mut FrameResources,
    pub frame: &'f SwapchainFrame<'f>,
    /// Whether this frame rebuilds acceleration structures.
    pub geometry_changed: bool,
}

impl PassContext<'_, '_> {
    pub fn extent(&self) -> vk::Extent2D {
        self.resources.extent()
    }
}

/// One stage of the frame.
///
/// Every pass except the destination records into its own command buffer,
/// already begun. The destination pass records inside the forward render
/// pass of the caller's destination command buffer.
pub trait FramePass {
    fn declaration(&self) -> PassDecl;

    fn record(&mut self, ctx: &mut PassContext<'_, '_>) -> Result<()>;

    /// Called after swapchain-sized resources have been recreated.
    fn on_resize(&mut self, _device: &DeviceContext, _resources: &FrameResources) -> Result<()> {
        Ok(())
    }
}
