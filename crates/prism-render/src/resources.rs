//! Resources passed between frame passes.

use crate::camera::CameraUniforms;
use crate::error::{RenderError, Result};
use crate::graph::ResourceId;
use ash::vk;
use hashbrown::{HashMap, HashSet};
use prism_gpu::{
    Blas, Buffer, BufferDesc, DeviceContext, Image, ImageBarrier, ImageDesc, ImageView, Tlas,
};

/// A swapchain-sized storage image produced by one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDesc {
    pub id: ResourceId,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

impl TargetDesc {
    /// Storage image readable by later passes. Transfer usage allows
    /// clearing and readback.
    pub fn storage(id: ResourceId, format: vk::Format) -> Self {
        Self {
            id,
            format,
            usage: vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

pub struct RenderTarget {
    pub image: Image,
    pub view: ImageView,
}

/// Render targets, acceleration structures and per-frame uniforms.
///
/// Storage targets live in `GENERAL` layout. A freshly created target is
/// transitioned by the first pass that writes it; the transition only
/// counts once the frame it was recorded in is handed out for submission.
pub struct FrameResources {
    descs: Vec<TargetDesc>,
    targets: HashMap<ResourceId, RenderTarget>,
    ready: HashSet<ResourceId>,
    pending_ready: HashSet<ResourceId>,
    target_generation: u64,
    blas: Vec<Blas>,
    tlas: Option<Tlas>,
    tlas_generation: u64,
    camera: Buffer,
    extent: vk::Extent2D,
}

impl FrameResources {
    pub fn new(device: &DeviceContext, descs: &[TargetDesc], extent: vk::Extent2D) -> Result<Self> {
        let camera = device.create_buffer(&BufferDesc::uniform(
            "camera_uniforms",
            std::mem::size_of::<CameraUniforms>() as u64,
        ))?;
        let mut resources = Self {
            descs: descs.to_vec(),
            targets: HashMap::new(),
            ready: HashSet::new(),
            pending_ready: HashSet::new(),
            target_generation: 0,
            blas: Vec::new(),
            tlas: None,
            tlas_generation: 0,
            camera,
            extent,
        };
        resources.recreate_targets(device, extent)?;
        Ok(resources)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Drop and recreate every target at `extent`.
    pub fn recreate_targets(&mut self, device: &DeviceContext, extent: vk::Extent2D) -> Result<()> {
        self.targets.clear();
        self.ready.clear();
        self.pending_ready.clear();
        for desc in &self.descs {
            let image = device.create_image(&ImageDesc::new_2d(
                desc.id.name(),
                desc.format,
                extent.width,
                extent.height,
                desc.usage,
            ))?;
            let view = device.create_image_view(&image)?;
            self.targets.insert(desc.id, RenderTarget { image, view });
        }
        self.extent = extent;
        self.target_generation += 1;
        tracing::debug!(
            targets = self.descs.len(),
            width = extent.width,
            height = extent.height,
            "Recreated render targets"
        );
        Ok(())
    }

    pub fn target(&self, id: ResourceId) -> Result<&RenderTarget> {
        self.targets
            .get(&id)
            .ok_or(RenderError::MissingResource(id.name()))
    }

    /// Bumped every time targets are recreated.
    pub fn target_generation(&self) -> u64 {
        self.target_generation
    }

    /// Barrier a writer records before using a target.
    ///
    /// `UNDEFINED -> GENERAL` for a fresh target, a `GENERAL` write-after-read
    /// barrier otherwise.
    pub fn storage_barrier(&mut self, id: ResourceId) -> Result<ImageBarrier> {
        let target = self.target(id)?;
        let old_layout = if self.ready.contains(&id) {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::UNDEFINED
        };
        let barrier = ImageBarrier::layout(
            target.image.handle(),
            old_layout,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        );
        self.pending_ready.insert(id);
        Ok(barrier)
    }

    /// Keep the layout transitions recorded this frame.
    pub fn commit_layouts(&mut self) {
        self.ready.extend(self.pending_ready.drain());
    }

    /// Forget transitions from an abandoned frame.
    pub fn discard_layouts(&mut self) {
        self.pending_ready.clear();
    }

    /// Treat every target as fresh again, for frames that never reached the GPU.
    pub fn forget_layouts(&mut self) {
        self.ready.clear();
        self.pending_ready.clear();
    }

    pub fn blas(&self) -> &[Blas] {
        &self.blas
    }

    pub fn set_blas(&mut self, blas: Vec<Blas>) {
        self.blas = blas;
    }

    pub fn tlas(&self) -> Option<&Tlas> {
        self.tlas.as_ref()
    }

    pub fn set_tlas(&mut self, tlas: Option<Tlas>) {
        self.tlas = tlas;
        self.tlas_generation += 1;
    }

    /// Bumped every time the top-level structure is replaced.
    pub fn tlas_generation(&self) -> u64 {
        self.tlas_generation
    }

    pub fn camera_buffer(&self) -> &Buffer {
        &self.camera
    }

    pub fn write_camera(&self, uniforms: &CameraUniforms) -> Result<()> {
        self.camera.write(0, std::slice::from_ref(uniforms))?;
        Ok(())
    }
}
