//! Render passes and framebuffers.

use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// One attachment of a single-subpass render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    /// Color attachment cleared at the start of the pass, prior contents
    /// discarded, ending ready for `final_layout`.
    pub fn color_clear(format: vk::Format, final_layout: vk::ImageLayout) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout,
        }
    }

    /// Depth attachment cleared at the start of the pass.
    pub fn depth_clear(format: vk::Format) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    fn to_vk(self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::default()
            .format(self.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
    }
}

/// Render pass creation parameters.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    pub colors: Vec<AttachmentDesc>,
    pub depth: Option<AttachmentDesc>,
}

pub struct RenderPass {
    raw: Arc<RawDevice>,
    render_pass: vk::RenderPass,
    attachment_count: usize,
}

impl RenderPass {
    pub fn new(raw: &Arc<RawDevice>, desc: &RenderPassDesc) -> Result<Self> {
        let mut attachments: Vec<vk::AttachmentDescription> =
            desc.colors.iter().map(|a| a.to_vk()).collect();
        let color_refs: Vec<vk::AttachmentReference> = (0..desc.colors.len() as u32)
            .map(|i| vk::AttachmentReference {
                attachment: i,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = desc.depth.map(|depth| {
            attachments.push(depth.to_vk());
            vk::AttachmentReference {
                attachment: desc.colors.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let subpasses = [subpass];
        let dependencies = [dependency];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { raw.device.create_render_pass(&info, None) }.map_err(|err| {
            tracing::error!(%err, "vkCreateRenderPass failed");
            GpuError::from(err)
        })?;
        Ok(Self {
            raw: Arc::clone(raw),
            render_pass,
            attachment_count: attachments.len(),
        })
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn attachment_count(&self) -> usize {
        self.attachment_count
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Image views bound to a compatible render pass.
pub struct Framebuffer {
    raw: Arc<RawDevice>,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl Framebuffer {
    /// Compatibility beyond the attachment count is left to the driver.
    pub fn new(
        raw: &Arc<RawDevice>,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        if attachments.len() != render_pass.attachment_count() {
            tracing::error!(
                given = attachments.len(),
                expected = render_pass.attachment_count(),
                "Framebuffer attachment count mismatch"
            );
            return Err(GpuError::InvalidResource(format!(
                "framebuffer has {} attachments, render pass expects {}",
                attachments.len(),
                render_pass.attachment_count()
            )));
        }
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle())
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe { raw.device.create_framebuffer(&info, None) }.map_err(|err| {
            tracing::error!(%err, "vkCreateFramebuffer failed");
            GpuError::from(err)
        })?;
        Ok(Self {
            raw: Arc::clone(raw),
            framebuffer,
            extent,
        })
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_framebuffer(self.framebuffer, None);
        }
    }
}
