//! Frame orchestration.
//!
//! [`FrameRenderer::render`] records every active pass and returns the
//! ordered submission list for the caller to hand to
//! `DeviceContext::dispatch_to_gpu`. The destination command buffer is
//! always the last entry, so its completion fence covers the whole frame.

use crate::camera::{Camera, CameraUniforms};
use crate::error::{RenderError, Result};
use crate::framebuffers::{FramebufferArena, FRAMEBUFFER_CACHE_SIZE};
use crate::graph::{Edge, FramePlan, PassGraph, PlannedSubmission};
use crate::pass::{FramePass, PassContext, SwapchainFrame};
use crate::passes::standard_targets;
use crate::resources::{FrameResources, TargetDesc};
use crate::scene::FrameState;
use ash::vk;
use hashbrown::HashMap;
use prism_gpu::{
    AttachmentDesc, CommandBuffer, DeviceContext, Framebuffer, GpuError, Image, ImageDesc,
    ImageView, RawDevice, RenderPass, RenderPassDesc, SubmitInfo, SyncKind, SyncPrimitive,
    WindowParams,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame renderer configuration.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Format of the destination (swapchain) images.
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    /// Layout the destination image is left in.
    pub final_layout: vk::ImageLayout,
    pub clear_color: [f32; 4],
    pub window: WindowParams,
    pub targets: Vec<TargetDesc>,
    pub framebuffer_slots: usize,
    pub frame_time_history: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: Some(vk::Format::D32_SFLOAT),
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            window: WindowParams::default(),
            targets: standard_targets(),
            framebuffer_slots: FRAMEBUFFER_CACHE_SIZE,
            frame_time_history: 120,
        }
    }
}

/// Bounded history of CPU record times.
#[derive(Debug, Clone)]
pub struct FrameTimes {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl FrameTimes {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Duration> + '_ {
        self.samples.iter().copied()
    }
}

/// Overlay drawn last into the destination image, inside the forward pass.
pub trait GuiOverlay {
    /// Build this frame's overlay state.
    fn prepare(&mut self, _scene: &FrameState<'_>) {}

    fn draw(&mut self, cmd: &CommandBuffer, scene: &FrameState<'_>) -> Result<()>;
}

struct DepthTarget {
    view: ImageView,
    _image: Image,
}

impl DepthTarget {
    fn new(device: &DeviceContext, format: vk::Format, extent: vk::Extent2D) -> Result<Self> {
        let image = device.create_image(&ImageDesc::new_2d(
            "depth",
            format,
            extent.width,
            extent.height,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ))?;
        let view = device.create_image_view(&image)?;
        Ok(Self {
            view,
            _image: image,
        })
    }
}

struct CachedFramebuffer {
    view: vk::ImageView,
    framebuffer: Framebuffer,
}

/// Drives the frame pass pipeline.
pub struct FrameRenderer {
    config: RendererConfig,
    graph: PassGraph,
    passes: Vec<Box<dyn FramePass>>,
    // None at the destination index
    pass_buffers: Vec<Option<CommandBuffer>>,
    edge_primitives: HashMap<Edge, SyncPrimitive>,
    relays: HashMap<Edge, CommandBuffer>,
    resources: FrameResources,
    framebuffers: FramebufferArena<CachedFramebuffer>,
    depth: Option<DepthTarget>,
    forward_pass: RenderPass,
    overlay: Option<Box<dyn GuiOverlay>>,
    gui_pending: bool,
    blas_built: Option<u64>,
    previous_camera: Option<Camera>,
    frame_times: FrameTimes,
    raw: Arc<RawDevice>,
}

impl FrameRenderer {
    /// Create the renderer. `build_passes` receives the forward render pass
    /// so raster passes can be built against it.
    pub fn new<F>(device: &DeviceContext, config: RendererConfig, build_passes: F) -> Result<Self>
    where
        F: FnOnce(&RenderPass) -> Result<Vec<Box<dyn FramePass>>>,
    {
        let raw = Arc::clone(device.raw()?);
        let extent = window_extent(config.window)?;

        let forward_pass = device.create_render_pass(&RenderPassDesc {
            colors: vec![AttachmentDesc::color_clear(
                config.color_format,
                config.final_layout,
            )],
            depth: config.depth_format.map(AttachmentDesc::depth_clear),
        })?;

        let passes = build_passes(&forward_pass)?;
        let graph = PassGraph::new(passes.iter().map(|pass| pass.declaration()).collect())?;

        let pool = device.command_pool()?;
        let pass_buffers = (0..passes.len())
            .map(|index| {
                if index == graph.destination() {
                    Ok(None)
                } else {
                    CommandBuffer::new(pool, false).map(Some)
                }
            })
            .collect::<prism_gpu::Result<Vec<_>>>()?;

        let resources = FrameResources::new(device, &config.targets, extent)?;
        let depth = config
            .depth_format
            .map(|format| DepthTarget::new(device, format, extent))
            .transpose()?;

        tracing::info!(
            passes = passes.len(),
            order = ?graph
                .order()
                .iter()
                .map(|&i| graph.passes()[i].name.as_str())
                .collect::<Vec<_>>(),
            width = extent.width,
            height = extent.height,
            "Frame renderer created"
        );

        Ok(Self {
            framebuffers: FramebufferArena::new(config.framebuffer_slots),
            frame_times: FrameTimes::new(config.frame_time_history),
            config,
            graph,
            passes,
            pass_buffers,
            edge_primitives: HashMap::new(),
            relays: HashMap::new(),
            resources,
            depth,
            forward_pass,
            overlay: None,
            gui_pending: false,
            blas_built: None,
            previous_camera: None,
            raw,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn graph(&self) -> &PassGraph {
        &self.graph
    }

    pub fn resources(&self) -> &FrameResources {
        &self.resources
    }

    /// Render pass the destination pass and overlay record into.
    pub fn forward_pass(&self) -> &RenderPass {
        &self.forward_pass
    }

    pub fn frame_times(&self) -> &FrameTimes {
        &self.frame_times
    }

    /// Scene revision of the last acceleration-structure build.
    pub fn built_revision(&self) -> Option<u64> {
        self.blas_built
    }

    /// Roll back a recorded frame whose submission failed.
    ///
    /// Its acceleration-structure builds and layout transitions never ran,
    /// so the next frame rebuilds and transitions from scratch.
    pub fn frame_lost(&mut self) {
        tracing::warn!(
            built_revision = ?self.blas_built,
            "Frame lost, acceleration structures will be rebuilt"
        );
        self.blas_built = None;
        self.previous_camera = None;
        self.resources.forget_layouts();
    }

    pub fn set_overlay(&mut self, overlay: Box<dyn GuiOverlay>) {
        self.overlay = Some(overlay);
    }

    /// Framebuffer for the frame's swapchain image, created on first use.
    pub fn framebuffer(
        &mut self,
        device: &DeviceContext,
        frame: &SwapchainFrame<'_>,
    ) -> Result<&Framebuffer> {
        framebuffer_for(
            &mut self.framebuffers,
            device,
            &self.forward_pass,
            self.depth.as_ref(),
            frame,
        )
    }

    /// Stage the overlay for the next recorded frame.
    pub fn draw_gui(&mut self, scene: &FrameState<'_>) {
        match self.overlay.as_mut() {
            Some(overlay) => {
                overlay.prepare(scene);
                self.gui_pending = true;
            }
            None => tracing::trace!("No overlay installed, GUI skipped"),
        }
    }

    /// Recreate every swapchain-sized resource for the new window size.
    pub fn on_resize(&mut self, device: &DeviceContext, window: WindowParams) -> Result<()> {
        let extent = window_extent(window)?;
        device.wait_for_gpu()?;

        let dropped = self.framebuffers.invalidate();
        self.depth = None;
        self.depth = self
            .config
            .depth_format
            .map(|format| DepthTarget::new(device, format, extent))
            .transpose()?;
        self.resources.recreate_targets(device, extent)?;
        for pass in &mut self.passes {
            pass.on_resize(device, &self.resources)?;
        }
        self.config.window = window;

        tracing::info!(
            width = extent.width,
            height = extent.height,
            framebuffers = dropped,
            "Renderer resized"
        );
        Ok(())
    }

    /// Record one frame and return its submissions in order.
    ///
    /// `dest` must not be pending from an earlier frame: wait on its
    /// completion primitive before rendering again. A pass that fails to
    /// record abandons the frame and nothing is returned for submission.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn render<'a>(
        &'a mut self,
        device: &DeviceContext,
        scene: &FrameState<'_>,
        dest: &'a CommandBuffer,
        frame: &SwapchainFrame<'a>,
    ) -> Result<Vec<SubmitInfo<'a>>> {
        let started = Instant::now();
        if dest.completion().is_some_and(SyncPrimitive::is_armed) {
            return Err(GpuError::InvalidState(
                "destination command buffer is still pending from the previous frame".into(),
            )
            .into());
        }
        let extent = self.resources.extent();
        if frame.extent != extent {
            return Err(GpuError::InvalidState(format!(
                "frame is {}x{} but renderer targets are {}x{}; call on_resize first",
                frame.extent.width, frame.extent.height, extent.width, extent.height
            ))
            .into());
        }

        let geometry_changed = scene.geometry_changed(self.blas_built);
        let plan = self
            .graph
            .plan_frame(&self.graph.active_passes(geometry_changed));
        for edge in plan.edges() {
            self.ensure_edge(device, edge)?;
        }
        for edge in plan.relays() {
            self.ensure_relay(device, edge)?;
        }

        let camera = CameraUniforms::for_frame(
            &scene.camera,
            self.previous_camera.as_ref(),
            scene.frame_index,
            extent.width,
            extent.height,
        );
        self.resources.write_camera(&camera)?;

        if let Err(err) = self.record_frame(device, scene, dest, frame, &plan, &camera, geometry_changed)
        {
            self.resources.discard_layouts();
            return Err(err);
        }
        self.resources.commit_layouts();

        if geometry_changed {
            self.blas_built = Some(scene.revision);
        }
        self.previous_camera = Some(scene.camera);
        self.gui_pending = false;

        let elapsed = started.elapsed();
        self.frame_times.push(elapsed);
        tracing::debug!(
            frame = scene.frame_index,
            submissions = plan.submissions.len(),
            skipped = plan.skipped.len(),
            record_us = elapsed.as_micros() as u64,
            "Recorded frame"
        );

        let this: &'a Self = self;
        this.submissions(&plan, dest, frame)
    }

    fn ensure_edge(&mut self, device: &DeviceContext, edge: Edge) -> Result<()> {
        if !self.edge_primitives.contains_key(&edge) {
            let primitive = device.create_sync_primitive(SyncKind::Gpu)?;
            self.edge_primitives.insert(edge, primitive);
        }
        Ok(())
    }

    // Relays carry no commands; recorded once and resubmitted every frame
    fn ensure_relay(&mut self, device: &DeviceContext, edge: Edge) -> Result<()> {
        if !self.relays.contains_key(&edge) {
            let relay = CommandBuffer::new(device.command_pool()?, false)?;
            relay.record(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE, |_| Ok(()))?;
            tracing::trace!(
                producer = %self.graph.passes()[edge.producer].name,
                consumer = %self.graph.passes()[edge.consumer].name,
                "Created relay submission"
            );
            self.relays.insert(edge, relay);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_frame(
        &mut self,
        device: &DeviceContext,
        scene: &FrameState<'_>,
        dest: &CommandBuffer,
        frame: &SwapchainFrame<'_>,
        plan: &FramePlan,
        camera: &CameraUniforms,
        geometry_changed: bool,
    ) -> Result<()> {
        let destination = self.graph.destination();
        let Self {
            graph,
            passes,
            pass_buffers,
            resources,
            framebuffers,
            depth,
            forward_pass,
            overlay,
            gui_pending,
            config,
            ..
        } = self;

        for index in plan.passes() {
            let name = &graph.passes()[index].name;
            let pass = &mut passes[index];
            let result = if index == destination {
                record_destination(
                    device,
                    dest,
                    framebuffers,
                    forward_pass,
                    depth.as_ref(),
                    config.clear_color,
                    frame,
                    |cmd| {
                        pass.record(&mut PassContext {
                            device,
                            cmd,
                            scene,
                            camera,
                            resources,
                            frame,
                            geometry_changed,
                        })?;
                        match overlay.as_mut() {
                            Some(overlay) if *gui_pending => overlay.draw(cmd, scene),
                            _ => Ok(()),
                        }
                    },
                )
            } else {
                match pass_buffers[index].as_ref() {
                    Some(cmd) => record_own(cmd, |cmd| {
                        pass.record(&mut PassContext {
                            device,
                            cmd,
                            scene,
                            camera,
                            resources,
                            frame,
                            geometry_changed,
                        })
                    }),
                    None => Err(RenderError::MissingResource("pass command buffer")),
                }
            };
            result.map_err(|source| {
                tracing::error!(pass = %name, %source, "Pass failed, frame abandoned");
                RenderError::PassFailed {
                    pass: name.clone(),
                    source: Box::new(source),
                }
            })?;
        }
        Ok(())
    }

    fn primitive(&self, edge: Edge) -> Result<&SyncPrimitive> {
        self.edge_primitives
            .get(&edge)
            .ok_or(RenderError::MissingResource("edge primitive"))
    }

    fn submissions<'a>(
        &'a self,
        plan: &FramePlan,
        dest: &'a CommandBuffer,
        frame: &SwapchainFrame<'a>,
    ) -> Result<Vec<SubmitInfo<'a>>> {
        let destination = self.graph.destination();
        let mut submissions = Vec::with_capacity(plan.submissions.len());
        for entry in &plan.submissions {
            let info = match entry {
                PlannedSubmission::Pass {
                    pass,
                    waits,
                    signal,
                } => {
                    let cmd = if *pass == destination {
                        dest
                    } else {
                        self.pass_buffers[*pass]
                            .as_ref()
                            .ok_or(RenderError::MissingResource("pass command buffer"))?
                    };
                    let mut info = SubmitInfo::new(cmd);
                    for &edge in waits {
                        info = info.wait(self.primitive(edge)?);
                    }
                    if let Some(edge) = *signal {
                        info = info.signal(self.primitive(edge)?);
                    }
                    if *pass == destination {
                        if let Some(acquired) = frame.image_available {
                            info = info.wait(acquired);
                        }
                        if let Some(finished) = frame.render_finished {
                            info = info.signal(finished);
                        }
                    }
                    info
                }
                PlannedSubmission::Relay { signal } => {
                    let relay = self
                        .relays
                        .get(signal)
                        .ok_or(RenderError::MissingResource("relay command buffer"))?;
                    SubmitInfo::new(relay).signal(self.primitive(*signal)?)
                }
            };
            submissions.push(info);
        }
        Ok(submissions)
    }
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        // Pass buffers and primitives may still be in use by the last frame
        if let Err(err) = self.raw.wait_idle() {
            tracing::warn!(%err, "Failed to wait for GPU before dropping renderer");
        }
    }
}

fn window_extent(window: WindowParams) -> Result<vk::Extent2D> {
    if window.width == 0 || window.height == 0 {
        return Err(GpuError::InvalidResource(format!(
            "window size {}x{} has no area",
            window.width, window.height
        ))
        .into());
    }
    Ok(vk::Extent2D {
        width: window.width,
        height: window.height,
    })
}

fn record_own<F>(cmd: &CommandBuffer, record: F) -> Result<()>
where
    F: FnOnce(&CommandBuffer) -> Result<()>,
{
    cmd.reset()?;
    cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    record(cmd)?;
    cmd.end()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn record_destination<F>(
    device: &DeviceContext,
    dest: &CommandBuffer,
    framebuffers: &mut FramebufferArena<CachedFramebuffer>,
    forward_pass: &RenderPass,
    depth: Option<&DepthTarget>,
    clear_color: [f32; 4],
    frame: &SwapchainFrame<'_>,
    record: F,
) -> Result<()>
where
    F: FnOnce(&CommandBuffer) -> Result<()>,
{
    let framebuffer = framebuffer_for(framebuffers, device, forward_pass, depth, frame)?;
    let mut clear_values = vec![vk::ClearValue {
        color: vk::ClearColorValue {
            float32: clear_color,
        },
    }];
    if depth.is_some() {
        clear_values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        });
    }

    record_own(dest, |cmd| {
        cmd.begin_render_pass(forward_pass, framebuffer, &clear_values)?;
        cmd.set_viewport_scissor(frame.extent)?;
        record(cmd)?;
        cmd.end_render_pass()?;
        Ok(())
    })
}

fn framebuffer_for<'f>(
    framebuffers: &'f mut FramebufferArena<CachedFramebuffer>,
    device: &DeviceContext,
    forward_pass: &RenderPass,
    depth: Option<&DepthTarget>,
    frame: &SwapchainFrame<'_>,
) -> Result<&'f Framebuffer> {
    let index = frame.image_index;
    // A different view at the same index means the swapchain was rebuilt
    if framebuffers
        .get(index)
        .is_some_and(|cached| cached.view != frame.view)
    {
        framebuffers.remove(index)?;
    }
    let cached = framebuffers.get_or_try_insert(index, || {
        let mut attachments = vec![frame.view];
        if let Some(depth) = depth {
            attachments.push(depth.view.handle());
        }
        let framebuffer = device.create_framebuffer(forward_pass, &attachments, frame.extent)?;
        tracing::debug!(index, "Created framebuffer");
        Ok(CachedFramebuffer {
            view: frame.view,
            framebuffer,
        })
    })?;
    Ok(&cached.framebuffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_times_are_bounded() {
        let mut times = FrameTimes::new(3);
        for ms in 1..=5 {
            times.push(Duration::from_millis(ms));
        }
        assert_eq!(times.len(), 3);
        assert_eq!(times.latest(), Some(Duration::from_millis(5)));
        assert_eq!(
            times.iter().collect::<Vec<_>>(),
            vec![
                Duration::from_millis(3),
                Duration::from_millis(4),
                Duration::from_millis(5)
            ]
        );
        assert_eq!(times.average(), Some(Duration::from_millis(4)));
    }

    #[test]
    fn empty_history_has_no_average() {
        let mut times = FrameTimes::new(0);
        times.push(Duration::from_millis(1));
        assert!(times.is_empty());
        assert_eq!(times.average(), None);
    }

    #[test]
    fn zero_area_window_is_rejected() {
        assert!(window_extent(WindowParams::new(0, 720)).is_err());
        let extent = window_extent(WindowParams::new(800, 600)).unwrap();
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn default_config_uses_standard_targets() {
        let config = RendererConfig::default();
        assert_eq!(config.targets.len(), standard_targets().len());
        assert_eq!(config.framebuffer_slots, FRAMEBUFFER_CACHE_SIZE);
    }
}
