//! Command pool, command buffers and recording operations.

use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::memory::{Buffer, Image};
use crate::pipeline::Pipeline;
use crate::render_pass::{Framebuffer, RenderPass};
use crate::sync::{SyncKind, SyncPrimitive};
use ash::vk;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;

/// Command pool for allocating primary command buffers.
pub struct CommandPool {
    raw: Arc<RawDevice>,
    pool: vk::CommandPool,
    queue_family: u32,
    // Allocation and freeing require external synchronization of the pool
    lock: Mutex<()>,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually.
    pub fn new(raw: &Arc<RawDevice>, queue_family: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { raw.device.create_command_pool(&create_info, None) }.map_err(|err| {
            tracing::error!(%err, "vkCreateCommandPool failed");
            GpuError::from(err)
        })?;

        Ok(Self {
            raw: Arc::clone(raw),
            pool,
            queue_family,
            lock: Mutex::new(()),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn allocate(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let _guard = self.lock.lock();
        let buffers = unsafe { self.raw.device.allocate_command_buffers(&alloc_info) }.map_err(
            |err| {
                tracing::error!(%err, "vkAllocateCommandBuffers failed");
                GpuError::from(err)
            },
        )?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("driver returned no command buffer".into()))
    }

    fn free(&self, buffer: vk::CommandBuffer) {
        let _guard = self.lock.lock();
        unsafe {
            self.raw.device.free_command_buffers(self.pool, &[buffer]);
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Recording state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
}

impl RecordingState {
    /// Begin recording. An executable buffer is implicitly reset.
    pub fn begin(self) -> Result<Self> {
        match self {
            Self::Initial | Self::Executable => Ok(Self::Recording),
            Self::Recording => Err(GpuError::InvalidState(
                "command buffer is already recording".into(),
            )),
        }
    }

    pub fn end(self) -> Result<Self> {
        match self {
            Self::Recording => Ok(Self::Executable),
            other => Err(GpuError::InvalidState(format!(
                "cannot end recording in {other:?} state"
            ))),
        }
    }

    pub fn require_recording(self) -> Result<()> {
        match self {
            Self::Recording => Ok(()),
            other => Err(GpuError::InvalidState(format!(
                "recording command issued in {other:?} state"
            ))),
        }
    }

    pub fn require_executable(self) -> Result<()> {
        match self {
            Self::Executable => Ok(()),
            other => Err(GpuError::InvalidState(format!(
                "submission requires an executable command buffer, found {other:?}"
            ))),
        }
    }
}

/// Access and layout transition of one image subresource range.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
}

impl ImageBarrier {
    /// Color transition covering every mip level.
    pub fn layout(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        Self {
            image,
            old_layout,
            new_layout,
            src_access,
            dst_access,
            aspect: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
        }
    }

    pub fn aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }

    pub fn mips(mut self, base: u32, count: u32) -> Self {
        self.base_mip_level = base;
        self.level_count = count;
        self
    }

    fn to_vk(self) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: self.base_mip_level,
                level_count: self.level_count,
                base_array_layer: 0,
                layer_count: 1,
            })
    }
}

/// Access transition of a whole buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl BufferBarrier {
    fn to_vk(self) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

/// A primary command buffer with an optional "execution finished" fence.
///
/// Recording methods take `&self`; the buffer is driven from one thread.
pub struct CommandBuffer {
    pool: Arc<CommandPool>,
    buffer: vk::CommandBuffer,
    state: Cell<RecordingState>,
    completion: Option<SyncPrimitive>,
}

impl CommandBuffer {
    /// Allocate a buffer from the pool, optionally with a completion fence.
    pub fn new(pool: &Arc<CommandPool>, with_completion: bool) -> Result<Self> {
        let completion = if with_completion {
            Some(SyncPrimitive::new(&pool.raw, SyncKind::Cpu)?)
        } else {
            None
        };
        let buffer = pool.allocate()?;
        Ok(Self {
            pool: Arc::clone(pool),
            buffer,
            state: Cell::new(RecordingState::Initial),
            completion,
        })
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn state(&self) -> RecordingState {
        self.state.get()
    }

    /// The CPU-kind primitive signaled when a submission of this buffer finishes.
    pub fn completion(&self) -> Option<&SyncPrimitive> {
        self.completion.as_ref()
    }

    fn device(&self) -> &ash::Device {
        &self.pool.raw.device
    }

    /// Handle for recording, after checking the buffer is in recording state.
    pub fn recording_handle(&self) -> Result<vk::CommandBuffer> {
        self.state.get().require_recording()?;
        Ok(self.buffer)
    }

    /// Handle for submission, after checking the buffer is executable.
    pub fn executable_handle(&self) -> Result<vk::CommandBuffer> {
        self.state.get().require_executable()?;
        Ok(self.buffer)
    }

    /// Begin recording.
    ///
    /// Fails while a submission that signals this buffer's completion fence
    /// has not been waited on.
    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        if self.completion.as_ref().is_some_and(SyncPrimitive::is_armed) {
            return Err(GpuError::InvalidState(
                "command buffer is still pending execution".into(),
            ));
        }
        let next = self.state.get().begin()?;
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device().begin_command_buffer(self.buffer, &begin_info) }.map_err(
            |err| {
                tracing::error!(%err, "vkBeginCommandBuffer failed");
                GpuError::from(err)
            },
        )?;
        self.state.set(next);
        Ok(())
    }

    /// End recording.
    pub fn end(&self) -> Result<()> {
        let next = self.state.get().end()?;
        unsafe { self.device().end_command_buffer(self.buffer) }.map_err(|err| {
            tracing::error!(%err, "vkEndCommandBuffer failed");
            GpuError::from(err)
        })?;
        self.state.set(next);
        Ok(())
    }

    /// Record with `f` between `begin` and `end`.
    pub fn record<F>(&self, flags: vk::CommandBufferUsageFlags, f: F) -> Result<()>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        self.begin(flags)?;
        f(self)?;
        self.end()
    }

    /// Return the buffer to the initial state.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device()
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
        }?;
        self.state.set(RecordingState::Initial);
        Ok(())
    }

    /// Record a pipeline barrier with per-resource transitions.
    pub fn pipeline_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    ) -> Result<()> {
        let cmd = self.recording_handle()?;
        let buffer_barriers: Vec<_> = buffers.iter().map(|b| b.to_vk()).collect();
        let image_barriers: Vec<_> = images.iter().map(|b| b.to_vk()).collect();
        unsafe {
            self.device().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &image_barriers,
            );
        }
        Ok(())
    }

    /// Record a global memory barrier.
    pub fn memory_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Result<()> {
        let cmd = self.recording_handle()?;
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        unsafe {
            self.device().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }

    pub fn copy_buffer_to_image(
        &self,
        src: &Buffer,
        dst: &Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe {
            self.device()
                .cmd_copy_buffer_to_image(cmd, src.handle(), dst.handle(), dst_layout, regions);
        }
        Ok(())
    }

    pub fn copy_image_to_buffer(
        &self,
        src: &Image,
        src_layout: vk::ImageLayout,
        dst: &Buffer,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe {
            self.device()
                .cmd_copy_image_to_buffer(cmd, src.handle(), src_layout, dst.handle(), regions);
        }
        Ok(())
    }

    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer, regions: &[vk::BufferCopy]) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe {
            self.device()
                .cmd_copy_buffer(cmd, src.handle(), dst.handle(), regions);
        }
        Ok(())
    }

    /// Clear every mip level of a color image in `layout`.
    pub fn clear_color_image(
        &self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    ) -> Result<()> {
        let cmd = self.recording_handle()?;
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device().cmd_clear_color_image(
                cmd,
                image,
                layout,
                &vk::ClearColorValue { float32: color },
                &[range],
            );
        }
        Ok(())
    }

    pub fn begin_render_pass(
        &self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        clear_values: &[vk::ClearValue],
    ) -> Result<()> {
        let cmd = self.recording_handle()?;
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.handle())
            .framebuffer(framebuffer.handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: framebuffer.extent(),
            })
            .clear_values(clear_values);
        unsafe {
            self.device()
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    pub fn end_render_pass(&self) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe { self.device().cmd_end_render_pass(cmd) };
        Ok(())
    }

    /// Set a full-extent viewport and scissor for dynamic-state pipelines.
    pub fn set_viewport_scissor(&self, extent: vk::Extent2D) -> Result<()> {
        let cmd = self.recording_handle()?;
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            self.device().cmd_set_viewport(cmd, 0, &[viewport]);
            self.device().cmd_set_scissor(cmd, 0, &[scissor]);
        }
        Ok(())
    }

    pub fn bind_pipeline(&self, pipeline: &dyn Pipeline) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe {
            self.device()
                .cmd_bind_pipeline(cmd, pipeline.bind_point(), pipeline.handle());
        }
        Ok(())
    }

    pub fn bind_descriptor_sets(
        &self,
        pipeline: &dyn Pipeline,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                cmd,
                pipeline.bind_point(),
                pipeline.layout(),
                first_set,
                sets,
                &[],
            );
        }
        Ok(())
    }

    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        pipeline: &dyn Pipeline,
        stages: vk::ShaderStageFlags,
        offset: u32,
        value: &T,
    ) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe {
            self.device().cmd_push_constants(
                cmd,
                pipeline.layout(),
                stages,
                offset,
                bytemuck::bytes_of(value),
            );
        }
        Ok(())
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe { self.device().cmd_draw(cmd, vertex_count, instance_count, 0, 0) };
        Ok(())
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<()> {
        let cmd = self.recording_handle()?;
        unsafe { self.device().cmd_dispatch(cmd, x, y, z) };
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // A pending buffer must not be freed
        if let Some(completion) = self.completion.as_ref().filter(|c| c.is_armed()) {
            if let Ok(fence) = completion.fence() {
                if let Err(err) =
                    unsafe { self.pool.raw.device.wait_for_fences(&[fence], true, u64::MAX) }
                {
                    tracing::warn!(%err, "Waiting on pending command buffer failed");
                }
            }
        }
        self.pool.free(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_recording_cycle() {
        let state = RecordingState::Initial;
        assert!(state.require_recording().is_err());
        let state = state.begin().unwrap();
        assert!(state.require_recording().is_ok());
        assert!(state.require_executable().is_err());
        let state = state.end().unwrap();
        assert!(state.require_executable().is_ok());
        // Re-recording an executable buffer resets it implicitly
        assert_eq!(state.begin().unwrap(), RecordingState::Recording);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(RecordingState::Initial.end().is_err());
        assert!(RecordingState::Executable.end().is_err());
        assert!(RecordingState::Recording.begin().is_err());
        assert!(RecordingState::Initial.require_executable().is_err());
    }

    #[test]
    fn image_barrier_defaults_cover_all_mips() {
        let barrier = ImageBarrier::layout(
            vk::Image::null(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::HOST_WRITE,
            vk::AccessFlags::TRANSFER_WRITE,
        );
        let raw = barrier.to_vk();
        assert_eq!(raw.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(raw.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);

        let raw = barrier.mips(2, 1).aspect(vk::ImageAspectFlags::DEPTH).to_vk();
        assert_eq!(raw.subresource_range.base_mip_level, 2);
        assert_eq!(raw.subresource_range.level_count, 1);
        assert_eq!(raw.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }
}
