//! Headless device and readback.

use ash::vk;
use prism_gpu::upload::{MipCopy, StagingLayout};
use prism_gpu::{
    Buffer, BufferDesc, CommandBuffer, DeviceConfig, DeviceContext, Image, ImageBarrier,
};

use crate::{Result, TestError};

/// A device context on the first adapter, with no window.
pub struct HeadlessDevice {
    context: DeviceContext,
}

impl HeadlessDevice {
    /// Device without validation or ray tracing.
    pub fn new() -> Result<Self> {
        Self::with_config(&Self::config(false))
    }

    /// Device with the ray tracing extensions; fails on adapters without them.
    pub fn with_ray_tracing() -> Result<Self> {
        Self::with_config(&Self::config(true))
    }

    /// Test configuration: no validation layer, so tests run on machines
    /// without the SDK installed.
    pub fn config(ray_tracing: bool) -> DeviceConfig {
        DeviceConfig::new()
            .app_name("prism-test")
            .validation(false)
            .ray_tracing(ray_tracing)
    }

    pub fn with_config(config: &DeviceConfig) -> Result<Self> {
        let mut context = DeviceContext::initialize(config)?;
        if context.adapter_count() == 0 {
            return Err(TestError::NoAdapter);
        }
        context.select_and_init_device(0)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut DeviceContext {
        &mut self.context
    }

    /// Submit `cmd` on its own and block until it has executed.
    pub fn submit_and_wait(&self, cmd: &CommandBuffer) -> Result<()> {
        let completion = cmd
            .completion()
            .ok_or_else(|| TestError::Readback("command buffer has no completion fence".into()))?;
        self.context.execute_command_buffer(cmd, None, None)?;
        self.context.wait(&[completion])?;
        Ok(())
    }

    /// Read `image` back through the same copy regions an upload of `mips`
    /// uses. Skipped (empty) mips come back empty.
    ///
    /// The image is left in `TRANSFER_SRC_OPTIMAL`.
    pub fn read_mips(
        &self,
        image: &Image,
        layout: vk::ImageLayout,
        mips: &[&[u8]],
    ) -> Result<Vec<Vec<u8>>> {
        let staging = StagingLayout::new(mips);
        let mut levels = vec![Vec::new(); mips.len()];
        if staging.is_empty() {
            return Ok(levels);
        }
        let buffer = self.copy_out(image, layout, &staging)?;
        for copy in &staging.copies {
            levels[copy.level as usize] = buffer.read_bytes(copy.offset, copy.size as usize)?;
        }
        Ok(levels)
    }

    /// Read mip 0 of an 8-bit, four-channel color image as RGBA.
    pub fn read_rgba8(&self, image: &Image, layout: vk::ImageLayout) -> Result<image::RgbaImage> {
        let bgra = match image.format() {
            vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => false,
            vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => true,
            other => {
                return Err(TestError::Readback(format!(
                    "unsupported readback format {other:?}"
                )))
            }
        };
        let extent = image.extent();
        let size = u64::from(extent.width) * u64::from(extent.height) * 4;
        let staging = StagingLayout {
            total_size: size,
            copies: vec![MipCopy {
                level: 0,
                offset: 0,
                size,
            }],
        };

        let buffer = self.copy_out(image, layout, &staging)?;
        let mut pixels = buffer.read_bytes(0, size as usize)?;
        if bgra {
            for pixel in pixels.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
        }
        image::RgbaImage::from_raw(extent.width, extent.height, pixels)
            .ok_or_else(|| TestError::Readback("pixel data does not match image size".into()))
    }

    fn copy_out(
        &self,
        image: &Image,
        layout: vk::ImageLayout,
        staging: &StagingLayout,
    ) -> Result<Buffer> {
        let buffer = self
            .context
            .create_buffer(&BufferDesc::readback("readback", staging.total_size))?;
        let regions = staging.copy_regions(|level| image.mip_extent(level));

        let cmd = self.context.create_command_buffer()?;
        cmd.record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, |cmd| {
            cmd.pipeline_barrier(
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                &[],
                &[ImageBarrier::layout(
                    image.handle(),
                    layout,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::MEMORY_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                )],
            )?;
            cmd.copy_image_to_buffer(
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                &buffer,
                &regions,
            )?;
            cmd.memory_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::HOST_READ,
            )
        })?;
        self.submit_and_wait(&cmd)?;
        tracing::debug!(
            regions = regions.len(),
            bytes = staging.total_size,
            "Read back image"
        );
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_gpu::{teardown_order, GpuError, ImageDesc, SubmitInfo, SyncKind, TeardownStep};

    // These tests require a GPU and are skipped without one

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn initialize_without_validation_lists_adapters() {
        let context = DeviceContext::initialize(&HeadlessDevice::config(false)).unwrap();
        assert!(context.adapter_count() > 0);
        let info = context.adapter_info(0).unwrap();
        assert!(!info.device_name.is_empty());
        assert!(!info.queue_families.is_empty());
        assert!(context.adapter_info(context.adapter_count()).is_err());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn missing_instance_extension_is_named() {
        let config = HeadlessDevice::config(false).require_instance_extension("VK_PRISM_not_real");
        match DeviceContext::initialize(&config) {
            Err(GpuError::MissingExtensions(names)) => {
                assert_eq!(names, vec!["VK_PRISM_not_real".to_string()]);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("initialization should fail"),
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn missing_device_extension_is_named() {
        let config = HeadlessDevice::config(false).require_device_extension("VK_PRISM_not_real");
        let mut context = DeviceContext::initialize(&config).unwrap();
        let err = context.select_and_init_device(0).unwrap_err();
        assert!(matches!(
            err,
            GpuError::MissingExtensions(ref names) if names == &["VK_PRISM_not_real"]
        ));
        assert!(!context.is_device_initialized());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn out_of_range_adapter_keeps_selection() {
        let mut device = HeadlessDevice::new().unwrap();
        let context = device.context_mut();
        let count = context.adapter_count();
        assert!(context.set_current_adapter(count).is_err());
        assert_eq!(context.current_adapter(), 0);
        assert!(matches!(
            context.adapter_info(count),
            Err(GpuError::IndexOutOfRange { what: "adapter", .. })
        ));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn main_command_buffer_is_cached() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let first = context.main_command_buffer().unwrap();
        let second = context.main_command_buffer().unwrap();
        assert!(std::ptr::eq(first, second));

        let a = context.create_command_buffer().unwrap();
        let b = context.create_command_buffer().unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_ne!(a.handle(), first.handle());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn zero_sized_buffer_is_rejected() {
        let device = HeadlessDevice::new().unwrap();
        let result = device
            .context()
            .create_buffer(&BufferDesc::staging("empty", 0));
        assert!(matches!(result, Err(GpuError::InvalidResource(_))));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn shutdown_releases_allocator_first() {
        let mut device = HeadlessDevice::new().unwrap();
        let context = device.context_mut();
        context.main_command_buffer().unwrap();
        drop(context.create_buffer(&BufferDesc::staging("scratch", 256)).unwrap());

        let steps = context.shutdown();
        assert_eq!(steps, teardown_order(0));
        assert_eq!(steps.first(), Some(&TeardownStep::Allocator));
        assert!(!context.is_device_initialized());
        assert!(context.shutdown().is_empty());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn shutdown_defers_allocator_while_buffers_live() {
        let mut device = HeadlessDevice::new().unwrap();
        let context = device.context_mut();
        let buffer = context.create_buffer(&BufferDesc::staging("held", 256)).unwrap();

        let steps = context.shutdown();
        assert!(!steps.contains(&TeardownStep::Allocator));
        assert_eq!(steps.last(), Some(&TeardownStep::Device));
        drop(buffer);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn waiting_on_gpu_primitive_is_rejected() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();
        let semaphore = context.create_sync_primitive(SyncKind::Gpu).unwrap();
        assert!(matches!(
            context.wait(&[&semaphore]),
            Err(GpuError::WrongSyncKind { .. })
        ));
        context.wait(&[]).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn uploaded_mips_read_back_identical() {
        let device = HeadlessDevice::new().unwrap();
        let pattern = |len: usize, seed: u8| -> Vec<u8> {
            (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
        };
        let mip0 = pattern(8 * 8 * 4, 0x11);
        let mip1 = pattern(4 * 4 * 4, 0x22);
        let mip3 = pattern(4, 0x44);
        // Mip 2 is skipped and must not shift mip 3
        let mips: [&[u8]; 4] = [&mip0, &mip1, &[], &mip3];

        let desc = ImageDesc::new_2d(
            "mips",
            vk::Format::R8G8B8A8_UNORM,
            8,
            8,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC,
        )
        .mip_levels(4);
        let image = device.context().create_image_with_data(&desc, &mips).unwrap();

        let levels = device
            .read_mips(&image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, &mips)
            .unwrap();
        assert_eq!(levels[0], mip0);
        assert_eq!(levels[1], mip1);
        assert!(levels[2].is_empty());
        assert_eq!(levels[3], mip3);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn chained_batches_execute_in_order() {
        let device = HeadlessDevice::new().unwrap();
        let context = device.context();

        let source = context
            .create_buffer(&BufferDesc::staging("source", 4))
            .unwrap();
        let middle = context
            .create_buffer(&BufferDesc::gpu_only(
                "middle",
                4,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            ))
            .unwrap();
        let target = context
            .create_buffer(&BufferDesc::readback("target", 4))
            .unwrap();
        let link = context.create_sync_primitive(SyncKind::Gpu).unwrap();
        let first = CommandBuffer::new(context.command_pool().unwrap(), false).unwrap();
        let second = context.create_command_buffer().unwrap();
        let region = [vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 4,
        }];

        for i in 0u32..100 {
            source.write(0, &[i]).unwrap();
            first.reset().unwrap();
            first
                .record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, |cmd| {
                    cmd.copy_buffer(&source, &middle, &region)
                })
                .unwrap();
            second.reset().unwrap();
            second
                .record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, |cmd| {
                    cmd.memory_barrier(
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::TRANSFER_READ,
                    )?;
                    cmd.copy_buffer(&middle, &target, &region)?;
                    cmd.memory_barrier(
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::HOST,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::HOST_READ,
                    )
                })
                .unwrap();

            context
                .dispatch_to_gpu(&[
                    SubmitInfo::new(&first).signal(&link),
                    SubmitInfo::new(&second).wait(&link),
                ])
                .unwrap();
            context.wait(&[second.completion().unwrap()]).unwrap();

            let bytes = target.read_bytes(0, 4).unwrap();
            assert_eq!(bytes, i.to_ne_bytes(), "batch {i}");
        }
    }
}
