//! Blocking upload of initial image data through a staging buffer.

use crate::command::{CommandBuffer, ImageBarrier};
use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::memory::{Buffer, BufferDesc, Image};
use crate::submit::{Queue, SubmitInfo};
use crate::sync::wait_and_reset;
use ash::vk;
use std::sync::Arc;

/// Size of one texel block of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelBlock {
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
}

impl TexelBlock {
    const fn texel(bytes: u64) -> Self {
        Self {
            width: 1,
            height: 1,
            bytes,
        }
    }

    const fn compressed(bytes: u64) -> Self {
        Self {
            width: 4,
            height: 4,
            bytes,
        }
    }

    /// Block size for the color formats uploads accept.
    pub fn of(format: vk::Format) -> Option<Self> {
        use vk::Format as F;
        let block = match format {
            F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT | F::R8_SRGB => Self::texel(1),
            F::R8G8_UNORM | F::R8G8_SNORM | F::R8G8_UINT | F::R8G8_SINT | F::R8G8_SRGB
            | F::R16_UNORM | F::R16_SNORM | F::R16_UINT | F::R16_SINT | F::R16_SFLOAT => {
                Self::texel(2)
            }
            F::R8G8B8A8_UNORM
            | F::R8G8B8A8_SNORM
            | F::R8G8B8A8_UINT
            | F::R8G8B8A8_SINT
            | F::R8G8B8A8_SRGB
            | F::B8G8R8A8_UNORM
            | F::B8G8R8A8_SRGB
            | F::A2B10G10R10_UNORM_PACK32
            | F::B10G11R11_UFLOAT_PACK32
            | F::E5B9G9R9_UFLOAT_PACK32
            | F::R16G16_UNORM
            | F::R16G16_SFLOAT
            | F::R32_UINT
            | F::R32_SINT
            | F::R32_SFLOAT => Self::texel(4),
            F::R16G16B16A16_UNORM
            | F::R16G16B16A16_SFLOAT
            | F::R32G32_UINT
            | F::R32G32_SINT
            | F::R32G32_SFLOAT => Self::texel(8),
            F::R32G32B32A32_UINT | F::R32G32B32A32_SINT | F::R32G32B32A32_SFLOAT => {
                Self::texel(16)
            }
            F::BC1_RGB_UNORM_BLOCK
            | F::BC1_RGB_SRGB_BLOCK
            | F::BC1_RGBA_UNORM_BLOCK
            | F::BC1_RGBA_SRGB_BLOCK
            | F::BC4_UNORM_BLOCK
            | F::BC4_SNORM_BLOCK => Self::compressed(8),
            F::BC2_UNORM_BLOCK
            | F::BC2_SRGB_BLOCK
            | F::BC3_UNORM_BLOCK
            | F::BC3_SRGB_BLOCK
            | F::BC5_UNORM_BLOCK
            | F::BC5_SNORM_BLOCK
            | F::BC6H_UFLOAT_BLOCK
            | F::BC6H_SFLOAT_BLOCK
            | F::BC7_UNORM_BLOCK
            | F::BC7_SRGB_BLOCK => Self::compressed(16),
            _ => return None,
        };
        Some(block)
    }

    /// Bytes a tightly packed region of `extent` occupies.
    pub fn region_size(self, extent: vk::Extent3D) -> u64 {
        let columns = u64::from(extent.width.div_ceil(self.width));
        let rows = u64::from(extent.height.div_ceil(self.height));
        columns * rows * u64::from(extent.depth) * self.bytes
    }
}

/// Where one mip level's bytes live in the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipCopy {
    pub level: u32,
    pub offset: u64,
    pub size: u64,
}

/// Packing of non-empty mip payloads into one staging buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingLayout {
    pub total_size: u64,
    pub copies: Vec<MipCopy>,
}

impl StagingLayout {
    /// Pack mips back to back in level order, skipping empty ones.
    pub fn new(mips: &[&[u8]]) -> Self {
        let mut total_size = 0;
        let mut copies = Vec::with_capacity(mips.len());
        for (level, data) in mips.iter().enumerate() {
            if data.is_empty() {
                tracing::warn!(level, "Skipping zero-sized mip level");
                continue;
            }
            let size = data.len() as u64;
            copies.push(MipCopy {
                level: level as u32,
                offset: total_size,
                size,
            });
            total_size += size;
        }
        Self { total_size, copies }
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Check that every packed mip covers its whole level.
    ///
    /// A short payload would make the copy read past the staging buffer.
    /// Longer payloads are accepted; the copy reads only what the level needs.
    pub fn check_sizes(
        &self,
        format: vk::Format,
        extent_of: impl Fn(u32) -> vk::Extent3D,
    ) -> Result<()> {
        let block = TexelBlock::of(format).ok_or_else(|| {
            GpuError::InvalidResource(format!("no texel size known for {format:?}"))
        })?;
        for copy in &self.copies {
            let required = block.region_size(extent_of(copy.level));
            if copy.size < required {
                return Err(GpuError::InvalidResource(format!(
                    "mip {} holds {} bytes but the level needs {required}",
                    copy.level, copy.size
                )));
            }
        }
        Ok(())
    }

    /// Copy every packed mip into a host-visible buffer.
    pub fn write_into(&self, staging: &Buffer, mips: &[&[u8]]) -> Result<()> {
        for copy in &self.copies {
            staging.write_bytes(copy.offset, mips[copy.level as usize])?;
        }
        Ok(())
    }

    /// One buffer-to-image region per packed mip.
    pub fn copy_regions(&self, extent_of: impl Fn(u32) -> vk::Extent3D) -> Vec<vk::BufferImageCopy> {
        self.copies
            .iter()
            .map(|copy| vk::BufferImageCopy {
                buffer_offset: copy.offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: copy.level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: extent_of(copy.level),
            })
            .collect()
    }
}

/// Record the transfer of `mips` into `image`.
///
/// The image goes from undefined to transfer destination before the copies
/// and from transfer destination to shader read-only after them.
pub fn record_upload(
    cmd: &CommandBuffer,
    staging: &Buffer,
    image: &Image,
    regions: &[vk::BufferImageCopy],
) -> Result<()> {
    cmd.pipeline_barrier(
        vk::PipelineStageFlags::HOST,
        vk::PipelineStageFlags::TRANSFER,
        &[],
        &[ImageBarrier::layout(
            image.handle(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::HOST_WRITE,
            vk::AccessFlags::TRANSFER_WRITE,
        )],
    )?;
    cmd.copy_buffer_to_image(
        staging,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        regions,
    )?;
    cmd.pipeline_barrier(
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::FRAGMENT_SHADER,
        &[],
        &[ImageBarrier::layout(
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        )],
    )
}

/// Fill a freshly created image with per-mip data and block until the GPU
/// has finished the copy.
///
/// `cmd` must carry a completion fence; it is submitted without wait or
/// signal primitives and the host waits on that fence before returning.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn upload_image(
    raw: &Arc<RawDevice>,
    queue: &Queue,
    cmd: &CommandBuffer,
    image: &Image,
    mips: &[&[u8]],
) -> Result<()> {
    if mips.len() > image.mip_levels() as usize {
        return Err(GpuError::InvalidResource(format!(
            "{} mip payloads supplied for an image with {} levels",
            mips.len(),
            image.mip_levels()
        )));
    }
    let completion = cmd.completion().ok_or_else(|| {
        GpuError::InvalidState("upload command buffer has no completion primitive".into())
    })?;

    let layout = StagingLayout::new(mips);
    if layout.is_empty() {
        tracing::warn!("Every mip level is empty, image left uninitialized");
        return Ok(());
    }

    layout
        .check_sizes(image.format(), |level| image.mip_extent(level))
        .inspect_err(|err| tracing::error!(%err, "Rejected initial image data"))?;

    let staging = Buffer::new(raw, &BufferDesc::staging("upload_staging", layout.total_size))?;
    layout.write_into(&staging, mips)?;
    let regions = layout.copy_regions(|level| image.mip_extent(level));

    cmd.reset()?;
    cmd.record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, |cmd| {
        record_upload(cmd, &staging, image, &regions)
    })?;
    queue.submit(&[SubmitInfo::new(cmd)])?;
    wait_and_reset(raw, &[completion])?;

    tracing::debug!(
        levels = layout.copies.len(),
        bytes = layout.total_size,
        "Uploaded image data"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_mips_back_to_back() {
        let mip0 = vec![1u8; 64];
        let mip1 = vec![2u8; 16];
        let mip2 = vec![3u8; 4];
        let layout = StagingLayout::new(&[mip0.as_slice(), &mip1, &mip2]);

        assert_eq!(layout.total_size, 84);
        assert_eq!(
            layout.copies,
            vec![
                MipCopy { level: 0, offset: 0, size: 64 },
                MipCopy { level: 1, offset: 64, size: 16 },
                MipCopy { level: 2, offset: 80, size: 4 },
            ]
        );
    }

    #[test]
    fn empty_mip_does_not_shift_later_offsets() {
        let mip0 = vec![0u8; 64];
        let mip2 = vec![0u8; 4];
        let layout = StagingLayout::new(&[mip0.as_slice(), &[], &mip2]);

        assert_eq!(layout.total_size, 68);
        assert_eq!(layout.copies.len(), 2);
        assert_eq!(layout.copies[1], MipCopy { level: 2, offset: 64, size: 4 });
    }

    #[test]
    fn all_empty_is_empty() {
        let layout = StagingLayout::new(&[&[], &[]]);
        assert!(layout.is_empty());
        assert_eq!(layout.total_size, 0);
        assert!(StagingLayout::new(&[]).is_empty());
    }

    fn square(size: u32) -> impl Fn(u32) -> vk::Extent3D {
        move |level| vk::Extent3D {
            width: (size >> level).max(1),
            height: (size >> level).max(1),
            depth: 1,
        }
    }

    #[test]
    fn short_payload_is_rejected() {
        // 4x4 RGBA8 needs 64 bytes
        let mip0 = vec![0u8; 16];
        let layout = StagingLayout::new(&[mip0.as_slice()]);
        let err = layout
            .check_sizes(vk::Format::R8G8B8A8_UNORM, square(4))
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidResource(_)));
    }

    #[test]
    fn full_and_skipped_payloads_pass() {
        let mip0 = vec![0u8; 64];
        let mip2 = vec![0u8; 4];
        let layout = StagingLayout::new(&[mip0.as_slice(), &[], &mip2]);
        assert!(layout
            .check_sizes(vk::Format::R8G8B8A8_UNORM, square(4))
            .is_ok());
    }

    #[test]
    fn compressed_levels_round_up_to_blocks() {
        let block = TexelBlock::of(vk::Format::BC1_RGBA_UNORM_BLOCK).unwrap();
        // 6x6 covers 2x2 blocks of 8 bytes, a 1x1 level still needs a block
        assert_eq!(block.region_size(square(6)(0)), 32);
        assert_eq!(block.region_size(square(1)(0)), 8);

        let mip0 = vec![0u8; 24];
        let layout = StagingLayout::new(&[mip0.as_slice()]);
        assert!(layout
            .check_sizes(vk::Format::BC1_RGBA_UNORM_BLOCK, square(6))
            .is_err());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mip0 = vec![0u8; 64];
        let layout = StagingLayout::new(&[mip0.as_slice()]);
        assert!(layout
            .check_sizes(vk::Format::D24_UNORM_S8_UINT, square(4))
            .is_err());
    }

    #[test]
    fn regions_follow_levels() {
        let mip0 = vec![0u8; 16];
        let mip1 = vec![0u8; 4];
        let layout = StagingLayout::new(&[&[], mip0.as_slice(), &mip1]);
        let regions = layout.copy_regions(|level| vk::Extent3D {
            width: 4 >> level,
            height: 4 >> level,
            depth: 1,
        });

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].buffer_offset, 0);
        assert_eq!(regions[0].image_subresource.mip_level, 1);
        assert_eq!(regions[0].image_extent.width, 2);
        assert_eq!(regions[1].buffer_offset, 16);
        assert_eq!(regions[1].image_subresource.mip_level, 2);
        assert_eq!(regions[1].image_extent.width, 1);
    }
}
