//! Image views and samplers.

use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::memory::Image;
use ash::vk;
use std::sync::Arc;

/// Aspect implied by a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// A 2D view over every mip level of an image.
pub struct ImageView {
    raw: Arc<RawDevice>,
    view: vk::ImageView,
    format: vk::Format,
}

impl ImageView {
    pub fn new(image: &Image) -> Result<Self> {
        let raw = image.raw();
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.handle())
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(image.format())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_for_format(image.format()),
                base_mip_level: 0,
                level_count: image.mip_levels(),
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { raw.device.create_image_view(&view_info, None) }.map_err(|err| {
            tracing::error!(%err, "vkCreateImageView failed");
            GpuError::from(err)
        })?;
        Ok(Self {
            raw: Arc::clone(raw),
            view,
            format: image.format(),
        })
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_image_view(self.view, None);
        }
    }
}

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

pub struct Sampler {
    raw: Arc<RawDevice>,
    sampler: vk::Sampler,
}

impl Sampler {
    pub fn new(raw: &Arc<RawDevice>, desc: &SamplerDesc) -> Result<Self> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .min_lod(0.0)
            .max_lod(desc.max_lod);

        let sampler = unsafe { raw.device.create_sampler(&info, None) }.map_err(|err| {
            tracing::error!(%err, "vkCreateSampler failed");
            GpuError::from(err)
        })?;
        Ok(Self {
            raw: Arc::clone(raw),
            sampler,
        })
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_sampler(self.sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_follows_format() {
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert!(aspect_for_format(vk::Format::D24_UNORM_S8_UINT)
            .contains(vk::ImageAspectFlags::STENCIL));
    }
}
