//! Descriptor set layouts, allocators and updates.

use crate::acceleration::AccelerationStructure;
use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::memory::Buffer;
use crate::views::{ImageView, Sampler};
use ash::vk;
use std::sync::Arc;

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    flags: Vec<vk::DescriptorBindingFlags>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self.flags.push(vk::DescriptorBindingFlags::empty());
        self
    }

    /// Add a partially bound array binding whose unused elements may be
    /// updated while the set is pending.
    pub fn bindless(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        max_count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self = self.binding(binding, descriptor_type, max_count, stage_flags);
        if let Some(flags) = self.flags.last_mut() {
            *flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
        }
        self
    }

    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    pub fn acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            stage_flags,
        )
    }

    /// Pool sizes needed to allocate `sets` sets of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.descriptor_count * sets;
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(binding.descriptor_type)
                        .descriptor_count(count),
                ),
            }
        }
        sizes
    }

    /// Build the descriptor set layout.
    pub fn build(&self, raw: &Arc<RawDevice>) -> Result<DescriptorSetLayout> {
        let needs_flags = self.flags.iter().any(|f| !f.is_empty());
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&self.flags);
        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        if needs_flags {
            layout_info = layout_info.push_next(&mut flags_info);
        }

        let layout = unsafe { raw.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|err| {
                tracing::error!(%err, "vkCreateDescriptorSetLayout failed");
                GpuError::from(err)
            })?;
        Ok(DescriptorSetLayout {
            raw: Arc::clone(raw),
            layout,
        })
    }
}

/// An owned descriptor set layout.
pub struct DescriptorSetLayout {
    raw: Arc<RawDevice>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Native handle accessor.
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// A descriptor set. Owned by the allocator it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet(vk::DescriptorSet);

impl DescriptorSet {
    /// Native handle accessor.
    pub fn handle(self) -> vk::DescriptorSet {
        self.0
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorAllocator {
    raw: Arc<RawDevice>,
    pool: vk::DescriptorPool,
}

impl DescriptorAllocator {
    /// Create a new descriptor pool.
    pub fn new(
        raw: &Arc<RawDevice>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = unsafe { raw.device.create_descriptor_pool(&create_info, None) }.map_err(
            |err| {
                tracing::error!(%err, "vkCreateDescriptorPool failed");
                GpuError::from(err)
            },
        )?;
        Ok(Self {
            raw: Arc::clone(raw),
            pool,
        })
    }

    /// Allocate one set of the given layout.
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> Result<DescriptorSet> {
        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.raw.device.allocate_descriptor_sets(&alloc_info) }.map_err(
            |err| {
                tracing::error!(%err, "vkAllocateDescriptorSets failed");
                GpuError::from(err)
            },
        )?;
        sets.into_iter()
            .next()
            .map(DescriptorSet)
            .ok_or_else(|| GpuError::InvalidState("driver returned no descriptor set".into()))
    }

    /// Reset the pool, freeing all descriptor sets.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.raw
                .device
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
        }?;
        Ok(())
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        unsafe {
            self.raw.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// A buffer range referenced by a descriptor.
#[derive(Clone, Copy)]
pub struct BufferBinding<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
    pub range: u64,
}

impl<'a> BufferBinding<'a> {
    pub fn whole(buffer: &'a Buffer) -> Self {
        Self {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }
}

/// An image view (and optional sampler) referenced by a descriptor.
#[derive(Clone, Copy)]
pub struct ImageBinding<'a> {
    pub view: &'a ImageView,
    pub sampler: Option<&'a Sampler>,
    pub layout: vk::ImageLayout,
}

/// A write into one binding of a descriptor set.
///
/// Resources are borrowed for the duration of the update only.
pub struct DescriptorWrite<'a> {
    pub set: DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffers: Vec<BufferBinding<'a>>,
    pub images: Vec<ImageBinding<'a>>,
    pub acceleration_structures: Vec<&'a AccelerationStructure>,
}

impl<'a> DescriptorWrite<'a> {
    pub fn new(set: DescriptorSet, binding: u32, descriptor_type: vk::DescriptorType) -> Self {
        Self {
            set,
            binding,
            array_element: 0,
            descriptor_type,
            buffers: Vec::new(),
            images: Vec::new(),
            acceleration_structures: Vec::new(),
        }
    }

    pub fn array_element(mut self, element: u32) -> Self {
        self.array_element = element;
        self
    }

    pub fn buffer(mut self, binding: BufferBinding<'a>) -> Self {
        self.buffers.push(binding);
        self
    }

    pub fn image(mut self, binding: ImageBinding<'a>) -> Self {
        self.images.push(binding);
        self
    }

    pub fn acceleration_structure(mut self, structure: &'a AccelerationStructure) -> Self {
        self.acceleration_structures.push(structure);
        self
    }

    /// Number of descriptors written.
    pub fn descriptor_count(&self) -> u32 {
        descriptor_count(
            self.buffers.len(),
            self.images.len(),
            self.acceleration_structures.len(),
        )
    }
}

/// The largest of the three resource list lengths.
pub fn descriptor_count(buffers: usize, images: usize, acceleration_structures: usize) -> u32 {
    buffers.max(images).max(acceleration_structures) as u32
}

/// Write resources into a descriptor set binding.
pub fn update_descriptor_set(raw: &RawDevice, write: &DescriptorWrite<'_>) {
    let count = write.descriptor_count();
    if count == 0 {
        tracing::warn!(binding = write.binding, "Descriptor write with no resources ignored");
        return;
    }

    let buffer_infos: Vec<vk::DescriptorBufferInfo> = write
        .buffers
        .iter()
        .map(|b| {
            vk::DescriptorBufferInfo::default()
                .buffer(b.buffer.handle())
                .offset(b.offset)
                .range(b.range)
        })
        .collect();
    let image_infos: Vec<vk::DescriptorImageInfo> = write
        .images
        .iter()
        .map(|i| {
            vk::DescriptorImageInfo::default()
                .image_view(i.view.handle())
                .sampler(i.sampler.map_or(vk::Sampler::null(), Sampler::handle))
                .image_layout(i.layout)
        })
        .collect();
    let structures: Vec<vk::AccelerationStructureKHR> = write
        .acceleration_structures
        .iter()
        .map(|s| s.handle())
        .collect();

    let mut as_info =
        vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&structures);
    let mut vk_write = vk::WriteDescriptorSet::default()
        .dst_set(write.set.handle())
        .dst_binding(write.binding)
        .dst_array_element(write.array_element)
        .descriptor_type(write.descriptor_type);
    if !buffer_infos.is_empty() {
        vk_write = vk_write.buffer_info(&buffer_infos);
    }
    if !image_infos.is_empty() {
        vk_write = vk_write.image_info(&image_infos);
    }
    if !structures.is_empty() {
        vk_write = vk_write.push_next(&mut as_info);
    }
    vk_write = vk_write.descriptor_count(count);

    unsafe {
        raw.device.update_descriptor_sets(&[vk_write], &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_longest_list() {
        assert_eq!(descriptor_count(0, 0, 0), 0);
        assert_eq!(descriptor_count(3, 1, 0), 3);
        assert_eq!(descriptor_count(0, 2, 5), 5);
    }

    #[test]
    fn pool_sizes_merge_types() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::RAYGEN_KHR)
            .storage_image(1, vk::ShaderStageFlags::RAYGEN_KHR)
            .acceleration_structure(2, vk::ShaderStageFlags::RAYGEN_KHR)
            .bindless(3, vk::DescriptorType::SAMPLED_IMAGE, 64, vk::ShaderStageFlags::ALL);
        let sizes = builder.pool_sizes(2);
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(sizes[0].descriptor_count, 4);
        assert_eq!(sizes[1].descriptor_count, 2);
        assert_eq!(sizes[2].descriptor_count, 128);
    }

    #[test]
    fn bindless_sets_binding_flags() {
        let builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .bindless(1, vk::DescriptorType::SAMPLED_IMAGE, 16, vk::ShaderStageFlags::COMPUTE);
        assert!(builder.flags[0].is_empty());
        assert!(builder.flags[1].contains(vk::DescriptorBindingFlags::PARTIALLY_BOUND));
        assert!(builder.flags[1]
            .contains(vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING));
    }
}
