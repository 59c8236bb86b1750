//! Descriptor bindings shared by the shader-driven passes.

use crate::error::Result;
use crate::graph::{PassDecl, ResourceId};
use crate::passes::ids;
use crate::resources::FrameResources;
use ash::vk;
use prism_gpu::{
    BufferBinding, DescriptorSet, DescriptorSetLayoutBuilder, DescriptorWrite, DeviceContext,
    ImageBinding,
};

/// Which binding slot each frame resource occupies in a pass's set.
///
/// Targets are bound as storage images in `GENERAL` layout. The set is
/// rewritten whenever targets are recreated or the TLAS is replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassBindings {
    pub camera: Option<u32>,
    pub tlas: Option<u32>,
    pub reads: Vec<(u32, ResourceId)>,
    pub writes: Vec<(u32, ResourceId)>,
    written: Option<(u64, u64)>,
}

impl PassBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn camera(mut self, binding: u32) -> Self {
        self.camera = Some(binding);
        self
    }

    pub fn tlas(mut self, binding: u32) -> Self {
        self.tlas = Some(binding);
        self
    }

    pub fn read(mut self, binding: u32, target: ResourceId) -> Self {
        self.reads.push((binding, target));
        self
    }

    pub fn write(mut self, binding: u32, target: ResourceId) -> Self {
        self.writes.push((binding, target));
        self
    }

    pub fn traces_rays(&self) -> bool {
        self.tlas.is_some()
    }

    pub fn written_targets(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.writes.iter().map(|&(_, id)| id)
    }

    /// Add the bound resources to a pass declaration.
    pub fn declare(&self, decl: PassDecl) -> PassDecl {
        let tlas = self.tlas.map(|_| ids::TLAS);
        decl.reads(tlas.into_iter().chain(self.reads.iter().map(|&(_, id)| id)))
            .writes(self.written_targets())
    }

    /// Set layout matching these bindings.
    pub fn layout(&self, stages: vk::ShaderStageFlags) -> DescriptorSetLayoutBuilder {
        let mut builder = DescriptorSetLayoutBuilder::new();
        if let Some(binding) = self.camera {
            builder = builder.uniform_buffer(binding, stages);
        }
        if let Some(binding) = self.tlas {
            builder = builder.acceleration_structure(binding, stages);
        }
        for &(binding, _) in self.reads.iter().chain(&self.writes) {
            builder = builder.storage_image(binding, stages);
        }
        builder
    }

    /// Rewrite `set` if resources changed since the last write.
    pub fn refresh(
        &mut self,
        device: &DeviceContext,
        set: DescriptorSet,
        resources: &FrameResources,
    ) -> Result<()> {
        let key = (resources.target_generation(), resources.tlas_generation());
        if self.written == Some(key) {
            return Ok(());
        }

        if let Some(binding) = self.camera {
            device.update_descriptor_set(
                &DescriptorWrite::new(set, binding, vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer(BufferBinding::whole(resources.camera_buffer())),
            )?;
        }
        if let (Some(binding), Some(tlas)) = (self.tlas, resources.tlas()) {
            device.update_descriptor_set(
                &DescriptorWrite::new(set, binding, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .acceleration_structure(tlas.structure()),
            )?;
        }
        for &(binding, id) in self.reads.iter().chain(&self.writes) {
            let target = resources.target(id)?;
            device.update_descriptor_set(
                &DescriptorWrite::new(set, binding, vk::DescriptorType::STORAGE_IMAGE).image(
                    ImageBinding {
                        view: &target.view,
                        sampler: None,
                        layout: vk::ImageLayout::GENERAL,
                    },
                ),
            )?;
        }

        self.written = Some(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ao_bindings() -> PassBindings {
        PassBindings::new()
            .camera(0)
            .tlas(1)
            .read(2, ids::GBUFFER)
            .write(3, ids::AO)
    }

    #[test]
    fn declaration_includes_tlas_and_targets() {
        let decl = ao_bindings().declare(PassDecl::new("ao"));
        assert_eq!(decl.reads, vec![ids::TLAS, ids::GBUFFER]);
        assert_eq!(decl.writes, vec![ids::AO]);
    }

    #[test]
    fn compute_bindings_do_not_read_tlas() {
        let bindings = PassBindings::new().read(0, ids::AO).write(1, ids::FILTERED);
        assert!(!bindings.traces_rays());
        let decl = bindings.declare(PassDecl::new("temporal"));
        assert_eq!(decl.reads, vec![ids::AO]);
    }

    #[test]
    fn layout_sizes_pool_per_type() {
        let sizes = ao_bindings()
            .layout(vk::ShaderStageFlags::RAYGEN_KHR)
            .pool_sizes(1);
        let count = |ty| {
            sizes
                .iter()
                .find(|s| s.ty == ty)
                .map_or(0, |s| s.descriptor_count)
        };
        assert_eq!(count(vk::DescriptorType::STORAGE_IMAGE), 2);
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), 1);
        assert_eq!(count(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), 1);
    }
}
