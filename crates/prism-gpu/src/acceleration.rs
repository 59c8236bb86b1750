//! Bottom- and top-level acceleration structures for hardware ray tracing.

use crate::command::CommandBuffer;
use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::memory::{Buffer, BufferDesc};
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

const INSTANCE_SIZE: usize = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();

/// An acceleration structure and its backing storage.
pub struct AccelerationStructure {
    raw: Arc<RawDevice>,
    handle: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
    build_scratch_size: u64,
    // Storage must outlive the structure
    _storage: Buffer,
}

impl AccelerationStructure {
    fn new(
        raw: &Arc<RawDevice>,
        ty: vk::AccelerationStructureTypeKHR,
        sizes: &vk::AccelerationStructureBuildSizesInfoKHR<'_>,
        name: &str,
    ) -> Result<Self> {
        let loaders = raw.ray_tracing()?;
        let storage = Buffer::new(
            raw,
            &BufferDesc {
                name,
                size: sizes.acceleration_structure_size,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::GpuOnly,
            },
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.handle())
            .offset(0)
            .size(sizes.acceleration_structure_size)
            .ty(ty);
        let handle = unsafe {
            loaders
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)
        }
        .map_err(|err| {
            tracing::error!(%err, name, "vkCreateAccelerationStructureKHR failed");
            GpuError::from(err)
        })?;

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let device_address = unsafe {
            loaders
                .acceleration_structure
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(Self {
            raw: Arc::clone(raw),
            handle,
            device_address,
            build_scratch_size: sizes.build_scratch_size,
            _storage: storage,
        })
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn build_scratch_size(&self) -> u64 {
        self.build_scratch_size
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        if let Ok(loaders) = self.raw.ray_tracing() {
            unsafe {
                loaders
                    .acceleration_structure
                    .destroy_acceleration_structure(self.handle, None);
            }
        }
    }
}

/// Indexed triangle geometry for a bottom-level build.
///
/// Vertices are `R32G32B32_SFLOAT` positions, indices are `u32`.
#[derive(Clone, Copy)]
pub struct TriangleGeometry<'a> {
    pub vertices: &'a Buffer,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub indices: &'a Buffer,
    pub triangle_count: u32,
    pub opaque: bool,
}

#[derive(Debug, Clone, Copy)]
struct GeometryRecord {
    vertex_address: vk::DeviceAddress,
    vertex_stride: u64,
    max_vertex: u32,
    index_address: vk::DeviceAddress,
    triangle_count: u32,
    flags: vk::GeometryFlagsKHR,
}

impl GeometryRecord {
    fn to_vk(self) -> vk::AccelerationStructureGeometryKHR<'static> {
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(self.flags)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.vertex_address,
                    })
                    .vertex_stride(self.vertex_stride)
                    .max_vertex(self.max_vertex)
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.index_address,
                    }),
            })
    }

    fn range(self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(self.triangle_count)
    }
}

/// Bottom-level acceleration structure over triangle meshes.
pub struct Blas {
    structure: AccelerationStructure,
    geometries: Vec<GeometryRecord>,
}

impl Blas {
    pub fn new(raw: &Arc<RawDevice>, geometries: &[TriangleGeometry<'_>]) -> Result<Self> {
        if geometries.is_empty() {
            return Err(GpuError::InvalidResource("BLAS without geometry".into()));
        }
        let loaders = raw.ray_tracing()?;
        let records: Vec<GeometryRecord> = geometries
            .iter()
            .map(|g| GeometryRecord {
                vertex_address: g.vertices.device_address(),
                vertex_stride: g.vertex_stride,
                max_vertex: g.vertex_count.saturating_sub(1),
                index_address: g.indices.device_address(),
                triangle_count: g.triangle_count,
                flags: if g.opaque {
                    vk::GeometryFlagsKHR::OPAQUE
                } else {
                    vk::GeometryFlagsKHR::empty()
                },
            })
            .collect();

        let vk_geometries: Vec<_> = records.iter().map(|r| r.to_vk()).collect();
        let counts: Vec<u32> = records.iter().map(|r| r.triangle_count).collect();
        let build_info = build_info(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, &vk_geometries);
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loaders.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &counts,
                &mut sizes,
            );
        }

        Ok(Self {
            structure: AccelerationStructure::new(
                raw,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                &sizes,
                "blas",
            )?,
            geometries: records,
        })
    }

    pub fn structure(&self) -> &AccelerationStructure {
        &self.structure
    }

    /// Record the build. `scratch` must hold at least `build_scratch_size` bytes.
    pub fn record_build(&self, cmd: &CommandBuffer, scratch: &Buffer) -> Result<()> {
        let geometries: Vec<_> = self.geometries.iter().map(|r| r.to_vk()).collect();
        let ranges: Vec<_> = self.geometries.iter().map(|r| r.range()).collect();
        record_build(
            cmd,
            &self.structure,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometries,
            &ranges,
            scratch,
        )
    }
}

/// One instance placed in a top-level structure.
#[derive(Debug, Clone, Copy)]
pub struct TlasInstance {
    pub blas_address: vk::DeviceAddress,
    pub transform: Mat4,
    pub custom_index: u32,
    pub mask: u8,
    pub hit_group_offset: u32,
}

impl TlasInstance {
    /// Reference a bottom-level structure. The BLAS is not owned.
    pub fn new(blas: &Blas, transform: Mat4) -> Self {
        Self {
            blas_address: blas.structure().device_address(),
            transform,
            custom_index: 0,
            mask: 0xFF,
            hit_group_offset: 0,
        }
    }

    fn to_vk(self) -> vk::AccelerationStructureInstanceKHR {
        vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR {
                matrix: transform_rows(&self.transform),
            },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.hit_group_offset,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}

/// Row-major 3x4 matrix from the upper three rows of an affine transform.
pub fn transform_rows(transform: &Mat4) -> [f32; 12] {
    let rows = [transform.row(0), transform.row(1), transform.row(2)];
    let mut out = [0.0; 12];
    for (i, row) in rows.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&row.to_array());
    }
    out
}

/// Top-level acceleration structure over BLAS instances.
pub struct Tlas {
    structure: AccelerationStructure,
    instance_buffer: Buffer,
    instance_count: u32,
}

impl Tlas {
    pub fn new(raw: &Arc<RawDevice>, instances: &[TlasInstance]) -> Result<Self> {
        if instances.is_empty() {
            return Err(GpuError::InvalidResource("TLAS without instances".into()));
        }
        let loaders = raw.ray_tracing()?;

        let instance_buffer = Buffer::new(
            raw,
            &BufferDesc {
                name: "tlas_instances",
                size: (instances.len() * INSTANCE_SIZE) as u64,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::CpuToGpu,
            },
        )?;
        for (i, instance) in instances.iter().enumerate() {
            let record = instance.to_vk();
            // The instance record is a plain repr(C) struct without padding
            let bytes = unsafe {
                std::slice::from_raw_parts(std::ptr::from_ref(&record).cast::<u8>(), INSTANCE_SIZE)
            };
            instance_buffer.write_bytes((i * INSTANCE_SIZE) as u64, bytes)?;
        }

        let instance_count = instances.len() as u32;
        let geometry = instances_geometry(instance_buffer.device_address());
        let build_info = build_info(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            std::slice::from_ref(&geometry),
        );
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loaders.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
                &mut sizes,
            );
        }

        Ok(Self {
            structure: AccelerationStructure::new(
                raw,
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                &sizes,
                "tlas",
            )?,
            instance_buffer,
            instance_count,
        })
    }

    pub fn structure(&self) -> &AccelerationStructure {
        &self.structure
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Record the build. Every referenced BLAS must be built earlier in
    /// submission order, with a barrier in between.
    pub fn record_build(&self, cmd: &CommandBuffer, scratch: &Buffer) -> Result<()> {
        let geometry = instances_geometry(self.instance_buffer.device_address());
        let range =
            vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(self.instance_count);
        record_build(
            cmd,
            &self.structure,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            std::slice::from_ref(&geometry),
            std::slice::from_ref(&range),
            scratch,
        )
    }
}

/// Create a device-local scratch buffer for acceleration structure builds.
pub fn create_scratch_buffer(raw: &Arc<RawDevice>, size: u64) -> Result<Buffer> {
    let alignment = u64::from(raw.adapter().ray_tracing.min_scratch_offset_alignment.max(1));
    Buffer::new(
        raw,
        &BufferDesc {
            name: "as_scratch",
            size: size.max(1).div_ceil(alignment) * alignment,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
        },
    )
}

impl CommandBuffer {
    /// Make finished acceleration structure builds visible to later builds
    /// and ray tracing shaders.
    pub fn acceleration_structure_barrier(&self) -> Result<()> {
        self.memory_barrier(
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        )
    }
}

fn instances_geometry(address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: address,
                }),
        })
}

fn build_info<'a>(
    ty: vk::AccelerationStructureTypeKHR,
    geometries: &'a [vk::AccelerationStructureGeometryKHR<'a>],
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
}

fn record_build(
    cmd: &CommandBuffer,
    structure: &AccelerationStructure,
    ty: vk::AccelerationStructureTypeKHR,
    geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
    ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    scratch: &Buffer,
) -> Result<()> {
    let handle = cmd.recording_handle()?;
    if scratch.size() < structure.build_scratch_size() {
        return Err(GpuError::InvalidResource(format!(
            "scratch buffer holds {} bytes, build needs {}",
            scratch.size(),
            structure.build_scratch_size()
        )));
    }
    let loaders = structure.raw.ray_tracing()?;
    let info = build_info(ty, geometries)
        .dst_acceleration_structure(structure.handle())
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch.device_address(),
        });
    unsafe {
        loaders
            .acceleration_structure
            .cmd_build_acceleration_structures(handle, &[info], &[ranges]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn instance_record_size() {
        assert_eq!(INSTANCE_SIZE, 64);
    }

    #[test]
    fn identity_transform_rows() {
        assert_eq!(
            transform_rows(&Mat4::IDENTITY),
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn translation_lands_in_last_column() {
        let rows = transform_rows(&Mat4::from_translation(Vec3::new(3.0, -2.0, 5.0)));
        assert_eq!(rows[3], 3.0);
        assert_eq!(rows[7], -2.0);
        assert_eq!(rows[11], 5.0);
    }
}
