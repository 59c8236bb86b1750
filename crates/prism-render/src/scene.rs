//! Per-frame scene input.
//!
//! The scene is owned by the caller; the renderer only reads it while
//! recording a frame.

use crate::camera::Camera;
use ash::vk;
use glam::Mat4;
use prism_gpu::{Buffer, BufferDesc, DeviceContext, MemoryLocation, Result, TriangleGeometry};

/// Usage of geometry buffers read by acceleration-structure builds.
pub const GEOMETRY_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
);

/// Indexed triangle mesh with `[f32; 3]` positions.
pub struct Mesh {
    pub vertices: Buffer,
    pub indices: Buffer,
    pub vertex_count: u32,
    pub triangle_count: u32,
    pub opaque: bool,
}

impl Mesh {
    pub const VERTEX_STRIDE: u64 = std::mem::size_of::<[f32; 3]>() as u64;

    /// Create a mesh in host-visible memory.
    pub fn new(
        device: &DeviceContext,
        name: &str,
        positions: &[[f32; 3]],
        indices: &[u32],
    ) -> Result<Self> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(positions);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);

        let vertices = device.create_buffer(&BufferDesc {
            name,
            size: vertex_bytes.len() as u64,
            usage: GEOMETRY_BUFFER_USAGE,
            location: MemoryLocation::CpuToGpu,
        })?;
        vertices.write_bytes(0, vertex_bytes)?;

        let indices_buffer = device.create_buffer(&BufferDesc {
            name,
            size: index_bytes.len() as u64,
            usage: GEOMETRY_BUFFER_USAGE,
            location: MemoryLocation::CpuToGpu,
        })?;
        indices_buffer.write_bytes(0, index_bytes)?;

        Ok(Self {
            vertices,
            indices: indices_buffer,
            vertex_count: positions.len() as u32,
            triangle_count: (indices.len() / 3) as u32,
            opaque: true,
        })
    }

    pub fn geometry(&self) -> TriangleGeometry<'_> {
        TriangleGeometry {
            vertices: &self.vertices,
            vertex_stride: Self::VERTEX_STRIDE,
            vertex_count: self.vertex_count,
            indices: &self.indices,
            triangle_count: self.triangle_count,
            opaque: self.opaque,
        }
    }
}

/// One placement of a mesh in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshInstance {
    /// Index into [`FrameState::meshes`].
    pub mesh: usize,
    pub transform: Mat4,
    pub custom_index: u32,
}

impl MeshInstance {
    pub fn new(mesh: usize, transform: Mat4) -> Self {
        Self {
            mesh,
            transform,
            custom_index: 0,
        }
    }
}

/// Scene state for one frame.
pub struct FrameState<'a> {
    /// Bumped by the caller whenever meshes or instances change.
    pub revision: u64,
    pub meshes: &'a [Mesh],
    pub instances: &'a [MeshInstance],
    pub camera: Camera,
    pub frame_index: u64,
}

impl FrameState<'_> {
    /// Whether geometry is newer than the last acceleration-structure build.
    pub fn geometry_changed(&self, built: Option<u64>) -> bool {
        built.map_or(true, |built| self.revision > built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(revision: u64) -> FrameState<'static> {
        FrameState {
            revision,
            meshes: &[],
            instances: &[],
            camera: Camera::default(),
            frame_index: 0,
        }
    }

    #[test]
    fn first_frame_always_builds() {
        assert!(state(0).geometry_changed(None));
    }

    #[test]
    fn rebuild_only_on_newer_revision() {
        assert!(!state(3).geometry_changed(Some(3)));
        assert!(state(4).geometry_changed(Some(3)));
    }
}
