//! Camera and view management.

use glam::{Mat4, Vec3};

/// Camera for rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            aspect,
            ..Self::default()
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// Camera uniform buffer data for GPU.
///
/// Carries the previous frame's view-projection for temporal reprojection.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub inverse_view: [[f32; 4]; 4],
    pub inverse_projection: [[f32; 4]; 4],
    pub previous_view_projection: [[f32; 4]; 4],
    pub position: [f32; 4],
    pub direction: [f32; 4],
    /// x: frame index (wrapping), y: render width, z: render height.
    pub frame: [u32; 4],
}

impl CameraUniforms {
    /// Uniforms for this frame, reprojecting against `previous`.
    pub fn for_frame(
        camera: &Camera,
        previous: Option<&Camera>,
        frame_index: u64,
        width: u32,
        height: u32,
    ) -> Self {
        let mut uniforms = Self::from(camera);
        if let Some(previous) = previous {
            uniforms.previous_view_projection =
                previous.view_projection_matrix().to_cols_array_2d();
        }
        uniforms.frame = [frame_index as u32, width, height, 0];
        uniforms
    }
}

impl From<&Camera> for CameraUniforms {
    fn from(camera: &Camera) -> Self {
        let view = camera.view_matrix();
        let projection = camera.projection_matrix();
        Self {
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
            inverse_view: view.inverse().to_cols_array_2d(),
            inverse_projection: projection.inverse().to_cols_array_2d(),
            previous_view_projection: (projection * view).to_cols_array_2d(),
            position: [camera.position.x, camera.position.y, camera.position.z, 1.0],
            direction: [
                camera.direction.x,
                camera.direction.y,
                camera.direction.z,
                0.0,
            ],
            frame: [0; 4],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_view_undoes_view() {
        let camera = Camera::looking_at(Vec3::new(3.0, 2.0, 1.0), Vec3::ZERO, 1.5);
        let uniforms = CameraUniforms::from(&camera);
        let product =
            Mat4::from_cols_array_2d(&uniforms.view) * Mat4::from_cols_array_2d(&uniforms.inverse_view);
        assert!(product.abs_diff_eq(Mat4::IDENTITY, 1e-5));
    }

    #[test]
    fn first_frame_reprojects_onto_itself() {
        let camera = Camera::default();
        let uniforms = CameraUniforms::for_frame(&camera, None, 0, 640, 480);
        assert_eq!(
            uniforms.previous_view_projection,
            camera.view_projection_matrix().to_cols_array_2d()
        );
        assert_eq!(uniforms.frame, [0, 640, 480, 0]);
    }

    #[test]
    fn previous_camera_is_carried() {
        let previous = Camera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 1.0);
        let current = Camera::looking_at(Vec3::new(1.0, 0.0, 10.0), Vec3::ZERO, 1.0);
        let uniforms = CameraUniforms::for_frame(&current, Some(&previous), 7, 64, 64);
        assert_eq!(
            uniforms.previous_view_projection,
            previous.view_projection_matrix().to_cols_array_2d()
        );
        assert_eq!(uniforms.frame[0], 7);
    }

    #[test]
    fn uniforms_are_std140_sized() {
        assert_eq!(std::mem::size_of::<CameraUniforms>() % 16, 0);
    }
}
