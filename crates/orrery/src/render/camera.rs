use super::SIMULATION_SCALE;
use derive_builder::Builder;
use glam::{DQuat, DVec3, Mat4, Quat, Vec3};

/// The point of view a frame is rendered from. The position is in simulation space (meters).
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct Camera {
    #[builder(default)]
    pub position: DVec3,
    #[builder(default = "DQuat::IDENTITY")]
    pub rotation: DQuat,
    /// Vertical field of view.
    #[builder(default = "60.0")]
    pub fov_degrees: f32,
    #[builder(default = "0.01")]
    pub near: f32,
    #[builder(default = "1e8")]
    pub far: f32,
}

impl Camera {
    pub fn builder() -> CameraBuilder {
        CameraBuilder::default()
    }

    /// View matrix in render space, relative to `render_origin`.
    pub fn view_matrix(&self, render_origin: DVec3) -> Mat4 {
        let eye = ((self.position - render_origin) / SIMULATION_SCALE).as_vec3();
        let rotation = Quat::from_xyzw(
            self.rotation.x as f32,
            self.rotation.y as f32,
            self.rotation.z as f32,
            self.rotation.w as f32,
        );
        Mat4::from_rotation_translation(rotation, eye).inverse()
    }

    /// Reverse-Z perspective projection with the Y axis flipped for the API's clip space.
    pub fn projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        let mut projection = Mat4::perspective_rh(
            self.fov_degrees.to_radians(),
            aspect_ratio,
            self.far,
            self.near,
        );
        projection.y_axis.y *= -1.0;
        projection
    }

    /// Camera position relative to `render_origin`, in render units.
    pub fn render_position(&self, render_origin: DVec3) -> Vec3 {
        ((self.position - render_origin) / SIMULATION_SCALE).as_vec3()
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
            fov_degrees: 60.0,
            near: 0.01,
            far: 1e8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    pub fn projection_flips_y_and_reverses_depth() {
        let camera = Camera::default();
        let projection = camera.projection_matrix(1.0);
        assert!(projection.y_axis.y < 0.0);

        // Near plane maps to depth 1, far plane to depth 0
        let near = projection * Vec4::new(0.0, 0.0, -camera.near, 1.0);
        let far = projection * Vec4::new(0.0, 0.0, -camera.far, 1.0);
        assert!((near.z / near.w - 1.0).abs() < 1e-4);
        assert!((far.z / far.w).abs() < 1e-4);
    }

    #[test]
    pub fn view_is_relative_to_the_render_origin() {
        let camera = Camera::builder()
            .position(DVec3::new(5e6, 0.0, 0.0))
            .build()
            .unwrap();
        let view = camera.view_matrix(DVec3::new(4e6, 0.0, 0.0));
        let origin = view.transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!(origin.length() < 1e-5);
    }
}
