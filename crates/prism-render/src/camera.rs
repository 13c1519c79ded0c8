//! Camera and view management.

use glam::{Mat4, Quat, Vec3};

/// Camera for rendering.
#[derive(Debug, Clone)]
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
        Self::new(
            Vec3::new(0.0, 1.0, 6.0),
            Vec3::ZERO,
            Vec3::Y,
            std::f32::consts::FRAC_PI_4,
            16.0 / 9.0,
            0.1,
            1000.0,
        )
    }
}

impl Camera {
    /// Create a new camera.
    pub fn new(
        position: Vec3,
        target: Vec3,
        up: Vec3,
        fov: f32,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Self {
        let direction = (target - position).normalize();
        Self {
            position,
            direction,
            up,
            fov,
            aspect,
            near,
            far,
        }
    }

    /// Set the camera position.
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    /// Set the aspect ratio.
    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn right(&self) -> Vec3 {
        self.direction.cross(self.up).normalize()
    }

    pub fn move_forward(&mut self, distance: f32) {
        self.position += self.direction * distance;
    }

    pub fn move_right(&mut self, distance: f32) {
        self.position += self.right() * distance;
    }

    /// Turn around the up axis. Positive angles turn right.
    pub fn yaw(&mut self, angle: f32) {
        self.direction = (Quat::from_axis_angle(self.up, -angle) * self.direction).normalize();
    }

    /// Tilt around the right axis. Positive angles look up. Stops short of
    /// the poles so the view basis never degenerates.
    pub fn pitch(&mut self, angle: f32) {
        let rotated = (Quat::from_axis_angle(self.right(), angle) * self.direction).normalize();
        if rotated.dot(self.up).abs() < 0.99 {
            self.direction = rotated;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Right-handed perspective with depth in `[0, 1]` and clip-space Y
    /// pointing down.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y = -projection.y_axis.y;
        projection
    }

    pub fn inverse_view_matrix(&self) -> Mat4 {
        self.view_matrix().inverse()
    }

    pub fn inverse_projection_matrix(&self) -> Mat4 {
        self.projection_matrix().inverse()
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// Per-frame pass constants, read by both render paths.
///
/// The raster shaders use `view_proj`; the ray-generation shader unprojects
/// launch coordinates with the two inverses. `light_position` drives both
/// shading models.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PassConstants {
    pub view_proj: [[f32; 4]; 4],
    pub view_inverse: [[f32; 4]; 4],
    pub proj_inverse: [[f32; 4]; 4],
    pub light_position: [f32; 4],
}

impl PassConstants {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(camera: &Camera, light_position: Vec3) -> Self {
        Self {
            view_proj: camera.view_projection_matrix().to_cols_array_2d(),
            view_inverse: camera.inverse_view_matrix().to_cols_array_2d(),
            proj_inverse: camera.inverse_projection_matrix().to_cols_array_2d(),
            light_position: light_position.extend(1.0).to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pass_constants_match_shader_block() {
        assert_eq!(PassConstants::SIZE, 3 * 64 + 16);
    }

    #[test]
    fn points_above_the_view_axis_land_in_the_upper_half() {
        let camera = Camera::default();
        let above = camera.position + camera.direction * 5.0 + Vec3::Y;
        let clip = camera.view_projection_matrix() * above.extend(1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn unprojected_center_ray_follows_view_direction() {
        let camera = Camera::default();
        let constants = PassConstants::new(&camera, Vec3::ZERO);
        let view_inverse = Mat4::from_cols_array_2d(&constants.view_inverse);
        let proj_inverse = Mat4::from_cols_array_2d(&constants.proj_inverse);

        let target = proj_inverse * glam::Vec4::new(0.0, 0.0, 1.0, 1.0);
        let direction = (view_inverse * target.truncate().normalize().extend(0.0)).truncate();
        assert_relative_eq!(direction.dot(camera.direction), 1.0, epsilon = 1e-4);

        let origin = view_inverse * glam::Vec4::W;
        assert_relative_eq!(origin.truncate().distance(camera.position), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn yaw_and_pitch_keep_direction_normalized() {
        let mut camera = Camera::default();
        for _ in 0..100 {
            camera.yaw(0.1);
            camera.pitch(0.05);
        }
        assert_relative_eq!(camera.direction.length(), 1.0, epsilon = 1e-4);
        assert!(camera.direction.dot(camera.up).abs() < 0.99);
    }

    #[test]
    fn move_right_is_perpendicular_to_view() {
        let mut camera = Camera::default();
        let start = camera.position;
        camera.move_right(2.0);
        let moved = camera.position - start;
        assert_relative_eq!(moved.length(), 2.0, epsilon = 1e-5);
        assert_relative_eq!(moved.dot(camera.direction), 0.0, epsilon = 1e-5);
    }
}
