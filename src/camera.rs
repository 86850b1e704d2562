// Camera for the ray generation shader
//
// The shader reconstructs primary rays from inverse matrices:
//   origin    = view_inverse * (0, 0, 0, 1)
//   direction = view_inverse * normalize(proj_inverse * (ndc.x, ndc.y, 1, 1))

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use crate::config::CameraConfig;

/// Push constant block, laid out like the shader's `Camera` uniform
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraPushConstants {
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
}

#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub z_near: f32,
    pub z_far: f32,
}

impl Camera {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            position: Vec3::from(config.position),
            target: Vec3::from(config.target),
            up: Vec3::Y,
            fov_y: config.fov_y_degrees.to_radians(),
            z_near: config.z_near,
            z_far: config.z_far,
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Right-handed perspective with Y flipped: launch row 0 is the top of the image
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov_y, aspect, self.z_near, self.z_far);
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn push_constants(&self, aspect: f32) -> CameraPushConstants {
        CameraPushConstants {
            view_inverse: self.view().inverse(),
            proj_inverse: self.projection(aspect).inverse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn primary_ray(constants: &CameraPushConstants, ndc_x: f32, ndc_y: f32) -> (Vec3, Vec3) {
        let origin = constants.view_inverse * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let target = constants.proj_inverse * Vec4::new(ndc_x, ndc_y, 1.0, 1.0);
        let local = (target.truncate() / target.w).normalize();
        let direction = constants.view_inverse * local.extend(0.0);
        (origin.truncate(), direction.truncate())
    }

    #[test]
    fn push_constants_are_two_matrices() {
        assert_eq!(std::mem::size_of::<CameraPushConstants>(), 128);
        assert_eq!(
            std::mem::size_of::<CameraPushConstants>() as u32,
            crate::backend::pipeline::PUSH_CONSTANT_SIZE
        );
    }

    #[test]
    fn centre_ray_points_at_target() {
        let camera = Camera::from_config(&CameraConfig::default());
        let constants = camera.push_constants(16.0 / 9.0);

        let (origin, direction) = primary_ray(&constants, 0.0, 0.0);
        assert!(origin.abs_diff_eq(camera.position, 1e-4));

        let expected = (camera.target - camera.position).normalize();
        assert!(direction.abs_diff_eq(expected, 1e-4));
    }

    #[test]
    fn top_row_looks_up() {
        let camera = Camera::from_config(&CameraConfig::default());
        let constants = camera.push_constants(1.0);

        // ndc y = -1 is the first launch row
        let (_, direction) = primary_ray(&constants, 0.0, -1.0);
        assert!(direction.y > 0.0);
    }

    #[test]
    fn fov_converts_to_radians() {
        let camera = Camera::from_config(&CameraConfig::default());
        assert!((camera.fov_y - std::f32::consts::FRAC_PI_3).abs() < 1e-6);
    }
}
