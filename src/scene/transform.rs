//! Transform component

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};

/// Transform component for positioning objects in 3D space
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn from_position_scale(position: Vec3, scale: Vec3) -> Self {
        Self {
            position,
            scale,
            ..Default::default()
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Get the model matrix for this transform
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Get the normal matrix (inverse transpose of model matrix)
    pub fn normal_matrix(&self) -> Mat4 {
        self.matrix().inverse().transpose()
    }

    /// Radius of a unit-sized mesh after scaling, used for frustum tests
    pub fn bounding_radius(&self) -> f32 {
        self.scale.abs().max_element() * 0.87
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_applies_scale_then_translation() {
        let t = Transform::from_position_scale(Vec3::new(1.0, 2.0, 3.0), Vec3::splat(2.0));
        assert_eq!(t.matrix().transform_point3(Vec3::X), Vec3::new(3.0, 2.0, 3.0));
    }

    #[test]
    fn test_normal_matrix_of_uniform_scale_keeps_direction() {
        let t = Transform::from_position_scale(Vec3::ZERO, Vec3::splat(4.0))
            .with_rotation(Quat::from_rotation_y(1.0));
        let n = t.normal_matrix().transform_vector3(Vec3::Y).normalize();
        assert!((n - Vec3::Y).length() < 1e-5);
    }
}
