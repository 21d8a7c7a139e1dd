//! Camera system

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Perspective projection shared by every camera variant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            fov_y: std::f32::consts::FRAC_PI_4, // 45 degrees
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        debug_assert!(aspect > 0.0, "projection aspect must be positive");
        debug_assert!(near > 0.0 && near < far, "invalid near/far planes");
        Self {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }
}

/// Unit view direction for a yaw/pitch pair. Positive pitch looks up.
pub fn direction_from_angles(yaw: f32, pitch: f32) -> Vec3 {
    Vec3::new(
        yaw.cos() * pitch.cos(),
        pitch.sin(),
        yaw.sin() * pitch.cos(),
    )
}

fn mirror_y(v: Vec3, height: f32) -> Vec3 {
    Vec3::new(v.x, v.y - 2.0 * (v.y - height), v.z)
}

/// Camera placed at its eye position, oriented by yaw and pitch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FirstPersonCamera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

/// Camera orbiting a target at a fixed distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThirdPersonCamera {
    pub target: Vec3,
    pub distance: f32,
    pub yaw: f32,
    pub pitch: f32,
}

impl ThirdPersonCamera {
    /// Eye sits behind the target along the view direction
    pub fn position(&self) -> Vec3 {
        self.target - direction_from_angles(self.yaw, self.pitch) * self.distance
    }
}

/// Camera looking from one point at another
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookAtCamera {
    pub position: Vec3,
    pub target: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraKind {
    FirstPerson(FirstPersonCamera),
    ThirdPerson(ThirdPersonCamera),
    LookAt(LookAtCamera),
}

/// The scene's active camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub kind: CameraKind,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO)
    }
}

impl Camera {
    pub fn first_person(position: Vec3, yaw: f32, pitch: f32) -> Self {
        Self {
            kind: CameraKind::FirstPerson(FirstPersonCamera {
                position,
                yaw,
                pitch,
            }),
            projection: Projection::default(),
        }
    }

    pub fn third_person(target: Vec3, distance: f32, yaw: f32, pitch: f32) -> Self {
        Self {
            kind: CameraKind::ThirdPerson(ThirdPersonCamera {
                target,
                distance,
                yaw,
                pitch,
            }),
            projection: Projection::default(),
        }
    }

    pub fn look_at(position: Vec3, target: Vec3) -> Self {
        Self {
            kind: CameraKind::LookAt(LookAtCamera { position, target }),
            projection: Projection::default(),
        }
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Eye position in world space
    pub fn position(&self) -> Vec3 {
        match &self.kind {
            CameraKind::FirstPerson(c) => c.position,
            CameraKind::ThirdPerson(c) => c.position(),
            CameraKind::LookAt(c) => c.position,
        }
    }

    /// Get the forward direction
    pub fn forward(&self) -> Vec3 {
        match &self.kind {
            CameraKind::FirstPerson(c) => direction_from_angles(c.yaw, c.pitch),
            CameraKind::ThirdPerson(c) => direction_from_angles(c.yaw, c.pitch),
            CameraKind::LookAt(c) => (c.target - c.position).normalize_or_zero(),
        }
    }

    /// Elevation of the view direction in radians
    pub fn pitch(&self) -> f32 {
        match &self.kind {
            CameraKind::FirstPerson(c) => c.pitch,
            CameraKind::ThirdPerson(c) => c.pitch,
            CameraKind::LookAt(_) => self.forward().y.clamp(-1.0, 1.0).asin(),
        }
    }

    /// Get the view matrix
    pub fn view_matrix(&self) -> Mat4 {
        let eye = self.position();
        Mat4::look_at_rh(eye, eye + self.forward(), Vec3::Y)
    }

    /// Get the projection matrix
    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }

    /// Get combined view-projection matrix
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// View matrix with the translation removed, for sky rendering
    pub fn rotation_only_view(&self) -> Mat4 {
        let mut view = self.view_matrix();
        view.w_axis = Vec4::W;
        view
    }

    /// Mirror image of this camera across the horizontal plane `y = height`.
    ///
    /// The eye's height becomes `y - 2 (y - height)` and the pitch is inverted.
    pub fn reflected_across(&self, height: f32) -> Self {
        let kind = match self.kind {
            CameraKind::FirstPerson(c) => CameraKind::FirstPerson(FirstPersonCamera {
                position: mirror_y(c.position, height),
                pitch: -c.pitch,
                ..c
            }),
            CameraKind::ThirdPerson(c) => CameraKind::ThirdPerson(ThirdPersonCamera {
                target: mirror_y(c.target, height),
                pitch: -c.pitch,
                ..c
            }),
            CameraKind::LookAt(c) => CameraKind::LookAt(LookAtCamera {
                position: mirror_y(c.position, height),
                target: mirror_y(c.target, height),
            }),
        };
        Self {
            kind,
            projection: self.projection,
        }
    }

    /// Update aspect ratio for perspective projection
    pub fn set_aspect(&mut self, width: f32, height: f32) {
        debug_assert!(height > 0.0, "zero projection height");
        self.projection.set_aspect(width / height);
    }

    /// Build camera uniform data for shaders
    pub fn uniform_data(&self) -> CameraUniformData {
        let view = self.view_matrix();
        let proj = self.projection_matrix();
        CameraUniformData {
            view,
            proj,
            view_proj: proj * view,
            position: self.position().extend(1.0),
        }
    }
}

/// Camera uniform data for GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniformData {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub position: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflection_mirrors_height_and_inverts_pitch() {
        let camera = Camera::first_person(Vec3::new(3.0, 20.0, -4.0), 0.7, -0.3);
        let reflected = camera.reflected_across(10.0);

        assert_eq!(reflected.position(), Vec3::new(3.0, 0.0, -4.0));
        assert_eq!(reflected.pitch(), 0.3);
        // Original is untouched
        assert_eq!(camera.position().y, 20.0);
    }

    #[test]
    fn test_third_person_reflection_mirrors_eye() {
        let camera = Camera::third_person(Vec3::new(0.0, 12.0, 0.0), 8.0, 0.0, -0.5);
        let eye = camera.position();
        let reflected = camera.reflected_across(10.0);
        let mirrored = reflected.position();
        assert!((mirrored.y - (eye.y - 2.0 * (eye.y - 10.0))).abs() < 1e-4);
        assert_eq!(reflected.pitch(), 0.5);
    }

    #[test]
    fn test_look_at_pitch_inverts_under_reflection() {
        let camera = Camera::look_at(Vec3::new(0.0, 20.0, 10.0), Vec3::new(0.0, 10.0, 0.0));
        let reflected = camera.reflected_across(10.0);
        assert!((camera.pitch() + reflected.pitch()).abs() < 1e-5);
        assert!(camera.pitch() < 0.0);
    }

    #[test]
    fn test_rotation_only_view_drops_translation() {
        let camera = Camera::first_person(Vec3::new(5.0, 5.0, 5.0), 0.0, 0.0);
        let view = camera.rotation_only_view();
        assert_eq!(view.w_axis, Vec4::W);
    }
}
