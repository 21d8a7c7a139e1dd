//! Camera controllers
//!
//! Controllers only read camera-relevant input; the window owns polling.
//! - FreeFly drives a first-person camera: WASD movement, mouse look, scroll speed
//! - Orbit drives a third-person camera around its target

use glam::{Vec2, Vec3};

use super::camera::{direction_from_angles, Camera, CameraKind};

/// Input state for camera controllers
#[derive(Debug, Clone, Default)]
pub struct CameraInput {
    /// Movement keys (WASD, QE for up/down)
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,

    /// Sprint modifier (shift)
    pub sprint: bool,

    /// Mouse delta since last frame (in pixels)
    pub mouse_delta: Vec2,

    /// Mouse scroll delta (positive = scroll up)
    pub scroll_delta: f32,

    /// Whether mouse look is active (e.g., right mouse button held)
    pub mouse_look_active: bool,
}

impl CameraInput {
    fn movement(&self, forward: Vec3, right: Vec3) -> Vec3 {
        let mut velocity = Vec3::ZERO;
        if self.forward {
            velocity += forward;
        }
        if self.backward {
            velocity -= forward;
        }
        if self.right {
            velocity += right;
        }
        if self.left {
            velocity -= right;
        }
        if self.up {
            velocity += Vec3::Y;
        }
        if self.down {
            velocity -= Vec3::Y;
        }
        velocity.normalize_or_zero()
    }
}

/// Abstract camera controller trait
pub trait CameraController {
    /// Update the camera based on input and delta time.
    ///
    /// Cameras of a variant the controller does not drive are left unchanged.
    fn update(&mut self, camera: &mut Camera, input: &CameraInput, dt: f32);

    /// Get the controller name for debugging
    fn name(&self) -> &'static str;
}

const MAX_PITCH: f32 = std::f32::consts::FRAC_PI_2 - 0.01;

/// Free-fly controller for first-person cameras
pub struct FreeFlyController {
    /// Base movement speed in units per second
    pub move_speed: f32,
    pub min_speed: f32,
    pub max_speed: f32,
    /// Mouse sensitivity (radians per pixel)
    pub mouse_sensitivity: f32,
    pub sprint_multiplier: f32,
    /// Speed change per scroll unit
    pub scroll_speed_factor: f32,
}

impl Default for FreeFlyController {
    fn default() -> Self {
        Self {
            move_speed: 5.0,
            min_speed: 0.5,
            max_speed: 50.0,
            mouse_sensitivity: 0.003,
            sprint_multiplier: 2.0,
            scroll_speed_factor: 1.2,
        }
    }
}

impl FreeFlyController {
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.move_speed = speed;
        self
    }
}

impl CameraController for FreeFlyController {
    fn update(&mut self, camera: &mut Camera, input: &CameraInput, dt: f32) {
        let CameraKind::FirstPerson(fp) = &mut camera.kind else {
            return;
        };

        if input.scroll_delta > 0.0 {
            self.move_speed *= self.scroll_speed_factor;
        } else if input.scroll_delta < 0.0 {
            self.move_speed /= self.scroll_speed_factor;
        }
        self.move_speed = self.move_speed.clamp(self.min_speed, self.max_speed);

        if input.mouse_look_active && input.mouse_delta != Vec2::ZERO {
            fp.yaw = (fp.yaw + input.mouse_delta.x * self.mouse_sensitivity)
                % std::f32::consts::TAU;
            // Screen y grows downwards
            fp.pitch = (fp.pitch - input.mouse_delta.y * self.mouse_sensitivity)
                .clamp(-MAX_PITCH, MAX_PITCH);
        }

        let forward = direction_from_angles(fp.yaw, fp.pitch);
        let right = Vec3::new(-fp.yaw.sin(), 0.0, fp.yaw.cos());
        let speed = if input.sprint {
            self.move_speed * self.sprint_multiplier
        } else {
            self.move_speed
        };
        fp.position += input.movement(forward, right) * speed * dt;
    }

    fn name(&self) -> &'static str {
        "FreeFly"
    }
}

/// Orbit controller for third-person cameras.
///
/// Mouse drag orbits, scroll zooms, WASD pans the target on the XZ plane.
pub struct OrbitController {
    pub min_distance: f32,
    pub max_distance: f32,
    pub min_pitch: f32,
    pub max_pitch: f32,
    /// Orbit sensitivity (radians per pixel)
    pub orbit_sensitivity: f32,
    /// Zoom factor per scroll unit
    pub zoom_factor: f32,
    pub pan_speed: f32,
}

impl Default for OrbitController {
    fn default() -> Self {
        Self {
            min_distance: 1.0,
            max_distance: 100.0,
            min_pitch: -MAX_PITCH,
            max_pitch: -0.05,
            orbit_sensitivity: 0.005,
            zoom_factor: 1.1,
            pan_speed: 5.0,
        }
    }
}

impl CameraController for OrbitController {
    fn update(&mut self, camera: &mut Camera, input: &CameraInput, dt: f32) {
        let CameraKind::ThirdPerson(tp) = &mut camera.kind else {
            return;
        };

        if input.scroll_delta > 0.0 {
            tp.distance /= self.zoom_factor;
        } else if input.scroll_delta < 0.0 {
            tp.distance *= self.zoom_factor;
        }
        tp.distance = tp.distance.clamp(self.min_distance, self.max_distance);

        if input.mouse_look_active && input.mouse_delta != Vec2::ZERO {
            tp.yaw = (tp.yaw + input.mouse_delta.x * self.orbit_sensitivity)
                % std::f32::consts::TAU;
            tp.pitch = (tp.pitch - input.mouse_delta.y * self.orbit_sensitivity)
                .clamp(self.min_pitch, self.max_pitch);
        }

        let forward = Vec3::new(tp.yaw.cos(), 0.0, tp.yaw.sin());
        let right = Vec3::new(-tp.yaw.sin(), 0.0, tp.yaw.cos());
        let speed = if input.sprint {
            self.pan_speed * 2.0
        } else {
            self.pan_speed
        };
        tp.target += input.movement(forward, right) * speed * dt;
    }

    fn name(&self) -> &'static str {
        "Orbit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_fly_moves_forward() {
        let mut camera = Camera::first_person(Vec3::ZERO, 0.0, 0.0);
        let mut controller = FreeFlyController::default();
        let input = CameraInput {
            forward: true,
            ..Default::default()
        };
        controller.update(&mut camera, &input, 1.0);
        assert!((camera.position() - Vec3::new(5.0, 0.0, 0.0)).length() < 1e-4);
    }

    #[test]
    fn test_free_fly_clamps_pitch() {
        let mut camera = Camera::first_person(Vec3::ZERO, 0.0, 0.0);
        let mut controller = FreeFlyController::default();
        let input = CameraInput {
            mouse_look_active: true,
            mouse_delta: Vec2::new(0.0, -100_000.0),
            ..Default::default()
        };
        controller.update(&mut camera, &input, 0.016);
        assert!(camera.pitch() <= MAX_PITCH);
    }

    #[test]
    fn test_orbit_zoom_respects_limits() {
        let mut camera = Camera::third_person(Vec3::ZERO, 1.05, 0.0, -0.3);
        let mut controller = OrbitController::default();
        let input = CameraInput {
            scroll_delta: 1.0,
            ..Default::default()
        };
        controller.update(&mut camera, &input, 0.016);
        match camera.kind {
            CameraKind::ThirdPerson(tp) => assert_eq!(tp.distance, 1.0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_controller_ignores_other_camera_kinds() {
        let mut camera = Camera::look_at(Vec3::ONE, Vec3::ZERO);
        let before = camera;
        let input = CameraInput {
            forward: true,
            ..Default::default()
        };
        FreeFlyController::default().update(&mut camera, &input, 1.0);
        OrbitController::default().update(&mut camera, &input, 1.0);
        assert_eq!(camera, before);
    }
}
