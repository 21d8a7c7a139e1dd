//! Scene management
//!
//! A [`Scene`] is the per-level state a render pass reads: the active camera,
//! the lights, the base clip plane and the entity registry. It holds no GPU
//! resources. Passes that need a different camera or clip plane work on a
//! [`FrameView`] copy instead of changing the scene.

mod camera;
mod camera_controller;
mod components;
mod light;
mod transform;

pub use camera::*;
pub use camera_controller::*;
pub use components::*;
pub use light::*;
pub use transform::*;

use bevy_ecs::prelude::*;
use glam::{Vec3, Vec4};

/// Plane equation `(n, d)`; a point `p` is kept when `dot(n, p) + d >= 0`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipPlane(pub Vec4);

impl ClipPlane {
    /// Sentinel far below any scene geometry, so nothing is clipped
    pub const DISABLED: ClipPlane = ClipPlane(Vec4::new(0.0, -1.0, 0.0, 100_000.0));

    /// Keeps everything above `y = height`
    pub fn above(height: f32) -> Self {
        ClipPlane(Vec4::new(0.0, 1.0, 0.0, -height))
    }

    /// Keeps everything below `y = height`
    pub fn below(height: f32) -> Self {
        ClipPlane(Vec4::new(0.0, -1.0, 0.0, height))
    }

    pub fn is_disabled(&self) -> bool {
        *self == Self::DISABLED
    }

    pub fn keeps(&self, point: Vec3) -> bool {
        self.0.dot(point.extend(1.0)) >= 0.0
    }

    pub fn as_vec4(&self) -> Vec4 {
        self.0
    }
}

impl Default for ClipPlane {
    fn default() -> Self {
        Self::DISABLED
    }
}

/// Camera and clip plane a pass renders with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameView {
    pub camera: Camera,
    pub clip_plane: ClipPlane,
}

impl FrameView {
    pub fn new(camera: Camera, clip_plane: ClipPlane) -> Self {
        Self { camera, clip_plane }
    }

    pub fn with_camera(self, camera: Camera) -> Self {
        Self { camera, ..self }
    }

    pub fn with_clip_plane(self, clip_plane: ClipPlane) -> Self {
        Self { clip_plane, ..self }
    }
}

/// The scene containing all renderable content
pub struct Scene {
    pub registry: World,
    pub camera: Camera,
    pub ambient: Vec3,
    pub directional: Option<DirectionalLight>,
    pub point_lights: Vec<PointLight>,
    pub clip_plane: ClipPlane,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            registry: World::new(),
            camera: Camera::default(),
            ambient: Vec3::splat(0.1),
            directional: None,
            point_lights: Vec::new(),
            clip_plane: ClipPlane::DISABLED,
        }
    }

    pub fn with_camera(mut self, camera: Camera) -> Self {
        self.camera = camera;
        self
    }

    /// Spawn an entity with the given components
    pub fn spawn(&mut self, bundle: impl Bundle) -> Entity {
        self.registry.spawn(bundle).id()
    }

    pub fn has<C: Component>(&self, entity: Entity) -> bool {
        self.registry.get::<C>(entity).is_some()
    }

    /// Add a point light, returning its index
    pub fn add_point_light(&mut self, light: PointLight) -> usize {
        self.point_lights.push(light);
        self.point_lights.len() - 1
    }

    pub fn set_directional_light(&mut self, light: DirectionalLight) {
        self.directional = Some(light);
    }

    pub fn clear_directional_light(&mut self) {
        self.directional = None;
    }

    /// The base view every frame starts from
    pub fn frame_view(&self) -> FrameView {
        FrameView::new(self.camera, self.clip_plane)
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_planes_split_at_height() {
        let above = ClipPlane::above(10.0);
        let below = ClipPlane::below(10.0);
        let high = Vec3::new(0.0, 12.0, 0.0);
        let low = Vec3::new(0.0, 8.0, 0.0);

        assert!(above.keeps(high) && !above.keeps(low));
        assert!(below.keeps(low) && !below.keeps(high));
        assert!(ClipPlane::DISABLED.keeps(high) && ClipPlane::DISABLED.keeps(low));
    }

    #[test]
    fn test_new_scene_starts_disabled() {
        let scene = Scene::new();
        assert!(scene.clip_plane.is_disabled());
        assert!(scene.directional.is_none());
        assert_eq!(scene.frame_view().camera, scene.camera);
    }

    #[test]
    fn test_has_reports_components() {
        let mut scene = Scene::new();
        let entity = scene.spawn((Transform::default(), Skydome));
        assert!(scene.has::<Skydome>(entity));
        assert!(!scene.has::<Water>(entity));
    }
}
