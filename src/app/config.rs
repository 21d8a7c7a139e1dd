//! Engine configuration

use std::time::Duration;

use crate::error::{EngineResult, ErrorKind};
use crate::scene::Projection;

/// Configuration for initializing the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Vertical field of view in degrees
    pub fov_y_degrees: f32,
    pub near: f32,
    pub far: f32,
    /// Fixed simulation updates per second
    pub update_rate: u32,
    /// Catch-up updates allowed before the backlog is dropped
    pub max_updates_per_frame: u32,
    /// Water reflection/refraction resolution relative to the window
    pub reflection_scale: f32,
    pub clear_color: [f32; 4],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Tidewater".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            fov_y_degrees: 70.0,
            near: 0.1,
            far: 1000.0,
            update_rate: 60,
            max_updates_per_frame: 5,
            reflection_scale: 0.5,
            clear_color: [0.5, 0.6, 0.7, 1.0],
        }
    }
}

impl EngineConfig {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_projection(mut self, fov_y_degrees: f32, near: f32, far: f32) -> Self {
        self.fov_y_degrees = fov_y_degrees;
        self.near = near;
        self.far = far;
        self
    }

    pub fn with_update_rate(mut self, update_rate: u32) -> Self {
        self.update_rate = update_rate;
        self
    }

    pub fn with_max_updates_per_frame(mut self, max_updates: u32) -> Self {
        self.max_updates_per_frame = max_updates;
        self
    }

    pub fn with_reflection_scale(mut self, scale: f32) -> Self {
        self.reflection_scale = scale;
        self
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    /// Duration of one fixed update
    pub fn update_step(&self) -> Duration {
        debug_assert!(self.update_rate > 0, "update rate must be positive");
        Duration::from_secs(1) / self.update_rate.max(1)
    }

    pub fn projection(&self) -> ProjectionConfig {
        ProjectionConfig {
            fov_y_degrees: self.fov_y_degrees,
            width: self.width,
            height: self.height,
            near: self.near,
            far: self.far,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ErrorKind::InvalidConfig(format!(
                "window size must be non-zero, got {}x{}",
                self.width, self.height
            ))
            .into());
        }
        if !(self.near > 0.0 && self.near < self.far) {
            return Err(ErrorKind::InvalidConfig(format!(
                "projection planes must satisfy 0 < near < far, got near {} far {}",
                self.near, self.far
            ))
            .into());
        }
        if self.update_rate == 0 {
            return Err(ErrorKind::InvalidConfig("update rate must be positive".into()).into());
        }
        if self.max_updates_per_frame == 0 {
            return Err(
                ErrorKind::InvalidConfig("at least one update per frame is required".into()).into(),
            );
        }
        Ok(())
    }
}

/// Projection parameters shared by cameras and off-screen target sizing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionConfig {
    pub fov_y_degrees: f32,
    pub width: u32,
    pub height: u32,
    pub near: f32,
    pub far: f32,
}

impl ProjectionConfig {
    pub fn aspect(&self) -> f32 {
        debug_assert!(self.height > 0, "projection height must be non-zero");
        self.width as f32 / self.height.max(1) as f32
    }

    pub fn to_projection(&self) -> Projection {
        Projection::perspective(self.fov_y_degrees, self.aspect(), self.near, self.far)
    }

    /// Size of an off-screen target at `scale` of the projection, never below 1x1
    pub fn scaled_size(&self, scale: f32) -> (u32, u32) {
        debug_assert!(scale > 0.0, "target scale must be positive");
        let scaled = |v: u32| ((v as f32 * scale).round() as u32).max(1);
        (scaled(self.width), scaled(self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_width(EngineConfig::default().with_size(0, 720))]
    #[case::zero_height(EngineConfig::default().with_size(1280, 0))]
    #[case::inverted_planes(EngineConfig::default().with_projection(70.0, 100.0, 1.0))]
    #[case::zero_near(EngineConfig::default().with_projection(70.0, 0.0, 1.0))]
    #[case::zero_rate(EngineConfig::default().with_update_rate(0))]
    #[case::zero_catch_up(EngineConfig::default().with_max_updates_per_frame(0))]
    fn test_invalid_config_is_rejected(#[case] config: EngineConfig) {
        let err = config.validate().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
    }

    #[test]
    fn test_projection_follows_window() {
        let projection = EngineConfig::default().with_size(800, 400).projection();
        assert_eq!(projection.aspect(), 2.0);
        assert_eq!(projection.scaled_size(0.5), (400, 200));
        assert_eq!(projection.to_projection().aspect, 2.0);
    }

    #[test]
    fn test_update_step() {
        let config = EngineConfig::default().with_update_rate(4);
        assert_eq!(config.update_step(), Duration::from_millis(250));
    }
}
