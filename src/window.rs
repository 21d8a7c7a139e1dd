//! Window management using winit

use std::collections::HashSet;
use std::sync::Arc;

use glam::Vec2;
use winit::{
    dpi::PhysicalSize,
    event::{DeviceEvent, ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::backend::BackendError;
use crate::scene::CameraInput;

/// Pixels of a touchpad scroll that count as one wheel line
const PIXELS_PER_LINE: f32 = 40.0;

/// Keyboard and mouse state polled by the application each frame
#[derive(Debug, Clone, Default)]
pub struct InputState {
    keys: HashSet<KeyCode>,
    buttons: HashSet<MouseButton>,
    mouse_delta: Vec2,
    scroll_delta: f32,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.keys.contains(&key)
    }

    pub fn is_button_pressed(&self, button: MouseButton) -> bool {
        self.buttons.contains(&button)
    }

    pub fn mouse_delta(&self) -> Vec2 {
        self.mouse_delta
    }

    pub fn scroll_delta(&self) -> f32 {
        self.scroll_delta
    }

    pub fn set_key(&mut self, key: KeyCode, pressed: bool) {
        if pressed {
            self.keys.insert(key);
        } else {
            self.keys.remove(&key);
        }
    }

    pub fn set_button(&mut self, button: MouseButton, pressed: bool) {
        if pressed {
            self.buttons.insert(button);
        } else {
            self.buttons.remove(&button);
        }
    }

    pub fn add_mouse_motion(&mut self, delta: Vec2) {
        self.mouse_delta += delta;
    }

    pub fn add_scroll(&mut self, lines: f32) {
        self.scroll_delta += lines;
    }

    /// Forget per-frame deltas; held keys and buttons stay pressed
    pub fn end_frame(&mut self) {
        self.mouse_delta = Vec2::ZERO;
        self.scroll_delta = 0.0;
    }

    /// Release everything, e.g. when the window loses focus
    pub fn clear(&mut self) {
        self.keys.clear();
        self.buttons.clear();
        self.end_frame();
    }

    /// Camera-relevant subset: WASD plus QE, shift, right mouse look and wheel
    pub fn camera_input(&self) -> CameraInput {
        CameraInput {
            forward: self.is_key_pressed(KeyCode::KeyW),
            backward: self.is_key_pressed(KeyCode::KeyS),
            left: self.is_key_pressed(KeyCode::KeyA),
            right: self.is_key_pressed(KeyCode::KeyD),
            up: self.is_key_pressed(KeyCode::KeyE),
            down: self.is_key_pressed(KeyCode::KeyQ),
            sprint: self.is_key_pressed(KeyCode::ShiftLeft)
                || self.is_key_pressed(KeyCode::ShiftRight),
            mouse_delta: self.mouse_delta,
            scroll_delta: self.scroll_delta,
            mouse_look_active: self.is_button_pressed(MouseButton::Right),
        }
    }

    pub fn handle_window_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        ..
                    },
                ..
            } => self.set_key(*code, *state == ElementState::Pressed),
            WindowEvent::MouseInput { state, button, .. } => {
                self.set_button(*button, *state == ElementState::Pressed)
            }
            WindowEvent::MouseWheel { delta, .. } => match delta {
                MouseScrollDelta::LineDelta(_, y) => self.add_scroll(*y),
                MouseScrollDelta::PixelDelta(position) => {
                    self.add_scroll(position.y as f32 / PIXELS_PER_LINE)
                }
            },
            WindowEvent::Focused(false) => self.clear(),
            _ => {}
        }
    }

    pub fn handle_device_event(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta } = event {
            self.add_mouse_motion(Vec2::new(delta.0 as f32, delta.1 as f32));
        }
    }
}

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
    input: InputState,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, BackendError> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| BackendError::InitializationFailed(format!("window: {e}")))?;

        Ok(Self {
            window: Arc::new(window),
            width,
            height,
            resized: false,
            close_requested: false,
            input: InputState::new(),
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get arc reference to window
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Get current window dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check if window was resized since last frame
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    /// Clear the resize flag
    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    pub fn input(&self) -> &InputState {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut InputState {
        &mut self.input
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => self.input.handle_window_event(event),
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_input_mapping() {
        let mut input = InputState::new();
        input.set_key(KeyCode::KeyW, true);
        input.set_key(KeyCode::ShiftLeft, true);
        input.set_button(MouseButton::Right, true);
        input.add_mouse_motion(Vec2::new(3.0, -2.0));
        input.add_scroll(1.0);

        let camera = input.camera_input();
        assert!(camera.forward && camera.sprint && camera.mouse_look_active);
        assert!(!camera.backward && !camera.up);
        assert_eq!(camera.mouse_delta, Vec2::new(3.0, -2.0));
        assert_eq!(camera.scroll_delta, 1.0);
    }

    #[test]
    fn test_end_frame_keeps_held_keys() {
        let mut input = InputState::new();
        input.set_key(KeyCode::KeyA, true);
        input.add_mouse_motion(Vec2::ONE);
        input.end_frame();

        assert!(input.is_key_pressed(KeyCode::KeyA));
        assert_eq!(input.mouse_delta(), Vec2::ZERO);

        input.set_key(KeyCode::KeyA, false);
        assert!(!input.is_key_pressed(KeyCode::KeyA));
    }
}
