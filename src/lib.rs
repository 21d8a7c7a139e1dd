//! Tidewater - a real-time 3D render pipeline
//!
//! Entities live in a Bevy ECS world inside a [`Scene`]. An ordered list
//! of render systems draws them each frame: forward models and instances,
//! skybox, GUI quads, particles, terrain, skinned meshes, deferred shading
//! and planar water with reflection and refraction captures.
//!
//! # Features
//! - Cached shader programs, textures and meshes released once at shutdown
//! - Off-screen targets for the G-buffer and the water captures
//! - Explicit per-pass camera and clip plane, never written back to the scene
//! - Fixed-rate updates with uncapped rendering over a stack of states
//! - wgpu backend plus a recording headless backend for tests

pub mod app;
pub mod backend;
pub mod error;
pub mod framebuffer;
pub mod logging;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod window;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::*;

pub use app::{Application, EngineConfig, SceneState, State, StateStack, Transition};
pub use backend::wgpu_backend::WgpuBackend;
pub use backend::{GraphicsBackend, HeadlessBackend};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use framebuffer::FrameBufferTarget;
pub use logging::{init_logging, LoggingConfig};
pub use pipeline::{RenderContext, RenderSystem, RenderSystemKind, RenderSystems};
pub use resources::ResourceManagers;
pub use scene::{ClipPlane, FrameView, Scene};
pub use window::{InputState, Window};
