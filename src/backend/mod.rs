//! Backend abstraction layer
//!
//! Provides the [`GraphicsBackend`] trait, the wgpu implementation and a
//! recording headless implementation.

pub mod headless;
pub mod shader;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use headless::HeadlessBackend;
pub use shader::*;
pub use traits::*;
pub use types::*;
