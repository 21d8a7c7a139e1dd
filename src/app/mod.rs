//! Application layer
//!
//! A fixed-rate update loop with uncapped rendering, driving a stack of
//! states. The stock [`SceneState`] owns a scene and its render systems.

mod application;
mod config;
mod fixed_step;
mod state;

pub use application::*;
pub use config::*;
pub use fixed_step::*;
pub use state::*;
