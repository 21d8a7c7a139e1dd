//! Application states
//!
//! States form a stack; only the top one is updated, rendered and fed input.
//! Entering a state is where it acquires its scene and render systems and
//! exiting is where it hands their GPU objects back.

use crate::backend::{ClearRequest, GraphicsBackend, Viewport};
use crate::error::EngineResult;
use crate::pipeline::{RenderContext, RenderSystems};
use crate::resources::ResourceManagers;
use crate::scene::{CameraController, CameraInput, Scene};
use crate::window::InputState;

use super::EngineConfig;

/// What a state has access to outside of `update`
pub struct StateContext<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub resources: &'a mut ResourceManagers,
    pub viewport: Viewport,
    pub config: &'a EngineConfig,
}

/// Change to the stack requested by the top state
pub enum Transition {
    None,
    Push(Box<dyn State>),
    Pop,
    Replace(Box<dyn State>),
    Quit,
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::None => f.write_str("None"),
            Transition::Push(state) => write!(f, "Push({})", state.name()),
            Transition::Pop => f.write_str("Pop"),
            Transition::Replace(state) => write!(f, "Replace({})", state.name()),
            Transition::Quit => f.write_str("Quit"),
        }
    }
}

pub trait State {
    fn name(&self) -> &'static str;

    fn on_enter(&mut self, _ctx: &mut StateContext<'_>) -> EngineResult<()> {
        Ok(())
    }

    /// Release everything acquired in `on_enter`
    fn on_exit(&mut self, _ctx: &mut StateContext<'_>) {}

    /// Called once per frame before the fixed updates
    fn handle_input(&mut self, _input: &InputState) {}

    /// One fixed step of `dt` seconds
    fn update(&mut self, dt: f32) -> Transition;

    fn render(&mut self, ctx: &mut StateContext<'_>) -> EngineResult<()>;

    fn resize(&mut self, _width: u32, _height: u32) {}
}

/// Stack of states with enter/exit bookkeeping
#[derive(Default)]
pub struct StateStack {
    states: Vec<Box<dyn State>>,
}

impl StateStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn top(&self) -> Option<&dyn State> {
        self.states.last().map(|state| state.as_ref())
    }

    pub fn top_mut(&mut self) -> Option<&mut (dyn State + 'static)> {
        self.states.last_mut().map(|state| state.as_mut())
    }

    /// Names from bottom to top
    pub fn names(&self) -> Vec<&'static str> {
        self.states.iter().map(|state| state.name()).collect()
    }

    /// Enter `state` and make it the top. A state whose `on_enter` fails is
    /// exited again and not pushed.
    pub fn push(&mut self, mut state: Box<dyn State>, ctx: &mut StateContext<'_>) -> EngineResult<()> {
        if let Err(err) = state.on_enter(ctx) {
            state.on_exit(ctx);
            return Err(err);
        }
        log::info!("Entered state {}", state.name());
        self.states.push(state);
        Ok(())
    }

    pub fn pop(&mut self, ctx: &mut StateContext<'_>) -> Option<Box<dyn State>> {
        let mut state = self.states.pop()?;
        state.on_exit(ctx);
        log::info!("Exited state {}", state.name());
        Some(state)
    }

    pub fn replace(&mut self, state: Box<dyn State>, ctx: &mut StateContext<'_>) -> EngineResult<()> {
        self.pop(ctx);
        self.push(state, ctx)
    }

    /// Apply a transition. Returns `false` once the application should stop.
    pub fn apply(&mut self, transition: Transition, ctx: &mut StateContext<'_>) -> EngineResult<bool> {
        match transition {
            Transition::None => {}
            Transition::Push(state) => self.push(state, ctx)?,
            Transition::Pop => {
                self.pop(ctx);
            }
            Transition::Replace(state) => self.replace(state, ctx)?,
            Transition::Quit => {
                self.clear(ctx);
                return Ok(false);
            }
        }
        Ok(!self.states.is_empty())
    }

    /// Exit every state, top first
    pub fn clear(&mut self, ctx: &mut StateContext<'_>) {
        while self.pop(ctx).is_some() {}
    }
}

type SceneSetup =
    Box<dyn FnOnce(&mut StateContext<'_>, &mut Scene, &mut RenderSystems) -> EngineResult<()>>;

/// The stock state: a [`Scene`] drawn by an ordered [`RenderSystems`] list.
///
/// The scene and its systems are built by `setup` when the state is entered
/// and dropped, with every system released, when it exits. `setup` registers
/// into the state's own list, so systems added before a failing step are
/// still released by the exit that follows.
pub struct SceneState {
    name: &'static str,
    setup: Option<SceneSetup>,
    scene: Option<Scene>,
    systems: RenderSystems,
    controller: Option<Box<dyn CameraController>>,
    camera_input: CameraInput,
}

impl SceneState {
    pub fn new<F>(name: &'static str, setup: F) -> Self
    where
        F: FnOnce(&mut StateContext<'_>, &mut Scene, &mut RenderSystems) -> EngineResult<()>
            + 'static,
    {
        Self {
            name,
            setup: Some(Box::new(setup)),
            scene: None,
            systems: RenderSystems::new(),
            controller: None,
            camera_input: CameraInput::default(),
        }
    }

    pub fn with_controller(mut self, controller: impl CameraController + 'static) -> Self {
        self.controller = Some(Box::new(controller));
        self
    }

    /// The live scene, present between enter and exit
    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    pub fn scene_mut(&mut self) -> Option<&mut Scene> {
        self.scene.as_mut()
    }

    pub fn systems(&self) -> &RenderSystems {
        &self.systems
    }
}

impl State for SceneState {
    fn name(&self) -> &'static str {
        self.name
    }

    fn on_enter(&mut self, ctx: &mut StateContext<'_>) -> EngineResult<()> {
        let mut scene = Scene::new();
        scene.camera.projection = ctx.config.projection().to_projection();
        scene
            .camera
            .set_aspect(ctx.viewport.width as f32, ctx.viewport.height.max(1) as f32);

        if let Some(setup) = self.setup.take() {
            setup(ctx, &mut scene, &mut self.systems)?;
        }
        log::debug!(
            "{} scene ready with systems {:?}",
            self.name,
            self.systems.names()
        );
        self.scene = Some(scene);
        Ok(())
    }

    fn on_exit(&mut self, ctx: &mut StateContext<'_>) {
        self.systems.release(ctx.backend);
        self.systems = RenderSystems::new();
        self.scene = None;
    }

    fn handle_input(&mut self, input: &InputState) {
        self.camera_input = input.camera_input();
    }

    fn update(&mut self, dt: f32) -> Transition {
        let Some(scene) = self.scene.as_mut() else {
            return Transition::None;
        };
        if let Some(controller) = self.controller.as_mut() {
            controller.update(&mut scene.camera, &self.camera_input, dt);
            // Deltas are consumed by the first step of the frame
            self.camera_input.mouse_delta = glam::Vec2::ZERO;
            self.camera_input.scroll_delta = 0.0;
        }
        self.systems.update_all(dt, scene);
        Transition::None
    }

    fn render(&mut self, ctx: &mut StateContext<'_>) -> EngineResult<()> {
        let Some(scene) = self.scene.as_ref() else {
            return Ok(());
        };
        let mut render =
            RenderContext::new(&mut *ctx.backend, &mut *ctx.resources, scene, ctx.viewport)
                .with_clear_color(ctx.config.clear_color);
        render.backend.clear(ClearRequest::color_and_depth(ctx.config.clear_color));
        self.systems.render_all(&mut render)
    }

    fn resize(&mut self, width: u32, height: u32) {
        if let Some(scene) = self.scene.as_mut() {
            scene.camera.set_aspect(width as f32, height.max(1) as f32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Journal = Rc<RefCell<Vec<String>>>;

    struct Probe {
        name: &'static str,
        journal: Journal,
        next: Option<Transition>,
    }

    impl Probe {
        fn boxed(name: &'static str, journal: &Journal) -> Box<dyn State> {
            Box::new(Self {
                name,
                journal: journal.clone(),
                next: None,
            })
        }
    }

    impl State for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn on_enter(&mut self, _ctx: &mut StateContext<'_>) -> EngineResult<()> {
            self.journal.borrow_mut().push(format!("enter {}", self.name));
            Ok(())
        }

        fn on_exit(&mut self, _ctx: &mut StateContext<'_>) {
            self.journal.borrow_mut().push(format!("exit {}", self.name));
        }

        fn update(&mut self, _dt: f32) -> Transition {
            self.next.take().unwrap_or(Transition::None)
        }

        fn render(&mut self, _ctx: &mut StateContext<'_>) -> EngineResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stack_lifecycle_order() {
        let mut backend = HeadlessBackend::with_surface_size(64, 64);
        let mut resources = ResourceManagers::new();
        let config = EngineConfig::default();
        let mut ctx = StateContext {
            backend: &mut backend,
            resources: &mut resources,
            viewport: Viewport::new(64, 64),
            config: &config,
        };
        let journal = Journal::default();
        let mut stack = StateStack::new();

        stack.push(Probe::boxed("menu", &journal), &mut ctx).unwrap();
        stack.push(Probe::boxed("level", &journal), &mut ctx).unwrap();
        assert_eq!(stack.names(), ["menu", "level"]);

        stack.replace(Probe::boxed("pause", &journal), &mut ctx).unwrap();
        assert!(!stack.apply(Transition::Quit, &mut ctx).unwrap());
        assert!(stack.is_empty());

        assert_eq!(
            *journal.borrow(),
            [
                "enter menu",
                "enter level",
                "exit level",
                "enter pause",
                "exit pause",
                "exit menu"
            ]
        );
    }

    #[test]
    fn test_scene_lives_between_enter_and_exit() {
        let mut backend = HeadlessBackend::with_surface_size(64, 64);
        let mut resources = ResourceManagers::new();
        let config = EngineConfig::default();
        let mut ctx = StateContext {
            backend: &mut backend,
            resources: &mut resources,
            viewport: Viewport::new(64, 32),
            config: &config,
        };

        let mut state = SceneState::new("level", |_ctx, scene, _systems| {
            scene.ambient = glam::Vec3::ONE;
            Ok(())
        });
        assert!(state.scene().is_none());

        state.on_enter(&mut ctx).unwrap();
        let scene = state.scene().unwrap();
        assert_eq!(scene.ambient, glam::Vec3::ONE);
        assert_eq!(scene.camera.projection.aspect, 2.0);

        state.on_exit(&mut ctx);
        assert!(state.scene().is_none());
    }

    #[test]
    fn test_failed_setup_releases_registered_systems() {
        use crate::pipeline::{DeferredRenderSystem, WaterConfig, WaterRenderSystem};

        let mut backend = HeadlessBackend::with_surface_size(64, 64);
        let mut resources = ResourceManagers::new();
        let config = EngineConfig::default();
        let mut ctx = StateContext {
            backend: &mut backend,
            resources: &mut resources,
            viewport: Viewport::new(64, 64),
            config: &config,
        };

        let state = SceneState::new("broken", |ctx, scene, systems| {
            let world = &mut scene.registry;
            systems.push(DeferredRenderSystem::new(world, ctx.resources, ctx.backend, 64, 64)?);
            let water =
                WaterRenderSystem::new(world, ctx.resources, ctx.backend, WaterConfig::new(0, 0))?;
            systems.push(water);
            Ok(())
        });
        let mut stack = StateStack::new();
        assert!(stack.push(Box::new(state), &mut ctx).is_err());
        assert!(stack.is_empty());

        ctx.resources.release_all(ctx.backend);
        assert_eq!(backend.live_framebuffers(), 0);
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_programs(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }
}
