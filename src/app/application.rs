//! Application driver

use std::process::ExitCode;
use std::time::Duration;

use winit::{
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
};

use crate::backend::wgpu_backend::WgpuBackend;
use crate::backend::{BackendError, ClearRequest, GraphicsBackend, Viewport};
use crate::error::EngineResult;
use crate::resources::ResourceManagers;
use crate::window::{InputState, Window};

use super::{EngineConfig, FixedTimestep, FrameClock, State, StateContext, StateStack};

/// Owns the backend, the resource caches and the state stack.
///
/// Each [`tick`](Application::tick) runs as many fixed updates as the
/// elapsed time calls for and then renders exactly once. Dropping the
/// application exits every state before the caches release their GPU
/// objects.
pub struct Application<B: GraphicsBackend> {
    backend: B,
    resources: ResourceManagers,
    states: StateStack,
    config: EngineConfig,
    viewport: Viewport,
    timestep: FixedTimestep,
    running: bool,
    shut_down: bool,
}

impl<B: GraphicsBackend> Application<B> {
    pub fn new(backend: B, config: EngineConfig) -> EngineResult<Self> {
        Self::with_resources(backend, ResourceManagers::new(), config)
    }

    pub fn with_resources(
        backend: B,
        resources: ResourceManagers,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let (width, height) = backend.surface_size();
        let timestep = FixedTimestep::new(config.update_step(), config.max_updates_per_frame);
        log::info!(
            "Application started at {}x{}, {} updates/s",
            width,
            height,
            config.update_rate
        );

        Ok(Self {
            backend,
            resources,
            states: StateStack::new(),
            config,
            viewport: Viewport::new(width, height),
            timestep,
            running: true,
            shut_down: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn resources(&self) -> &ResourceManagers {
        &self.resources
    }

    pub fn states(&self) -> &StateStack {
        &self.states
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Split borrow of the stack and the context its states run in
    fn parts(&mut self) -> (&mut StateStack, StateContext<'_>) {
        let ctx = StateContext {
            backend: &mut self.backend,
            resources: &mut self.resources,
            viewport: self.viewport,
            config: &self.config,
        };
        (&mut self.states, ctx)
    }

    pub fn push_state(&mut self, state: Box<dyn State>) -> EngineResult<()> {
        let (states, mut ctx) = self.parts();
        states.push(state, &mut ctx)
    }

    pub fn pop_state(&mut self) -> Option<Box<dyn State>> {
        let (states, mut ctx) = self.parts();
        states.pop(&mut ctx)
    }

    pub fn handle_input(&mut self, input: &InputState) {
        if let Some(state) = self.states.top_mut() {
            state.handle_input(input);
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.backend.resize(width, height);
        let (width, height) = self.backend.surface_size();
        self.viewport = Viewport::new(width, height);
        if let Some(state) = self.states.top_mut() {
            state.resize(width, height);
        }
    }

    /// Run the fixed updates owed for `frame_dt`, then render one frame.
    ///
    /// Returns `false` once the state stack has emptied or a state quit.
    pub fn tick(&mut self, frame_dt: Duration) -> EngineResult<bool> {
        if !self.running {
            return Ok(false);
        }

        let updates = self.timestep.advance(frame_dt);
        let dt = self.timestep.step_secs();
        for _ in 0..updates {
            let Some(state) = self.states.top_mut() else {
                break;
            };
            let transition = state.update(dt);
            let (states, mut ctx) = self.parts();
            if !states.apply(transition, &mut ctx)? {
                self.running = false;
                return Ok(false);
            }
        }

        self.backend.begin_frame()?;
        let (states, mut ctx) = self.parts();
        match states.top_mut() {
            Some(state) => state.render(&mut ctx)?,
            None => ctx
                .backend
                .clear(ClearRequest::color_and_depth(ctx.config.clear_color)),
        }
        self.backend.end_frame()?;

        self.running = !self.states.is_empty();
        Ok(self.running)
    }

    /// Exit every state and release the caches. Runs once; `Drop` calls it too.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.running = false;
        let (states, mut ctx) = self.parts();
        states.clear(&mut ctx);
        self.resources.release_all(&mut self.backend);
        log::info!("Application shut down");
    }
}

impl<B: GraphicsBackend> Drop for Application<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open a window, run `setup` and drive the application until it stops.
///
/// A fatal error is logged and turned into a failing exit code.
pub fn run<F>(config: EngineConfig, setup: F) -> ExitCode
where
    F: FnOnce(&mut Application<WgpuBackend>) -> EngineResult<()>,
{
    match run_event_loop(config, setup) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("Fatal error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_event_loop<F>(config: EngineConfig, setup: F) -> EngineResult<()>
where
    F: FnOnce(&mut Application<WgpuBackend>) -> EngineResult<()>,
{
    config.validate()?;
    let event_loop = EventLoop::new()
        .map_err(|e| BackendError::InitializationFailed(format!("event loop: {e}")))?;
    let mut window = Window::new(&event_loop, &config.title, config.width, config.height)?;
    let backend = WgpuBackend::new(window.window_arc(), config.vsync)?;

    let mut app = Application::new(backend, config)?;
    setup(&mut app)?;

    let mut clock = FrameClock::new();
    let mut failure = None;

    event_loop
        .run(|event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event);
                    match event {
                        WindowEvent::CloseRequested => elwt.exit(),
                        WindowEvent::Resized(size) => app.resize(size.width, size.height),
                        _ => {}
                    }
                }
                Event::DeviceEvent { event, .. } => window.input_mut().handle_device_event(&event),
                Event::AboutToWait => {
                    app.handle_input(window.input());
                    window.input_mut().end_frame();
                    match app.tick(clock.tick().dt) {
                        Ok(true) => window.request_redraw(),
                        Ok(false) => elwt.exit(),
                        Err(err) => {
                            failure = Some(err);
                            elwt.exit();
                        }
                    }
                }
                _ => {}
            }
        })
        .map_err(|e| BackendError::InitializationFailed(format!("event loop: {e}")))?;

    app.shutdown();
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Transition;
    use crate::backend::HeadlessBackend;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counter {
        updates: Rc<Cell<u32>>,
        renders: Rc<Cell<u32>>,
        quit_after: u32,
    }

    impl State for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn update(&mut self, _dt: f32) -> Transition {
            self.updates.set(self.updates.get() + 1);
            if self.updates.get() >= self.quit_after {
                Transition::Quit
            } else {
                Transition::None
            }
        }

        fn render(&mut self, _ctx: &mut StateContext<'_>) -> EngineResult<()> {
            self.renders.set(self.renders.get() + 1);
            Ok(())
        }
    }

    type Counts = (Rc<Cell<u32>>, Rc<Cell<u32>>);

    fn counting_app(quit_after: u32) -> (Application<HeadlessBackend>, Counts) {
        let backend = HeadlessBackend::with_surface_size(320, 200);
        let config = EngineConfig::default().with_update_rate(10);
        let mut app = Application::new(backend, config).unwrap();
        let updates = Rc::new(Cell::new(0));
        let renders = Rc::new(Cell::new(0));
        app.push_state(Box::new(Counter {
            updates: updates.clone(),
            renders: renders.clone(),
            quit_after,
        }))
        .unwrap();
        (app, (updates, renders))
    }

    #[test]
    fn test_tick_runs_owed_updates_then_one_render() {
        let (mut app, (updates, renders)) = counting_app(u32::MAX);

        assert!(app.tick(Duration::from_millis(250)).unwrap());
        assert_eq!(updates.get(), 2);
        assert_eq!(renders.get(), 1);

        assert!(app.tick(Duration::from_millis(20)).unwrap());
        assert_eq!(updates.get(), 2);
        assert_eq!(renders.get(), 2);
        assert_eq!(app.backend().frames_submitted(), 2);
    }

    #[test]
    fn test_quit_stops_the_application() {
        let (mut app, (updates, renders)) = counting_app(1);

        assert!(!app.tick(Duration::from_millis(300)).unwrap());
        assert_eq!(updates.get(), 1);
        assert_eq!(renders.get(), 0);
        assert!(app.states().is_empty());
        assert!(!app.tick(Duration::from_millis(300)).unwrap());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let backend = HeadlessBackend::with_surface_size(320, 200);
        let config = EngineConfig::default().with_update_rate(0);
        assert!(Application::new(backend, config).is_err());
    }
}
