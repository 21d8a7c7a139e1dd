//! Render systems
//!
//! Each technique is one [`RenderSystem`]. A system resolves its program once
//! at construction, optionally advances animated state in `update` and draws
//! the entities matching its query in `render`. [`RenderSystems`] runs them
//! in registration order and wraps every `render` in the system's
//! `prepare_rendering` / `finish_rendering` pair, so the fixed-function state
//! is back at [`RenderState::ENGINE_DEFAULT`] between systems.

/// WGSL light structures and shading helpers shared by the lit techniques
macro_rules! wgsl_lighting {
    () => {
        r#"
struct PointLight {
    // w components carry constant, linear and quadratic attenuation
    position: vec4<f32>,
    ambient: vec4<f32>,
    diffuse: vec4<f32>,
    specular: vec4<f32>,
}

struct DirectionalLight {
    // w = 1 when the scene has a directional light
    direction: vec4<f32>,
    diffuse: vec4<f32>,
    specular: vec4<f32>,
}

fn shade_point(light: PointLight, world: vec3<f32>, n: vec3<f32>, to_eye: vec3<f32>,
               albedo: vec3<f32>, spec: f32, shininess: f32) -> vec3<f32> {
    let offset = light.position.xyz - world;
    let distance = length(offset);
    let l = offset / max(distance, 0.0001);
    let attenuation = 1.0 / (light.position.w + light.ambient.w * distance
        + light.diffuse.w * distance * distance);
    let diffuse = max(dot(n, l), 0.0) * light.diffuse.xyz * albedo;
    let h = normalize(l + to_eye);
    let specular = pow(max(dot(n, h), 0.0), shininess) * spec * light.specular.xyz;
    return (light.ambient.xyz * albedo + diffuse + specular) * attenuation;
}

fn shade_directional(light: DirectionalLight, n: vec3<f32>, to_eye: vec3<f32>,
                     albedo: vec3<f32>, spec: f32, shininess: f32) -> vec3<f32> {
    if (light.direction.w < 0.5) {
        return vec3<f32>(0.0);
    }
    let l = normalize(-light.direction.xyz);
    let diffuse = max(dot(n, l), 0.0) * light.diffuse.xyz * albedo;
    let h = normalize(l + to_eye);
    let specular = pow(max(dot(n, h), 0.0), shininess) * spec * light.specular.xyz;
    return diffuse + specular;
}
"#
    };
}

pub mod deferred;
pub mod gui;
mod instance;
pub mod instancing;
pub mod model;
pub mod particle;
pub mod skeletal;
pub mod skybox;
pub mod terrain;
pub mod water;

pub use deferred::DeferredRenderSystem;
pub use gui::GuiRenderSystem;
pub use instance::*;
pub use instancing::InstancingRenderSystem;
pub use model::ModelRenderSystem;
pub use particle::ParticleRenderSystem;
pub use skeletal::SkeletalRenderSystem;
pub use skybox::SkyboxRenderSystem;
pub use terrain::TerrainRenderSystem;
pub use water::{WaterConfig, WaterRenderSystem};

use bytemuck::Zeroable;

use crate::backend::{GraphicsBackend, RenderState, UniformValue, Viewport};
use crate::error::EngineResult;
use crate::resources::{GpuMesh, Material, ResourceManagers, ShaderProgram, TextureManager};
use crate::scene::{pack_point_lights, FrameView, GpuDirectionalLight, Scene};

/// Point lights shaded by the forward techniques
pub const MAX_FORWARD_POINT_LIGHTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderSystemKind {
    Model,
    Instancing,
    Skybox,
    Gui,
    Particle,
    Terrain,
    Water,
    Skeletal,
    Deferred,
}

impl RenderSystemKind {
    pub const ALL: [RenderSystemKind; 9] = [
        RenderSystemKind::Model,
        RenderSystemKind::Instancing,
        RenderSystemKind::Skybox,
        RenderSystemKind::Gui,
        RenderSystemKind::Particle,
        RenderSystemKind::Terrain,
        RenderSystemKind::Water,
        RenderSystemKind::Skeletal,
        RenderSystemKind::Deferred,
    ];
}

/// Everything a render system reads during one `render` call
pub struct RenderContext<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub resources: &'a mut ResourceManagers,
    pub scene: &'a Scene,
    /// Camera and clip plane for this invocation
    pub view: FrameView,
    /// The application's current viewport, restored when an off-screen target unbinds
    pub app_viewport: Viewport,
    pub clear_color: [f32; 4],
    /// True while an off-screen capture re-renders the scene
    pub capture: bool,
}

impl<'a> RenderContext<'a> {
    pub fn new(
        backend: &'a mut dyn GraphicsBackend,
        resources: &'a mut ResourceManagers,
        scene: &'a Scene,
        app_viewport: Viewport,
    ) -> Self {
        Self {
            backend,
            resources,
            view: scene.frame_view(),
            scene,
            app_viewport,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            capture: false,
        }
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    /// Context for an off-screen capture seen through `view`
    pub fn capture(&mut self, view: FrameView) -> RenderContext<'_> {
        RenderContext {
            backend: &mut *self.backend,
            resources: &mut *self.resources,
            scene: self.scene,
            view,
            app_viewport: self.app_viewport,
            clear_color: self.clear_color,
            capture: true,
        }
    }
}

/// A rendering technique
pub trait RenderSystem {
    fn name(&self) -> &'static str;

    fn kind(&self) -> RenderSystemKind;

    /// Advance system-owned animated state. Never touches the GPU.
    fn update(&mut self, _dt: f32, _scene: &mut Scene) {}

    /// Called for every system before the frame's first `render`, captures included
    fn begin_frame(&mut self) {}

    /// Fixed-function state this technique draws with
    fn render_state(&self) -> RenderState;

    fn prepare_rendering(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_render_state(self.render_state());
    }

    fn finish_rendering(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_render_state(RenderState::ENGINE_DEFAULT);
    }

    /// Draw every matching entity. `siblings` are the other registered
    /// systems, available to techniques that capture the scene off-screen.
    fn render(&mut self, ctx: &mut RenderContext<'_>, siblings: &mut Siblings<'_>)
        -> EngineResult<()>;

    /// Free GPU objects the system owns outright (off-screen targets, instance buffers)
    fn release(&mut self, _backend: &mut dyn GraphicsBackend) {}
}

/// Registration handle of a system inside [`RenderSystems`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(u32);

struct Registered {
    id: SystemId,
    system: Box<dyn RenderSystem>,
}

/// The systems registered alongside the one currently rendering
pub struct Siblings<'s> {
    before: &'s mut [Registered],
    after: &'s mut [Registered],
}

impl Siblings<'static> {
    /// No siblings; handed to systems rendered from inside another system
    pub fn empty() -> Self {
        Siblings {
            before: &mut [],
            after: &mut [],
        }
    }
}

impl<'s> Siblings<'s> {
    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<SystemId> {
        self.before
            .iter()
            .chain(self.after.iter())
            .map(|entry| entry.id)
            .collect()
    }

    /// Render the listed siblings in order with `ctx`.
    ///
    /// Each one gets an empty sibling set, so captures cannot recurse.
    /// Ids that are not siblings here are skipped.
    pub fn render(&mut self, ids: &[SystemId], ctx: &mut RenderContext<'_>) -> EngineResult<()> {
        for id in ids {
            let Some(entry) = self
                .before
                .iter_mut()
                .chain(self.after.iter_mut())
                .find(|entry| entry.id == *id)
            else {
                log::trace!("{id:?} is not a sibling in this pass, skipped");
                continue;
            };
            run_system(entry.system.as_mut(), ctx, &mut Siblings::empty())?;
        }
        Ok(())
    }
}

fn run_system(
    system: &mut dyn RenderSystem,
    ctx: &mut RenderContext<'_>,
    siblings: &mut Siblings<'_>,
) -> EngineResult<()> {
    log::trace!("Rendering {}", system.name());
    system.prepare_rendering(ctx.backend);
    let result = system.render(ctx, siblings);
    // Runs even when the render failed
    system.finish_rendering(ctx.backend);
    result
}

/// Ordered composition of render systems owned by a state
#[derive(Default)]
pub struct RenderSystems {
    systems: Vec<Registered>,
    next_id: u32,
}

impl RenderSystems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a system after every system already present
    pub fn add(&mut self, system: Box<dyn RenderSystem>) -> SystemId {
        let id = SystemId(self.next_id);
        self.next_id += 1;
        log::debug!("Registered {} render system as {:?}", system.name(), id);
        self.systems.push(Registered { id, system });
        id
    }

    pub fn push<S: RenderSystem + 'static>(&mut self, system: S) -> SystemId {
        self.add(Box::new(system))
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn ids(&self) -> Vec<SystemId> {
        self.systems.iter().map(|entry| entry.id).collect()
    }

    pub fn get(&self, id: SystemId) -> Option<&dyn RenderSystem> {
        self.systems
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.system.as_ref())
    }

    pub fn get_mut(&mut self, id: SystemId) -> Option<&mut (dyn RenderSystem + 'static)> {
        self.systems
            .iter_mut()
            .find(|entry| entry.id == id)
            .map(|entry| entry.system.as_mut())
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.systems.iter().map(|entry| entry.system.name()).collect()
    }

    pub fn update_all(&mut self, dt: f32, scene: &mut Scene) {
        for entry in &mut self.systems {
            entry.system.update(dt, scene);
        }
    }

    /// Render every system once, in registration order
    pub fn render_all(&mut self, ctx: &mut RenderContext<'_>) -> EngineResult<()> {
        for entry in &mut self.systems {
            entry.system.begin_frame();
        }
        for index in 0..self.systems.len() {
            let (before, rest) = self.systems.split_at_mut(index);
            let Some((current, after)) = rest.split_first_mut() else {
                break;
            };
            let mut siblings = Siblings { before, after };
            run_system(current.system.as_mut(), ctx, &mut siblings)?;
        }
        Ok(())
    }

    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for entry in &mut self.systems {
            entry.system.release(backend);
        }
    }
}

/// Camera matrices and the active clip plane
pub(crate) fn set_view_uniforms(
    program: &ShaderProgram,
    backend: &mut dyn GraphicsBackend,
    view: &FrameView,
) -> EngineResult<()> {
    program.set_uniform(backend, "view_proj", view.camera.view_projection_matrix())?;
    program.set_uniform(backend, "camera_position", view.camera.position().extend(1.0))?;
    program.set_uniform(backend, "clip_plane", view.clip_plane.as_vec4())
}

/// Ambient, directional and up to `max_point_lights` point lights
pub(crate) fn set_light_uniforms(
    program: &ShaderProgram,
    backend: &mut dyn GraphicsBackend,
    scene: &Scene,
    max_point_lights: usize,
) -> EngineResult<()> {
    let (count, packed) = pack_point_lights(&scene.point_lights, max_point_lights);
    let directional = scene
        .directional
        .as_ref()
        .map(|light| light.to_gpu_data())
        .unwrap_or_else(GpuDirectionalLight::zeroed);

    program.set_uniform(backend, "ambient", scene.ambient.extend(1.0))?;
    program.set_uniform(backend, "num_point_lights", count)?;
    program.set_uniform(backend, "point_lights", UniformValue::Bytes(packed))?;
    program.set_uniform(
        backend,
        "directional",
        UniformValue::Bytes(bytemuck::bytes_of(&directional).to_vec()),
    )
}

/// Material of an entity: its override if present, else the mesh's imported one
pub(crate) fn resolve_material(material: Option<&Material>, mesh: &GpuMesh) -> Material {
    match (material, &mesh.material) {
        (Some(material), _) => material.clone(),
        (None, Some(imported)) => Material::from(imported),
        (None, None) => Material::default(),
    }
}

/// Diffuse texture, tint and the specular / fake lighting parameters
pub(crate) fn bind_material(
    program: &ShaderProgram,
    backend: &mut dyn GraphicsBackend,
    textures: &mut TextureManager,
    material: &Material,
) -> EngineResult<()> {
    let texture = textures.get_key(backend, &material.diffuse)?;
    program.bind_texture(backend, "diffuse_texture", texture.handle)?;
    program.set_uniform(backend, "material_tint", material.tint)?;
    program.set_uniform(backend, "material_params", material.params())
}
