//! Camera-facing particles

use std::sync::Arc;

use bevy_ecs::prelude::*;

use crate::backend::{BlendState, GraphicsBackend, RenderState};
use crate::error::EngineResult;
use crate::resources::{BuiltinMesh, GpuMesh, ResourceManagers, ShaderKind, ShaderProgram, ShaderSource};
use crate::scene::{ParticleEmitter, Scene, Transform};

use super::skybox::billboard_axes;
use super::{
    InstanceBatch, InstanceBuffer, ParticleInstance, RenderContext, RenderSystem,
    RenderSystemKind, Siblings,
};

pub const PARTICLE_SHADER: ShaderSource = ShaderSource {
    label: "particle",
    wgsl: PARTICLE_WGSL,
    uniforms: &["view_proj", "camera_right", "camera_up", "clip_plane"],
    textures: &["particle_texture"],
};

const PARTICLE_WGSL: &str = r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    camera_right: vec4<f32>,
    camera_up: vec4<f32>,
    clip_plane: vec4<f32>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var particle_texture: texture_2d<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) world_position: vec3<f32>,
    @location(2) fade: f32,
}

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(4) center_size: vec4<f32>,
    @location(5) life: vec4<f32>,
) -> VertexOutput {
    var out: VertexOutput;
    let world = center_size.xyz
        + (u.camera_right.xyz * position.x + u.camera_up.xyz * position.y) * center_size.w;
    out.clip_position = u.view_proj * vec4<f32>(world, 1.0);
    out.world_position = world;
    out.uv = uv;
    out.fade = 1.0 - clamp(life.x, 0.0, 1.0);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let texel = textureSampleLevel(particle_texture, tex_sampler, in.uv, 0.0);
    if (dot(vec4<f32>(in.world_position, 1.0), u.clip_plane) < 0.0) {
        discard;
    }
    return vec4<f32>(texel.rgb, texel.a * in.fade);
}
"#;

type EmitterQuery = (&'static Transform, &'static mut ParticleEmitter);

/// Spawns, ages and draws the particles of every [`ParticleEmitter`].
///
/// All live particles share one instance buffer and each emitter draws its
/// own range of it as an instanced triangle strip.
pub struct ParticleRenderSystem {
    program: Arc<ShaderProgram>,
    quad: Arc<GpuMesh>,
    query: QueryState<EmitterQuery>,
    instances: InstanceBuffer<ParticleInstance>,
}

impl ParticleRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
    ) -> EngineResult<Self> {
        Ok(Self {
            program: resources.shaders.get(backend, ShaderKind::Particle)?,
            quad: resources.meshes.builtin(backend, BuiltinMesh::Quad)?,
            query: world.query::<EmitterQuery>(),
            instances: InstanceBuffer::new("particle"),
        })
    }
}

impl RenderSystem for ParticleRenderSystem {
    fn name(&self) -> &'static str {
        "Particle"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Particle
    }

    fn update(&mut self, dt: f32, scene: &mut Scene) {
        for (transform, mut emitter) in self.query.iter_mut(&mut scene.registry) {
            emitter.advance(dt, transform.position);
        }
    }

    fn begin_frame(&mut self) {
        self.instances.begin_frame();
    }

    /// Blended and depth tested, but never writing depth
    fn render_state(&self) -> RenderState {
        RenderState::ENGINE_DEFAULT
            .with_depth_write(false)
            .with_blend(BlendState::alpha_blending())
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _siblings: &mut Siblings<'_>) -> EngineResult<()> {
        let scene = ctx.scene;
        let eye = ctx.view.camera.position();

        let mut batch = InstanceBatch::new();
        for (_, emitter) in self.query.iter(&scene.registry) {
            let mut live: Vec<ParticleInstance> = emitter
                .particles()
                .iter()
                .map(|p| ParticleInstance {
                    center_size: p.position.extend(p.size),
                    life: glam::Vec4::new(p.age / p.lifetime.max(f32::EPSILON), 0.0, 0.0, 0.0),
                })
                .collect();
            // Back to front so blending composes
            live.sort_by(|a, b| {
                let da = a.center_size.truncate().distance_squared(eye);
                let db = b.center_size.truncate().distance_squared(eye);
                db.total_cmp(&da)
            });
            batch.push(live);
        }
        if batch.data().is_empty() {
            return Ok(());
        }
        let base = self.instances.upload(ctx.backend, batch.data())?;

        let (right, up) = billboard_axes(&ctx.view.camera);
        let program = &self.program;
        program.bind(ctx.backend);
        program.set_uniform(ctx.backend, "view_proj", ctx.view.camera.view_projection_matrix())?;
        program.set_uniform(ctx.backend, "camera_right", right)?;
        program.set_uniform(ctx.backend, "camera_up", up)?;
        program.set_uniform(ctx.backend, "clip_plane", ctx.view.clip_plane.as_vec4())?;

        self.quad.bind(ctx.backend);
        self.instances.bind(ctx.backend);
        let emitters = self.query.iter(&scene.registry);
        for ((_, emitter), range) in emitters.zip(batch.ranges_from(base)) {
            if range.is_empty() {
                continue;
            }
            let texture = ctx.resources.textures.get_key(ctx.backend, &emitter.texture)?;
            program.bind_texture(ctx.backend, "particle_texture", texture.handle)?;
            self.quad.draw(ctx.backend, range);
        }
        Ok(())
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.instances.release(backend);
    }
}
