//! Terrain patches

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::Vec4;

use crate::backend::{CullMode, GraphicsBackend, RenderState};
use crate::error::EngineResult;
use crate::resources::{ResourceManagers, ShaderKind, ShaderProgram, ShaderSource};
use crate::scene::{Scene, Terrain, Transform};

use super::{
    set_light_uniforms, set_view_uniforms, RenderContext, RenderSystem, RenderSystemKind,
    Siblings, MAX_FORWARD_POINT_LIGHTS,
};

pub const TERRAIN_SHADER: ShaderSource = ShaderSource {
    label: "terrain",
    wgsl: TERRAIN_WGSL,
    uniforms: &[
        "view_proj",
        "model",
        "camera_position",
        "clip_plane",
        "terrain_params",
        "ambient",
        "directional",
        "num_point_lights",
        "point_lights",
    ],
    textures: &["terrain_texture"],
};

const TERRAIN_WGSL: &str = concat!(
    wgsl_lighting!(),
    r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    model: mat4x4<f32>,
    camera_position: vec4<f32>,
    clip_plane: vec4<f32>,
    // x = texture tiling
    terrain_params: vec4<f32>,
    ambient: vec4<f32>,
    directional: DirectionalLight,
    num_point_lights: u32,
    point_lights: array<PointLight, 8>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var terrain_texture: texture_2d<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
) -> VertexOutput {
    var out: VertexOutput;
    let world = u.model * vec4<f32>(position, 1.0);
    out.world_position = world.xyz;
    out.clip_position = u.view_proj * world;
    out.normal = (u.model * vec4<f32>(normal, 0.0)).xyz;
    out.uv = uv * u.terrain_params.x;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let albedo = textureSampleLevel(terrain_texture, tex_sampler, in.uv, 0.0).rgb;
    if (dot(vec4<f32>(in.world_position, 1.0), u.clip_plane) < 0.0) {
        discard;
    }

    let n = normalize(in.normal);
    let to_eye = normalize(u.camera_position.xyz - in.world_position);
    var color = u.ambient.xyz * albedo;
    color = color + shade_directional(u.directional, n, to_eye, albedo, 0.0, 1.0);
    let count = min(u.num_point_lights, 8u);
    for (var i = 0u; i < count; i = i + 1u) {
        color = color + shade_point(u.point_lights[i], in.world_position, n, to_eye, albedo, 0.0, 1.0);
    }
    return vec4<f32>(color, 1.0);
}
"#
);

type TerrainQuery = (&'static Transform, &'static mut Terrain);

/// Draws the active level of detail of each [`Terrain`] with a single call.
///
/// `update` picks the level from the patch's distance to the camera.
pub struct TerrainRenderSystem {
    program: Arc<ShaderProgram>,
    query: QueryState<TerrainQuery>,
}

impl TerrainRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
    ) -> EngineResult<Self> {
        Ok(Self {
            program: resources.shaders.get(backend, ShaderKind::Terrain)?,
            query: world.query::<TerrainQuery>(),
        })
    }
}

impl RenderSystem for TerrainRenderSystem {
    fn name(&self) -> &'static str {
        "Terrain"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Terrain
    }

    fn update(&mut self, _dt: f32, scene: &mut Scene) {
        let eye = scene.camera.position();
        for (transform, mut terrain) in self.query.iter_mut(&mut scene.registry) {
            let distance = transform.position.distance(eye);
            let before = terrain.active_lod();
            terrain.select_lod(distance);
            if terrain.active_lod() != before {
                log::debug!("Terrain switched to LOD {}", terrain.active_lod());
            }
        }
    }

    fn render_state(&self) -> RenderState {
        RenderState::ENGINE_DEFAULT.with_cull_mode(CullMode::Back)
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _siblings: &mut Siblings<'_>) -> EngineResult<()> {
        let scene = ctx.scene;
        let program = &self.program;
        program.bind(ctx.backend);
        set_view_uniforms(program, ctx.backend, &ctx.view)?;
        set_light_uniforms(program, ctx.backend, scene, MAX_FORWARD_POINT_LIGHTS)?;

        for (transform, terrain) in self.query.iter(&scene.registry) {
            let Some(mesh) = terrain.active_mesh() else {
                continue;
            };
            let texture = ctx.resources.textures.get_key(ctx.backend, &terrain.texture)?;
            program.bind_texture(ctx.backend, "terrain_texture", texture.handle)?;
            program.set_uniform(ctx.backend, "model", transform.matrix())?;
            program.set_uniform(
                ctx.backend,
                "terrain_params",
                Vec4::new(terrain.tiling, 0.0, 0.0, 0.0),
            )?;
            mesh.bind(ctx.backend);
            mesh.draw(ctx.backend, 0..1);
        }
        Ok(())
    }
}
