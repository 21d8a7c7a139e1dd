//! Forward-lit static meshes

use std::sync::Arc;

use bevy_ecs::prelude::*;

use crate::backend::{BlendState, CullMode, GraphicsBackend, RenderState};
use crate::error::EngineResult;
use crate::resources::{Material, ResourceManagers, ShaderKind, ShaderProgram, ShaderSource};
use crate::scene::{Model, Transform};

use super::{
    bind_material, resolve_material, set_light_uniforms, set_view_uniforms, RenderContext,
    RenderSystem, RenderSystemKind, Siblings, MAX_FORWARD_POINT_LIGHTS,
};

pub const MODEL_SHADER: ShaderSource = ShaderSource {
    label: "model",
    wgsl: MODEL_WGSL,
    uniforms: &[
        "view_proj",
        "model",
        "normal_matrix",
        "camera_position",
        "clip_plane",
        "material_tint",
        "material_params",
        "ambient",
        "directional",
        "num_point_lights",
        "point_lights",
    ],
    textures: &["diffuse_texture"],
};

const MODEL_WGSL: &str = concat!(
    wgsl_lighting!(),
    r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    model: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
    camera_position: vec4<f32>,
    clip_plane: vec4<f32>,
    material_tint: vec4<f32>,
    // x = specular, y = shininess, z = fake lighting
    material_params: vec4<f32>,
    ambient: vec4<f32>,
    directional: DirectionalLight,
    num_point_lights: u32,
    point_lights: array<PointLight, 8>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var diffuse_texture: texture_2d<f32>;

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
    var n = (u.normal_matrix * vec4<f32>(normal, 0.0)).xyz;
    if (u.material_params.z > 0.5) {
        n = vec3<f32>(0.0, 1.0, 0.0);
    }
    out.normal = n;
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let texel = textureSampleLevel(diffuse_texture, tex_sampler, in.uv, 0.0) * u.material_tint;
    if (dot(vec4<f32>(in.world_position, 1.0), u.clip_plane) < 0.0 || texel.a < 0.1) {
        discard;
    }

    let n = normalize(in.normal);
    let to_eye = normalize(u.camera_position.xyz - in.world_position);
    let spec = u.material_params.x;
    let shininess = u.material_params.y;

    var color = u.ambient.xyz * texel.rgb;
    color = color + shade_directional(u.directional, n, to_eye, texel.rgb, spec, shininess);
    let count = min(u.num_point_lights, 8u);
    for (var i = 0u; i < count; i = i + 1u) {
        color = color + shade_point(u.point_lights[i], in.world_position, n, to_eye, texel.rgb, spec, shininess);
    }
    return vec4<f32>(color, texel.a);
}
"#
);

type ModelQuery = (
    &'static Model,
    &'static Transform,
    Option<&'static Material>,
);

/// Draws every entity holding a [`Model`] and a [`Transform`], one indexed draw each
pub struct ModelRenderSystem {
    program: Arc<ShaderProgram>,
    query: QueryState<ModelQuery>,
}

impl ModelRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
    ) -> EngineResult<Self> {
        Ok(Self {
            program: resources.shaders.get(backend, ShaderKind::Model)?,
            query: world.query::<ModelQuery>(),
        })
    }
}

impl RenderSystem for ModelRenderSystem {
    fn name(&self) -> &'static str {
        "Model"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Model
    }

    fn render_state(&self) -> RenderState {
        RenderState::ENGINE_DEFAULT.with_cull_mode(CullMode::Back)
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _siblings: &mut Siblings<'_>) -> EngineResult<()> {
        let opaque = self.render_state();
        // Transparent surfaces are seen from both sides
        let transparent = opaque
            .with_blend(BlendState::alpha_blending())
            .with_cull_mode(CullMode::None);

        let scene = ctx.scene;
        let program = &self.program;
        program.bind(ctx.backend);
        set_view_uniforms(program, ctx.backend, &ctx.view)?;
        set_light_uniforms(program, ctx.backend, scene, MAX_FORWARD_POINT_LIGHTS)?;

        for (model, transform, material) in self.query.iter(&scene.registry) {
            let material = resolve_material(material, &model.mesh);
            let state = if material.transparent { transparent } else { opaque };
            if ctx.backend.render_state() != state {
                ctx.backend.set_render_state(state);
            }

            bind_material(program, ctx.backend, &mut ctx.resources.textures, &material)?;
            program.set_uniform(ctx.backend, "model", transform.matrix())?;
            program.set_uniform(ctx.backend, "normal_matrix", transform.normal_matrix())?;
            model.mesh.bind(ctx.backend);
            model.mesh.draw(ctx.backend, 0..1);
        }
        Ok(())
    }
}
