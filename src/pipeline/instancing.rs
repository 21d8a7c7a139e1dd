//! Many copies of one mesh per draw call

use std::sync::Arc;

use bevy_ecs::prelude::*;

use crate::backend::{CullMode, GraphicsBackend, RenderState};
use crate::error::EngineResult;
use crate::resources::{Material, ResourceManagers, ShaderKind, ShaderProgram, ShaderSource};
use crate::scene::Instanced;

use super::{
    bind_material, resolve_material, set_light_uniforms, set_view_uniforms, InstanceBatch,
    InstanceBuffer, InstanceTransform, RenderContext, RenderSystem, RenderSystemKind, Siblings,
    MAX_FORWARD_POINT_LIGHTS,
};

pub const INSTANCING_SHADER: ShaderSource = ShaderSource {
    label: "instancing",
    wgsl: INSTANCING_WGSL,
    uniforms: &[
        "view_proj",
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

const INSTANCING_WGSL: &str = concat!(
    wgsl_lighting!(),
    r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    clip_plane: vec4<f32>,
    material_tint: vec4<f32>,
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
    @location(4) model_0: vec4<f32>,
    @location(5) model_1: vec4<f32>,
    @location(6) model_2: vec4<f32>,
    @location(7) model_3: vec4<f32>,
) -> VertexOutput {
    let model = mat4x4<f32>(model_0, model_1, model_2, model_3);
    var out: VertexOutput;
    let world = model * vec4<f32>(position, 1.0);
    out.world_position = world.xyz;
    out.clip_position = u.view_proj * world;
    var n = (model * vec4<f32>(normal, 0.0)).xyz;
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

type InstancedQuery = (&'static Instanced, Option<&'static Material>);

/// Draws each [`Instanced`] entity with one indexed call, instance count taken
/// from the component's transform list
pub struct InstancingRenderSystem {
    program: Arc<ShaderProgram>,
    query: QueryState<InstancedQuery>,
    instances: InstanceBuffer<InstanceTransform>,
}

impl InstancingRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
    ) -> EngineResult<Self> {
        Ok(Self {
            program: resources.shaders.get(backend, ShaderKind::Instancing)?,
            query: world.query::<InstancedQuery>(),
            instances: InstanceBuffer::new("instancing"),
        })
    }
}

impl RenderSystem for InstancingRenderSystem {
    fn name(&self) -> &'static str {
        "Instancing"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Instancing
    }

    fn begin_frame(&mut self) {
        self.instances.begin_frame();
    }

    fn render_state(&self) -> RenderState {
        RenderState::ENGINE_DEFAULT.with_cull_mode(CullMode::Back)
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _siblings: &mut Siblings<'_>) -> EngineResult<()> {
        let scene = ctx.scene;

        let mut batch = InstanceBatch::new();
        for (instanced, _) in self.query.iter(&scene.registry) {
            batch.push(instanced.instances.iter().map(InstanceTransform::from));
        }
        if batch.data().is_empty() {
            return Ok(());
        }
        let base = self.instances.upload(ctx.backend, batch.data())?;

        let program = &self.program;
        program.bind(ctx.backend);
        set_view_uniforms(program, ctx.backend, &ctx.view)?;
        set_light_uniforms(program, ctx.backend, scene, MAX_FORWARD_POINT_LIGHTS)?;

        let entities = self.query.iter(&scene.registry);
        for ((instanced, material), range) in entities.zip(batch.ranges_from(base)) {
            if range.is_empty() {
                continue;
            }
            let material = resolve_material(material, &instanced.mesh);
            bind_material(program, ctx.backend, &mut ctx.resources.textures, &material)?;
            instanced.mesh.bind(ctx.backend);
            self.instances.bind(ctx.backend);
            instanced.mesh.draw(ctx.backend, range);
        }
        Ok(())
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.instances.release(backend);
    }
}
