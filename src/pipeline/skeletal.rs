//! Skinned meshes

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::Mat4;

use crate::backend::{CullMode, GraphicsBackend, RenderState, UniformValue};
use crate::error::EngineResult;
use crate::resources::{Material, ResourceManagers, ShaderKind, ShaderProgram, ShaderSource};
use crate::scene::{SkeletalMesh, Transform};

use super::{
    bind_material, resolve_material, set_light_uniforms, set_view_uniforms, RenderContext,
    RenderSystem, RenderSystemKind, Siblings, MAX_FORWARD_POINT_LIGHTS,
};

/// Bone matrices uploaded per draw
pub const MAX_BONES: usize = 64;

pub const SKELETAL_SHADER: ShaderSource = ShaderSource {
    label: "skeletal",
    wgsl: SKELETAL_WGSL,
    uniforms: &[
        "view_proj",
        "model",
        "camera_position",
        "clip_plane",
        "material_tint",
        "material_params",
        "ambient",
        "directional",
        "num_point_lights",
        "point_lights",
        "bones",
    ],
    textures: &["diffuse_texture"],
};

const SKELETAL_WGSL: &str = concat!(
    wgsl_lighting!(),
    r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    model: mat4x4<f32>,
    camera_position: vec4<f32>,
    clip_plane: vec4<f32>,
    material_tint: vec4<f32>,
    material_params: vec4<f32>,
    ambient: vec4<f32>,
    directional: DirectionalLight,
    num_point_lights: u32,
    point_lights: array<PointLight, 8>,
    bones: array<mat4x4<f32>, 64>,
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
    @location(3) joints: vec4<u32>,
    @location(4) weights: vec4<f32>,
) -> VertexOutput {
    let skin = u.bones[min(joints.x, 63u)] * weights.x
        + u.bones[min(joints.y, 63u)] * weights.y
        + u.bones[min(joints.z, 63u)] * weights.z
        + u.bones[min(joints.w, 63u)] * weights.w;
    let model = u.model * skin;

    var out: VertexOutput;
    let world = model * vec4<f32>(position, 1.0);
    out.world_position = world.xyz;
    out.clip_position = u.view_proj * world;
    out.normal = (model * vec4<f32>(normal, 0.0)).xyz;
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let texel = textureSampleLevel(diffuse_texture, tex_sampler, in.uv, 0.0) * u.material_tint;
    if (dot(vec4<f32>(in.world_position, 1.0), u.clip_plane) < 0.0) {
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

/// Bone palette padded with identities to [`MAX_BONES`]
pub(crate) fn pack_bones(bones: &[Mat4]) -> Vec<u8> {
    if bones.len() > MAX_BONES {
        log::warn!(
            "Skeleton has {} bones, only the first {} are uploaded",
            bones.len(),
            MAX_BONES
        );
    }
    let mut palette = [Mat4::IDENTITY; MAX_BONES];
    for (slot, bone) in palette.iter_mut().zip(bones) {
        *slot = *bone;
    }
    bytemuck::cast_slice(&palette).to_vec()
}

type SkeletalQuery = (
    &'static SkeletalMesh,
    &'static Transform,
    Option<&'static Material>,
);

/// Draws each [`SkeletalMesh`] with its bone matrices.
///
/// The matrices come from the animation collaborator and are uploaded
/// unchanged with every draw.
pub struct SkeletalRenderSystem {
    program: Arc<ShaderProgram>,
    query: QueryState<SkeletalQuery>,
}

impl SkeletalRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
    ) -> EngineResult<Self> {
        Ok(Self {
            program: resources.shaders.get(backend, ShaderKind::Skeletal)?,
            query: world.query::<SkeletalQuery>(),
        })
    }
}

impl RenderSystem for SkeletalRenderSystem {
    fn name(&self) -> &'static str {
        "Skeletal"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Skeletal
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

        for (skinned, transform, material) in self.query.iter(&scene.registry) {
            let material = resolve_material(material, &skinned.mesh);
            bind_material(program, ctx.backend, &mut ctx.resources.textures, &material)?;
            program.set_uniform(ctx.backend, "model", transform.matrix())?;
            program.set_uniform(
                ctx.backend,
                "bones",
                UniformValue::Bytes(pack_bones(&skinned.bone_matrices)),
            )?;
            skinned.mesh.bind(ctx.backend);
            skinned.mesh.draw(ctx.backend, 0..1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_pack_bones_pads_with_identity() {
        let bones = [Mat4::from_translation(Vec3::X)];
        let bytes = pack_bones(&bones);
        assert_eq!(bytes.len(), MAX_BONES * 64);
        let first: Mat4 = bytemuck::pod_read_unaligned(&bytes[..64]);
        let second: Mat4 = bytemuck::pod_read_unaligned(&bytes[64..128]);
        assert_eq!(first, bones[0]);
        assert_eq!(second, Mat4::IDENTITY);
    }

    #[test]
    fn test_pack_bones_truncates_long_skeletons() {
        let bones = vec![Mat4::IDENTITY; MAX_BONES + 10];
        assert_eq!(pack_bones(&bones).len(), MAX_BONES * 64);
    }
}
