//! Deferred shading
//!
//! The geometry pass writes world position, normal and albedo+specular of
//! every model into the G-buffer. The lighting pass then shades one
//! fullscreen quad from those attachments, so lighting cost depends on the
//! pixel count rather than on the scene. Only one shininess value is used
//! for every surface; the G-buffer has no room for more.

use std::sync::Arc;

use bevy_ecs::prelude::*;

use crate::backend::{ClearRequest, CompareFunction, CullMode, GraphicsBackend, RenderState};
use crate::error::EngineResult;
use crate::framebuffer::FrameBufferTarget;
use crate::resources::{
    BuiltinMesh, GpuMesh, Material, ResourceManagers, ShaderKind, ShaderProgram, ShaderSource,
};
use crate::scene::{Model, Skydome, Transform};

use super::{
    bind_material, resolve_material, set_light_uniforms, RenderContext, RenderSystem,
    RenderSystemKind, Siblings,
};

/// Point lights shaded by the lighting pass
pub const MAX_DEFERRED_POINT_LIGHTS: usize = 32;

pub const GBUFFER_SHADER: ShaderSource = ShaderSource {
    label: "gbuffer",
    wgsl: GBUFFER_WGSL,
    uniforms: &[
        "view_proj",
        "model",
        "normal_matrix",
        "clip_plane",
        "material_tint",
        "material_params",
    ],
    textures: &["diffuse_texture"],
};

const GBUFFER_WGSL: &str = r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    model: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
    clip_plane: vec4<f32>,
    material_tint: vec4<f32>,
    material_params: vec4<f32>,
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

struct GBufferOutput {
    @location(0) position: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) albedo_spec: vec4<f32>,
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
fn fs_main(in: VertexOutput) -> GBufferOutput {
    let texel = textureSampleLevel(diffuse_texture, tex_sampler, in.uv, 0.0) * u.material_tint;
    if (dot(vec4<f32>(in.world_position, 1.0), u.clip_plane) < 0.0 || texel.a < 0.1) {
        discard;
    }
    var out: GBufferOutput;
    // w = 1 marks covered pixels
    out.position = vec4<f32>(in.world_position, 1.0);
    out.normal = vec4<f32>(normalize(in.normal), 0.0);
    out.albedo_spec = vec4<f32>(texel.rgb, u.material_params.x);
    return out;
}
"#;

pub const LIGHTING_SHADER: ShaderSource = ShaderSource {
    label: "deferred_lighting",
    wgsl: LIGHTING_WGSL,
    uniforms: &[
        "view_proj",
        "camera_position",
        "ambient",
        "shininess",
        "directional",
        "num_point_lights",
        "point_lights",
    ],
    textures: &["gbuffer_position", "gbuffer_normal", "gbuffer_albedo_spec"],
};

const LIGHTING_WGSL: &str = concat!(
    wgsl_lighting!(),
    r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    ambient: vec4<f32>,
    directional: DirectionalLight,
    shininess: f32,
    num_point_lights: u32,
    point_lights: array<PointLight, 32>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var gbuffer_position: texture_2d<f32>;
@group(1) @binding(2) var gbuffer_normal: texture_2d<f32>;
@group(1) @binding(3) var gbuffer_albedo_spec: texture_2d<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
}

struct LightingOutput {
    @location(0) color: vec4<f32>,
    @builtin(frag_depth) depth: f32,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(position.xy, 0.0, 1.0);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> LightingOutput {
    let pixel = vec2<i32>(in.clip_position.xy);
    let position = textureLoad(gbuffer_position, pixel, 0);
    let normal = textureLoad(gbuffer_normal, pixel, 0).xyz;
    let albedo_spec = textureLoad(gbuffer_albedo_spec, pixel, 0);

    var out: LightingOutput;
    if (position.w < 0.5) {
        // Nothing was drawn here; leave it to later passes
        out.color = vec4<f32>(0.0, 0.0, 0.0, 0.0);
        out.depth = 1.0;
        return out;
    }

    let world = position.xyz;
    let n = normalize(normal);
    let to_eye = normalize(u.camera_position.xyz - world);
    let albedo = albedo_spec.rgb;
    let spec = albedo_spec.a;

    var color = u.ambient.xyz * albedo;
    color = color + shade_directional(u.directional, n, to_eye, albedo, spec, u.shininess);
    let count = min(u.num_point_lights, 32u);
    for (var i = 0u; i < count; i = i + 1u) {
        color = color + shade_point(u.point_lights[i], world, n, to_eye, albedo, spec, u.shininess);
    }

    // Depth from the G-buffer so later forward passes composite correctly
    let clip = u.view_proj * vec4<f32>(world, 1.0);
    out.color = vec4<f32>(color, 1.0);
    out.depth = clamp(clip.z / clip.w, 0.0, 1.0);
    return out;
}
"#
);

type GeometryQuery = (
    &'static Model,
    &'static Transform,
    Option<&'static Material>,
);

/// Geometry pass into a G-buffer followed by a fullscreen lighting pass.
///
/// Entities marked [`Skydome`] are left out of the G-buffer.
pub struct DeferredRenderSystem {
    geometry: Arc<ShaderProgram>,
    lighting: Arc<ShaderProgram>,
    gbuffer: FrameBufferTarget,
    screen_quad: Arc<GpuMesh>,
    query: QueryState<GeometryQuery, Without<Skydome>>,
    shininess: f32,
}

impl DeferredRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> EngineResult<Self> {
        let geometry = resources.shaders.get(backend, ShaderKind::GBuffer)?;
        let lighting = resources.shaders.get(backend, ShaderKind::DeferredLighting)?;
        let screen_quad = resources.meshes.builtin(backend, BuiltinMesh::FullscreenQuad)?;
        let gbuffer = FrameBufferTarget::gbuffer(backend, width, height)?;

        Ok(Self {
            geometry,
            lighting,
            gbuffer,
            screen_quad,
            query: world.query_filtered::<GeometryQuery, Without<Skydome>>(),
            shininess: 32.0,
        })
    }

    pub fn with_shininess(mut self, shininess: f32) -> Self {
        self.shininess = shininess;
        self
    }

    pub fn gbuffer(&self) -> &FrameBufferTarget {
        &self.gbuffer
    }

    /// Lighting reads every pixel of the G-buffer and writes its depth back
    fn lighting_state() -> RenderState {
        RenderState::ENGINE_DEFAULT.with_depth_compare(CompareFunction::Always)
    }

    fn geometry_pass(&mut self, ctx: &mut RenderContext<'_>) -> EngineResult<()> {
        let scene = ctx.scene;
        let program = &self.geometry;
        ctx.backend.clear(ClearRequest::color_and_depth([0.0; 4]));
        program.bind(ctx.backend);
        program.set_uniform(ctx.backend, "view_proj", ctx.view.camera.view_projection_matrix())?;
        program.set_uniform(ctx.backend, "clip_plane", ctx.view.clip_plane.as_vec4())?;

        for (model, transform, material) in self.query.iter(&scene.registry) {
            let material = resolve_material(material, &model.mesh);
            bind_material(program, ctx.backend, &mut ctx.resources.textures, &material)?;
            program.set_uniform(ctx.backend, "model", transform.matrix())?;
            program.set_uniform(ctx.backend, "normal_matrix", transform.normal_matrix())?;
            model.mesh.bind(ctx.backend);
            model.mesh.draw(ctx.backend, 0..1);
        }
        Ok(())
    }

    fn lighting_pass(&self, ctx: &mut RenderContext<'_>) -> EngineResult<()> {
        let (Some(position), Some(normal), Some(albedo_spec)) = (
            self.gbuffer.color_texture(0),
            self.gbuffer.color_texture(1),
            self.gbuffer.color_texture(2),
        ) else {
            return Ok(());
        };

        ctx.backend.clear(ClearRequest::color_and_depth(ctx.clear_color));
        ctx.backend.set_render_state(Self::lighting_state());

        let camera = ctx.view.camera;
        let program = &self.lighting;
        program.bind(ctx.backend);
        program.bind_texture(ctx.backend, "gbuffer_position", position)?;
        program.bind_texture(ctx.backend, "gbuffer_normal", normal)?;
        program.bind_texture(ctx.backend, "gbuffer_albedo_spec", albedo_spec)?;
        program.set_uniform(ctx.backend, "view_proj", camera.view_projection_matrix())?;
        program.set_uniform(ctx.backend, "camera_position", camera.position().extend(1.0))?;
        program.set_uniform(ctx.backend, "shininess", self.shininess)?;
        set_light_uniforms(program, ctx.backend, ctx.scene, MAX_DEFERRED_POINT_LIGHTS)?;

        self.screen_quad.bind(ctx.backend);
        self.screen_quad.draw(ctx.backend, 0..1);
        Ok(())
    }
}

impl RenderSystem for DeferredRenderSystem {
    fn name(&self) -> &'static str {
        "Deferred"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Deferred
    }

    /// State of the geometry pass
    fn render_state(&self) -> RenderState {
        RenderState::ENGINE_DEFAULT.with_cull_mode(CullMode::Back)
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _siblings: &mut Siblings<'_>) -> EngineResult<()> {
        // Lighting targets the default framebuffer, which an off-screen capture must not touch
        if ctx.capture {
            log::debug!("Deferred shading skipped inside an off-screen capture");
            return Ok(());
        }

        self.gbuffer.bind_as_render_target(ctx.backend);
        let filled = self.geometry_pass(ctx);
        // The G-buffer is unbound before anything samples it
        self.gbuffer.unbind_render_target(ctx.backend, ctx.app_viewport);
        filled?;

        self.lighting_pass(ctx)
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.gbuffer.release(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, UniformValue, Viewport};
    use crate::scene::{PointLight, Scene};
    use glam::Vec3;

    fn deferred_scene(backend: &mut HeadlessBackend, resources: &mut ResourceManagers) -> Scene {
        let mut scene = Scene::new();
        let cube = resources.meshes.builtin(backend, BuiltinMesh::Cube).unwrap();
        scene.spawn((Model { mesh: cube.clone() }, Transform::default()));
        scene.spawn((Model { mesh: cube }, Transform::default(), Skydome));
        scene.add_point_light(PointLight::new(Vec3::new(0.0, 5.0, 0.0)));
        scene
    }

    #[test]
    fn test_geometry_then_single_lighting_draw() {
        let mut backend = HeadlessBackend::with_surface_size(800, 600);
        let mut resources = ResourceManagers::new();
        let mut scene = deferred_scene(&mut backend, &mut resources);
        let mut system =
            DeferredRenderSystem::new(&mut scene.registry, &mut resources, &mut backend, 800, 600)
                .unwrap();
        let gbuffer = system.gbuffer().handle();

        {
            let mut ctx =
                RenderContext::new(&mut backend, &mut resources, &scene, Viewport::new(800, 600));
            system.render(&mut ctx, &mut Siblings::empty()).unwrap();
        }

        let geometry: Vec<_> = backend.draws_with_program("gbuffer").collect();
        assert_eq!(geometry.len(), 1, "skydome entities stay out of the G-buffer");
        assert_eq!(geometry[0].framebuffer, Some(gbuffer));

        let lighting: Vec<_> = backend.draws_with_program("deferred_lighting").collect();
        assert_eq!(lighting.len(), 1);
        assert_eq!(lighting[0].framebuffer, None);
        assert_eq!(lighting[0].uniform("num_point_lights"), Some(&UniformValue::UInt(1)));
        for index in 0..3 {
            let attachment = system.gbuffer().color_texture(index).unwrap();
            assert!(lighting[0].samples(attachment));
        }
        assert_eq!(backend.bound_framebuffer(), None);

        system.release(&mut backend);
        resources.release_all(&mut backend);
    }

    #[test]
    fn test_capture_skips_deferred_shading() {
        let mut backend = HeadlessBackend::with_surface_size(320, 240);
        let mut resources = ResourceManagers::new();
        let mut scene = deferred_scene(&mut backend, &mut resources);
        let mut system =
            DeferredRenderSystem::new(&mut scene.registry, &mut resources, &mut backend, 320, 240)
                .unwrap();

        {
            let mut ctx =
                RenderContext::new(&mut backend, &mut resources, &scene, Viewport::new(320, 240));
            let view = ctx.view;
            system.render(&mut ctx.capture(view), &mut Siblings::empty()).unwrap();
        }
        assert_eq!(backend.draw_calls().count(), 0);

        system.release(&mut backend);
        resources.release_all(&mut backend);
    }
}
