//! Planar water with reflection and refraction captures
//!
//! Each water surface renders the scene twice off-screen before drawing
//! itself. The reflection capture mirrors the camera across the surface and
//! keeps only geometry above it. The refraction capture keeps the original
//! camera and only geometry below. Both run the captured sibling systems
//! with a modified [`FrameView`], so the scene's own camera and clip plane
//! are never touched.

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::Vec4;

use crate::backend::{BlendState, ClearRequest, GraphicsBackend, RenderState};
use crate::error::EngineResult;
use crate::framebuffer::FrameBufferTarget;
use crate::resources::{BuiltinMesh, GpuMesh, ResourceManagers, ShaderKind, ShaderProgram, ShaderSource};
use crate::scene::{ClipPlane, FrameView, Scene, Water};

use super::{
    set_light_uniforms, set_view_uniforms, RenderContext, RenderSystem, RenderSystemKind,
    Siblings, SystemId, MAX_FORWARD_POINT_LIGHTS,
};

pub const WATER_SHADER: ShaderSource = ShaderSource {
    label: "water",
    wgsl: WATER_WGSL,
    uniforms: &[
        "view_proj",
        "model",
        "camera_position",
        "clip_plane",
        "water_params",
        "ambient",
        "directional",
        "num_point_lights",
        "point_lights",
    ],
    textures: &[
        "reflection_texture",
        "refraction_texture",
        "refraction_depth",
        "dudv_map",
        "normal_map",
    ],
};

const WATER_WGSL: &str = concat!(
    wgsl_lighting!(),
    r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    model: mat4x4<f32>,
    camera_position: vec4<f32>,
    clip_plane: vec4<f32>,
    // x = move factor, y = wave strength, z = near plane, w = far plane
    water_params: vec4<f32>,
    ambient: vec4<f32>,
    directional: DirectionalLight,
    num_point_lights: u32,
    point_lights: array<PointLight, 8>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var reflection_texture: texture_2d<f32>;
@group(1) @binding(2) var refraction_texture: texture_2d<f32>;
@group(1) @binding(3) var refraction_depth: texture_depth_2d;
@group(1) @binding(4) var dudv_map: texture_2d<f32>;
@group(1) @binding(5) var normal_map: texture_2d<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) clip: vec4<f32>,
    @location(2) uv: vec2<f32>,
}

fn linear_depth(depth: f32) -> f32 {
    let near = u.water_params.z;
    let far = u.water_params.w;
    return near * far / (far - depth * (far - near));
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) uv: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    let world = u.model * vec4<f32>(position, 1.0);
    out.world_position = world.xyz;
    out.clip_position = u.view_proj * world;
    out.clip = out.clip_position;
    out.uv = uv * 6.0;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let ndc = in.clip.xy / in.clip.w;
    let screen = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);

    // Soften the shoreline using the depth behind the surface
    let depth_size = vec2<f32>(textureDimensions(refraction_depth));
    let texel = vec2<i32>(clamp(screen * depth_size, vec2<f32>(0.0), depth_size - 1.0));
    let floor_distance = linear_depth(textureLoad(refraction_depth, texel, 0));
    let surface_distance = linear_depth(in.clip_position.z);
    let water_depth = floor_distance - surface_distance;
    let edge = clamp(water_depth / 5.0, 0.0, 1.0);

    let move_factor = u.water_params.x;
    let strength = u.water_params.y;
    var distortion = textureSampleLevel(dudv_map, tex_sampler, vec2<f32>(in.uv.x + move_factor, in.uv.y), 0.0).rg * 0.1;
    distortion = in.uv + vec2<f32>(distortion.x, distortion.y + move_factor);
    let total = (textureSampleLevel(dudv_map, tex_sampler, distortion, 0.0).rg * 2.0 - 1.0) * strength * edge;

    let reflect_uv = clamp(vec2<f32>(screen.x, 1.0 - screen.y) + total, vec2<f32>(0.001), vec2<f32>(0.999));
    let refract_uv = clamp(screen + total, vec2<f32>(0.001), vec2<f32>(0.999));
    let reflection = textureSampleLevel(reflection_texture, tex_sampler, reflect_uv, 0.0);
    let refraction = textureSampleLevel(refraction_texture, tex_sampler, refract_uv, 0.0);

    let normal_sample = textureSampleLevel(normal_map, tex_sampler, distortion, 0.0);
    let n = normalize(vec3<f32>(normal_sample.r * 2.0 - 1.0, normal_sample.b * 3.0, normal_sample.g * 2.0 - 1.0));

    let to_eye = normalize(u.camera_position.xyz - in.world_position);
    let fresnel = clamp(pow(max(dot(to_eye, vec3<f32>(0.0, 1.0, 0.0)), 0.0), 0.5), 0.0, 1.0);

    var color = mix(reflection, refraction, vec4<f32>(fresnel));
    color = mix(color, vec4<f32>(0.0, 0.3, 0.5, 1.0), vec4<f32>(0.2));
    let highlights = shade_directional(u.directional, n, to_eye, vec3<f32>(0.0), 0.6 * edge, 20.0);
    return vec4<f32>(color.rgb + highlights, edge);
}
"#
);

/// Sizes of the capture targets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaterConfig {
    pub width: u32,
    pub height: u32,
    /// Reflection resolution relative to the window
    pub reflection_scale: f32,
    pub wave_strength: f32,
}

impl WaterConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            reflection_scale: 0.5,
            wave_strength: 0.02,
        }
    }

    pub fn with_reflection_scale(mut self, scale: f32) -> Self {
        self.reflection_scale = scale;
        self
    }

    fn reflection_size(&self) -> (u32, u32) {
        (
            (self.width as f32 * self.reflection_scale).round() as u32,
            (self.height as f32 * self.reflection_scale).round() as u32,
        )
    }
}

/// Views for the two captures of a surface at `height`
pub(crate) fn capture_views(base: FrameView, height: f32) -> (FrameView, FrameView) {
    let reflection = FrameView::new(base.camera.reflected_across(height), ClipPlane::above(height));
    let refraction = base.with_clip_plane(ClipPlane::below(height));
    (reflection, refraction)
}

/// Draws each [`Water`] surface after capturing its reflection and refraction.
///
/// The captured systems are the siblings named by [`WaterRenderSystem::capturing`],
/// rendered in the order given.
pub struct WaterRenderSystem {
    program: Arc<ShaderProgram>,
    surface: Arc<GpuMesh>,
    query: QueryState<&'static mut Water>,
    reflection: FrameBufferTarget,
    refraction: FrameBufferTarget,
    captured: Vec<SystemId>,
    config: WaterConfig,
}

impl WaterRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
        config: WaterConfig,
    ) -> EngineResult<Self> {
        let program = resources.shaders.get(backend, ShaderKind::Water)?;
        let surface = resources.meshes.builtin(backend, BuiltinMesh::Plane)?;

        let (reflect_width, reflect_height) = config.reflection_size();
        let mut reflection = FrameBufferTarget::water_reflection(backend, reflect_width, reflect_height)?;
        let refraction = match FrameBufferTarget::water_refraction(backend, config.width, config.height) {
            Ok(target) => target,
            Err(err) => {
                reflection.release(backend);
                return Err(err);
            }
        };

        Ok(Self {
            program,
            surface,
            query: world.query::<&mut Water>(),
            reflection,
            refraction,
            captured: Vec::new(),
            config,
        })
    }

    /// Systems re-rendered into both captures
    pub fn capturing(mut self, systems: impl IntoIterator<Item = SystemId>) -> Self {
        self.captured = systems.into_iter().collect();
        self
    }

    pub fn reflection_target(&self) -> &FrameBufferTarget {
        &self.reflection
    }

    pub fn refraction_target(&self) -> &FrameBufferTarget {
        &self.refraction
    }

    fn capture(
        target: &mut FrameBufferTarget,
        captured: &[SystemId],
        view: FrameView,
        ctx: &mut RenderContext<'_>,
        siblings: &mut Siblings<'_>,
    ) -> EngineResult<()> {
        target.bind_as_render_target(ctx.backend);
        ctx.backend.clear(ClearRequest::color_and_depth(ctx.clear_color));
        let result = siblings.render(captured, &mut ctx.capture(view));
        target.unbind_render_target(ctx.backend, ctx.app_viewport);
        result
    }

    fn draw_surface(&self, ctx: &mut RenderContext<'_>, water: &Water) -> EngineResult<()> {
        let textures = &mut ctx.resources.textures;
        let dudv = textures.get_key(ctx.backend, &water.dudv_map)?;
        let normal = textures.get_key(ctx.backend, &water.normal_map)?;
        let (Some(reflection), Some(refraction), Some(depth)) = (
            self.reflection.color_texture(0),
            self.refraction.color_texture(0),
            self.refraction.depth_texture(),
        ) else {
            return Ok(());
        };

        let projection = ctx.view.camera.projection;
        let program = &self.program;
        ctx.backend.set_render_state(self.render_state());
        program.bind(ctx.backend);
        program.bind_texture(ctx.backend, "reflection_texture", reflection)?;
        program.bind_texture(ctx.backend, "refraction_texture", refraction)?;
        program.bind_texture(ctx.backend, "refraction_depth", depth)?;
        program.bind_texture(ctx.backend, "dudv_map", dudv.handle)?;
        program.bind_texture(ctx.backend, "normal_map", normal.handle)?;
        set_view_uniforms(program, ctx.backend, &ctx.view)?;
        set_light_uniforms(program, ctx.backend, ctx.scene, MAX_FORWARD_POINT_LIGHTS)?;
        program.set_uniform(ctx.backend, "model", water.model_matrix())?;
        program.set_uniform(
            ctx.backend,
            "water_params",
            Vec4::new(
                water.move_factor,
                self.config.wave_strength,
                projection.near,
                projection.far,
            ),
        )?;
        self.surface.bind(ctx.backend);
        self.surface.draw(ctx.backend, 0..1);
        Ok(())
    }
}

impl RenderSystem for WaterRenderSystem {
    fn name(&self) -> &'static str {
        "Water"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Water
    }

    fn update(&mut self, dt: f32, scene: &mut Scene) {
        for mut water in self.query.iter_mut(&mut scene.registry) {
            water.advance(dt);
        }
    }

    fn render_state(&self) -> RenderState {
        RenderState::ENGINE_DEFAULT.with_blend(BlendState::alpha_blending())
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, siblings: &mut Siblings<'_>) -> EngineResult<()> {
        // Water is not visible in its own captures
        if ctx.capture {
            return Ok(());
        }

        let scene = ctx.scene;
        let surfaces: Vec<Water> = self.query.iter(&scene.registry).cloned().collect();
        for water in &surfaces {
            let (reflected, refracted) = capture_views(ctx.view, water.height);
            log::trace!("Capturing water at height {}", water.height);
            Self::capture(&mut self.reflection, &self.captured, reflected, ctx, siblings)?;
            Self::capture(&mut self.refraction, &self.captured, refracted, ctx, siblings)?;
            self.draw_surface(ctx, water)?;
        }
        Ok(())
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.reflection.release(backend);
        self.refraction.release(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Camera;
    use glam::Vec3;

    #[test]
    fn test_capture_views_leave_base_untouched() {
        let base = FrameView::new(
            Camera::first_person(Vec3::new(0.0, 20.0, 0.0), 0.0, -0.4),
            ClipPlane::DISABLED,
        );
        let (reflection, refraction) = capture_views(base, 10.0);

        assert_eq!(reflection.camera.position().y, 0.0);
        assert_eq!(reflection.camera.pitch(), 0.4);
        assert_eq!(reflection.clip_plane, ClipPlane::above(10.0));
        assert_eq!(refraction.camera, base.camera);
        assert_eq!(refraction.clip_plane, ClipPlane::below(10.0));
        assert_eq!(base.clip_plane, ClipPlane::DISABLED);
    }

    #[test]
    fn test_reflection_target_is_scaled() {
        let config = WaterConfig::new(1280, 720);
        assert_eq!(config.reflection_size(), (640, 360));
        assert_eq!(config.with_reflection_scale(1.0).reflection_size(), (1280, 720));
    }
}
