//! Cubemap sky and the sun billboard

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::Vec4;

use crate::backend::{BlendState, CompareFunction, GraphicsBackend, RenderState};
use crate::error::EngineResult;
use crate::resources::{BuiltinMesh, GpuMesh, ResourceManagers, ShaderKind, ShaderProgram, ShaderSource};
use crate::scene::{Camera, Skybox};

use super::{RenderContext, RenderSystem, RenderSystemKind, Siblings};

pub const SKYBOX_SHADER: ShaderSource = ShaderSource {
    label: "skybox",
    wgsl: SKYBOX_WGSL,
    uniforms: &["view_proj"],
    textures: &["skybox_texture"],
};

const SKYBOX_WGSL: &str = r#"
struct Uniforms {
    // Projection times the view without its translation
    view_proj: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var skybox_texture: texture_cube<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) direction: vec3<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> VertexOutput {
    var out: VertexOutput;
    let clip = u.view_proj * vec4<f32>(position, 1.0);
    // z = w puts the sky on the far plane
    out.clip_position = clip.xyww;
    out.direction = position;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSampleLevel(skybox_texture, tex_sampler, normalize(in.direction), 0.0);
}
"#;

pub const SUN_SHADER: ShaderSource = ShaderSource {
    label: "sun",
    wgsl: SUN_WGSL,
    uniforms: &["view_proj", "center", "camera_right", "camera_up"],
    textures: &["sun_texture"],
};

const SUN_WGSL: &str = r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    // xyz = world position, w = billboard size
    center: vec4<f32>,
    camera_right: vec4<f32>,
    camera_up: vec4<f32>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var sun_texture: texture_2d<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) uv: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    let world = u.center.xyz
        + (u.camera_right.xyz * position.x + u.camera_up.xyz * position.y) * u.center.w;
    let clip = u.view_proj * vec4<f32>(world, 1.0);
    out.clip_position = clip.xyww;
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSampleLevel(sun_texture, tex_sampler, in.uv, 0.0);
}
"#;

/// Right and up axes of the camera in world space
pub(crate) fn billboard_axes(camera: &Camera) -> (Vec4, Vec4) {
    let view = camera.view_matrix();
    let right = Vec4::new(view.x_axis.x, view.y_axis.x, view.z_axis.x, 0.0);
    let up = Vec4::new(view.x_axis.y, view.y_axis.y, view.z_axis.y, 0.0);
    (right, up)
}

/// Draws each [`Skybox`] cubemap behind all other geometry, then the sun
/// billboard when the scene's directional light is a sun
pub struct SkyboxRenderSystem {
    program: Arc<ShaderProgram>,
    sun_program: Arc<ShaderProgram>,
    cube: Arc<GpuMesh>,
    quad: Arc<GpuMesh>,
    query: QueryState<&'static Skybox>,
}

impl SkyboxRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
    ) -> EngineResult<Self> {
        Ok(Self {
            program: resources.shaders.get(backend, ShaderKind::Skybox)?,
            sun_program: resources.shaders.get(backend, ShaderKind::Sun)?,
            cube: resources.meshes.builtin(backend, BuiltinMesh::Cube)?,
            quad: resources.meshes.builtin(backend, BuiltinMesh::Quad)?,
            query: world.query::<&Skybox>(),
        })
    }

    fn render_sun(&self, ctx: &mut RenderContext<'_>) -> EngineResult<()> {
        let scene = ctx.scene;
        let Some(billboard) = scene.directional.as_ref().and_then(|d| d.billboard()) else {
            return Ok(());
        };
        let texture = ctx.resources.textures.get_key(ctx.backend, &billboard.texture)?;
        let camera = &ctx.view.camera;
        let (right, up) = billboard_axes(camera);
        let center = (camera.position() + billboard.offset).extend(billboard.scale);

        ctx.backend
            .set_render_state(self.render_state().with_blend(BlendState::additive()));
        let program = &self.sun_program;
        program.bind(ctx.backend);
        program.bind_texture(ctx.backend, "sun_texture", texture.handle)?;
        program.set_uniform(ctx.backend, "view_proj", camera.view_projection_matrix())?;
        program.set_uniform(ctx.backend, "center", center)?;
        program.set_uniform(ctx.backend, "camera_right", right)?;
        program.set_uniform(ctx.backend, "camera_up", up)?;
        self.quad.bind(ctx.backend);
        self.quad.draw(ctx.backend, 0..1);
        Ok(())
    }
}

impl RenderSystem for SkyboxRenderSystem {
    fn name(&self) -> &'static str {
        "Skybox"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Skybox
    }

    /// Passes at the far plane without writing depth
    fn render_state(&self) -> RenderState {
        RenderState::ENGINE_DEFAULT
            .with_depth_compare(CompareFunction::LessEqual)
            .with_depth_write(false)
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _siblings: &mut Siblings<'_>) -> EngineResult<()> {
        let scene = ctx.scene;
        let camera = ctx.view.camera;
        let view_proj = camera.projection_matrix() * camera.rotation_only_view();

        let program = &self.program;
        program.bind(ctx.backend);
        program.set_uniform(ctx.backend, "view_proj", view_proj)?;
        for skybox in self.query.iter(&scene.registry) {
            let cubemap = ctx.resources.textures.get_key(ctx.backend, &skybox.cubemap)?;
            program.bind_texture(ctx.backend, "skybox_texture", cubemap.handle)?;
            self.cube.bind(ctx.backend);
            self.cube.draw(ctx.backend, 0..1);
        }

        self.render_sun(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_billboard_axes_are_orthonormal() {
        let camera = Camera::look_at(Vec3::new(3.0, 2.0, 5.0), Vec3::ZERO);
        let (right, up) = billboard_axes(&camera);
        assert!((right.length() - 1.0).abs() < 1e-5);
        assert!((up.length() - 1.0).abs() < 1e-5);
        assert!(right.dot(up).abs() < 1e-5);
        assert!(right.truncate().dot(camera.forward()).abs() < 1e-5);
    }
}
