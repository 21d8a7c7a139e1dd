//! Screen-space textured quads

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat};

use crate::backend::{BlendState, GraphicsBackend, RenderState};
use crate::error::EngineResult;
use crate::resources::{BuiltinMesh, GpuMesh, ResourceManagers, ShaderKind, ShaderProgram, ShaderSource};
use crate::scene::GuiQuad;

use super::{RenderContext, RenderSystem, RenderSystemKind, Siblings};

pub const GUI_SHADER: ShaderSource = ShaderSource {
    label: "gui",
    wgsl: GUI_WGSL,
    uniforms: &["transform", "tint"],
    textures: &["gui_texture"],
};

const GUI_WGSL: &str = r#"
struct Uniforms {
    transform: mat4x4<f32>,
    tint: vec4<f32>,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var gui_texture: texture_2d<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) uv: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = u.transform * vec4<f32>(position.xy, 0.0, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSampleLevel(gui_texture, tex_sampler, in.uv, 0.0) * u.tint;
}
"#;

/// Transform from the unit quad to the quad's place on screen
pub(crate) fn gui_transform(quad: &GuiQuad) -> Mat4 {
    Mat4::from_scale_rotation_translation(
        quad.scale.extend(1.0),
        Quat::IDENTITY,
        quad.position.extend(0.0),
    )
}

/// Draws each [`GuiQuad`] as an alpha-blended triangle strip over everything else
pub struct GuiRenderSystem {
    program: Arc<ShaderProgram>,
    quad: Arc<GpuMesh>,
    query: QueryState<&'static GuiQuad>,
}

impl GuiRenderSystem {
    pub fn new(
        world: &mut World,
        resources: &mut ResourceManagers,
        backend: &mut dyn GraphicsBackend,
    ) -> EngineResult<Self> {
        Ok(Self {
            program: resources.shaders.get(backend, ShaderKind::Gui)?,
            quad: resources.meshes.builtin(backend, BuiltinMesh::Quad)?,
            query: world.query::<&GuiQuad>(),
        })
    }
}

impl RenderSystem for GuiRenderSystem {
    fn name(&self) -> &'static str {
        "Gui"
    }

    fn kind(&self) -> RenderSystemKind {
        RenderSystemKind::Gui
    }

    fn render_state(&self) -> RenderState {
        RenderState::ENGINE_DEFAULT
            .with_depth_test(false)
            .with_depth_write(false)
            .with_blend(BlendState::alpha_blending())
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _siblings: &mut Siblings<'_>) -> EngineResult<()> {
        // The overlay never shows up in reflections
        if ctx.capture {
            return Ok(());
        }
        let scene = ctx.scene;
        let program = &self.program;
        program.bind(ctx.backend);
        self.quad.bind(ctx.backend);
        for quad in self.query.iter(&scene.registry) {
            let texture = ctx.resources.textures.get_key(ctx.backend, &quad.texture)?;
            program.bind_texture(ctx.backend, "gui_texture", texture.handle)?;
            program.set_uniform(ctx.backend, "transform", gui_transform(quad))?;
            program.set_uniform(ctx.backend, "tint", quad.tint)?;
            self.quad.draw(ctx.backend, 0..1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::TextureKey;
    use glam::{Vec2, Vec3};

    #[test]
    fn test_gui_transform_places_quad_corners() {
        let quad = GuiQuad::new(TextureKey::white(), Vec2::new(0.5, -0.5), Vec2::splat(0.2));
        let corner = gui_transform(&quad).transform_point3(Vec3::new(0.5, 0.5, 0.0));
        assert!((corner - Vec3::new(0.6, -0.4, 0.0)).length() < 1e-6);
    }
}
