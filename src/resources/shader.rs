//! Shader programs and the per-technique program cache

use std::sync::Arc;

use crate::backend::{
    GraphicsBackend, ProgramDescriptor, ProgramHandle, ShaderReflectError, ShaderReflection,
    TextureHandle, UniformValue,
};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::pipeline;

use super::cache::{GpuResource, ResourceCache};

/// One tag per render technique. Each tag maps to exactly one compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Model,
    Instancing,
    Skybox,
    Sun,
    Gui,
    Particle,
    Terrain,
    Water,
    Skeletal,
    GBuffer,
    DeferredLighting,
}

impl ShaderKind {
    pub const ALL: [ShaderKind; 11] = [
        ShaderKind::Model,
        ShaderKind::Instancing,
        ShaderKind::Skybox,
        ShaderKind::Sun,
        ShaderKind::Gui,
        ShaderKind::Particle,
        ShaderKind::Terrain,
        ShaderKind::Water,
        ShaderKind::Skeletal,
        ShaderKind::GBuffer,
        ShaderKind::DeferredLighting,
    ];

    pub fn source(&self) -> &'static ShaderSource {
        match self {
            ShaderKind::Model => &pipeline::model::MODEL_SHADER,
            ShaderKind::Instancing => &pipeline::instancing::INSTANCING_SHADER,
            ShaderKind::Skybox => &pipeline::skybox::SKYBOX_SHADER,
            ShaderKind::Sun => &pipeline::skybox::SUN_SHADER,
            ShaderKind::Gui => &pipeline::gui::GUI_SHADER,
            ShaderKind::Particle => &pipeline::particle::PARTICLE_SHADER,
            ShaderKind::Terrain => &pipeline::terrain::TERRAIN_SHADER,
            ShaderKind::Water => &pipeline::water::WATER_SHADER,
            ShaderKind::Skeletal => &pipeline::skeletal::SKELETAL_SHADER,
            ShaderKind::GBuffer => &pipeline::deferred::GBUFFER_SHADER,
            ShaderKind::DeferredLighting => &pipeline::deferred::LIGHTING_SHADER,
        }
    }
}

/// WGSL source of a technique together with the names its render system sets
#[derive(Debug)]
pub struct ShaderSource {
    pub label: &'static str,
    pub wgsl: &'static str,
    pub uniforms: &'static [&'static str],
    pub textures: &'static [&'static str],
}

/// A linked program and its discovered uniform table
#[derive(Debug)]
pub struct ShaderProgram {
    kind: ShaderKind,
    label: &'static str,
    handle: ProgramHandle,
    reflection: ShaderReflection,
}

impl ShaderProgram {
    /// Compile `source` and check that every name the render system relies on exists
    pub fn compile(
        backend: &mut dyn GraphicsBackend,
        kind: ShaderKind,
        source: &ShaderSource,
    ) -> EngineResult<Self> {
        let reflection = ShaderReflection::from_wgsl(source.wgsl).map_err(|e| match e {
            ShaderReflectError::Parse(message) => {
                EngineError::new(ErrorKind::ShaderCompile { kind, message })
            }
            other => EngineError::new(ErrorKind::ShaderLink {
                kind,
                message: other.to_string(),
            }),
        })?;

        if let Some(name) = source
            .uniforms
            .iter()
            .find(|name| reflection.uniform(name).is_none())
        {
            return Err(EngineError::new(ErrorKind::MissingUniform {
                kind,
                name: name.to_string(),
            }));
        }
        if let Some(name) = source
            .textures
            .iter()
            .find(|name| reflection.texture(name).is_none())
        {
            return Err(EngineError::new(ErrorKind::MissingTexture {
                kind,
                name: name.to_string(),
            }));
        }

        let handle = backend.create_program(&ProgramDescriptor {
            label: source.label,
            source: source.wgsl,
            reflection: &reflection,
        })?;
        log::info!(
            "Compiled {} program ({} uniforms, {} textures)",
            source.label,
            reflection.uniforms().len(),
            reflection.textures().len()
        );

        Ok(Self {
            kind,
            label: source.label,
            handle,
            reflection,
        })
    }

    pub fn kind(&self) -> ShaderKind {
        self.kind
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }

    pub fn bind(&self, backend: &mut dyn GraphicsBackend) {
        backend.use_program(self.handle);
    }

    /// Set a uniform by name. Unknown names are a hard error.
    pub fn set_uniform(
        &self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> EngineResult<()> {
        let slot = self.reflection.uniform(name).ok_or_else(|| {
            EngineError::new(ErrorKind::MissingUniform {
                kind: self.kind,
                name: name.to_string(),
            })
        })?;
        backend.set_uniform(self.handle, slot, &value.into());
        Ok(())
    }

    /// Bind a texture to the sampler variable called `name`
    pub fn bind_texture(
        &self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        texture: TextureHandle,
    ) -> EngineResult<()> {
        let slot = self.reflection.texture(name).ok_or_else(|| {
            EngineError::new(ErrorKind::MissingTexture {
                kind: self.kind,
                name: name.to_string(),
            })
        })?;
        backend.bind_texture(slot.binding, texture);
        Ok(())
    }
}

impl GpuResource for ShaderProgram {
    fn release(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_program(self.handle);
    }
}

/// Cache of compiled programs keyed by technique
pub struct ShaderManager {
    cache: ResourceCache<ShaderKind, ShaderProgram>,
}

impl ShaderManager {
    pub fn new() -> Self {
        Self {
            cache: ResourceCache::new("shader"),
        }
    }

    pub fn get(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        kind: ShaderKind,
    ) -> EngineResult<Arc<ShaderProgram>> {
        self.cache
            .get_or_create(&kind, |kind| ShaderProgram::compile(backend, *kind, kind.source()))
    }

    pub fn contains(&self, kind: ShaderKind) -> bool {
        self.cache.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn constructions(&self) -> usize {
        self.cache.constructions()
    }

    pub fn release_all(&mut self, backend: &mut dyn GraphicsBackend) {
        self.cache.release_all(backend);
    }
}

impl Default for ShaderManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    const FLAT: &str = r#"
struct Uniforms {
    mvp: mat4x4<f32>,
}
@group(0) @binding(0) var<uniform> u: Uniforms;

@vertex
fn vs_main(@location(0) p: vec3<f32>) -> @builtin(position) vec4<f32> {
    return u.mvp * vec4<f32>(p, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
"#;

    #[test]
    fn test_every_technique_compiles() {
        let mut backend = HeadlessBackend::default();
        let mut shaders = ShaderManager::new();
        for kind in ShaderKind::ALL {
            if let Err(err) = shaders.get(&mut backend, kind) {
                panic!("{kind:?}: {err}");
            }
        }
        assert_eq!(shaders.len(), ShaderKind::ALL.len());
    }

    #[test]
    fn test_program_is_shared_per_kind() {
        let mut backend = HeadlessBackend::default();
        let mut shaders = ShaderManager::new();
        let a = shaders.get(&mut backend, ShaderKind::Model).unwrap();
        let b = shaders.get(&mut backend, ShaderKind::Model).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.programs_created(), 1);
    }

    #[test]
    fn test_missing_required_uniform_fails_at_link() {
        let mut backend = HeadlessBackend::default();
        let source = ShaderSource {
            label: "flat",
            wgsl: FLAT,
            uniforms: &["mvp", "tint"],
            textures: &[],
        };
        let err = ShaderProgram::compile(&mut backend, ShaderKind::Gui, &source).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::MissingUniform { name, .. } if name == "tint"
        ));
        assert_eq!(backend.programs_created(), 0);
    }

    #[test]
    fn test_set_unknown_uniform_is_an_error() {
        let mut backend = HeadlessBackend::default();
        let source = ShaderSource {
            label: "flat",
            wgsl: FLAT,
            uniforms: &["mvp"],
            textures: &[],
        };
        let program = ShaderProgram::compile(&mut backend, ShaderKind::Gui, &source).unwrap();
        assert!(program
            .set_uniform(&mut backend, "mvp", glam::Mat4::IDENTITY)
            .is_ok());
        assert!(program.set_uniform(&mut backend, "nope", 1.0f32).is_err());
    }

    #[test]
    fn test_compile_error_names_kind() {
        let mut backend = HeadlessBackend::default();
        let source = ShaderSource {
            label: "bad",
            wgsl: "this is not wgsl",
            uniforms: &[],
            textures: &[],
        };
        let err = ShaderProgram::compile(&mut backend, ShaderKind::Terrain, &source).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::ShaderCompile {
                kind: ShaderKind::Terrain,
                ..
            }
        ));
    }
}
