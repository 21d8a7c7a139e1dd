//! WGSL reflection shared by every backend
//!
//! Programs bind their loose uniforms through a single uniform block at
//! `@group(0) @binding(0)` and their textures in `@group(1)`, with one
//! sampler at binding 0 and textures from binding 1 upwards. Reflection
//! records the name, offset and size of each block member so uniforms can
//! be set by name the way a GL program looks up uniform locations.

use super::types::TextureDimension;
use thiserror::Error;

/// Group holding the uniform block
pub const UNIFORM_GROUP: u32 = 0;
/// Group holding the sampler and textures
pub const TEXTURE_GROUP: u32 = 1;
/// Binding of the shared sampler inside [`TEXTURE_GROUP`]
pub const SAMPLER_BINDING: u32 = 0;

#[derive(Error, Debug, Clone)]
pub enum ShaderReflectError {
    #[error("WGSL parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("missing entry point `{0}`")]
    MissingEntryPoint(&'static str),
}

/// Location of one member of the uniform block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformSlot {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// How a texture binding is read by the shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSampleKind {
    Float,
    /// Depth attachments, read with `textureLoad`
    Depth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSlot {
    pub name: String,
    pub binding: u32,
    pub dimension: TextureDimension,
    pub sample_kind: TextureSampleKind,
}

/// Everything a backend needs to know about a program's resource interface
#[derive(Debug, Clone, Default)]
pub struct ShaderReflection {
    uniforms: Vec<UniformSlot>,
    uniform_block_size: u32,
    textures: Vec<TextureSlot>,
}

impl ShaderReflection {
    /// Parse and validate `source`, then collect its resource interface.
    ///
    /// Parse failures correspond to a compile error, validation failures to a
    /// link error.
    pub fn from_wgsl(source: &str) -> Result<Self, ShaderReflectError> {
        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| ShaderReflectError::Parse(e.emit_to_string(source)))?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator
            .validate(&module)
            .map_err(|e| ShaderReflectError::Validation(e.to_string()))?;

        for (entry, stage) in [
            ("vs_main", naga::ShaderStage::Vertex),
            ("fs_main", naga::ShaderStage::Fragment),
        ] {
            if !module
                .entry_points
                .iter()
                .any(|ep| ep.name == entry && ep.stage == stage)
            {
                return Err(ShaderReflectError::MissingEntryPoint(entry));
            }
        }

        let mut reflection = Self::default();

        for (_, global) in module.global_variables.iter() {
            let Some(binding) = &global.binding else {
                continue;
            };
            let ty = &module.types[global.ty];

            match (global.space, &ty.inner) {
                (
                    naga::AddressSpace::Uniform,
                    naga::TypeInner::Struct { members, span },
                ) if binding.group == UNIFORM_GROUP && binding.binding == 0 => {
                    reflection.uniform_block_size = *span;
                    for member in members {
                        let Some(name) = &member.name else { continue };
                        reflection.uniforms.push(UniformSlot {
                            name: name.clone(),
                            offset: member.offset,
                            size: module.types[member.ty].inner.size(module.to_ctx()),
                        });
                    }
                }
                (_, naga::TypeInner::Image { dim, class, .. })
                    if binding.group == TEXTURE_GROUP =>
                {
                    let dimension = match dim {
                        naga::ImageDimension::Cube => TextureDimension::Cube,
                        _ => TextureDimension::D2,
                    };
                    let sample_kind = match class {
                        naga::ImageClass::Depth { .. } => TextureSampleKind::Depth,
                        _ => TextureSampleKind::Float,
                    };
                    reflection.textures.push(TextureSlot {
                        name: global.name.clone().unwrap_or_default(),
                        binding: binding.binding,
                        dimension,
                        sample_kind,
                    });
                }
                _ => {}
            }
        }

        reflection.textures.sort_by_key(|t| t.binding);
        Ok(reflection)
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformSlot> {
        self.uniforms.iter().find(|u| u.name == name)
    }

    pub fn uniforms(&self) -> &[UniformSlot] {
        &self.uniforms
    }

    /// Size in bytes of the uniform block, zero when the program has none
    pub fn uniform_block_size(&self) -> u32 {
        self.uniform_block_size
    }

    pub fn texture(&self, name: &str) -> Option<&TextureSlot> {
        self.textures.iter().find(|t| t.name == name)
    }

    pub fn textures(&self) -> &[TextureSlot] {
        &self.textures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
struct Uniforms {
    view_proj: mat4x4<f32>,
    light_color: vec3<f32>,
    strength: f32,
}

@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var tex_sampler: sampler;
@group(1) @binding(1) var albedo: texture_2d<f32>;
@group(1) @binding(2) var depth_map: texture_depth_2d;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return u.view_proj * vec4<f32>(position, 1.0);
}

@fragment
fn fs_main(@builtin(position) frag: vec4<f32>) -> @location(0) vec4<f32> {
    let d = textureLoad(depth_map, vec2<i32>(frag.xy), 0);
    let c = textureSample(albedo, tex_sampler, frag.xy);
    return vec4<f32>(c.rgb * u.light_color * u.strength, d);
}
"#;

    #[test]
    fn test_reflects_uniform_block_members() {
        let reflection = ShaderReflection::from_wgsl(SOURCE).unwrap();
        let color = reflection.uniform("light_color").unwrap();
        assert_eq!(color.offset, 64);
        assert_eq!(color.size, 12);
        assert_eq!(reflection.uniform("strength").unwrap().offset, 76);
        assert_eq!(reflection.uniform_block_size(), 80);
        assert!(reflection.uniform("missing").is_none());
    }

    #[test]
    fn test_reflects_texture_bindings() {
        let reflection = ShaderReflection::from_wgsl(SOURCE).unwrap();
        assert_eq!(reflection.textures().len(), 2);
        assert_eq!(reflection.texture("albedo").unwrap().binding, 1);
        assert_eq!(
            reflection.texture("depth_map").unwrap().sample_kind,
            TextureSampleKind::Depth
        );
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = ShaderReflection::from_wgsl("fn broken( {").unwrap_err();
        assert!(matches!(err, ShaderReflectError::Parse(_)));
    }

    #[test]
    fn test_missing_entry_point() {
        let src = "@vertex fn vs_main() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }";
        let err = ShaderReflection::from_wgsl(src).unwrap_err();
        assert!(matches!(err, ShaderReflectError::MissingEntryPoint("fs_main")));
    }
}
