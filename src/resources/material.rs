//! Per-entity material overrides

use bevy_ecs::prelude::*;
use glam::Vec4;

use super::loader::MeshMaterial;
use super::texture::TextureKey;

/// Surface parameters applied when drawing an entity's mesh
#[derive(Component, Debug, Clone, PartialEq)]
pub struct Material {
    pub diffuse: TextureKey,
    pub tint: Vec4,
    pub specular: f32,
    pub shininess: f32,
    /// Shade as if the normal pointed straight up (foliage, grass cards)
    pub fake_lighting: bool,
    pub transparent: bool,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            diffuse: TextureKey::white(),
            tint: Vec4::ONE,
            specular: 0.0,
            shininess: 32.0,
            fake_lighting: false,
            transparent: false,
        }
    }
}

impl Material {
    pub fn textured(texture: TextureKey) -> Self {
        Self {
            diffuse: texture,
            ..Default::default()
        }
    }

    pub fn with_tint(mut self, tint: Vec4) -> Self {
        self.tint = tint;
        self
    }

    pub fn with_specular(mut self, specular: f32, shininess: f32) -> Self {
        self.specular = specular;
        self.shininess = shininess;
        self
    }

    pub fn with_fake_lighting(mut self, enabled: bool) -> Self {
        self.fake_lighting = enabled;
        self
    }

    pub fn with_transparency(mut self, enabled: bool) -> Self {
        self.transparent = enabled;
        self
    }

    /// x = specular, y = shininess, z = fake lighting flag
    pub fn params(&self) -> Vec4 {
        Vec4::new(
            self.specular,
            self.shininess,
            if self.fake_lighting { 1.0 } else { 0.0 },
            0.0,
        )
    }
}

impl From<&MeshMaterial> for Material {
    fn from(imported: &MeshMaterial) -> Self {
        Self {
            diffuse: imported
                .diffuse_texture
                .as_ref()
                .map(|path| TextureKey::file(path))
                .unwrap_or_else(TextureKey::white),
            tint: imported.diffuse_color.extend(1.0),
            specular: imported.specular,
            shininess: imported.shininess,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_params_pack_fake_lighting() {
        let material = Material::default()
            .with_specular(0.5, 16.0)
            .with_fake_lighting(true);
        assert_eq!(material.params(), Vec4::new(0.5, 16.0, 1.0, 0.0));
    }

    #[test]
    fn test_imported_material_without_texture_uses_white() {
        let imported = MeshMaterial {
            diffuse_texture: None,
            diffuse_color: Vec3::new(1.0, 0.0, 0.0),
            specular: 0.2,
            shininess: 8.0,
        };
        let material = Material::from(&imported);
        assert_eq!(material.diffuse, TextureKey::white());
        assert_eq!(material.tint, Vec4::new(1.0, 0.0, 0.0, 1.0));
    }
}
