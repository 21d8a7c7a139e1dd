//! Light types for the scene

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::resources::TextureKey;

/// Distance falloff `1 / (constant + linear d + quadratic d^2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attenuation {
    pub constant: f32,
    pub linear: f32,
    pub quadratic: f32,
}

impl Default for Attenuation {
    fn default() -> Self {
        // Roughly a 100 unit range
        Self {
            constant: 1.0,
            linear: 0.045,
            quadratic: 0.0075,
        }
    }
}

impl Attenuation {
    pub fn factor(&self, distance: f32) -> f32 {
        1.0 / (self.constant + self.linear * distance + self.quadratic * distance * distance)
    }

    /// Distance at which the light falls below `threshold` of its intensity
    pub fn range(&self, threshold: f32) -> f32 {
        let c = self.constant - 1.0 / threshold;
        if self.quadratic <= f32::EPSILON {
            if self.linear <= f32::EPSILON {
                return f32::INFINITY;
            }
            return (-c / self.linear).max(0.0);
        }
        let disc = self.linear * self.linear - 4.0 * self.quadratic * c;
        ((-self.linear + disc.max(0.0).sqrt()) / (2.0 * self.quadratic)).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub ambient: Vec3,
    pub diffuse: Vec3,
    pub specular: Vec3,
    pub attenuation: Attenuation,
}

impl PointLight {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            ambient: Vec3::splat(0.05),
            diffuse: Vec3::splat(0.8),
            specular: Vec3::ONE,
            attenuation: Attenuation::default(),
        }
    }

    pub fn with_colors(mut self, ambient: Vec3, diffuse: Vec3, specular: Vec3) -> Self {
        self.ambient = ambient;
        self.diffuse = diffuse;
        self.specular = specular;
        self
    }

    pub fn with_attenuation(mut self, constant: f32, linear: f32, quadratic: f32) -> Self {
        self.attenuation = Attenuation {
            constant,
            linear,
            quadratic,
        };
        self
    }

    /// Convert to GPU data format
    pub fn to_gpu_data(&self) -> GpuPointLight {
        GpuPointLight {
            position: self.position.extend(self.attenuation.constant),
            ambient: self.ambient.extend(self.attenuation.linear),
            diffuse: self.diffuse.extend(self.attenuation.quadratic),
            specular: self.specular.extend(0.0),
        }
    }
}

/// Parameters common to both directional light variants
#[derive(Debug, Clone, PartialEq)]
pub struct Directional {
    pub direction: Vec3,
    pub diffuse: Vec3,
    pub specular: Vec3,
}

impl Default for Directional {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.5, -1.0, -0.5).normalize(),
            diffuse: Vec3::splat(0.9),
            specular: Vec3::splat(0.5),
        }
    }
}

/// Sun disc drawn as a camera-facing billboard
#[derive(Debug, Clone, PartialEq)]
pub struct SunBillboard {
    pub texture: TextureKey,
    /// Offset from the camera position, so the sun never gets closer
    pub offset: Vec3,
    pub scale: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectionalLight {
    Plain(Directional),
    Sun {
        light: Directional,
        billboard: SunBillboard,
    },
}

impl DirectionalLight {
    pub fn new(direction: Vec3, diffuse: Vec3, specular: Vec3) -> Self {
        DirectionalLight::Plain(Directional {
            direction: direction.normalize(),
            diffuse,
            specular,
        })
    }

    /// A sun whose light travels from the billboard towards the camera
    pub fn sun(texture: TextureKey, offset: Vec3, diffuse: Vec3, specular: Vec3) -> Self {
        DirectionalLight::Sun {
            light: Directional {
                direction: (-offset).normalize(),
                diffuse,
                specular,
            },
            billboard: SunBillboard {
                texture,
                offset,
                scale: 20.0,
            },
        }
    }

    pub fn light(&self) -> &Directional {
        match self {
            DirectionalLight::Plain(light) => light,
            DirectionalLight::Sun { light, .. } => light,
        }
    }

    pub fn billboard(&self) -> Option<&SunBillboard> {
        match self {
            DirectionalLight::Plain(_) => None,
            DirectionalLight::Sun { billboard, .. } => Some(billboard),
        }
    }

    /// Convert to GPU data format. w of `direction` flags an enabled light.
    pub fn to_gpu_data(&self) -> GpuDirectionalLight {
        let light = self.light();
        GpuDirectionalLight {
            direction: light.direction.extend(1.0),
            diffuse: light.diffuse.extend(0.0),
            specular: light.specular.extend(0.0),
        }
    }
}

/// GPU layout of a point light
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuPointLight {
    /// xyz = position, w = constant attenuation
    pub position: Vec4,
    /// xyz = ambient, w = linear attenuation
    pub ambient: Vec4,
    /// xyz = diffuse, w = quadratic attenuation
    pub diffuse: Vec4,
    pub specular: Vec4,
}

/// GPU layout of the directional light; all zero when the scene has none
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuDirectionalLight {
    pub direction: Vec4,
    pub diffuse: Vec4,
    pub specular: Vec4,
}

/// Pack up to `max` point lights into a fixed-size uniform array
pub fn pack_point_lights(lights: &[PointLight], max: usize) -> (u32, Vec<u8>) {
    let mut packed = vec![GpuPointLight::zeroed(); max];
    let count = lights.len().min(max);
    if lights.len() > max {
        log::warn!(
            "{} point lights in scene, only the first {} are shaded",
            lights.len(),
            max
        );
    }
    for (slot, light) in packed.iter_mut().zip(lights) {
        *slot = light.to_gpu_data();
    }
    (count as u32, bytemuck::cast_slice(&packed).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attenuation_range_matches_factor() {
        let attenuation = Attenuation::default();
        let range = attenuation.range(0.01);
        assert!((attenuation.factor(range) - 0.01).abs() < 1e-4);
    }

    #[test]
    fn test_pack_point_lights_truncates_and_pads() {
        let lights = vec![PointLight::new(Vec3::Y); 3];
        let (count, bytes) = pack_point_lights(&lights, 2);
        assert_eq!(count, 2);
        assert_eq!(bytes.len(), 2 * std::mem::size_of::<GpuPointLight>());

        let (count, bytes) = pack_point_lights(&lights[..1], 4);
        assert_eq!(count, 1);
        assert_eq!(bytes.len(), 4 * 64);
    }

    #[test]
    fn test_sun_direction_points_away_from_billboard() {
        let sun = DirectionalLight::sun(
            TextureKey::white(),
            Vec3::new(0.0, 100.0, 0.0),
            Vec3::ONE,
            Vec3::ONE,
        );
        assert_eq!(sun.light().direction, -Vec3::Y);
        assert!(sun.billboard().is_some());
    }
}
