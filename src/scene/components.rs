//! Components consumed by the render systems

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::{Mat4, Vec2, Vec3, Vec4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::resources::{GpuMesh, TextureKey};

use super::transform::Transform;

/// Renderable mesh, drawn through the entity's [`Transform`]
#[derive(Component, Debug, Clone)]
pub struct Model {
    pub mesh: Arc<GpuMesh>,
}

/// Excludes an entity from the deferred geometry pass
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Skydome;

/// Many copies of one mesh drawn with a single call
#[derive(Component, Debug, Clone)]
pub struct Instanced {
    pub mesh: Arc<GpuMesh>,
    pub instances: Vec<Transform>,
}

impl Instanced {
    pub fn count(&self) -> u32 {
        self.instances.len() as u32
    }
}

/// Cubemap drawn behind everything else
#[derive(Component, Debug, Clone)]
pub struct Skybox {
    pub cubemap: TextureKey,
}

/// Screen-space textured quad. Position and scale are in normalized device units.
#[derive(Component, Debug, Clone)]
pub struct GuiQuad {
    pub texture: TextureKey,
    pub position: Vec2,
    pub scale: Vec2,
    pub tint: Vec4,
}

impl GuiQuad {
    pub fn new(texture: TextureKey, position: Vec2, scale: Vec2) -> Self {
        Self {
            texture,
            position,
            scale,
            tint: Vec4::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub position: Vec3,
    pub velocity: Vec3,
    pub age: f32,
    pub lifetime: f32,
    pub size: f32,
}

/// Spawns camera-facing particles at the entity's transform
#[derive(Component, Debug, Clone)]
pub struct ParticleEmitter {
    pub texture: TextureKey,
    /// Particles per second
    pub spawn_rate: f32,
    pub lifetime: f32,
    pub speed: f32,
    /// Half-angle of the emission cone around +Y, in radians
    pub spread: f32,
    pub size: f32,
    pub max_particles: usize,
    particles: Vec<Particle>,
    spawn_accumulator: f32,
    rng: StdRng,
}

impl ParticleEmitter {
    pub fn new(texture: TextureKey, spawn_rate: f32, lifetime: f32) -> Self {
        Self {
            texture,
            spawn_rate,
            lifetime,
            speed: 2.0,
            spread: 0.3,
            size: 0.5,
            max_particles: 1000,
            particles: Vec::new(),
            spawn_accumulator: 0.0,
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }

    pub fn with_motion(mut self, speed: f32, spread: f32) -> Self {
        self.speed = speed;
        self.spread = spread;
        self
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Age and move live particles, drop expired ones, spawn new ones at `origin`
    pub fn advance(&mut self, dt: f32, origin: Vec3) {
        for particle in &mut self.particles {
            particle.age += dt;
            particle.position += particle.velocity * dt;
        }
        self.particles.retain(|p| p.age < p.lifetime);

        self.spawn_accumulator += self.spawn_rate * dt;
        while self.spawn_accumulator >= 1.0 {
            self.spawn_accumulator -= 1.0;
            if self.particles.len() >= self.max_particles {
                continue;
            }
            let azimuth = self.rng.gen_range(0.0..std::f32::consts::TAU);
            let tilt = self.rng.gen_range(0.0..=self.spread);
            let direction = Vec3::new(
                tilt.sin() * azimuth.cos(),
                tilt.cos(),
                tilt.sin() * azimuth.sin(),
            );
            self.particles.push(Particle {
                position: origin,
                velocity: direction * self.speed,
                age: 0.0,
                lifetime: self.lifetime,
                size: self.size,
            });
        }
    }
}

/// Terrain patch with precomputed levels of detail, finest first
#[derive(Component, Debug, Clone)]
pub struct Terrain {
    pub lods: Vec<Arc<GpuMesh>>,
    pub texture: TextureKey,
    /// Camera distance covered by each level before switching to the next
    pub lod_distance: f32,
    pub tiling: f32,
    active_lod: usize,
}

impl Terrain {
    pub fn new(lods: Vec<Arc<GpuMesh>>, texture: TextureKey) -> Self {
        Self {
            lods,
            texture,
            lod_distance: 100.0,
            tiling: 40.0,
            active_lod: 0,
        }
    }

    pub fn select_lod(&mut self, camera_distance: f32) {
        let level = (camera_distance / self.lod_distance.max(f32::EPSILON)) as usize;
        self.active_lod = level.min(self.lods.len().saturating_sub(1));
    }

    pub fn active_lod(&self) -> usize {
        self.active_lod
    }

    pub fn active_mesh(&self) -> Option<&Arc<GpuMesh>> {
        self.lods.get(self.active_lod)
    }
}

/// Horizontal water surface at `height`, spanning `size` on the XZ plane
#[derive(Component, Debug, Clone)]
pub struct Water {
    pub height: f32,
    pub center: Vec2,
    pub size: Vec2,
    pub dudv_map: TextureKey,
    pub normal_map: TextureKey,
    pub wave_speed: f32,
    /// Scroll phase of the dudv/normal maps, kept in [0, 1)
    pub move_factor: f32,
}

impl Water {
    pub fn new(height: f32, size: Vec2, dudv_map: TextureKey, normal_map: TextureKey) -> Self {
        Self {
            height,
            center: Vec2::ZERO,
            size,
            dudv_map,
            normal_map,
            wave_speed: 0.03,
            move_factor: 0.0,
        }
    }

    pub fn advance(&mut self, dt: f32) {
        self.move_factor = (self.move_factor + self.wave_speed * dt).rem_euclid(1.0);
    }

    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(
            Vec3::new(self.size.x, 1.0, self.size.y),
            glam::Quat::IDENTITY,
            Vec3::new(self.center.x, self.height, self.center.y),
        )
    }
}

/// Skinned mesh with bone matrices supplied by the animation collaborator
#[derive(Component, Debug, Clone)]
pub struct SkeletalMesh {
    pub mesh: Arc<GpuMesh>,
    pub bone_matrices: Vec<Mat4>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_move_factor_wraps() {
        let mut water = Water::new(0.0, Vec2::ONE, TextureKey::white(), TextureKey::flat_normal());
        water.wave_speed = 0.4;
        water.advance(2.0);
        assert!((water.move_factor - 0.8).abs() < 1e-6);
        water.advance(1.0);
        assert!((water.move_factor - 0.2).abs() < 1e-5);
    }

    #[test]
    fn test_emitter_spawns_and_expires() {
        let mut emitter = ParticleEmitter::new(TextureKey::white(), 10.0, 1.0);
        emitter.advance(0.5, Vec3::ZERO);
        assert_eq!(emitter.particles().len(), 5);
        for p in emitter.particles() {
            assert!(p.velocity.y > 0.0);
        }

        // First batch reaches its lifetime, second batch spawns
        emitter.advance(1.0, Vec3::ZERO);
        assert_eq!(emitter.particles().len(), 10);
        assert!(emitter.particles().iter().all(|p| p.age == 0.0));
    }

    #[test]
    fn test_emitter_respects_capacity() {
        let mut emitter = ParticleEmitter::new(TextureKey::white(), 100.0, 10.0);
        emitter.max_particles = 8;
        emitter.advance(1.0, Vec3::ZERO);
        assert_eq!(emitter.particles().len(), 8);
    }
}
