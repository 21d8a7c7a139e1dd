//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::path::Path;

use glam::{Mat4, Vec2, Vec3};
use tidewater_engine::backend::{HeadlessBackend, Viewport};
use tidewater_engine::pipeline::*;
use tidewater_engine::resources::{
    BuiltinMesh, DecodedImage, ObjLoader, ResourceManagers, TextureDecoder, TextureKey,
};
use tidewater_engine::scene::*;

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;

/// Decodes every path to a small opaque image; paths containing "missing" fail
pub struct MemoryDecoder;

impl TextureDecoder for MemoryDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage, String> {
        if path.to_string_lossy().contains("missing") {
            return Err(format!("{} not found", path.display()));
        }
        Ok(DecodedImage {
            width: 2,
            height: 2,
            channels: 4,
            rgba: vec![200; 2 * 2 * 4],
        })
    }
}

pub fn backend() -> HeadlessBackend {
    HeadlessBackend::with_surface_size(WIDTH, HEIGHT)
}

pub fn resources() -> ResourceManagers {
    ResourceManagers::with_collaborators(Box::new(MemoryDecoder), Box::new(ObjLoader))
}

pub fn viewport() -> Viewport {
    Viewport::new(WIDTH, HEIGHT)
}

pub fn sky_faces() -> TextureKey {
    TextureKey::cubemap([
        "sky/right.png",
        "sky/left.png",
        "sky/top.png",
        "sky/bottom.png",
        "sky/back.png",
        "sky/front.png",
    ])
}

/// Spawn one entity the system of `kind` draws
pub fn spawn_subject(
    kind: RenderSystemKind,
    scene: &mut Scene,
    resources: &mut ResourceManagers,
    backend: &mut HeadlessBackend,
) {
    let cube = resources.meshes.builtin(backend, BuiltinMesh::Cube).unwrap();
    match kind {
        RenderSystemKind::Model | RenderSystemKind::Deferred => {
            scene.spawn((Model { mesh: cube }, Transform::from_position(Vec3::Y)));
        }
        RenderSystemKind::Instancing => {
            let instances = (0..3)
                .map(|i| Transform::from_position(Vec3::X * i as f32))
                .collect();
            scene.spawn(Instanced {
                mesh: cube,
                instances,
            });
        }
        RenderSystemKind::Skybox => {
            scene.spawn(Skybox {
                cubemap: sky_faces(),
            });
        }
        RenderSystemKind::Gui => {
            scene.spawn(GuiQuad::new(
                TextureKey::file("gui/health.png"),
                Vec2::new(-0.75, 0.9),
                Vec2::splat(0.2),
            ));
        }
        RenderSystemKind::Particle => {
            scene.spawn((
                Transform::default(),
                ParticleEmitter::new(TextureKey::file("fx/smoke.png"), 20.0, 2.0),
            ));
        }
        RenderSystemKind::Terrain => {
            let plane = resources.meshes.builtin(backend, BuiltinMesh::Plane).unwrap();
            scene.spawn((
                Transform::from_position_scale(Vec3::ZERO, Vec3::splat(100.0)),
                Terrain::new(vec![plane], TextureKey::file("terrain/grass.png")),
            ));
        }
        RenderSystemKind::Water => {
            scene.spawn(water_at(10.0));
        }
        RenderSystemKind::Skeletal => {
            scene.spawn((
                SkeletalMesh {
                    mesh: cube,
                    bone_matrices: vec![Mat4::IDENTITY; 4],
                },
                Transform::default(),
            ));
        }
    }
}

pub fn water_at(height: f32) -> Water {
    Water::new(
        height,
        Vec2::splat(50.0),
        TextureKey::file("water/dudv.png"),
        TextureKey::file("water/normal.png"),
    )
}

/// Construct the system of `kind` against `scene`
pub fn system_for(
    kind: RenderSystemKind,
    scene: &mut Scene,
    resources: &mut ResourceManagers,
    backend: &mut HeadlessBackend,
) -> Box<dyn RenderSystem> {
    let world = &mut scene.registry;
    match kind {
        RenderSystemKind::Model => Box::new(ModelRenderSystem::new(world, resources, backend).unwrap()),
        RenderSystemKind::Instancing => {
            Box::new(InstancingRenderSystem::new(world, resources, backend).unwrap())
        }
        RenderSystemKind::Skybox => {
            Box::new(SkyboxRenderSystem::new(world, resources, backend).unwrap())
        }
        RenderSystemKind::Gui => Box::new(GuiRenderSystem::new(world, resources, backend).unwrap()),
        RenderSystemKind::Particle => {
            Box::new(ParticleRenderSystem::new(world, resources, backend).unwrap())
        }
        RenderSystemKind::Terrain => {
            Box::new(TerrainRenderSystem::new(world, resources, backend).unwrap())
        }
        RenderSystemKind::Water => Box::new(
            WaterRenderSystem::new(world, resources, backend, WaterConfig::new(WIDTH, HEIGHT))
                .unwrap(),
        ),
        RenderSystemKind::Skeletal => {
            Box::new(SkeletalRenderSystem::new(world, resources, backend).unwrap())
        }
        RenderSystemKind::Deferred => Box::new(
            DeferredRenderSystem::new(world, resources, backend, WIDTH, HEIGHT).unwrap(),
        ),
    }
}
