//! Harbor scene: terrain, a reflective water plane, a ring of instanced
//! crates and a smoking rock.
//!
//! Run with:
//!   cargo run --example water_scene
//!   cargo run --example water_scene -- --assets ./assets --no-vsync
//!
//! Controls:
//!   WASD     - Move camera
//!   QE       - Move up/down
//!   Shift    - Sprint
//!   Mouse    - Look around (hold right mouse button)
//!   Scroll   - Adjust speed

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use glam::{Vec2, Vec3};
use tidewater_engine::pipeline::*;
use tidewater_engine::resources::{BuiltinMesh, Material, TextureKey};
use tidewater_engine::scene::*;
use tidewater_engine::{app, init_logging, EngineConfig, LoggingConfig, SceneState};

#[derive(Parser, Debug)]
#[command(name = "water_scene", about = "Tidewater harbor demo")]
struct Args {
    /// Directory holding textures; missing files fall back to solid colors
    #[arg(long, default_value = "assets")]
    assets: PathBuf,

    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Disable vertical sync (may cause tearing).
    #[arg(long)]
    no_vsync: bool,

    /// Reflection capture resolution relative to the window.
    #[arg(long, default_value = "0.5")]
    reflection_scale: f32,

    /// Log filter, e.g. `debug` or `tidewater_engine=trace`.
    #[arg(long)]
    log: Option<String>,
}

/// Texture under `dir`, or `fallback` when the file is absent
fn asset(dir: &Path, name: &str, fallback: TextureKey) -> TextureKey {
    let path = dir.join(name);
    if path.is_file() {
        TextureKey::file(path)
    } else {
        log::warn!("{} not found, using a placeholder", path.display());
        fallback
    }
}

fn sky(dir: &Path) -> Option<TextureKey> {
    let faces = ["right", "left", "top", "bottom", "back", "front"]
        .map(|face| dir.join("sky").join(format!("{face}.png")));
    faces
        .iter()
        .all(|face| face.is_file())
        .then(|| TextureKey::cubemap(faces))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(match &args.log {
        Some(filter) => LoggingConfig::with_filter(filter.as_str()),
        None => LoggingConfig::default(),
    });

    let config = EngineConfig::default()
        .with_title("Tidewater - Harbor")
        .with_size(args.width, args.height)
        .with_vsync(!args.no_vsync)
        .with_reflection_scale(args.reflection_scale);

    let assets = args.assets;
    app::run(config, move |app| {
        let state = SceneState::new("harbor", move |ctx, scene, systems| {
            let backend = &mut *ctx.backend;
            let resources = &mut *ctx.resources;
            let meshes = &mut resources.meshes;
            let cube = meshes.builtin(backend, BuiltinMesh::Cube)?;
            let plane = meshes.builtin(backend, BuiltinMesh::Plane)?;
            let sphere = meshes.builtin(backend, BuiltinMesh::Sphere)?;

            scene.camera = Camera::first_person(Vec3::new(0.0, 12.0, 40.0), 0.0, -0.25)
                .with_projection(scene.camera.projection);
            scene.set_directional_light(DirectionalLight::new(
                Vec3::new(-0.4, -1.0, -0.3),
                Vec3::splat(0.9),
                Vec3::splat(0.6),
            ));
            scene.add_point_light(
                PointLight::new(Vec3::new(6.0, 8.0, 0.0)).with_attenuation(1.0, 0.045, 0.0075),
            );

            scene.spawn((
                Transform::from_position_scale(Vec3::new(0.0, -2.0, 0.0), Vec3::splat(400.0)),
                Terrain::new(
                    vec![plane],
                    asset(&assets, "terrain/sand.png", TextureKey::white()),
                ),
            ));
            scene.spawn((
                Model { mesh: sphere },
                Transform::from_position_scale(Vec3::new(0.0, 3.0, -20.0), Vec3::splat(6.0)),
                Material::textured(asset(&assets, "rock.png", TextureKey::white()))
                    .with_specular(0.3, 16.0),
            ));
            scene.spawn(Instanced {
                mesh: cube.clone(),
                instances: (0..12)
                    .map(|i| {
                        let angle = i as f32 * std::f32::consts::TAU / 12.0;
                        Transform::from_position(Vec3::new(angle.cos(), 0.1, angle.sin()) * 14.0)
                    })
                    .collect(),
            });
            scene.spawn((
                Transform::from_position(Vec3::new(-8.0, 1.0, -14.0)),
                ParticleEmitter::new(
                    asset(&assets, "fx/smoke.png", TextureKey::white()),
                    30.0,
                    3.0,
                )
                .with_motion(1.5, 0.4),
            ));
            scene.spawn(Water::new(
                0.0,
                Vec2::splat(200.0),
                asset(&assets, "water/dudv.png", TextureKey::flat_normal()),
                asset(&assets, "water/normal.png", TextureKey::flat_normal()),
            ));
            scene.spawn(GuiQuad::new(
                asset(&assets, "gui/logo.png", TextureKey::white()),
                Vec2::new(-0.85, 0.85),
                Vec2::splat(0.1),
            ));
            let sky = sky(&assets);
            if let Some(cubemap) = sky.clone() {
                scene.spawn(Skybox { cubemap });
            }

            let world = &mut scene.registry;
            let (width, height) = (ctx.viewport.width, ctx.viewport.height);
            let mut captured = Vec::new();
            if sky.is_some() {
                captured.push(systems.push(SkyboxRenderSystem::new(world, resources, backend)?));
            }
            captured.push(systems.push(TerrainRenderSystem::new(world, resources, backend)?));
            captured.push(systems.push(ModelRenderSystem::new(world, resources, backend)?));
            captured.push(systems.push(InstancingRenderSystem::new(world, resources, backend)?));
            let water = WaterRenderSystem::new(
                world,
                resources,
                backend,
                WaterConfig::new(width, height).with_reflection_scale(ctx.config.reflection_scale),
            )?;
            systems.push(water.capturing(captured));
            systems.push(ParticleRenderSystem::new(world, resources, backend)?);
            systems.push(GuiRenderSystem::new(world, resources, backend)?);
            Ok(())
        })
        .with_controller(FreeFlyController::default().with_speed(12.0));

        app.push_state(Box::new(state))
    })
}
