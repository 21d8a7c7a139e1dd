//! End-to-end pipeline scenarios on the recording headless backend

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use glam::{Vec3, Vec4};
use rstest::rstest;
use tidewater_engine::backend::headless::{Command, DrawCall};
use tidewater_engine::backend::{GraphicsBackend, RenderState, UniformValue};
use tidewater_engine::pipeline::*;
use tidewater_engine::resources::{BuiltinMesh, Material, ShaderKind, TextureKey};
use tidewater_engine::scene::*;
use tidewater_engine::{Application, EngineConfig, EngineResult, ErrorKind, SceneState};

fn camera_height(draw: &DrawCall) -> f32 {
    draw.uniform("camera_position")
        .and_then(UniformValue::as_vec4)
        .map(|p| p.y)
        .unwrap_or(f32::NAN)
}

#[test]
fn test_deferred_gbuffer_matches_window() {
    let mut backend = backend();
    let mut resources = resources();
    let mut scene = Scene::new();
    spawn_subject(RenderSystemKind::Deferred, &mut scene, &mut resources, &mut backend);

    let mut systems = RenderSystems::new();
    let deferred = DeferredRenderSystem::new(
        &mut scene.registry,
        &mut resources,
        &mut backend,
        WIDTH,
        HEIGHT,
    )
    .unwrap();
    let gbuffer = deferred.gbuffer().handle();
    systems.push(deferred);

    let attachments = backend.framebuffer_attachments(gbuffer).unwrap().clone();
    assert_eq!(attachments.color_attachments.len(), 3);
    for texture in &attachments.color_attachments {
        let desc = backend.texture_descriptor(*texture).unwrap();
        assert_eq!((desc.width, desc.height), (WIDTH, HEIGHT));
    }

    {
        let mut ctx = RenderContext::new(&mut backend, &mut resources, &scene, viewport());
        systems.render_all(&mut ctx).unwrap();
    }
    let lighting: Vec<_> = backend.draws_with_program("deferred_lighting").collect();
    assert_eq!(lighting.len(), 1);
    assert_eq!(lighting[0].framebuffer, None);
    assert_eq!(lighting[0].viewport, viewport());

    systems.release(&mut backend);
    resources.release_all(&mut backend);
    assert_eq!(backend.live_framebuffers(), 0);
    assert_eq!(backend.live_textures(), 0);
}

#[test]
fn test_systems_draw_in_registration_order() {
    let mut backend = backend();
    let mut resources = resources();
    let mut scene = Scene::new();
    let order = [
        RenderSystemKind::Skybox,
        RenderSystemKind::Model,
        RenderSystemKind::Gui,
    ];

    let mut systems = RenderSystems::new();
    for kind in order {
        spawn_subject(kind, &mut scene, &mut resources, &mut backend);
        systems.add(system_for(kind, &mut scene, &mut resources, &mut backend));
    }
    assert_eq!(systems.names(), ["Skybox", "Model", "Gui"]);

    {
        let mut ctx = RenderContext::new(&mut backend, &mut resources, &scene, viewport());
        systems.render_all(&mut ctx).unwrap();
    }
    let labels: Vec<&str> = backend
        .draw_calls()
        .map(|draw| draw.program_label.as_str())
        .collect();
    assert_eq!(labels, ["skybox", "model", "gui"]);

    systems.release(&mut backend);
    resources.release_all(&mut backend);
}

#[test]
fn test_water_captures_use_their_own_view() {
    let mut backend = backend();
    let mut resources = resources();
    let camera = Camera::first_person(Vec3::new(0.0, 20.0, 0.0), 0.0, -0.5);
    let mut scene = Scene::new().with_camera(camera);
    spawn_subject(RenderSystemKind::Model, &mut scene, &mut resources, &mut backend);
    scene.spawn(water_at(10.0));

    let mut systems = RenderSystems::new();
    let model = systems.add(system_for(
        RenderSystemKind::Model,
        &mut scene,
        &mut resources,
        &mut backend,
    ));
    let water = WaterRenderSystem::new(
        &mut scene.registry,
        &mut resources,
        &mut backend,
        WaterConfig::new(WIDTH, HEIGHT),
    )
    .unwrap()
    .capturing([model]);
    let reflection = water.reflection_target().handle();
    let refraction = water.refraction_target().handle();
    systems.push(water);

    {
        let mut ctx = RenderContext::new(&mut backend, &mut resources, &scene, viewport());
        systems.render_all(&mut ctx).unwrap();
    }

    let models: Vec<_> = backend.draws_with_program("model").collect();
    assert_eq!(models.len(), 3, "main pass plus one draw per capture");

    let reflected = models
        .iter()
        .find(|d| d.framebuffer == Some(reflection))
        .unwrap();
    assert_eq!(camera_height(reflected), 0.0);
    assert_eq!(
        reflected.uniform("clip_plane"),
        Some(&UniformValue::Vec4(ClipPlane::above(10.0).as_vec4()))
    );

    let refracted = models
        .iter()
        .find(|d| d.framebuffer == Some(refraction))
        .unwrap();
    assert_eq!(camera_height(refracted), 20.0);
    assert_eq!(
        refracted.uniform("clip_plane"),
        Some(&UniformValue::Vec4(ClipPlane::below(10.0).as_vec4()))
    );

    let surface: Vec<_> = backend.draws_with_program("water").collect();
    assert_eq!(surface.len(), 1);
    assert_eq!(surface[0].framebuffer, None);
    assert_eq!(camera_height(surface[0]), 20.0);

    assert_eq!(scene.clip_plane, ClipPlane::DISABLED);
    assert_eq!(scene.camera, camera);
    assert_eq!(backend.bound_framebuffer(), None);
    assert_eq!(backend.viewport(), viewport());

    systems.release(&mut backend);
    resources.release_all(&mut backend);
}

/// Renders the wrapped system only from inside an off-screen capture
struct CapturedOnly<S>(S);

impl<S: RenderSystem> RenderSystem for CapturedOnly<S> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn kind(&self) -> RenderSystemKind {
        self.0.kind()
    }

    fn begin_frame(&mut self) {
        self.0.begin_frame();
    }

    fn render_state(&self) -> RenderState {
        self.0.render_state()
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, siblings: &mut Siblings<'_>) -> EngineResult<()> {
        if !ctx.capture {
            return Ok(());
        }
        self.0.render(ctx, siblings)
    }

    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.0.release(backend);
    }
}

#[test]
fn test_failed_capture_leaves_no_altered_state() {
    let mut backend = backend();
    let mut resources = resources();
    let camera = Camera::first_person(Vec3::new(0.0, 20.0, 0.0), 0.0, -0.5);
    let mut scene = Scene::new().with_camera(camera);
    let cube = resources.meshes.builtin(&mut backend, BuiltinMesh::Cube).unwrap();
    scene.spawn((
        Model { mesh: cube },
        Transform::from_position(Vec3::Y * 15.0),
        Material::textured(TextureKey::file("missing.png")),
    ));
    scene.spawn(water_at(10.0));

    let mut systems = RenderSystems::new();
    let model = ModelRenderSystem::new(&mut scene.registry, &mut resources, &mut backend).unwrap();
    let model = systems.push(CapturedOnly(model));
    let water = WaterRenderSystem::new(
        &mut scene.registry,
        &mut resources,
        &mut backend,
        WaterConfig::new(WIDTH, HEIGHT),
    )
    .unwrap()
    .capturing([model]);
    let reflection = water.reflection_target().handle();
    systems.push(water);

    let result = {
        let mut ctx = RenderContext::new(&mut backend, &mut resources, &scene, viewport());
        systems.render_all(&mut ctx)
    };

    let err = result.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TextureLoad { .. }), "{err}");
    assert!(backend
        .commands()
        .iter()
        .any(|command| matches!(command, Command::BindFramebuffer(Some(fb)) if *fb == reflection)));
    assert_eq!(backend.bound_framebuffer(), None);
    assert_eq!(backend.viewport(), viewport());
    assert_eq!(backend.render_state(), RenderState::ENGINE_DEFAULT);
    assert_eq!(backend.draws_with_program("water").count(), 0);
    assert_eq!(scene.clip_plane, ClipPlane::DISABLED);
    assert_eq!(scene.camera, camera);

    systems.release(&mut backend);
    resources.release_all(&mut backend);
    assert_eq!(backend.live_framebuffers(), 0);
}

#[test]
fn test_captured_particles_keep_their_own_instances() {
    let mut backend = backend();
    let mut resources = resources();
    let camera = Camera::first_person(Vec3::new(0.0, 20.0, 10.0), 0.0, -0.5);
    let mut scene = Scene::new().with_camera(camera);
    spawn_subject(RenderSystemKind::Particle, &mut scene, &mut resources, &mut backend);
    scene.spawn(water_at(-5.0));

    let mut systems = RenderSystems::new();
    let particles = systems.add(system_for(
        RenderSystemKind::Particle,
        &mut scene,
        &mut resources,
        &mut backend,
    ));
    let water = WaterRenderSystem::new(
        &mut scene.registry,
        &mut resources,
        &mut backend,
        WaterConfig::new(WIDTH, HEIGHT),
    )
    .unwrap()
    .capturing([particles]);
    systems.push(water);
    systems.update_all(0.5, &mut scene);

    for _ in 0..2 {
        backend.take_commands();
        {
            let mut ctx = RenderContext::new(&mut backend, &mut resources, &scene, viewport());
            systems.render_all(&mut ctx).unwrap();
        }

        let mut ranges: Vec<_> = backend
            .draws_with_program("particle")
            .map(|draw| draw.instances.clone())
            .collect();
        assert_eq!(ranges.len(), 3, "main pass plus both captures");
        assert_eq!(ranges[0].start, 0, "each frame starts over");
        ranges.sort_by_key(|range| range.start);
        for pair in ranges.windows(2) {
            assert!(pair[0].end <= pair[1].start, "{ranges:?} overlap");
        }
    }

    systems.release(&mut backend);
    resources.release_all(&mut backend);
}

#[rstest]
#[case::model(RenderSystemKind::Model)]
#[case::instancing(RenderSystemKind::Instancing)]
#[case::skybox(RenderSystemKind::Skybox)]
#[case::gui(RenderSystemKind::Gui)]
#[case::particle(RenderSystemKind::Particle)]
#[case::terrain(RenderSystemKind::Terrain)]
#[case::water(RenderSystemKind::Water)]
#[case::skeletal(RenderSystemKind::Skeletal)]
#[case::deferred(RenderSystemKind::Deferred)]
fn test_render_state_is_restored_after_each_system(#[case] kind: RenderSystemKind) {
    let mut backend = backend();
    let mut resources = resources();
    let mut scene = Scene::new();
    spawn_subject(kind, &mut scene, &mut resources, &mut backend);

    let mut systems = RenderSystems::new();
    let id = systems.add(system_for(kind, &mut scene, &mut resources, &mut backend));
    let expected = systems.get(id).unwrap().render_state();
    assert_eq!(systems.get(id).unwrap().kind(), kind);

    systems.update_all(0.5, &mut scene);
    {
        let mut ctx = RenderContext::new(&mut backend, &mut resources, &scene, viewport());
        systems.render_all(&mut ctx).unwrap();
    }

    let states: Vec<RenderState> = backend
        .commands()
        .iter()
        .filter_map(|command| match command {
            Command::SetRenderState(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states.first(), Some(&expected));
    assert_eq!(states.last(), Some(&RenderState::ENGINE_DEFAULT));
    assert_eq!(backend.render_state(), RenderState::ENGINE_DEFAULT);
    assert!(backend.draw_calls().count() > 0, "{kind:?} drew nothing");

    systems.release(&mut backend);
    resources.release_all(&mut backend);
}

#[test]
fn test_resources_are_shared_between_systems() {
    let mut backend = backend();
    let mut resources = resources();
    let mut scene = Scene::new();

    let _first = system_for(RenderSystemKind::Model, &mut scene, &mut resources, &mut backend);
    let _second = system_for(RenderSystemKind::Model, &mut scene, &mut resources, &mut backend);
    assert_eq!(resources.shaders.constructions(), 1);

    let a = resources.shaders.get(&mut backend, ShaderKind::Model).unwrap();
    let b = resources.shaders.get(&mut backend, ShaderKind::Model).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(backend.programs_created(), 1);

    let grass = resources.textures.get(&mut backend, "terrain/grass.png").unwrap();
    let again = resources.textures.get(&mut backend, "terrain/./grass.png").unwrap();
    assert!(Arc::ptr_eq(&grass, &again));
    assert_eq!(backend.textures_created(), 1);

    resources.release_all(&mut backend);
    assert_eq!(backend.live_programs(), 0);
    assert_eq!(backend.live_textures(), 0);
}

#[test]
fn test_missing_texture_fails_the_frame_without_caching() {
    let mut backend = backend();
    let mut resources = resources();
    let mut scene = Scene::new();
    let cube = resources.meshes.builtin(&mut backend, BuiltinMesh::Cube).unwrap();
    let missing = TextureKey::file("textures/missing_rock.png");
    scene.spawn((
        Model { mesh: cube },
        Transform::default(),
        Material::textured(missing.clone()).with_tint(Vec4::ONE),
    ));

    let mut systems = RenderSystems::new();
    systems.add(system_for(RenderSystemKind::Model, &mut scene, &mut resources, &mut backend));
    let result = {
        let mut ctx = RenderContext::new(&mut backend, &mut resources, &scene, viewport());
        systems.render_all(&mut ctx)
    };

    let err = result.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TextureLoad { .. }), "{err}");
    assert!(!resources.textures.contains(&missing));
    assert_eq!(backend.live_textures(), 0);
    assert_eq!(backend.render_state(), RenderState::ENGINE_DEFAULT);

    resources.release_all(&mut backend);
}

#[test]
fn test_scene_state_releases_everything_at_shutdown() {
    let config = EngineConfig::default().with_update_rate(30);
    let mut app = Application::with_resources(backend(), resources(), config).unwrap();
    let state = SceneState::new("harbor", |ctx, scene, systems| {
        scene.spawn(water_at(0.0));
        scene.add_point_light(PointLight::new(Vec3::new(0.0, 4.0, 0.0)));
        let skybox = SkyboxRenderSystem::new(&mut scene.registry, ctx.resources, ctx.backend)?;
        let model = ModelRenderSystem::new(&mut scene.registry, ctx.resources, ctx.backend)?;
        let skybox = systems.push(skybox);
        let model = systems.push(model);
        let (width, height) = (ctx.viewport.width, ctx.viewport.height);
        let water = WaterRenderSystem::new(
            &mut scene.registry,
            ctx.resources,
            ctx.backend,
            WaterConfig::new(width, height).with_reflection_scale(ctx.config.reflection_scale),
        )?;
        systems.push(water.capturing([skybox, model]));
        Ok(())
    });
    app.push_state(Box::new(state)).unwrap();

    assert!(app.tick(Duration::from_millis(100)).unwrap());
    assert_eq!(app.backend().frames_submitted(), 1);
    assert_eq!(app.backend().draws_with_program("water").count(), 1);
    assert!(app.backend().live_framebuffers() >= 2);

    app.shutdown();
    let backend = app.backend();
    assert_eq!(backend.live_framebuffers(), 0);
    assert_eq!(backend.live_textures(), 0);
    assert_eq!(backend.live_programs(), 0);
    assert_eq!(backend.live_buffers(), 0);
}

#[test]
fn test_failed_scene_setup_releases_partial_systems() {
    let mut app = Application::with_resources(backend(), resources(), EngineConfig::default()).unwrap();
    let state = SceneState::new("broken", |ctx, scene, systems| {
        let world = &mut scene.registry;
        let deferred = DeferredRenderSystem::new(world, ctx.resources, ctx.backend, WIDTH, HEIGHT)?;
        systems.push(deferred);
        let water = WaterRenderSystem::new(world, ctx.resources, ctx.backend, WaterConfig::new(0, 0))?;
        systems.push(water);
        Ok(())
    });

    let err = app.push_state(Box::new(state)).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::FramebufferIncomplete { .. }), "{err}");
    assert!(app.states().is_empty());
    assert_eq!(app.backend().live_framebuffers(), 0);

    app.shutdown();
    assert_eq!(app.backend().live_framebuffers(), 0);
    assert_eq!(app.backend().live_textures(), 0);
    assert_eq!(app.backend().live_programs(), 0);
}
