//! Frame protocol driven through the public API with a recording device

use glam::Vec3;
use helio_shadow_gen::device::{DeviceCommand, ImageProgram};
use helio_shadow_gen::settings::EdgeMaskType;
use helio_shadow_gen::visibility::ObjectId;
use helio_shadow_gen::{
    Aabb, Error, FillStatus, GeneratorId, IndirectLightingMethod, LightKind, OperationKind, Phase, PoolConfig,
    RecordingDevice, ReflectanceGenerator, ResourcePool, ResourceRole, SceneCamera, SceneObject, ShadowGenerator,
    ShadowLight, ShadowMethod, ShadowScene, ShadowSettingsSystem, Versioned,
};

struct Yard {
    frame: u64,
    objects: Vec<SceneObject>,
}

impl ShadowScene for Yard {
    fn frame(&self) -> u64 {
        self.frame
    }

    fn objects(&self) -> &[SceneObject] {
        &self.objects
    }
}

fn yard() -> Yard {
    Yard {
        frame: 1,
        objects: vec![
            SceneObject {
                id: ObjectId(10),
                bounds: Aabb::new(Vec3::new(-20.0, -1.0, -20.0), Vec3::new(20.0, 0.0, 20.0)),
                casts_shadows: false,
                receives_shadows: true,
                last_modified: 0,
            },
            SceneObject {
                id: ObjectId(11),
                bounds: Aabb::new(Vec3::new(-1.0, 0.0, -1.0), Vec3::new(1.0, 4.0, 1.0)),
                casts_shadows: true,
                receives_shadows: true,
                last_modified: 0,
            },
        ],
    }
}

fn camera() -> SceneCamera {
    SceneCamera::new(Vec3::new(0.0, 6.0, 18.0), Vec3::new(0.0, -0.3, -1.0), 1.0, 1.0, 0.1, 100.0)
}

fn sun() -> ShadowLight {
    ShadowLight::directional(Vec3::new(0.3, -1.0, 0.2), Vec3::ONE)
}

fn pool() -> ResourcePool {
    ResourcePool::new(PoolConfig::default().with_resolution_range(16, 512))
}

fn fill(generator: &mut ShadowGenerator, device: &mut RecordingDevice, pool: &mut ResourcePool) {
    let passes = generator.begin_write(false, false);
    assert!(passes > 0);
    for i in 0..passes {
        generator.begin_write_pass(device, i).unwrap();
        generator.end_write_pass(device).unwrap();
    }
    generator.end_write(device, pool).unwrap();
}

#[test]
fn phases_follow_the_frame() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let mut device = RecordingDevice::new();
    let mut generator = ShadowGenerator::new(GeneratorId(1), LightKind::Directional, 0);
    assert_eq!(generator.phase(), Phase::Unassigned);

    generator
        .update(512, &Versioned::default(), &Versioned::default(), &pool)
        .unwrap();
    assert_eq!(generator.assign_resources(&mut pool).unwrap(), 0);
    assert_eq!(generator.phase(), Phase::ResourcesAssigned);
    assert!(generator.compute_visibility_set(&mut pool, &yard(), &sun(), &camera(), None));
    assert!(generator.contains_renderable_objects());

    generator.begin_write(false, false);
    assert_eq!(generator.phase(), Phase::Writing);
    generator.begin_write_pass(&mut device, 0).unwrap();
    assert!(device.targets_bound());
    generator.end_write_pass(&mut device).unwrap();
    generator.end_write(&mut device, &mut pool).unwrap();
    assert_eq!(generator.phase(), Phase::PostProcessing);
    assert_eq!(generator.fill_status(), FillStatus::CanFill);

    generator.begin_read(&mut device, 1.0, 1.0, 50.0, None).unwrap();
    assert_eq!(generator.phase(), Phase::Reading);
    generator.end_read(&mut device).unwrap();
    assert_eq!(generator.phase(), Phase::Idle);

    // The device is left the way the generator found it
    assert!(!device.targets_bound());
    let first = device.commands().first().cloned();
    assert!(matches!(first, Some(DeviceCommand::Camera(_))));
    assert!(matches!(device.commands().last(), Some(DeviceCommand::BindTexture { texture: None, .. })));
}

#[test]
fn cascades_own_their_statistics_maps() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let system = Versioned::new(ShadowSettingsSystem::default().with_method(ShadowMethod::VSM));
    let mut cascades: Vec<_> = (0..2)
        .map(|i| ShadowGenerator::new(GeneratorId(20 + i), LightKind::Directional, i as usize))
        .collect();
    for cascade in cascades.iter_mut() {
        cascade.update(512, &system, &Versioned::default(), &pool).unwrap();
        assert_eq!(cascade.assign_resources(&mut pool).unwrap(), 0);
    }

    let near = &cascades[0];
    let far = &cascades[1];
    // Depth scratch targets are shared, the filtered maps are not
    assert_eq!(near.resources()[0].id, far.resources()[0].id);
    assert_eq!(near.resources()[1].id, far.resources()[1].id);
    assert_ne!(near.resources()[2].id, far.resources()[2].id);
    assert!(near.can_blend(far));
}

#[test]
fn variance_maps_are_blurred_after_writing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let mut device = RecordingDevice::new();
    let system = Versioned::new(ShadowSettingsSystem::default().with_method(ShadowMethod::VSM));
    let mut generator = ShadowGenerator::new(GeneratorId(2), LightKind::Directional, 0);
    generator.update(256, &system, &Versioned::default(), &pool).unwrap();
    generator.assign_resources(&mut pool).unwrap();
    assert!(generator.compute_visibility_set(&mut pool, &yard(), &sun(), &camera(), None));

    fill(&mut generator, &mut device, &mut pool);

    let draws = device.draws();
    assert_eq!(draws.len(), 2);
    assert!(matches!(draws[0], ImageProgram::StatisticsBlur { convert_depth: true, .. }));
    assert!(matches!(draws[1], ImageProgram::StatisticsBlur { convert_depth: false, .. }));
    assert!(!device.targets_bound());
}

#[test]
fn unchanged_scene_is_not_refilled() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let mut device = RecordingDevice::new();
    let mut generator = ShadowGenerator::new(GeneratorId(3), LightKind::Directional, 0);
    generator
        .update(256, &Versioned::default(), &Versioned::default(), &pool)
        .unwrap();
    generator.assign_resources(&mut pool).unwrap();
    let mut scene = yard();
    assert!(generator.compute_visibility_set(&mut pool, &scene, &sun(), &camera(), None));
    assert!(generator.should_regenerate());
    fill(&mut generator, &mut device, &mut pool);
    generator.begin_read(&mut device, 1.0, 1.0, 50.0, None).unwrap();
    generator.end_read(&mut device).unwrap();

    pool.reset_availability();
    assert!(generator.reassign_resources(&mut pool));
    generator.assign_resources(&mut pool).unwrap();
    scene.frame = 2;
    assert!(generator.compute_visibility_set(&mut pool, &scene, &sun(), &camera(), None));
    assert!(!generator.should_regenerate());
}

#[test]
fn reflective_generator_shares_the_pool() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let mut device = RecordingDevice::new();
    let system = Versioned::new(ShadowSettingsSystem::default().with_method(ShadowMethod::RSM));

    let mut shadow = ShadowGenerator::new(GeneratorId(4), LightKind::Directional, 0);
    shadow
        .update(256, &Versioned::default(), &Versioned::default(), &pool)
        .unwrap();
    shadow.assign_resources(&mut pool).unwrap();

    let mut rsm = ReflectanceGenerator::new(GeneratorId(5), LightKind::Directional, 0);
    rsm.update(256, &system, &Versioned::default(), &pool).unwrap();
    assert_eq!(rsm.assign_resources(&mut pool).unwrap(), 0);
    assert!(rsm.random_texture().is_some());
    assert!(rsm.compute_visibility_set(&mut pool, &yard(), &sun(), &camera(), None));

    rsm.begin_write(false, false);
    rsm.begin_write_pass(&mut device, 0).unwrap();
    rsm.end_write_pass(&mut device).unwrap();
    rsm.end_write(&mut device, &mut pool).unwrap();
    rsm.begin_read(&mut device, None).unwrap();
    rsm.end_read(&mut device).unwrap();

    let shadow_ids: Vec<_> = shadow.resources().iter().filter(|r| r.is_dedicated()).map(|r| r.id).collect();
    assert!(rsm
        .resources()
        .iter()
        .filter(|r| r.is_dedicated())
        .all(|r| !shadow_ids.contains(&r.id)));
    assert_eq!(rsm.phase(), Phase::Idle);
}

#[test]
fn casters_come_back_after_an_empty_frame() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let mut device = RecordingDevice::new();
    let mut generator = ShadowGenerator::new(GeneratorId(6), LightKind::Directional, 0);
    generator
        .update(256, &Versioned::default(), &Versioned::default(), &pool)
        .unwrap();
    generator.assign_resources(&mut pool).unwrap();

    let mut empty = yard();
    empty.objects.retain(|o| !o.casts_shadows);
    assert!(!generator.compute_visibility_set(&mut pool, &empty, &sun(), &camera(), None));
    assert_eq!(generator.begin_write(false, false), -1);

    pool.reset_availability();
    generator.reassign_resources(&mut pool);
    generator.assign_resources(&mut pool).unwrap();
    let mut scene = yard();
    scene.frame = 2;
    assert!(generator.compute_visibility_set(&mut pool, &scene, &sun(), &camera(), None));
    fill(&mut generator, &mut device, &mut pool);
    generator.begin_read(&mut device, 1.0, 1.0, 50.0, None).unwrap();
    generator.end_read(&mut device).unwrap();
}

#[test]
fn last_fill_is_read_without_writing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let mut device = RecordingDevice::new();
    let mut generator = ShadowGenerator::new(GeneratorId(7), LightKind::Directional, 0);
    generator
        .update(256, &Versioned::default(), &Versioned::default(), &pool)
        .unwrap();
    generator.assign_resources(&mut pool).unwrap();
    let mut scene = yard();
    assert!(generator.compute_visibility_set(&mut pool, &scene, &sun(), &camera(), None));
    fill(&mut generator, &mut device, &mut pool);
    generator.begin_read(&mut device, 1.0, 1.0, 50.0, None).unwrap();
    generator.end_read(&mut device).unwrap();

    pool.reset_availability();
    assert!(generator.reassign_resources(&mut pool));
    generator.assign_resources(&mut pool).unwrap();
    assert_eq!(generator.fill_status(), FillStatus::CanFill);
    scene.frame = 2;
    assert!(generator.compute_visibility_set(&mut pool, &scene, &sun(), &camera(), None));
    let draws = device.draws().len();
    generator.begin_read(&mut device, 1.0, 1.0, 50.0, None).unwrap();
    generator.end_read(&mut device).unwrap();
    assert_eq!(device.draws().len(), draws);
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "protocol violation"))]
fn fresh_targets_cannot_be_read() {
    let mut pool = pool();
    let mut device = RecordingDevice::new();
    let mut generator = ShadowGenerator::new(GeneratorId(8), LightKind::Directional, 0);
    generator
        .update(256, &Versioned::default(), &Versioned::default(), &pool)
        .unwrap();
    generator.assign_resources(&mut pool).unwrap();
    assert!(generator.compute_visibility_set(&mut pool, &yard(), &sun(), &camera(), None));
    let err = generator.begin_read(&mut device, 1.0, 1.0, 50.0, None).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn edge_masks_pack_four_lights_per_target() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let system = Versioned::new(ShadowSettingsSystem::default().with_edge_mask(EdgeMaskType::Edge, 8));
    let mut lights: Vec<_> = (0..5)
        .map(|i| ShadowGenerator::new(GeneratorId(30 + i), LightKind::Directional, 0))
        .collect();
    let mut edges = Vec::new();
    for light in lights.iter_mut() {
        light.update(256, &system, &Versioned::default(), &pool).unwrap();
        assert_eq!(light.assign_resources(&mut pool).unwrap(), 0);
        assert!(light.uses_edge_mask());
        let slot = light
            .descriptors()
            .iter()
            .position(|d| d.role == ResourceRole::EdgeMap)
            .unwrap();
        edges.push((light.resources()[slot].id, light.edge_mask_channels().bits()));
    }

    // An RGBA8 mask holds one channel per light
    assert!(edges[..4].iter().all(|(id, _)| *id == edges[0].0));
    let bits: Vec<_> = edges[..4].iter().map(|(_, bits)| *bits).collect();
    assert_eq!(bits, vec![0b0001, 0b0010, 0b0100, 0b1000]);
    assert_ne!(edges[4].0, edges[0].0);
    assert_eq!(edges[4].1, 0b0001);
}

#[test]
fn vertex_texture_rsm_merges_depth_and_normals() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = pool();
    let mut device = RecordingDevice::new();
    let system = Versioned::new(ShadowSettingsSystem {
        method: ShadowMethod::RSM,
        indirect_method: IndirectLightingMethod::VTF,
        ..Default::default()
    });
    let mut rsm = ReflectanceGenerator::new(GeneratorId(9), LightKind::Directional, 0);
    rsm.update(128, &system, &Versioned::default(), &pool).unwrap();
    assert!(rsm.descriptors().iter().any(|d| d.role == ResourceRole::DepthNormalMap));
    rsm.assign_resources(&mut pool).unwrap();

    let post: Vec<_> = rsm.post_operations().iter().map(|op| op.kind).collect();
    assert_eq!(post, vec![OperationKind::MergeDepthNormal]);

    assert!(rsm.compute_visibility_set(&mut pool, &yard(), &sun(), &camera(), None));
    rsm.begin_write(false, false);
    rsm.begin_write_pass(&mut device, 0).unwrap();
    rsm.end_write_pass(&mut device).unwrap();
    rsm.end_write(&mut device, &mut pool).unwrap();
    assert_eq!(device.draws(), vec![ImageProgram::MergeDepthNormal]);
    rsm.begin_read(&mut device, None).unwrap();
    rsm.end_read(&mut device).unwrap();
}
