//! Lights competing for a fixed target budget

use helio_shadow_gen::pool::TargetKey;
use helio_shadow_gen::{
    FillStatus, GeneratorId, LeaseKind, LightKind, PoolConfig, ResourceDescriptor, ResourcePool, ResourceRole,
    ShadowGenerator, TargetUsage, Versioned,
};
use wgpu::TextureFormat;

const SHADOW_SIZE: u32 = 1024;
const RSM_SIZE: u32 = 512;

fn shadow_key() -> TargetKey {
    TargetKey::square(SHADOW_SIZE, TextureFormat::Depth32Float, TargetUsage::ShadowMap)
}

fn rsm_color() -> ResourceDescriptor {
    ResourceDescriptor::cached(ResourceRole::ColorMap, RSM_SIZE, TextureFormat::Rgba8Unorm, TargetUsage::RenderTarget)
}

/// Four dedicated shadow maps, one RSM color map, and a shared fallback
fn budgeted_pool() -> ResourcePool {
    let budget = shadow_key().size_bytes() * 4 + rsm_color().key.size_bytes();
    let mut pool = ResourcePool::new(PoolConfig::default().with_memory_limit(Some(budget)));
    assert_eq!(pool.add_cached_maps(shadow_key(), 4), 4);
    assert_eq!(pool.add_cached_maps(rsm_color().key, 1), 1);
    pool.add_default_maps(&[shadow_key()]);
    pool
}

fn lights(pool: &mut ResourcePool, count: u32) -> Vec<ShadowGenerator> {
    (0..count)
        .map(|i| {
            let mut generator = ShadowGenerator::new(GeneratorId(i + 1), LightKind::Directional, 0);
            generator
                .update(SHADOW_SIZE, &Versioned::default(), &Versioned::default(), pool)
                .unwrap();
            generator
        })
        .collect()
}

#[test]
fn fifth_light_falls_back_to_the_default_map() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = budgeted_pool();
    let budget = pool.config().memory_limit.unwrap();
    let mut generators = lights(&mut pool, 5);

    let defaults: Vec<u32> = generators
        .iter_mut()
        .map(|g| g.assign_resources(&mut pool).unwrap())
        .collect();
    assert_eq!(defaults, vec![0, 0, 0, 0, 1]);

    for generator in &generators[..4] {
        assert_eq!(generator.resources()[0].kind, LeaseKind::Dedicated);
        assert_eq!(generator.fill_status(), FillStatus::MustFill);
    }
    let fifth = &generators[4];
    assert_eq!(fifth.default_count(), 1);
    assert_eq!(fifth.resources()[0].kind, LeaseKind::Default);
    assert!(fifth.requires_default_resource());
    assert_eq!(fifth.fill_status(), FillStatus::CannotFill);

    // Every dedicated map went to a different light
    let mut ids: Vec<_> = generators[..4].iter().map(|g| g.resources()[0].id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(pool.available_count(&shadow_key()), 0);
    assert!(pool.dedicated_bytes() <= budget);

    // The RSM color target is a different descriptor with its own cached map
    let rsm = pool.lease(GeneratorId(100), &[rsm_color()]).unwrap();
    assert_eq!(rsm.default_count, 0);
    assert_eq!(rsm.resources[0].kind, LeaseKind::Dedicated);
    assert_eq!(rsm.resources[0].width, RSM_SIZE);
    assert!(pool.dedicated_bytes() <= budget);
}

#[test]
fn released_map_goes_to_the_waiting_light() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = budgeted_pool();
    let mut generators = lights(&mut pool, 5);
    for generator in generators.iter_mut() {
        generator.assign_resources(&mut pool).unwrap();
    }
    let freed = generators[0].resources()[0].id;

    generators[0].release_resources(&mut pool);
    assert!(generators[0].resources().is_empty());
    assert_eq!(pool.available_count(&shadow_key()), 1);

    // Force the fifth light to renegotiate
    pool.reset_availability();
    assert!(!generators[4].reassign_resources(&mut pool));
    assert_eq!(generators[4].assign_resources(&mut pool).unwrap(), 0);
    assert_eq!(generators[4].resources()[0].id, freed);
    assert_eq!(generators[4].fill_status(), FillStatus::MustFill);
}

#[test]
fn reclaimed_targets_keep_their_contents() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pool = budgeted_pool();
    let mut generators = lights(&mut pool, 4);
    for generator in generators.iter_mut() {
        generator.assign_resources(&mut pool).unwrap();
    }
    let before: Vec<_> = generators.iter().map(|g| g.resources()[0].id).collect();

    pool.reset_availability();
    for generator in generators.iter_mut() {
        assert!(generator.reassign_resources(&mut pool));
        assert_eq!(generator.assign_resources(&mut pool).unwrap(), 0);
        assert_eq!(generator.fill_status(), FillStatus::CanFill);
    }
    let after: Vec<_> = generators.iter().map(|g| g.resources()[0].id).collect();
    assert_eq!(before, after);
}
