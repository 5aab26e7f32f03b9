//! Reflective shadow map generator
//!
//! Renders depth, normal and flux from the light instead of plain depth, so
//! indirect lighting can treat every texel as a small virtual light. Shares
//! the whole generator protocol with [`ShadowGenerator`] and only replaces
//! the resource layout, the post operations and what `begin_read` uploads.

use crate::constants::{RsmConstants, RsmParams};
use crate::device::{ConstantBlock, GraphicsDevice, SystemState};
use crate::generator::{GeneratorId, GeneratorKind, ShadowGenerator};
use crate::pool::{ResourceId, ResourcePool, SamplerState, TargetKey, TargetUsage};
use crate::postprocess::PostOpTable;
use crate::settings::IndirectLightingMethod;
use crate::visibility::LightKind;
use crate::{protocol_violation, Error, Result};
use glam::Mat4;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::ops::{Deref, DerefMut};

/// Side of the random rotation texture sampled by the indirect lookup
pub const RANDOM_TEXTURE_SIZE: u32 = 16;

const RANDOM_SEED: u64 = 0x5eed_0f_715a;

/// How the indirect lookup walks the G-buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SamplingMethod {
    Random = 0,
    ProjectCell = 1,
    BoxFilter = 2,
}

pub struct ReflectanceGenerator {
    inner: ShadowGenerator,
    random_texture: Option<ResourceId>,
    random_uploaded: bool,
}

impl ReflectanceGenerator {
    pub fn new(id: GeneratorId, light_kind: LightKind, frustum_index: usize) -> Self {
        Self {
            inner: ShadowGenerator::new(id, light_kind, frustum_index)
                .with_kind(GeneratorKind::Reflective, PostOpTable::reflective()),
            random_texture: None,
            random_uploaded: false,
        }
    }

    pub fn random_texture(&self) -> Option<ResourceId> {
        self.random_texture
    }

    pub fn sampling_method(&self) -> SamplingMethod {
        let settings = self.inner.settings();
        if settings.project_cell {
            SamplingMethod::ProjectCell
        } else if settings.box_filter {
            SamplingMethod::BoxFilter
        } else {
            SamplingMethod::Random
        }
    }

    /// Lease the G-buffer targets. The random texture is created on first use.
    pub fn assign_resources(&mut self, pool: &mut ResourcePool) -> Result<u32> {
        if self.inner.registers().random.is_some() && self.random_texture.is_none() {
            let key = TargetKey::square(RANDOM_TEXTURE_SIZE, wgpu::TextureFormat::Rgba8Unorm, TargetUsage::Texture);
            let texture = pool.create_persistent(key);
            let sampler = pool.sampler(SamplerState::wrap_point());
            self.random_texture = Some(texture);
            self.random_uploaded = false;
            self.inner.set_random_texture(Some((texture, sampler)));
        }
        self.inner.assign_resources(pool)
    }

    fn upload_random_texture(&mut self, device: &mut dyn GraphicsDevice) -> Result<()> {
        let Some(texture) = self.random_texture else {
            return Ok(());
        };
        if self.random_uploaded {
            return Ok(());
        }
        let mut rng = StdRng::seed_from_u64(RANDOM_SEED);
        let mut data = vec![0u8; (RANDOM_TEXTURE_SIZE * RANDOM_TEXTURE_SIZE * 4) as usize];
        rng.fill(&mut data[..]);
        device.write_texture(texture, &data)?;
        log::debug!("Uploaded {}x{} RSM random texture", RANDOM_TEXTURE_SIZE, RANDOM_TEXTURE_SIZE);
        self.random_uploaded = true;
        Ok(())
    }

    /// Constant block for the current light and G-buffer
    pub fn rsm_constants(&self) -> Result<RsmConstants> {
        let (Some(light), Some(camera)) = (self.inner.light(), self.inner.light_camera()) else {
            return Err(Error::Resource(format!(
                "{:?} has no light camera; compute_visibility_set must run first",
                self.inner.id()
            )));
        };
        let s = self.inner.settings();
        let resolution = self.inner.resolution();
        Ok(RsmConstants::new(&RsmParams {
            size: self.inner.final_resolution().min(resolution) as f32,
            merged_size: resolution as f32,
            view: camera.view,
            projection: camera.projection,
            near: camera.near,
            far: camera.far,
            position: light.position,
            direction: light.direction,
            color: light.color * s.intensity * light.hdr_scale,
            sample_radius: s.filter_radius,
            geometry_bias: s.minimum_cutoff,
        }))
    }

    /// Bind the G-buffer and upload the indirect lighting constants.
    pub fn begin_read(&mut self, device: &mut dyn GraphicsDevice, texture_projection: Option<Mat4>) -> Result<()> {
        if self.inner.light_camera().is_none() {
            return Err(protocol_violation(format!(
                "{:?} begin_read before compute_visibility_set",
                self.inner.id()
            )));
        }
        let constants = self.rsm_constants()?;
        self.inner.enter_read(device)?;
        self.upload_random_texture(device)?;

        device.upload_constants(ConstantBlock::Rsm, bytemuck::bytes_of(&constants))?;
        self.inner.upload_texture_projection(device, texture_projection)?;

        let settings = self.inner.settings();
        if settings
            .indirect_method
            .contains(IndirectLightingMethod::PROPAGATION_VOLUMES)
        {
            let registers = *self.inner.registers();
            let read = self.inner.read_operations().get(0);
            let depth = registers.depth.and_then(|slot| read.and_then(|op| op.input_at(slot)));
            let normal = registers.normal.and_then(|slot| read.and_then(|op| op.input_at(slot)));
            if let (Some(depth), Some(normal)) = (depth, normal) {
                device.bind_vpl_data(depth.texture, normal.texture);
            }
        } else {
            device.set_system_state(SystemState::SamplingMethod, self.sampling_method() as u32);
            device.set_system_state(SystemState::PrimaryTaps, settings.primary_samples);
            device.set_system_state(SystemState::SecondaryTaps, settings.secondary_samples);
        }
        Ok(())
    }
}

impl Deref for ReflectanceGenerator {
    type Target = ShadowGenerator;

    fn deref(&self) -> &ShadowGenerator {
        &self.inner
    }
}

impl DerefMut for ReflectanceGenerator {
    fn deref_mut(&mut self) -> &mut ShadowGenerator {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCommand, ImageProgram, RecordingDevice};
    use crate::operation::OperationKind;
    use crate::pool::{LeaseKind, PoolConfig, ResourceRole};
    use crate::settings::{ShadowMethod, ShadowSettingsLight, ShadowSettingsSystem, Versioned};
    use crate::visibility::{Aabb, ObjectId, SceneCamera, SceneObject, ShadowLight, ShadowScene};
    use glam::Vec3;

    struct Scene(Vec<SceneObject>);

    impl ShadowScene for Scene {
        fn frame(&self) -> u64 {
            1
        }

        fn objects(&self) -> &[SceneObject] {
            &self.0
        }
    }

    fn scene() -> Scene {
        Scene(vec![
            SceneObject {
                id: ObjectId(1),
                bounds: Aabb::new(Vec3::new(-5.0, -1.0, -5.0), Vec3::new(5.0, 0.0, 5.0)),
                casts_shadows: true,
                receives_shadows: true,
                last_modified: 0,
            },
            SceneObject {
                id: ObjectId(2),
                bounds: Aabb::new(Vec3::new(-0.5, 1.5, -0.5), Vec3::new(0.5, 2.5, 0.5)),
                casts_shadows: true,
                receives_shadows: false,
                last_modified: 0,
            },
        ])
    }

    fn camera() -> SceneCamera {
        SceneCamera::new(Vec3::new(0.0, 5.0, 15.0), Vec3::new(0.0, -0.3, -1.0), 1.0, 1.0, 0.1, 100.0)
    }

    fn box_filtered() -> Versioned<ShadowSettingsSystem> {
        Versioned::new(ShadowSettingsSystem {
            method: ShadowMethod::RSM,
            box_filter: true,
            primary_samples: 32,
            ..Default::default()
        })
    }

    fn pool() -> ResourcePool {
        ResourcePool::new(PoolConfig::default().with_resolution_range(1, 256))
    }

    #[test]
    fn box_filter_adds_low_resolution_copies() {
        let mut pool = pool();
        let mut rsm = ReflectanceGenerator::new(GeneratorId(1), LightKind::Directional, 0);
        rsm.update(256, &box_filtered(), &Versioned::default(), &pool).unwrap();
        assert_eq!(rsm.final_resolution(), 32);
        assert_eq!(rsm.descriptors().len(), 7);
        assert!(rsm.method().contains(ShadowMethod::BOX_FILTER));

        assert_eq!(rsm.assign_resources(&mut pool).unwrap(), 0);
        let color = rsm
            .descriptors()
            .iter()
            .position(|d| d.role == ResourceRole::ColorMap)
            .unwrap();
        assert_eq!(rsm.resources()[color].kind, LeaseKind::Dedicated);

        let post: Vec<_> = rsm.post_operations().iter().map(|op| op.kind).collect();
        assert_eq!(post, vec![OperationKind::DownsampleRsmMax]);
        let read = rsm.read_operations().get(0).unwrap();
        assert_eq!(read.inputs.len(), 4);
    }

    #[test]
    fn frame_reduces_gbuffer_and_uploads_flux() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut pool = pool();
        let mut device = RecordingDevice::new();
        let mut rsm = ReflectanceGenerator::new(GeneratorId(1), LightKind::Directional, 0);
        let light_settings = Versioned::new(ShadowSettingsLight {
            intensity: 2.0,
            ..Default::default()
        });
        rsm.update(256, &box_filtered(), &light_settings, &pool).unwrap();
        rsm.assign_resources(&mut pool).unwrap();
        let light = ShadowLight::directional(Vec3::NEG_Y, Vec3::new(1.0, 0.5, 0.25));
        assert!(rsm.compute_visibility_set(&mut pool, &scene(), &light, &camera(), None));

        for frame in 0..2 {
            let passes = rsm.begin_write(false, false);
            assert_eq!(passes, 1);
            rsm.begin_write_pass(&mut device, 0).unwrap();
            rsm.end_write_pass(&mut device).unwrap();
            rsm.end_write(&mut device, &mut pool).unwrap();
            if frame == 0 {
                // 256 → 128 → 64 → 32
                let reductions = device
                    .draws()
                    .into_iter()
                    .filter(|p| matches!(p, ImageProgram::Downsample { targets: 3, .. }))
                    .count();
                assert_eq!(reductions, 3);
            }

            rsm.begin_read(&mut device, None).unwrap();
            rsm.end_read(&mut device).unwrap();
        }

        let uploads = device
            .commands()
            .iter()
            .filter(|c| matches!(c, DeviceCommand::WriteTexture { .. }))
            .count();
        assert_eq!(uploads, 1);

        let block = device.last_constants(ConstantBlock::Rsm).unwrap();
        let constants: RsmConstants = bytemuck::pod_read_unaligned(block);
        assert_eq!(constants.color, [2.0, 1.0, 0.5]);
        assert!(device.commands().contains(&DeviceCommand::SystemState {
            state: SystemState::SamplingMethod,
            value: SamplingMethod::BoxFilter as u32,
        }));
    }

    #[test]
    fn propagation_volumes_bind_vpl_data() {
        let mut pool = pool();
        let mut device = RecordingDevice::new();
        let system = Versioned::new(ShadowSettingsSystem {
            method: ShadowMethod::RSM,
            indirect_method: IndirectLightingMethod::PROPAGATION_VOLUMES,
            ..Default::default()
        });
        let mut rsm = ReflectanceGenerator::new(GeneratorId(2), LightKind::Directional, 0);
        rsm.update(64, &system, &Versioned::default(), &pool).unwrap();
        rsm.assign_resources(&mut pool).unwrap();
        let light = ShadowLight::directional(Vec3::NEG_Y, Vec3::ONE);
        assert!(rsm.compute_visibility_set(&mut pool, &scene(), &light, &camera(), None));
        rsm.begin_write(false, false);
        rsm.begin_write_pass(&mut device, 0).unwrap();
        rsm.end_write_pass(&mut device).unwrap();
        rsm.end_write(&mut device, &mut pool).unwrap();

        rsm.begin_read(&mut device, None).unwrap();
        assert!(device
            .commands()
            .iter()
            .any(|c| matches!(c, DeviceCommand::VplData { .. })));
        assert!(!device.commands().iter().any(|c| matches!(
            c,
            DeviceCommand::SystemState { state: SystemState::SamplingMethod, .. }
        )));
        rsm.end_read(&mut device).unwrap();
    }
}
