//! Per-light shadow map generator
//!
//! A generator owns the targets one light frustum renders into for a frame.
//! The owner drives it through a fixed protocol:
//!
//! ```text
//! update → reassign_resources / assign_resources → compute_visibility_set
//!        → begin_write → (begin_write_pass → end_write_pass)* → end_write
//!        → begin_read → end_read
//! ```
//!
//! Calls out of order are protocol violations: they assert in debug builds
//! and return [`Error::Protocol`] without touching any state in release.

use crate::constants::{attenuation_scale_bias, channel_selector, split_blend, ShadowConstants};
use crate::device::{ConstantBlock, GraphicsDevice, Rect, SystemState};
use crate::operation::{build_reflective_operations, build_shadow_operations, BuildContext, OperationList, OperationSet};
use crate::pool::{
    ChannelMask, LeasedResource, PoolConfig, ResourceDescriptor, ResourceId, ResourcePool, ResourceRole,
    SamplerFilter, SamplerId, SamplerState, TargetUsage,
};
use crate::postprocess::{PostOpContext, PostOpTable};
use crate::settings::{
    EdgeMaskType, IndirectLightingMethod, SettingsVersion, ShadowMethod, ShadowSettings, ShadowSettingsLight,
    ShadowSettingsSystem, Versioned,
};
use crate::visibility::{
    fit_ortho, fit_ortho_stable, light_view, perspective_camera, Aabb, Frustum, LightCamera, LightKind, ObjectId,
    SceneCamera, ShadowLight, ShadowScene,
};
use crate::{protocol_violation, Error, Result};
use crate::device::CameraState;
use glam::{Mat4, Vec3};

/// Identifies a generator to the pool
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct GeneratorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorKind {
    ShadowMap,
    Reflective,
}

/// Where a generator is in its frame protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    Unassigned,
    ResourcesAssigned,
    VisibilityComputed,
    Writing,
    PostProcessing,
    Reading,
    Idle,
}

/// What the owner should do with the targets after assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillStatus {
    /// Nothing to shadow (no resources, nothing visible)
    #[default]
    DoNothing,
    /// Only shared defaults were available; contents cannot be kept
    CannotFill,
    /// Last frame's contents are still valid
    CanFill,
    /// Fresh targets, contents undefined
    MustFill,
}

/// Shader sampler registers the read pass binds into. `None` disables the
/// features that need the register (edge masks, translucency, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerRegisters {
    pub depth: Option<u32>,
    pub edge: Option<u32>,
    pub color: Option<u32>,
    pub normal: Option<u32>,
    pub random: Option<u32>,
}

impl Default for SamplerRegisters {
    fn default() -> Self {
        Self {
            depth: Some(0),
            edge: Some(1),
            color: Some(2),
            normal: Some(3),
            random: Some(4),
        }
    }
}

impl SamplerRegisters {
    pub fn with_edge(mut self, slot: Option<u32>) -> Self {
        self.edge = slot;
        self
    }

    pub fn with_color(mut self, slot: Option<u32>) -> Self {
        self.color = slot;
        self
    }

    pub fn with_random(mut self, slot: Option<u32>) -> Self {
        self.random = slot;
        self
    }

    /// Every assigned register
    pub fn slots(&self) -> impl Iterator<Item = u32> {
        [self.depth, self.edge, self.color, self.normal, self.random]
            .into_iter()
            .flatten()
    }
}

/// Descriptors plus the capability bits resolved while choosing them
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Description {
    pub descriptors: Vec<ResourceDescriptor>,
    pub method: ShadowMethod,
    pub final_resolution: u32,
}

/// Edge mask size for a shadow resolution and filter radius.
///
/// The mask is dilated with 2x2 reductions until one texel covers the
/// filter kernel, then finished with a 3x3 filter.
pub fn edge_mask_resolution(resolution: u32, filter_radius: f32) -> u32 {
    let kernel = filter_radius.ceil() * 2.0 + 1.0;
    let mips = (kernel / 3.0).log2().ceil().max(0.0) as u32;
    resolution.checked_shr(mips).unwrap_or(0).max(1)
}

fn statistics_sampler(settings: &ShadowSettings) -> (SamplerState, bool) {
    let mut state = SamplerState::linear();
    if settings.anisotropy_samples > 0 {
        state.filter = SamplerFilter::Anisotropic(settings.anisotropy_samples.min(16) as u16);
    } else if settings.trilinear {
        state.filter = SamplerFilter::Trilinear;
    } else if !settings.bilinear {
        return (SamplerState::point(), true);
    }
    (state, false)
}

/// Pick targets and capability bits for a set of settings.
pub(crate) fn describe_resources(
    kind: GeneratorKind,
    settings: &ShadowSettings,
    pool: &ResourcePool,
    resolution: u32,
    registers: &SamplerRegisters,
) -> Description {
    let config: &PoolConfig = pool.config();
    let precision = settings.precision;
    let technique = settings.method.technique();
    let mut method = technique;
    method |= match precision {
        16 => ShadowMethod::BITS_16,
        24 => ShadowMethod::BITS_24,
        _ => ShadowMethod::BITS_32,
    };

    let size = resolution;
    let depth_format = pool.best_depth_format(precision);
    let mut descriptors = Vec::new();
    let mut final_resolution = resolution;

    if kind == GeneratorKind::Reflective || technique.contains(ShadowMethod::REFLECTIVE) {
        let rgba8 = pool.best_render_target_format(8, 4);
        let gbuffer = [
            ResourceDescriptor::cached(ResourceRole::DepthMap, size, wgpu::TextureFormat::R32Float, TargetUsage::RenderTarget),
            ResourceDescriptor::cached(ResourceRole::NormalMap, size, rgba8, TargetUsage::RenderTarget),
            ResourceDescriptor::cached(ResourceRole::ColorMap, size, rgba8, TargetUsage::RenderTarget),
        ];
        descriptors.push(ResourceDescriptor::shared(
            ResourceRole::DepthStencilBuffer,
            size,
            depth_format,
            TargetUsage::ShadowMap,
        ));
        descriptors.extend(gbuffer);
        if settings.box_filter {
            final_resolution = settings.primary_samples.max(1).next_power_of_two().min(size);
            descriptors.extend(gbuffer.map(|d| d.with_size(final_resolution)));
            method |= ShadowMethod::BOX_FILTER;
        }
        if settings.indirect_method.contains(IndirectLightingMethod::VTF) {
            descriptors.push(ResourceDescriptor::cached(
                ResourceRole::DepthNormalMap,
                final_resolution,
                wgpu::TextureFormat::Rgba16Float,
                TargetUsage::RenderTarget,
            ));
        }
    } else if technique.is_statistical() {
        descriptors.push(ResourceDescriptor::shared(
            ResourceRole::DepthStencilBuffer,
            size,
            depth_format,
            TargetUsage::ShadowMap,
        ));
        descriptors.push(ResourceDescriptor::shared(
            ResourceRole::DepthMap,
            size,
            pool.best_render_target_format(precision, 1),
            TargetUsage::RenderTarget,
        ));
        let channels = if technique.contains(ShadowMethod::EVSM) {
            4
        } else if technique.contains(ShadowMethod::VARIANCE) {
            2
        } else {
            1
        };
        let (sampler, manual) = statistics_sampler(settings);
        if manual {
            method |= ShadowMethod::MANUAL_2X2;
        }
        descriptors.push(
            ResourceDescriptor::cached(
                ResourceRole::StatisticsMap,
                size,
                pool.best_render_target_format(precision, channels),
                TargetUsage::RenderTarget,
            )
            .with_sampler(sampler),
        );
    } else {
        let pure_pcf = !technique.contains(ShadowMethod::SOFT_SHADOWS);
        let depth_map = pool.best_render_target_format(precision, 1);
        if pure_pcf && config.hardware_shadow_maps {
            descriptors.push(
                ResourceDescriptor::cached(ResourceRole::DepthStencilBuffer, size, depth_format, TargetUsage::ShadowMap)
                    .with_sampler(SamplerState::compare()),
            );
            descriptors.push(ResourceDescriptor::shared(ResourceRole::DepthMap, size, depth_map, TargetUsage::RenderTarget));
            method |= ShadowMethod::HARDWARE | ShadowMethod::COMPARE;
        } else if config.depth_reads {
            descriptors.push(ResourceDescriptor::cached(
                ResourceRole::DepthStencilBuffer,
                size,
                depth_format,
                TargetUsage::ShadowMap,
            ));
            descriptors.push(ResourceDescriptor::shared(ResourceRole::DepthMap, size, depth_map, TargetUsage::RenderTarget));
            method |= ShadowMethod::HARDWARE | ShadowMethod::GATHER | ShadowMethod::MANUAL_2X2;
        } else {
            descriptors.push(ResourceDescriptor::shared(
                ResourceRole::DepthStencilBuffer,
                size,
                depth_format,
                TargetUsage::DepthStencil,
            ));
            descriptors.push(ResourceDescriptor::cached(ResourceRole::DepthMap, size, depth_map, TargetUsage::RenderTarget));
            method |= ShadowMethod::DEPTH_READS;
        }
    }

    if settings.uses_edge_mask() && registers.edge.is_some() && kind == GeneratorKind::ShadowMap {
        let mask_size = edge_mask_resolution(size, settings.filter_radius);
        let desc = match settings.mask_type {
            EdgeMaskType::DepthExtents => {
                let format = if settings.mask_precision == 16 {
                    method |= ShadowMethod::EXTENTS_BITS_16;
                    pool.best_render_target_format(16, 2)
                } else {
                    pool.best_render_target_format(8, 4)
                };
                method |= ShadowMethod::DEPTH_EXTENTS_MASK;
                ResourceDescriptor::cached(ResourceRole::EdgeMap, mask_size, format, TargetUsage::RenderTarget)
                    .with_channels(2)
            }
            _ => {
                method |= ShadowMethod::EDGE_MASK;
                ResourceDescriptor::cached(
                    ResourceRole::EdgeMap,
                    mask_size,
                    pool.best_render_target_format(8, 4),
                    TargetUsage::RenderTarget,
                )
                .with_channels(1)
                .with_sampler(SamplerState::linear())
            }
        };
        descriptors.push(desc);
    }

    if settings.translucency && registers.color.is_some() && kind == GeneratorKind::ShadowMap {
        descriptors.push(
            ResourceDescriptor::cached(
                ResourceRole::ColorMap,
                size,
                pool.best_render_target_format(8, 4),
                TargetUsage::RenderTarget,
            )
            .with_sampler(SamplerState::linear()),
        );
        method |= ShadowMethod::TRANSLUCENCY;
    }

    if settings.jitter {
        method |= ShadowMethod::JITTER;
    }
    if settings.rotate {
        method |= ShadowMethod::ROTATE;
    }

    Description {
        descriptors,
        method,
        final_resolution,
    }
}

/// Shadow map generator for one light frustum.
pub struct ShadowGenerator {
    id: GeneratorId,
    kind: GeneratorKind,
    light_kind: LightKind,
    frustum_index: usize,
    registers: SamplerRegisters,
    post_table: PostOpTable,
    phase: Phase,

    // Settings and descriptions
    settings: ShadowSettings,
    settings_version: Option<SettingsVersion>,
    base_resolution: u32,
    resolution: u32,
    final_resolution: u32,
    method: ShadowMethod,
    descriptors: Vec<ResourceDescriptor>,
    descriptor_version: u64,

    // Assignment
    assigned_descriptors: Vec<ResourceDescriptor>,
    assigned_version: u64,
    resources: Vec<LeasedResource>,
    samplers: Vec<SamplerId>,
    default_count: u32,
    fill_status: FillStatus,
    reassigned: bool,
    exhaustion_logged: bool,
    operations: OperationSet,
    operations_dirty: bool,
    random_texture: Option<(ResourceId, SamplerId)>,

    // Edge masks
    mask_channels: ChannelMask,
    mask_dirty: bool,

    // Visibility
    light: Option<ShadowLight>,
    light_camera: Option<LightCamera>,
    visible: Option<bool>,
    last_visibility_frame: Option<u64>,
    casters: Vec<ObjectId>,
    tracked: Vec<ObjectId>,
    caster_bounds: Aabb,
    receiver_bounds: Aabb,
    split_frustum: Option<Frustum>,
    split_range: Option<(f32, f32)>,
    sphere_radius: f32,

    // Frame state
    write_index: i32,
    read_index: i32,
    pass_open: bool,
    saved_camera: Option<CameraState>,
    visibility_dirty: bool,
    content_dirty: bool,
    /// Targets hold a finished fill (set by `end_write`)
    contents_valid: bool,
    attenuation: f32,
}

impl ShadowGenerator {
    pub fn new(id: GeneratorId, light_kind: LightKind, frustum_index: usize) -> Self {
        log::info!("Creating shadow generator {:?} ({:?}, frustum {})", id, light_kind, frustum_index);
        Self {
            id,
            kind: GeneratorKind::ShadowMap,
            light_kind,
            frustum_index,
            registers: SamplerRegisters::default(),
            post_table: PostOpTable::shadow(),
            phase: Phase::Unassigned,

            settings: ShadowSettings::default(),
            settings_version: None,
            base_resolution: 0,
            resolution: 0,
            final_resolution: 0,
            method: ShadowMethod::empty(),
            descriptors: Vec::new(),
            descriptor_version: 0,

            assigned_descriptors: Vec::new(),
            assigned_version: 0,
            resources: Vec::new(),
            samplers: Vec::new(),
            default_count: 0,
            fill_status: FillStatus::DoNothing,
            reassigned: false,
            exhaustion_logged: false,
            operations: OperationSet::default(),
            operations_dirty: true,
            random_texture: None,

            mask_channels: ChannelMask::EMPTY,
            mask_dirty: false,

            light: None,
            light_camera: None,
            visible: None,
            last_visibility_frame: None,
            casters: Vec::new(),
            tracked: Vec::new(),
            caster_bounds: Aabb::EMPTY,
            receiver_bounds: Aabb::EMPTY,
            split_frustum: None,
            split_range: None,
            sphere_radius: 0.0,

            write_index: -1,
            read_index: -1,
            pass_open: false,
            saved_camera: None,
            visibility_dirty: true,
            content_dirty: true,
            contents_valid: false,
            attenuation: 1.0,
        }
    }

    pub(crate) fn with_kind(mut self, kind: GeneratorKind, post_table: PostOpTable) -> Self {
        self.kind = kind;
        self.post_table = post_table;
        self
    }

    /// Shader registers used by the read pass
    pub fn with_registers(mut self, registers: SamplerRegisters) -> Self {
        self.registers = registers;
        self.settings_version = None;
        self
    }

    pub fn id(&self) -> GeneratorId {
        self.id
    }

    pub fn kind(&self) -> GeneratorKind {
        self.kind
    }

    pub fn light_kind(&self) -> LightKind {
        self.light_kind
    }

    pub fn frustum_index(&self) -> usize {
        self.frustum_index
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn settings(&self) -> &ShadowSettings {
        &self.settings
    }

    /// Technique plus resolved capability bits
    pub fn method(&self) -> ShadowMethod {
        self.method
    }

    pub fn registers(&self) -> &SamplerRegisters {
        &self.registers
    }

    pub fn descriptors(&self) -> &[ResourceDescriptor] {
        &self.descriptors
    }

    pub fn resources(&self) -> &[LeasedResource] {
        &self.resources
    }

    pub fn operations(&self) -> &OperationSet {
        &self.operations
    }

    pub fn fill_status(&self) -> FillStatus {
        self.fill_status
    }

    pub fn default_count(&self) -> u32 {
        self.default_count
    }

    pub fn light_camera(&self) -> Option<&LightCamera> {
        self.light_camera.as_ref()
    }

    pub fn light(&self) -> Option<&ShadowLight> {
        self.light.as_ref()
    }

    /// Objects rendered into the shadow map this frame
    pub fn visible_objects(&self) -> &[ObjectId] {
        &self.casters
    }

    pub fn caster_bounds(&self) -> &Aabb {
        &self.caster_bounds
    }

    pub fn receiver_bounds(&self) -> &Aabb {
        &self.receiver_bounds
    }

    /// Strength passed to the last `begin_read`
    pub fn attenuation(&self) -> f32 {
        self.attenuation
    }

    pub fn write_pass_index(&self) -> i32 {
        self.write_index
    }

    pub fn read_pass_index(&self) -> i32 {
        self.read_index
    }

    pub fn write_pass_count(&self) -> u32 {
        self.operations.write.len() as u32
    }

    /// Requested resolution, before any default substitution
    pub fn requested_resolution(&self) -> u32 {
        self.resolution
    }

    /// Resolution of the reduced G-buffer when box filtering, else the resolution
    pub fn final_resolution(&self) -> u32 {
        self.final_resolution
    }

    /// Resolution actually bound: shared defaults may be smaller than requested.
    pub fn resolution(&self) -> u32 {
        self.resources
            .iter()
            .filter(|r| r.is_default())
            .map(|r| r.width)
            .fold(self.resolution, u32::min)
    }

    pub fn edge_mask_channels(&self) -> ChannelMask {
        self.mask_channels
    }

    pub fn uses_edge_mask(&self) -> bool {
        self.registers.edge.is_some()
            && self.method.intersects(ShadowMethod::EDGE_MASK | ShadowMethod::DEPTH_EXTENTS_MASK)
    }

    pub fn requires_default_resource(&self) -> bool {
        self.default_count > 0
    }

    pub fn contains_renderable_objects(&self) -> bool {
        !self.casters.is_empty()
    }

    /// Whether this generator and `neighbor` can blend across their border.
    pub fn can_blend(&self, neighbor: &ShadowGenerator) -> bool {
        neighbor.resolution() == self.resolution()
            && neighbor.settings.method == self.settings.method
            && self.settings.method.is_statistical()
    }

    /// True when the targets must be refilled this frame.
    pub fn should_regenerate(&self) -> bool {
        self.visibility_dirty || self.content_dirty || self.default_count > 0
    }

    fn in_session(&self) -> bool {
        matches!(self.phase, Phase::Writing | Phase::Reading)
    }

    fn is_assigned(&self) -> bool {
        !self.resources.is_empty() && self.phase != Phase::Unassigned
    }

    /// Merge settings and rebuild descriptors when a source changed.
    ///
    /// Returns whether the descriptors changed.
    pub fn update(
        &mut self,
        base_resolution: u32,
        system: &Versioned<ShadowSettingsSystem>,
        light: &Versioned<ShadowSettingsLight>,
        pool: &ResourcePool,
    ) -> Result<bool> {
        if self.in_session() {
            return Err(protocol_violation(format!(
                "{:?} updated during {:?}",
                self.id, self.phase
            )));
        }

        let version = SettingsVersion {
            system: system.version(),
            light: light.version(),
        };
        if self.settings_version == Some(version) && self.base_resolution == base_resolution {
            return Ok(false);
        }

        let settings = ShadowSettings::combine(system, light);
        let config = pool.config();
        let mut resolution =
            settings.adjusted_resolution(base_resolution, config.minimum_resolution, config.maximum_resolution);
        if !resolution.is_power_of_two() {
            let rounded = 1 << resolution.ilog2();
            log::warn!("Shadow resolution {} is not a power of two, using {}", resolution, rounded);
            resolution = rounded;
        }

        let description = describe_resources(self.kind, &settings, pool, resolution, &self.registers);
        let changed = description.descriptors != self.descriptors || description.method != self.method;
        if changed {
            log::debug!(
                "{:?} descriptors rebuilt: {} targets at {}x{} ({:?})",
                self.id,
                description.descriptors.len(),
                resolution,
                resolution,
                description.method
            );
            self.descriptors = description.descriptors;
            self.method = description.method;
            self.descriptor_version += 1;
        }

        self.settings = settings;
        self.settings_version = Some(version);
        self.base_resolution = base_resolution;
        self.resolution = resolution;
        self.final_resolution = description.final_resolution;
        self.operations_dirty = true;
        self.content_dirty = true;
        Ok(changed)
    }

    /// Lease targets for the current descriptors.
    ///
    /// Returns the number of shared defaults substituted for dedicated
    /// targets. Calling it again while the lease is still held changes nothing.
    pub fn assign_resources(&mut self, pool: &mut ResourcePool) -> Result<u32> {
        if self.in_session() {
            return Err(protocol_violation(format!(
                "{:?} assigned resources during {:?}",
                self.id, self.phase
            )));
        }
        if self.descriptors.is_empty() {
            return Err(Error::Settings(format!("{:?} has no resource descriptions; call update first", self.id)));
        }
        let held = !self.resources.is_empty()
            && self.assigned_version == self.descriptor_version
            && self.resources.iter().all(|r| pool.is_held_by(self.id, r));
        if held {
            if self.reassigned {
                self.fill_status = FillStatus::CanFill;
            }
            if self.default_count > 0 && self.phase == Phase::Idle {
                // Defaults are shared, somebody else may have drawn into them
                self.contents_valid = false;
            }
            if self.operations_dirty {
                self.rebuild_operations(pool)?;
            }
            if self.phase == Phase::Unassigned {
                self.phase = Phase::ResourcesAssigned;
            }
            return Ok(self.default_count);
        }

        if !self.resources.is_empty() {
            let stale = std::mem::take(&mut self.resources);
            pool.release(self.id, &stale);
        }

        let lease = match pool.lease(self.id, &self.descriptors) {
            Ok(lease) => lease,
            Err(err) => {
                if !self.exhaustion_logged {
                    log::warn!("{:?} could not lease shadow targets: {}", self.id, err);
                    self.exhaustion_logged = true;
                }
                self.reset_assignment();
                return Err(err);
            }
        };
        self.exhaustion_logged = false;
        self.resources = lease.resources;
        self.default_count = lease.default_count;
        self.assigned_descriptors = self.descriptors.clone();
        self.assigned_version = self.descriptor_version;
        self.reassigned = false;
        self.content_dirty = true;
        self.contents_valid = false;

        self.refresh_edge_mask(pool, true);
        self.rebuild_operations(pool)?;

        self.fill_status = if self.default_count > 0 {
            FillStatus::CannotFill
        } else {
            FillStatus::MustFill
        };
        self.phase = Phase::ResourcesAssigned;
        Ok(self.default_count)
    }

    /// Keep last frame's targets where possible.
    ///
    /// Returns true when every target is still held and dedicated. On any
    /// failure all targets are released and `assign_resources` starts over.
    pub fn reassign_resources(&mut self, pool: &mut ResourcePool) -> bool {
        if self.in_session() {
            let _ = protocol_violation(format!("{:?} reassigned during {:?}", self.id, self.phase));
            return false;
        }
        if self.resources.is_empty() {
            self.reassigned = false;
            return false;
        }

        let ok = if self.assigned_version != self.descriptor_version {
            match pool.reassign(self.id, &self.assigned_descriptors, &self.descriptors, &mut self.resources) {
                Ok(lease) => {
                    self.default_count = lease.default_count;
                    self.assigned_descriptors = self.descriptors.clone();
                    self.assigned_version = self.descriptor_version;
                    self.content_dirty = true;
                    self.contents_valid = false;
                    self.fill_status = FillStatus::MustFill;
                    self.refresh_edge_mask(pool, true);
                    self.rebuild_operations(pool).is_ok()
                }
                Err(err) => {
                    log::debug!("{:?} reassignment failed: {}", self.id, err);
                    self.resources.clear();
                    false
                }
            }
        } else if pool.reclaim(self.id, &self.descriptors, &self.resources) {
            self.fill_status = FillStatus::CanFill;
            self.refresh_edge_mask(pool, false);
            if self.operations_dirty {
                self.rebuild_operations(pool).is_ok()
            } else {
                true
            }
        } else {
            false
        };

        // Defaults are given back so a freed dedicated target can be picked up
        if !ok || self.default_count > 0 {
            self.release_resources(pool);
            return false;
        }

        self.reassigned = true;
        self.phase = Phase::ResourcesAssigned;
        true
    }

    /// Return every held target to the pool.
    pub fn release_resources(&mut self, pool: &mut ResourcePool) {
        if !self.resources.is_empty() {
            pool.release(self.id, &self.resources);
        }
        self.reset_assignment();
    }

    fn reset_assignment(&mut self) {
        self.resources.clear();
        self.samplers.clear();
        self.assigned_descriptors.clear();
        self.assigned_version = 0;
        self.default_count = 0;
        self.mask_channels = ChannelMask::EMPTY;
        self.mask_dirty = false;
        self.reassigned = false;
        self.contents_valid = false;
        self.fill_status = FillStatus::DoNothing;
        self.operations.clear();
        self.phase = Phase::Unassigned;
    }

    fn role_index(&self, role: ResourceRole) -> Option<usize> {
        self.descriptors.iter().position(|d| d.role == role)
    }

    fn refresh_edge_mask(&mut self, pool: &ResourcePool, fresh: bool) {
        let Some(index) = self.role_index(ResourceRole::EdgeMap) else {
            return;
        };
        let Some(leased) = self.resources.get(index) else {
            return;
        };
        if leased.is_default() && self.settings.mask_cached_only {
            log::debug!("{:?} only got the default edge mask, disabling edge masking", self.id);
            self.mask_channels = ChannelMask::EMPTY;
            self.mask_dirty = false;
            self.method.remove(ShadowMethod::EDGE_MASK | ShadowMethod::DEPTH_EXTENTS_MASK);
            return;
        }
        let channels = pool.channel_mask(self.id, leased.id);
        if fresh || channels != self.mask_channels {
            self.mask_dirty = true;
        }
        self.mask_channels = channels;
    }

    pub(crate) fn set_random_texture(&mut self, texture: Option<(ResourceId, SamplerId)>) {
        if self.random_texture != texture {
            self.random_texture = texture;
            self.operations_dirty = true;
        }
    }

    fn rebuild_operations(&mut self, pool: &mut ResourcePool) -> Result<()> {
        self.samplers = self.descriptors.iter().map(|d| pool.sampler(d.sampler)).collect();
        let ctx = BuildContext {
            settings: &self.settings,
            method: self.method,
            descriptors: &self.descriptors,
            resources: &self.resources,
            samplers: &self.samplers,
            registers: &self.registers,
            random_texture: self.random_texture,
        };
        let built = match self.kind {
            GeneratorKind::ShadowMap => build_shadow_operations(&ctx),
            GeneratorKind::Reflective => build_reflective_operations(&ctx),
        };
        match built {
            Ok(set) => {
                log::debug!(
                    "{:?} built {} write, {} post and {} read operations",
                    self.id,
                    set.write.len(),
                    set.post.len(),
                    set.read.len()
                );
                self.operations = set;
                self.operations_dirty = false;
                Ok(())
            }
            Err(err) => {
                self.operations.clear();
                Err(err)
            }
        }
    }

    /// Gather casters and receivers and fit the light camera.
    ///
    /// `split` restricts receivers to the camera slice `(near, far)`; it is
    /// only meaningful for directional lights. Returns false when nothing can
    /// cast a shadow, in which case the generator releases its targets.
    pub fn compute_visibility_set<S: ShadowScene + ?Sized>(
        &mut self,
        pool: &mut ResourcePool,
        scene: &S,
        light: &ShadowLight,
        camera: &SceneCamera,
        split: Option<(f32, f32)>,
    ) -> bool {
        if self.in_session() {
            let _ = protocol_violation(format!("{:?} computed visibility during {:?}", self.id, self.phase));
            return false;
        }

        let frame = scene.frame();
        let changed = match self.last_visibility_frame {
            None => true,
            Some(last) => {
                light.last_modified > last
                    || self.light.as_ref().map_or(true, |l| l != light)
                    || self.tracked.iter().any(|id| match scene.get(*id) {
                        Some(object) => object.last_modified > last,
                        None => true,
                    })
            }
        };
        self.visibility_dirty |= changed;
        let previous = self.last_visibility_frame;

        self.casters.clear();
        self.tracked.clear();
        self.caster_bounds = Aabb::EMPTY;
        self.receiver_bounds = Aabb::EMPTY;
        self.split_frustum = None;
        self.split_range = None;

        match (light.kind, split) {
            (LightKind::Directional, Some((near, far))) => self.gather_split(scene, light, camera, near, far),
            (LightKind::Directional, None) => self.gather_directional(scene, light, camera),
            _ => self.gather_perspective(scene, light, camera),
        }

        self.light = Some(*light);
        self.last_visibility_frame = Some(frame);

        if self.casters.is_empty() {
            log::trace!("{:?} has no visible shadow casters", self.id);
            self.visible = Some(false);
            self.visibility_dirty = false;
            self.release_resources(pool);
            return false;
        }

        // Objects that entered the view since the last pass also need a fill
        if !self.visibility_dirty {
            if let Some(last) = previous {
                self.visibility_dirty = self
                    .tracked
                    .iter()
                    .filter_map(|id| scene.get(*id))
                    .any(|o| o.last_modified > last);
            }
        }

        self.visible = Some(true);
        if self.is_assigned() {
            self.phase = Phase::VisibilityComputed;
        }
        true
    }

    fn gather_directional<S: ShadowScene + ?Sized>(&mut self, scene: &S, light: &ShadowLight, camera: &SceneCamera) {
        let frustum = camera.frustum();
        let view = light_view(light, self.frustum_index);
        for object in scene.objects().iter().filter(|o| o.receives_shadows) {
            if frustum.test_aabb(&object.bounds) {
                self.receiver_bounds = self.receiver_bounds.union(&object.bounds);
                self.tracked.push(object.id);
            }
        }
        if self.receiver_bounds.is_empty() {
            return;
        }
        let receivers_v = self.receiver_bounds.transform(&view);
        self.collect_casters(scene, &view, &receivers_v);
        if !self.casters.is_empty() {
            self.light_camera = Some(fit_ortho(view, &self.caster_bounds, &self.receiver_bounds));
        }
    }

    fn gather_split<S: ShadowScene + ?Sized>(
        &mut self,
        scene: &S,
        light: &ShadowLight,
        camera: &SceneCamera,
        near: f32,
        far: f32,
    ) {
        let split = camera.with_clip(near, far).frustum();
        if self.sphere_radius <= 0.0 {
            // Cached once; recomputing every frame makes the fit shimmer
            self.sphere_radius = split.bounding_radius();
        }
        let view = light_view(light, self.frustum_index);
        let split_v = Aabb::from_points(&split.corners.map(|c| view.transform_point3(c)));

        for object in scene.objects().iter().filter(|o| o.receives_shadows) {
            if split.test_aabb(&object.bounds) {
                self.receiver_bounds = self.receiver_bounds.union(&object.bounds);
                self.tracked.push(object.id);
            }
        }
        self.collect_casters(scene, &view, &split_v);
        if !self.casters.is_empty() {
            let receivers = self.receiver_bounds.intersection(&split.bounds());
            let receivers = if receivers.is_empty() { split.bounds() } else { receivers };
            self.light_camera = Some(fit_ortho(view, &self.caster_bounds, &receivers));
        }
        self.split_frustum = Some(split);
        self.split_range = Some((near, far));
    }

    /// Casters overlapping `region_v` in light space and not behind it
    fn collect_casters<S: ShadowScene + ?Sized>(&mut self, scene: &S, view: &Mat4, region_v: &Aabb) {
        for object in scene.objects().iter().filter(|o| o.casts_shadows) {
            let caster_v = object.bounds.transform(view);
            if caster_v.intersects_xy(region_v) && caster_v.max.z >= region_v.min.z {
                self.caster_bounds = self.caster_bounds.union(&object.bounds);
                self.casters.push(object.id);
                if !self.tracked.contains(&object.id) {
                    self.tracked.push(object.id);
                }
            }
        }
    }

    fn gather_perspective<S: ShadowScene + ?Sized>(&mut self, scene: &S, light: &ShadowLight, camera: &SceneCamera) {
        let light_camera = perspective_camera(light, self.frustum_index);
        let light_frustum = light_camera.frustum();
        let camera_frustum = camera.frustum();
        for object in scene.objects() {
            if !light_frustum.test_aabb(&object.bounds) {
                continue;
            }
            if object.casts_shadows {
                self.caster_bounds = self.caster_bounds.union(&object.bounds);
                self.casters.push(object.id);
                self.tracked.push(object.id);
            }
            if object.receives_shadows && camera_frustum.test_aabb(&object.bounds) {
                self.receiver_bounds = self.receiver_bounds.union(&object.bounds);
                if !self.tracked.contains(&object.id) {
                    self.tracked.push(object.id);
                }
            }
        }
        self.light_camera = Some(light_camera);
    }

    /// Start filling the targets. Returns the number of write passes, or -1
    /// when there is nothing to fill (no targets, nothing visible).
    pub fn begin_write(&mut self, parallel_split: bool, fixed_split_distances: bool) -> i32 {
        if matches!(self.phase, Phase::Writing | Phase::Reading) {
            let _ = protocol_violation(format!("{:?} begin_write during {:?}", self.id, self.phase));
            return -1;
        }
        if !self.is_assigned() || self.visible != Some(true) || self.operations.write.is_empty() {
            return -1;
        }

        if parallel_split {
            if let (Some(split), Some(light)) = (self.split_frustum.as_ref(), self.light.as_ref()) {
                let view = light_view(light, self.frustum_index);
                let camera = if fixed_split_distances {
                    fit_ortho_stable(
                        view,
                        &self.caster_bounds,
                        split,
                        self.sphere_radius,
                        self.resolution(),
                        self.settings.filter_radius,
                    )
                } else {
                    let receivers = self.receiver_bounds.intersection(&split.bounds());
                    let receivers = if receivers.is_empty() { split.bounds() } else { receivers };
                    fit_ortho(view, &self.caster_bounds, &receivers)
                };
                self.light_camera = Some(camera);
            }
        }

        self.phase = Phase::Writing;
        self.write_index = -1;
        self.pass_open = false;
        self.contents_valid = false;
        self.operations.write.len() as i32
    }

    /// Bind the targets of write pass `index`, clear them and set raster state.
    pub fn begin_write_pass(&mut self, device: &mut dyn GraphicsDevice, index: i32) -> Result<()> {
        let count = self.operations.write.len() as i32;
        if self.phase != Phase::Writing || self.pass_open || index < 0 || index >= count {
            return Err(protocol_violation(format!(
                "{:?} begin_write_pass({}) with {} passes during {:?}",
                self.id, index, count, self.phase
            )));
        }
        let Some(op) = self.operations.write.get(index as usize) else {
            return Err(Error::Resource(format!("missing write operation {}", index)));
        };

        if self.saved_camera.is_none() {
            self.saved_camera = Some(device.camera());
            if let Some(camera) = self.light_camera.as_ref() {
                device.set_camera(camera.state());
            }
        }

        for input in &op.inputs {
            device.bind_texture(input.slot, Some(input.texture), Some(input.sampler));
        }
        if !op.outputs.is_empty() || op.depth_stencil.is_some() {
            device.begin_target_render(&op.outputs, op.depth_stencil)?;
        }
        if !op.clear_flags.is_empty() {
            device.clear(
                Rect::square(self.resolution()),
                op.clear_flags,
                op.clear_color,
                op.clear_depth,
                op.clear_stencil,
            )?;
        }
        device.set_color_writes(op.color_writes);
        device.set_cull_mode(op.cull_mode);
        device.set_depth_bias(self.settings.depth_bias_hw, self.settings.slope_scale_bias);
        if let Some(camera) = self.light_camera.as_ref() {
            device.set_clip_planes(&camera.frustum().planes);
        }

        log::trace!("{:?} write pass {} ({:?})", self.id, index, op.kind);
        self.write_index = index;
        self.pass_open = true;
        Ok(())
    }

    pub fn end_write_pass(&mut self, device: &mut dyn GraphicsDevice) -> Result<()> {
        if self.phase != Phase::Writing || !self.pass_open {
            return Err(protocol_violation(format!(
                "{:?} end_write_pass without an open pass ({:?})",
                self.id, self.phase
            )));
        }
        let op = self.operations.write.get(self.write_index as usize);
        let began = op.map_or(false, |op| !op.outputs.is_empty() || op.depth_stencil.is_some());
        if let Some(op) = op {
            for input in &op.inputs {
                device.bind_texture(input.slot, None, None);
            }
        }
        device.set_clip_planes(&[]);
        self.pass_open = false;
        if began {
            device.end_target_render()?;
        }
        Ok(())
    }

    /// Run the post operations in order and restore the scene camera.
    pub fn end_write(&mut self, device: &mut dyn GraphicsDevice, pool: &mut ResourcePool) -> Result<()> {
        if self.phase != Phase::Writing || self.pass_open {
            return Err(protocol_violation(format!(
                "{:?} end_write during {:?} (pass open: {})",
                self.id, self.phase, self.pass_open
            )));
        }

        self.phase = Phase::PostProcessing;
        let result = self.run_post_operations(device, pool);

        if let Some(camera) = self.saved_camera.take() {
            device.set_camera(camera);
        }
        self.write_index = -1;
        result?;

        self.visibility_dirty = false;
        self.content_dirty = false;
        self.contents_valid = true;
        if self.fill_status == FillStatus::MustFill {
            self.fill_status = FillStatus::CanFill;
        }
        Ok(())
    }

    fn run_post_operations(&mut self, device: &mut dyn GraphicsDevice, pool: &mut ResourcePool) -> Result<()> {
        let depth_range = self.light_camera.as_ref().map_or((0.0, 1.0), |c| (c.near, c.far));
        let mut ctx = PostOpContext {
            device,
            pool,
            settings: &self.settings,
            method: self.method,
            resolution: self.resolution(),
            depth_range,
            mask_channels: self.mask_channels,
            mask_dirty: &mut self.mask_dirty,
        };
        for op in self.operations.post.iter() {
            self.post_table.execute(&mut ctx, op)?;
        }
        Ok(())
    }

    /// Check the read can start and bind its inputs.
    ///
    /// Reading without a write this frame is only allowed while the targets
    /// still hold an earlier fill.
    pub(crate) fn enter_read(&mut self, device: &mut dyn GraphicsDevice) -> Result<()> {
        if matches!(self.phase, Phase::Writing | Phase::Reading) || !self.is_assigned() {
            return Err(protocol_violation(format!(
                "{:?} begin_read during {:?} (assigned: {})",
                self.id,
                self.phase,
                self.is_assigned()
            )));
        }
        let written = self.phase == Phase::PostProcessing;
        if !self.contents_valid || !(written || self.fill_status == FillStatus::CanFill) {
            return Err(protocol_violation(format!(
                "{:?} begin_read before end_write ({:?})",
                self.id, self.fill_status
            )));
        }
        if let Some(op) = self.operations.read.get(0) {
            for input in &op.inputs {
                device.bind_texture(input.slot, Some(input.texture), Some(input.sampler));
            }
        }
        self.phase = Phase::Reading;
        self.read_index = 0;
        Ok(())
    }

    /// Light view-projection mapped into texture space.
    ///
    /// `texture_projection` replaces the default NDC → UV transform.
    pub fn texture_projection(&self, texture_projection: Option<Mat4>) -> Mat4 {
        let Some(camera) = self.light_camera.as_ref() else {
            return Mat4::IDENTITY;
        };
        let to_texture = texture_projection.unwrap_or_else(|| {
            Mat4::from_translation(Vec3::new(0.5, 0.5, 0.0)) * Mat4::from_scale(Vec3::new(0.5, -0.5, 1.0))
        });
        to_texture * camera.view_projection()
    }

    pub(crate) fn upload_texture_projection(
        &self,
        device: &mut dyn GraphicsDevice,
        texture_projection: Option<Mat4>,
    ) -> Result<()> {
        let matrix = self.texture_projection(texture_projection).to_cols_array();
        device.upload_constants(ConstantBlock::LightTexProjection, bytemuck::cast_slice(&matrix))
    }

    /// Base shadow block for a fade between `min_distance` and `max_distance`.
    ///
    /// `attenuation` is the shadow strength, 0 switches the shadow off.
    pub fn shadow_constants(&self, attenuation: f32, min_distance: f32, max_distance: f32) -> ShadowConstants {
        let s = &self.settings;
        let (scale, bias) = attenuation_scale_bias(min_distance, max_distance);
        let size = self.resolution().max(1) as f32;

        let mut channels = self.mask_channels.channels();
        let (edge_mask0, edge_mask1) = if self.uses_edge_mask() {
            let first = channels.next();
            let second = if self.method.contains(ShadowMethod::DEPTH_EXTENTS_MASK) {
                channels.next()
            } else {
                None
            };
            (channel_selector(first), channel_selector(second))
        } else {
            ([0.0; 4], [0.0; 4])
        };

        let filter = if self.method.is_statistical() {
            [s.minimum_variance, s.exponent, s.minimum_cutoff, 0.0]
        } else {
            let inv_range = 1.0 / (s.filter_distance_far - s.filter_distance_near);
            [
                s.filter_radius_near,
                s.filter_radius_far,
                inv_range,
                s.filter_distance_near * inv_range,
            ]
        };

        ShadowConstants {
            attenuation: [min_distance, max_distance, scale, bias],
            split_blend: self.split_range.map_or([0.0; 4], |(near, far)| split_blend(near, far)),
            texture_size: [size, size, 1.0 / size, 1.0 / size],
            edge_mask0,
            edge_mask1,
            bias: [s.depth_bias_sw, s.slope_scale_bias, s.normal_bias_surface, s.normal_bias_light],
            filter,
            strength: [attenuation, 1.0 - attenuation, 0.0, 0.0],
        }
    }

    /// Bind the finished targets and upload the lighting constants.
    pub fn begin_read(
        &mut self,
        device: &mut dyn GraphicsDevice,
        attenuation: f32,
        min_distance: f32,
        max_distance: f32,
        texture_projection: Option<Mat4>,
    ) -> Result<()> {
        self.enter_read(device)?;
        self.attenuation = attenuation;

        let constants = self.shadow_constants(attenuation, min_distance, max_distance);
        device.upload_constants(ConstantBlock::Shadow, bytemuck::bytes_of(&constants))?;
        self.upload_texture_projection(device, texture_projection)?;

        device.set_system_state(SystemState::ShadowMethod, self.method.bits());
        device.set_system_state(SystemState::PrimaryTaps, self.settings.primary_samples);
        device.set_system_state(SystemState::SecondaryTaps, self.settings.secondary_samples);
        Ok(())
    }

    /// Unbind every sampler register and switch shadow taps off.
    pub fn end_read(&mut self, device: &mut dyn GraphicsDevice) -> Result<()> {
        if self.phase != Phase::Reading {
            return Err(protocol_violation(format!(
                "{:?} end_read during {:?}",
                self.id, self.phase
            )));
        }
        device.set_system_state(SystemState::PrimaryTaps, 0);
        device.set_system_state(SystemState::SecondaryTaps, 0);
        for slot in self.registers.slots() {
            device.bind_texture(slot, None, None);
        }
        self.read_index = -1;
        self.phase = Phase::Idle;
        Ok(())
    }

    pub fn write_operations(&self) -> &OperationList {
        &self.operations.write
    }

    pub fn post_operations(&self) -> &OperationList {
        &self.operations.post
    }

    pub fn read_operations(&self) -> &OperationList {
        &self.operations.read
    }
}
