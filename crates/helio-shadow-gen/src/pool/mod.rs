//! Shared render target pool
//!
//! Every light asks the pool for the targets it needs. Requests for dedicated
//! ("cached") targets are served from existing free targets, then from new
//! allocations within the memory budget, and finally from a shared default
//! target of the closest size. Shared targets are handed to anyone; the pool
//! never tracks owners for them.
//!
//! The pool is pure bookkeeping. GPU textures are materialized from it by
//! [`crate::backend::WgpuResources`].

mod channels;
mod format;
mod sampler;

pub use channels::{ChannelAllocator, ChannelMask};
pub use format::{best_depth_format, best_render_target_format, bytes_per_texel, channel_count, is_depth};
pub use sampler::{SamplerAddress, SamplerFilter, SamplerId, SamplerState, SamplerTable};

use crate::generator::GeneratorId;
use crate::{Error, Result};
use std::collections::HashMap;

/// Arena handle to a pooled target
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u32);

impl ResourceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a target is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetUsage {
    /// Color render target, sampled afterwards
    RenderTarget,
    /// Depth-stencil that is never sampled
    DepthStencil,
    /// Depth target sampled (usually with comparison) afterwards
    ShadowMap,
    /// Sampled texture written by uploads
    Texture,
}

impl TargetUsage {
    pub fn to_wgpu(self) -> wgpu::TextureUsages {
        match self {
            TargetUsage::RenderTarget | TargetUsage::ShadowMap => {
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
            }
            TargetUsage::DepthStencil => wgpu::TextureUsages::RENDER_ATTACHMENT,
            TargetUsage::Texture => wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        }
    }

    pub fn is_render_target(self) -> bool {
        self == TargetUsage::RenderTarget
    }
}

/// Key for pool lookup
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
pub struct TargetKey {
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub usage: TargetUsage,
}

impl TargetKey {
    pub fn square(size: u32, format: wgpu::TextureFormat, usage: TargetUsage) -> Self {
        Self { width: size, height: size, format, usage }
    }

    pub fn size_bytes(&self) -> u64 {
        self.width as u64 * self.height as u64 * bytes_per_texel(self.format)
    }

    pub fn to_descriptor<'a>(&self, label: Option<&'a str>) -> wgpu::TextureDescriptor<'a> {
        wgpu::TextureDescriptor {
            label,
            size: wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.format,
            usage: self.usage.to_wgpu(),
            view_formats: &[],
        }
    }
}

/// Whether a request wants its own target or is happy with a shared one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Cached,
    Shared,
}

/// What a target is used for by the generator holding it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    DepthStencilBuffer,
    DepthMap,
    ColorMap,
    StatisticsMap,
    NormalMap,
    EdgeMap,
    DepthNormalMap,
}

/// One target a generator needs for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    pub key: TargetKey,
    pub residency: Residency,
    /// Channels to claim, zero for the whole target
    pub channels: u32,
    pub sampler: SamplerState,
    pub role: ResourceRole,
}

impl ResourceDescriptor {
    pub fn cached(role: ResourceRole, size: u32, format: wgpu::TextureFormat, usage: TargetUsage) -> Self {
        Self {
            key: TargetKey::square(size, format, usage),
            residency: Residency::Cached,
            channels: 0,
            sampler: SamplerState::point(),
            role,
        }
    }

    pub fn shared(role: ResourceRole, size: u32, format: wgpu::TextureFormat, usage: TargetUsage) -> Self {
        Self {
            residency: Residency::Shared,
            ..Self::cached(role, size, format, usage)
        }
    }

    pub fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerState) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.key.width = size;
        self.key.height = size;
        self
    }

    pub fn is_shared(&self) -> bool {
        self.residency == Residency::Shared
    }
}

/// How a lease was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseKind {
    Dedicated,
    /// Shared target that was asked for
    Shared,
    /// Shared fallback standing in for a dedicated request
    Default,
}

/// A pooled target bound to a generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasedResource {
    pub id: ResourceId,
    pub kind: LeaseKind,
    pub channels: ChannelMask,
    pub width: u32,
    pub height: u32,
}

impl LeasedResource {
    pub fn is_default(&self) -> bool {
        self.kind == LeaseKind::Default
    }

    pub fn is_dedicated(&self) -> bool {
        self.kind == LeaseKind::Dedicated
    }
}

/// Result of a lease
#[derive(Debug, Clone, Default)]
pub struct Lease {
    pub resources: Vec<LeasedResource>,
    pub default_count: u32,
}

/// Lifetime class of a pooled target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    Cached,
    Shared,
    Scratch,
    Persistent,
}

/// A target owned by the pool
#[derive(Debug, Clone)]
pub struct PoolResource {
    pub key: TargetKey,
    pub class: PoolClass,
    channels: ChannelAllocator,
    last_assigned: u64,
}

impl PoolResource {
    fn new(key: TargetKey, class: PoolClass) -> Self {
        Self {
            key,
            class,
            channels: ChannelAllocator::new(channel_count(key.format)),
            last_assigned: 0,
        }
    }

    pub fn channels(&self) -> &ChannelAllocator {
        &self.channels
    }
}

/// Successive half-resolution scratch targets of one format
#[derive(Debug, Clone)]
pub struct ResampleChain {
    pub format: wgpu::TextureFormat,
    levels: Vec<(u32, ResourceId)>,
}

impl ResampleChain {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Level whose size matches `size`
    pub fn level_for(&self, size: u32) -> Option<usize> {
        self.levels.iter().position(|(s, _)| *s == size)
    }

    pub fn level(&self, index: usize) -> Option<ResourceId> {
        self.levels.get(index).map(|(_, id)| *id)
    }

    pub fn size(&self, index: usize) -> Option<u32> {
        self.levels.get(index).map(|(s, _)| *s)
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Budget for dedicated targets in bytes, `None` for unlimited
    pub memory_limit: Option<u64>,
    pub minimum_resolution: u32,
    pub maximum_resolution: u32,
    pub maximum_shared_per_key: u32,
    /// Depth targets can be sampled with hardware comparison
    pub hardware_shadow_maps: bool,
    /// Depth targets can be read back as plain floats
    pub depth_reads: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            memory_limit: Some(64 * 1024 * 1024),
            minimum_resolution: 1,
            maximum_resolution: 2048,
            maximum_shared_per_key: 1,
            hardware_shadow_maps: true,
            depth_reads: true,
        }
    }
}

impl PoolConfig {
    pub fn with_memory_limit(mut self, bytes: Option<u64>) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_resolution_range(mut self, minimum: u32, maximum: u32) -> Self {
        self.minimum_resolution = minimum.max(1);
        self.maximum_resolution = maximum.max(self.minimum_resolution);
        self
    }

    pub fn with_hardware_shadow_maps(mut self, enabled: bool) -> Self {
        self.hardware_shadow_maps = enabled;
        self
    }

    pub fn with_depth_reads(mut self, enabled: bool) -> Self {
        self.depth_reads = enabled;
        self
    }
}

/// Pool of render targets shared by every generator
pub struct ResourcePool {
    config: PoolConfig,
    resources: Vec<PoolResource>,
    cached: HashMap<TargetKey, Vec<ResourceId>>,
    shared: HashMap<TargetKey, Vec<ResourceId>>,
    chains: HashMap<(wgpu::TextureFormat, u32), ResampleChain>,
    samplers: SamplerTable,
    dedicated_bytes: u64,
    total_bytes: u64,
    tick: u64,
}

impl ResourcePool {
    pub fn new(config: PoolConfig) -> Self {
        log::info!(
            "Creating shadow resource pool (budget: {:?} bytes, resolution {}..={})",
            config.memory_limit,
            config.minimum_resolution,
            config.maximum_resolution
        );
        Self {
            config,
            resources: Vec::new(),
            cached: HashMap::new(),
            shared: HashMap::new(),
            chains: HashMap::new(),
            samplers: SamplerTable::default(),
            dedicated_bytes: 0,
            total_bytes: 0,
            tick: 0,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn resource(&self, id: ResourceId) -> Option<&PoolResource> {
        self.resources.get(id.index())
    }

    pub fn resources(&self) -> impl Iterator<Item = (ResourceId, &PoolResource)> {
        self.resources
            .iter()
            .enumerate()
            .map(|(i, r)| (ResourceId(i as u32), r))
    }

    /// Memory held by dedicated targets
    pub fn dedicated_bytes(&self) -> u64 {
        self.dedicated_bytes
    }

    /// Memory held by every target, scratch and shared included
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn samplers(&self) -> &SamplerTable {
        &self.samplers
    }

    pub fn sampler(&mut self, state: SamplerState) -> SamplerId {
        self.samplers.intern(state)
    }

    pub fn best_render_target_format(&self, precision: u32, channels: u32) -> wgpu::TextureFormat {
        best_render_target_format(precision, channels)
    }

    pub fn best_depth_format(&self, precision: u32) -> wgpu::TextureFormat {
        best_depth_format(precision)
    }

    /// Pre-allocate dedicated targets. Returns how many fit in the budget.
    pub fn add_cached_maps(&mut self, key: TargetKey, count: u32) -> u32 {
        let mut created = 0;
        for _ in 0..count {
            if self.grow(key).is_none() {
                log::warn!(
                    "Shadow pool budget reached after {} of {} cached {:?} maps",
                    created,
                    count,
                    key
                );
                break;
            }
            created += 1;
        }
        log::debug!("Added {} cached {}x{} {:?} maps", created, key.width, key.height, key.format);
        created
    }

    /// Create the shared fallback targets
    pub fn add_default_maps(&mut self, keys: &[TargetKey]) {
        for key in keys {
            let existing = self.shared.get(key).map_or(0, Vec::len) as u32;
            for _ in existing..self.config.maximum_shared_per_key.max(1) {
                let id = self.insert(PoolResource::new(*key, PoolClass::Shared));
                self.shared.entry(*key).or_default().push(id);
            }
            log::debug!("Added default {}x{} {:?} map", key.width, key.height, key.format);
        }
    }

    /// Create a target that lives outside of leasing (lookup textures etc.)
    pub fn create_persistent(&mut self, key: TargetKey) -> ResourceId {
        self.insert(PoolResource::new(key, PoolClass::Persistent))
    }

    /// Scratch chain from the maximum resolution down to 1x1, created on first use
    pub fn resample_chain(&mut self, format: wgpu::TextureFormat) -> ResampleChain {
        self.resample_chain_at(format, 0)
    }

    /// Chain number `index` of `format`, for passes writing several targets
    /// of the same format at once
    pub fn resample_chain_at(&mut self, format: wgpu::TextureFormat, index: u32) -> ResampleChain {
        if let Some(chain) = self.chains.get(&(format, index)) {
            return chain.clone();
        }

        let mut levels = Vec::new();
        let mut size = self.config.maximum_resolution.max(1);
        loop {
            let key = TargetKey::square(size, format, TargetUsage::RenderTarget);
            let id = self.insert(PoolResource::new(key, PoolClass::Scratch));
            levels.push((size, id));
            if size == 1 {
                break;
            }
            size /= 2;
        }
        log::debug!("Created {:?} resample chain {} with {} levels", format, index, levels.len());

        let chain = ResampleChain { format, levels };
        self.chains.insert((format, index), chain.clone());
        chain
    }

    /// Number of cached targets of `key` with no owner
    pub fn available_count(&self, key: &TargetKey) -> usize {
        self.cached.get(key).map_or(0, |ids| {
            ids.iter()
                .filter(|id| {
                    self.resource(**id)
                        .map_or(false, |r| r.channels.free() == r.channels.all())
                })
                .count()
        })
    }

    /// Lease every descriptor, substituting shared defaults where needed.
    pub fn lease(&mut self, owner: GeneratorId, descriptors: &[ResourceDescriptor]) -> Result<Lease> {
        let mut excluded = Vec::new();
        let mut lease = Lease::default();

        for desc in descriptors {
            match self.lease_one(owner, desc, &mut excluded) {
                Some(leased) => {
                    if leased.is_default() {
                        lease.default_count += 1;
                    }
                    lease.resources.push(leased);
                }
                None => {
                    self.release(owner, &lease.resources);
                    return Err(Error::ResourceExhaustion {
                        owner,
                        descriptor: format!("{:?} {:?}", desc.role, desc.key),
                    });
                }
            }
        }

        log::debug!(
            "{:?} leased {} targets ({} defaults)",
            owner,
            lease.resources.len(),
            lease.default_count
        );
        Ok(lease)
    }

    /// Return leased targets; channel slots remember the last filler.
    pub fn release(&mut self, owner: GeneratorId, resources: &[LeasedResource]) {
        for leased in resources.iter().filter(|r| r.is_dedicated()) {
            if let Some(res) = self.resources.get_mut(leased.id.index()) {
                res.channels.release(owner);
            }
        }
        log::trace!("{:?} released {} targets", owner, resources.len());
    }

    /// Renegotiate after a descriptor change, keeping unchanged targets.
    pub fn reassign(
        &mut self,
        owner: GeneratorId,
        previous: &[ResourceDescriptor],
        descriptors: &[ResourceDescriptor],
        resources: &mut Vec<LeasedResource>,
    ) -> Result<Lease> {
        let mut kept: Vec<Option<LeasedResource>> = vec![None; descriptors.len()];
        let mut dropped = Vec::new();

        for (i, leased) in resources.drain(..).enumerate() {
            let unchanged = i < descriptors.len()
                && previous.get(i) == Some(&descriptors[i])
                && self.is_held_by(owner, &leased);
            if unchanged {
                kept[i] = Some(leased);
            } else {
                dropped.push(leased);
            }
        }
        self.release(owner, &dropped);

        let mut excluded: Vec<ResourceId> = kept
            .iter()
            .flatten()
            .filter(|r| !r.is_dedicated())
            .map(|r| r.id)
            .collect();

        let mut lease = Lease::default();
        for (i, desc) in descriptors.iter().enumerate() {
            let leased = match kept[i] {
                Some(leased) => Some(leased),
                None => self.lease_one(owner, desc, &mut excluded),
            };
            match leased {
                Some(leased) => {
                    if leased.is_default() {
                        lease.default_count += 1;
                    }
                    lease.resources.push(leased);
                }
                None => {
                    let mut held = lease.resources;
                    held.extend(kept.iter().skip(i + 1).flatten().copied());
                    self.release(owner, &held);
                    return Err(Error::ResourceExhaustion {
                        owner,
                        descriptor: format!("{:?} {:?}", desc.role, desc.key),
                    });
                }
            }
        }

        log::debug!(
            "{:?} reassigned {} targets ({} kept, {} defaults)",
            owner,
            lease.resources.len(),
            kept.iter().flatten().count(),
            lease.default_count
        );
        *resources = lease.resources.clone();
        Ok(lease)
    }

    /// Take back exactly the targets and channels `owner` filled before.
    ///
    /// All or nothing: returns false without claiming anything if any
    /// target was handed to somebody else in the meantime.
    pub fn reclaim(&mut self, owner: GeneratorId, descriptors: &[ResourceDescriptor], resources: &[LeasedResource]) -> bool {
        if resources.is_empty() || descriptors.len() != resources.len() {
            return false;
        }

        for (desc, leased) in descriptors.iter().zip(resources) {
            let Some(res) = self.resource(leased.id) else {
                return false;
            };
            if res.key.format != desc.key.format || res.key.usage != desc.key.usage {
                return false;
            }
            if leased.is_dedicated() {
                if res.key != desc.key {
                    return false;
                }
                let owned = res.channels.owned(owner);
                let reusable = res.channels.channel_mask(owner);
                if owned != leased.channels && reusable.union(leased.channels) != reusable {
                    return false;
                }
            }
        }

        self.tick += 1;
        let tick = self.tick;
        for (desc, leased) in descriptors.iter().zip(resources).filter(|(_, r)| r.is_dedicated()) {
            if let Some(res) = self.resources.get_mut(leased.id.index()) {
                if res.channels.owned(owner) != leased.channels {
                    res.channels.release(owner);
                    res.channels.acquire_exact(owner, desc.role, leased.channels);
                }
                res.last_assigned = tick;
            }
        }
        log::trace!("{:?} reclaimed {} targets", owner, resources.len());
        true
    }

    /// Drop every owner so targets can be reclaimed or redistributed.
    pub fn reset_availability(&mut self) {
        for res in &mut self.resources {
            res.channels.reset_owners();
        }
    }

    /// Whether `owner` still holds `leased`
    pub fn is_held_by(&self, owner: GeneratorId, leased: &LeasedResource) -> bool {
        match leased.kind {
            LeaseKind::Dedicated => self
                .resource(leased.id)
                .map_or(false, |r| r.channels.owned(owner) == leased.channels && !leased.channels.is_empty()),
            LeaseKind::Shared | LeaseKind::Default => self.resource(leased.id).is_some(),
        }
    }

    /// Channels of `id` that belong to `owner`; shared targets are fully visible.
    pub fn channel_mask(&self, owner: GeneratorId, id: ResourceId) -> ChannelMask {
        match self.resource(id) {
            Some(res) if res.class == PoolClass::Cached => res.channels.channel_mask(owner),
            Some(res) => res.channels.all(),
            None => ChannelMask::EMPTY,
        }
    }

    fn lease_one(
        &mut self,
        owner: GeneratorId,
        desc: &ResourceDescriptor,
        excluded: &mut Vec<ResourceId>,
    ) -> Option<LeasedResource> {
        if desc.residency == Residency::Cached {
            let id = self.find_cached(desc).or_else(|| self.grow(desc.key));
            if let Some(id) = id {
                self.tick += 1;
                let tick = self.tick;
                let res = self.resources.get_mut(id.index())?;
                let channels = res.channels.acquire(owner, desc.role, desc.channels, None)?;
                res.last_assigned = tick;
                return Some(LeasedResource {
                    id,
                    kind: LeaseKind::Dedicated,
                    channels,
                    width: res.key.width,
                    height: res.key.height,
                });
            }
        }

        // Scratch targets requested as shared are created on first use
        if desc.residency == Residency::Shared && !self.shared.contains_key(&desc.key) {
            self.add_default_maps(&[desc.key]);
        }
        let id = self.find_shared(&desc.key, excluded)?;
        excluded.push(id);
        let res = self.resource(id)?;
        let kind = match desc.residency {
            Residency::Cached => {
                log::debug!(
                    "{:?} falls back to default {}x{} {:?} for {:?}",
                    owner,
                    res.key.width,
                    res.key.height,
                    res.key.format,
                    desc.role
                );
                LeaseKind::Default
            }
            Residency::Shared => LeaseKind::Shared,
        };
        Some(LeasedResource {
            id,
            kind,
            channels: res.channels.all(),
            width: res.key.width,
            height: res.key.height,
        })
    }

    /// Free cached target of `desc.key` with room for the requested channels.
    ///
    /// Untouched targets win; otherwise the one assigned longest ago.
    fn find_cached(&self, desc: &ResourceDescriptor) -> Option<ResourceId> {
        let ids = self.cached.get(&desc.key)?;
        ids.iter()
            .copied()
            .filter_map(|id| self.resource(id).map(|r| (id, r)))
            .filter(|(_, r)| r.channels.free().count() >= r.channels.requested(desc.channels))
            .min_by_key(|(_, r)| (!r.channels.is_pristine(), r.last_assigned))
            .map(|(id, _)| id)
    }

    /// Allocate a new dedicated target if the budget allows.
    fn grow(&mut self, key: TargetKey) -> Option<ResourceId> {
        if key.width < self.config.minimum_resolution || key.width > self.config.maximum_resolution {
            return None;
        }
        let size = key.size_bytes();
        if let Some(limit) = self.config.memory_limit {
            if self.dedicated_bytes + size > limit {
                return None;
            }
        }
        let id = self.insert(PoolResource::new(key, PoolClass::Cached));
        self.cached.entry(key).or_default().push(id);
        log::debug!("Allocated cached {}x{} {:?} target {:?}", key.width, key.height, key.format, id);
        Some(id)
    }

    /// Shared target with the same format and usage, closest in size.
    fn find_shared(&self, key: &TargetKey, excluded: &[ResourceId]) -> Option<ResourceId> {
        let distance = |width: u32| {
            let want = key.width.max(1).ilog2() as i64;
            let have = width.max(1).ilog2() as i64;
            // Prefer larger targets on ties
            ((want - have).abs(), width < key.width)
        };
        self.shared
            .iter()
            .filter(|(k, _)| k.format == key.format && k.usage == key.usage)
            .flat_map(|(_, ids)| ids.iter().copied())
            .filter(|id| !excluded.contains(id))
            .filter_map(|id| self.resource(id).map(|r| (id, r.key.width)))
            .min_by_key(|(id, width)| (distance(*width), *id))
            .map(|(id, _)| id)
    }

    fn insert(&mut self, resource: PoolResource) -> ResourceId {
        let bytes = resource.key.size_bytes();
        if resource.class == PoolClass::Cached {
            self.dedicated_bytes += bytes;
        }
        self.total_bytes += bytes;
        let id = ResourceId(self.resources.len() as u32);
        self.resources.push(resource);
        id
    }
}
