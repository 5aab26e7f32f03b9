//! Post-process operations
//!
//! Post operations run after every write pass of a generator has finished.
//! They are plain functions looked up by [`OperationKind`] in a
//! [`PostOpTable`]; the reflective generator registers its extra kinds on top
//! of the shadow table.

use crate::constants::{channel_selector, ImageConstants};
use crate::device::{ColorWrites, ConstantBlock, DownsampleMode, GraphicsDevice, ImageProgram};
use crate::operation::{Operation, OperationKind};
use crate::pool::{ChannelMask, ResampleChain, ResourceId, ResourcePool, SamplerState, TargetUsage};
use crate::settings::{ShadowMethod, ShadowSettings};
use crate::{Error, Result};
use glam::Vec4;
use std::collections::HashMap;

/// State a post operation may read or update
pub struct PostOpContext<'a> {
    pub device: &'a mut dyn GraphicsDevice,
    pub pool: &'a mut ResourcePool,
    pub settings: &'a ShadowSettings,
    pub method: ShadowMethod,
    /// Resolution the write passes rendered at
    pub resolution: u32,
    /// Light camera depth range (near, far)
    pub depth_range: (f32, f32),
    pub mask_channels: ChannelMask,
    pub mask_dirty: &'a mut bool,
}

pub type PostOpFn = fn(&mut PostOpContext<'_>, &Operation) -> Result<()>;

/// Dispatch table of post operations keyed by operation kind
#[derive(Clone)]
pub struct PostOpTable {
    handlers: HashMap<OperationKind, PostOpFn>,
}

impl PostOpTable {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Operations every shadow map generator understands
    pub fn shadow() -> Self {
        let mut table = Self::empty();
        table.register(OperationKind::ComputeEdgeMask, update_edge_mask);
        table.register(OperationKind::ComputeStatistics, create_statistics_map);
        table.register(OperationKind::MergeColorAndEdge, copy_edge_to_color);
        table.register(OperationKind::DownsampleDepthMin, downsample_chain);
        table.register(OperationKind::DownsampleDepthMax, downsample_chain);
        table.register(OperationKind::DownsampleDepthAverage, downsample_chain);
        table.register(OperationKind::DownsampleDepthMinMax, downsample_chain);
        table
    }

    /// Shadow operations plus the G-buffer reductions
    pub fn reflective() -> Self {
        let mut table = Self::shadow();
        table.register(OperationKind::DownsampleRsmMin, downsample_chain);
        table.register(OperationKind::DownsampleRsmMax, downsample_chain);
        table.register(OperationKind::DownsampleRsmAverage, downsample_chain);
        table.register(OperationKind::MergeDepthNormal, merge_depth_normal_buffers);
        table
    }

    pub fn register(&mut self, kind: OperationKind, handler: PostOpFn) {
        self.handlers.insert(kind, handler);
    }

    pub fn contains(&self, kind: OperationKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn execute(&self, ctx: &mut PostOpContext<'_>, op: &Operation) -> Result<()> {
        match self.handlers.get(&op.kind) {
            Some(handler) => {
                log::trace!("Post operation {:?}", op.kind);
                handler(ctx, op)
            }
            None => {
                log::warn!("No post operation registered for {:?}", op.kind);
                Ok(())
            }
        }
    }
}

impl Default for PostOpTable {
    fn default() -> Self {
        Self::shadow()
    }
}

fn first_output(op: &Operation) -> Result<ResourceId> {
    op.outputs
        .first()
        .copied()
        .ok_or_else(|| Error::Resource(format!("{:?} has no output", op.kind)))
}

fn first_input(op: &Operation) -> Result<ResourceId> {
    op.inputs
        .first()
        .map(|i| i.texture)
        .ok_or_else(|| Error::Resource(format!("{:?} has no input", op.kind)))
}

fn target_size(pool: &ResourcePool, id: ResourceId) -> Result<u32> {
    pool.resource(id)
        .map(|r| r.key.width)
        .ok_or_else(|| Error::Resource(format!("unknown target {:?}", id)))
}

fn is_hardware_depth(pool: &ResourcePool, id: ResourceId) -> bool {
    pool.resource(id)
        .map_or(false, |r| matches!(r.key.usage, TargetUsage::ShadowMap | TargetUsage::DepthStencil))
}

fn chain_level(chain: &ResampleChain, size: u32) -> Result<usize> {
    chain
        .level_for(size)
        .ok_or_else(|| Error::Resource(format!("{:?} resample chain has no {}x{} level", chain.format, size, size)))
}

fn chain_target(chain: &ResampleChain, level: usize) -> Result<ResourceId> {
    chain
        .level(level)
        .ok_or_else(|| Error::Resource(format!("{:?} resample chain has no level {}", chain.format, level)))
}

/// Render one full-screen pass from `sources` into `targets`.
fn fullscreen_pass(
    ctx: &mut PostOpContext<'_>,
    sources: &[ResourceId],
    targets: &[ResourceId],
    constants: &ImageConstants,
    program: ImageProgram,
) -> Result<()> {
    let sampler = ctx.pool.sampler(SamplerState::point());
    ctx.device.begin_target_render(targets, None)?;
    for (slot, &source) in sources.iter().enumerate() {
        ctx.device.bind_texture(slot as u32, Some(source), Some(sampler));
    }
    ctx.device.upload_constants(ConstantBlock::ImageProcessing, bytemuck::bytes_of(constants))?;
    ctx.device.draw_fullscreen(program)?;
    for slot in 0..sources.len() {
        ctx.device.bind_texture(slot as u32, None, None);
    }
    ctx.device.end_target_render()
}

/// Detect depth discontinuities, dilate them down to the mask resolution and
/// write them into this generator's channels of the edge target.
pub fn update_edge_mask(ctx: &mut PostOpContext<'_>, op: &Operation) -> Result<()> {
    if !*ctx.mask_dirty {
        return Ok(());
    }

    let edge = first_output(op)?;
    let source = first_input(op)?;
    let (format, mask_size) = match ctx.pool.resource(edge) {
        Some(r) => (r.key.format, r.key.width),
        None => return Err(Error::Resource(format!("unknown edge target {:?}", edge))),
    };
    let extents = ctx.method.contains(ShadowMethod::DEPTH_EXTENTS_MASK);
    let hardware_depth = is_hardware_depth(ctx.pool, source);

    let chain = ctx.pool.resample_chain(format);
    let start = chain_level(&chain, ctx.resolution)?;
    let end = chain_level(&chain, mask_size)?;

    let (near, far) = ctx.depth_range;
    let threshold = ctx.settings.mask_threshold / (far - near).max(f32::EPSILON);
    let params = Vec4::new(threshold, near, far, 0.0);

    ctx.device.set_color_writes(ColorWrites::ALL);
    let detect = chain_target(&chain, start)?;
    fullscreen_pass(
        ctx,
        &[source],
        &[detect],
        &ImageConstants::new(ctx.resolution, params, [0.0; 4]),
        ImageProgram::DetectEdges { depth_extents: extents, hardware_depth },
    )?;

    for level in start..end {
        let from = chain_target(&chain, level)?;
        let to = chain_target(&chain, level + 1)?;
        let size = chain.size(level).unwrap_or(1);
        fullscreen_pass(
            ctx,
            &[from],
            &[to],
            &ImageConstants::new(size, params, [0.0; 4]),
            ImageProgram::DilateEdges { depth_extents: extents },
        )?;
    }

    let selector = channel_selector(ctx.mask_channels.channels().next());
    ctx.device.set_color_writes(ctx.mask_channels.color_writes());
    let last = chain_target(&chain, end)?;
    fullscreen_pass(
        ctx,
        &[last],
        &[edge],
        &ImageConstants::new(mask_size, params, selector),
        ImageProgram::FilterEdges { depth_extents: extents },
    )?;
    ctx.device.set_color_writes(ColorWrites::ALL);

    *ctx.mask_dirty = false;
    Ok(())
}

/// Separable blur of the depth target into the statistics map.
///
/// Each pass blurs vertically into a scratch level of the same size, then
/// horizontally back into the map. The first pass also converts raw depth into
/// moments or exponential depth.
pub fn create_statistics_map(ctx: &mut PostOpContext<'_>, op: &Operation) -> Result<()> {
    let stats = first_output(op)?;
    let source = first_input(op)?;
    let (format, size) = match ctx.pool.resource(stats) {
        Some(r) => (r.key.format, r.key.width),
        None => return Err(Error::Resource(format!("unknown statistics target {:?}", stats))),
    };
    let hardware_depth = is_hardware_depth(ctx.pool, source);

    let chain = ctx.pool.resample_chain(format);
    let scratch = chain_target(&chain, chain_level(&chain, size)?)?;

    let s = ctx.settings;
    let radius = s.filter_radius.ceil().max(1.0) as u32;
    let technique = ctx.method.technique();
    let params = Vec4::new(s.filter_blur_factor, s.minimum_variance, s.exponent, 0.0);
    let constants = ImageConstants::new(size, params, [0.0; 4]);

    for pass in 0..s.filter_passes.max(1) {
        let input = if pass == 0 { source } else { stats };
        fullscreen_pass(
            ctx,
            &[input],
            &[scratch],
            &constants,
            ImageProgram::StatisticsBlur {
                vertical: true,
                convert_depth: pass == 0,
                hardware_depth: hardware_depth && pass == 0,
                method: technique,
                radius,
            },
        )?;
        fullscreen_pass(
            ctx,
            &[scratch],
            &[stats],
            &constants,
            ImageProgram::StatisticsBlur {
                vertical: false,
                convert_depth: false,
                hardware_depth: false,
                method: technique,
                radius,
            },
        )?;
    }
    Ok(())
}

/// Copy the edge mask into the alpha channel of a color target
pub fn copy_edge_to_color(ctx: &mut PostOpContext<'_>, op: &Operation) -> Result<()> {
    let color = first_output(op)?;
    let edge = first_input(op)?;
    let size = target_size(ctx.pool, color)?;

    ctx.device.set_color_writes(ColorWrites::ALPHA);
    fullscreen_pass(
        ctx,
        &[edge],
        &[color],
        &ImageConstants::new(size, Vec4::ZERO, channel_selector(ctx.mask_channels.channels().next())),
        ImageProgram::CopyEdgeToAlpha,
    )?;
    ctx.device.set_color_writes(ColorWrites::ALL);
    Ok(())
}

fn downsample_mode(kind: OperationKind) -> DownsampleMode {
    match kind {
        OperationKind::DownsampleDepthMin | OperationKind::DownsampleRsmMin => DownsampleMode::Min,
        OperationKind::DownsampleDepthMax | OperationKind::DownsampleRsmMax => DownsampleMode::Max,
        OperationKind::DownsampleDepthMinMax => DownsampleMode::MinMax,
        _ => DownsampleMode::Average,
    }
}

/// Reduce every input down a resample chain until it reaches the size of
/// the matching output. Each level is its own full-screen pass.
pub fn downsample_chain(ctx: &mut PostOpContext<'_>, op: &Operation) -> Result<()> {
    if op.inputs.is_empty() || op.inputs.len() != op.outputs.len() {
        return Err(Error::Resource(format!(
            "{:?} needs matching inputs and outputs ({} / {})",
            op.kind,
            op.inputs.len(),
            op.outputs.len()
        )));
    }

    let mode = downsample_mode(op.kind);
    let targets = op.outputs.clone();
    let target_size = target_size(ctx.pool, targets[0])?;
    let source_size = target_size_of_input(ctx, op)?;
    if target_size > source_size {
        return Err(Error::Resource(format!(
            "cannot down-sample {} to larger {}",
            source_size, target_size
        )));
    }

    // Targets sharing a format need separate scratch levels
    let mut chains: Vec<ResampleChain> = Vec::with_capacity(targets.len());
    for &target in &targets {
        let format = ctx
            .pool
            .resource(target)
            .map(|r| r.key.format)
            .ok_or_else(|| Error::Resource(format!("unknown target {:?}", target)))?;
        let index = chains.iter().filter(|c| c.format == format).count() as u32;
        chains.push(ctx.pool.resample_chain_at(format, index));
    }
    let start = chain_level(&chains[0], source_size)?;
    let end = chain_level(&chains[0], target_size)?;
    if start == end {
        log::trace!("{:?} source already at {}x{}", op.kind, target_size, target_size);
        return Ok(());
    }

    let mut current: Vec<ResourceId> = op.inputs.iter().map(|i| i.texture).collect();
    for level in start + 1..=end {
        let next = if level == end {
            targets.clone()
        } else {
            chains
                .iter()
                .map(|c| chain_target(c, level))
                .collect::<Result<Vec<_>>>()?
        };
        let size = chains[0].size(level - 1).unwrap_or(1);
        fullscreen_pass(
            ctx,
            &current,
            &next,
            &ImageConstants::new(size, Vec4::ZERO, [0.0; 4]),
            ImageProgram::Downsample { mode, targets: next.len() as u32 },
        )?;
        current = next;
    }
    Ok(())
}

fn target_size_of_input(ctx: &PostOpContext<'_>, op: &Operation) -> Result<u32> {
    let source = first_input(op)?;
    target_size(ctx.pool, source)
}

/// Pack the separate depth and normal targets into one
pub fn merge_depth_normal_buffers(ctx: &mut PostOpContext<'_>, op: &Operation) -> Result<()> {
    let merged = first_output(op)?;
    let size = target_size(ctx.pool, merged)?;
    let (Some(depth), Some(normal)) = (op.input_at(0), op.input_at(1)) else {
        return Err(Error::Resource("depth/normal merge needs two inputs".into()));
    };
    let sources = [depth.texture, normal.texture];
    fullscreen_pass(
        ctx,
        &sources,
        &[merged],
        &ImageConstants::new(size, Vec4::ZERO, [0.0; 4]),
        ImageProgram::MergeDepthNormal,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCommand, RecordingDevice};
    use crate::pool::{PoolConfig, ResourceDescriptor, ResourceRole};
    use crate::settings::Versioned;
    use crate::generator::GeneratorId;
    use wgpu::TextureFormat;

    fn pool() -> ResourcePool {
        ResourcePool::new(PoolConfig::default().with_resolution_range(1, 256))
    }

    fn target(pool: &mut ResourcePool, size: u32, format: TextureFormat) -> ResourceId {
        let desc = ResourceDescriptor::cached(ResourceRole::ColorMap, size, format, TargetUsage::RenderTarget);
        pool.lease(GeneratorId(99), &[desc]).unwrap().resources[0].id
    }

    #[test]
    fn downsample_walks_every_level() {
        let mut pool = pool();
        let settings = crate::settings::ShadowSettings::combine(&Versioned::default(), &Versioned::default());
        let high = target(&mut pool, 64, TextureFormat::Rgba8Unorm);
        let low = target(&mut pool, 8, TextureFormat::Rgba8Unorm);
        let sampler = pool.sampler(SamplerState::point());

        let op = Operation::new(OperationKind::DownsampleRsmAverage)
            .with_input(0, high, sampler)
            .with_output(low);

        let mut device = RecordingDevice::new();
        let mut dirty = false;
        let mut ctx = PostOpContext {
            device: &mut device,
            pool: &mut pool,
            settings: &settings,
            method: ShadowMethod::RSM,
            resolution: 64,
            depth_range: (0.0, 1.0),
            mask_channels: ChannelMask::EMPTY,
            mask_dirty: &mut dirty,
        };
        PostOpTable::reflective().execute(&mut ctx, &op).unwrap();

        // 64 → 32 → 16 → 8
        assert_eq!(device.draws().len(), 3);
        let last_target = device.commands().iter().rev().find_map(|c| match c {
            DeviceCommand::BeginTargets { outputs, .. } => Some(outputs.clone()),
            _ => None,
        });
        assert_eq!(last_target, Some(vec![low]));
        assert!(!device.targets_bound());
    }

    #[test]
    fn statistics_runs_two_passes_per_filter_pass() {
        let mut pool = pool();
        let mut system = crate::settings::ShadowSettingsSystem::default().with_method(ShadowMethod::VSM);
        system.filter_passes = 2;
        let settings = crate::settings::ShadowSettings::combine(&Versioned::new(system), &Versioned::default());
        let depth = target(&mut pool, 32, TextureFormat::R32Float);
        let stats = target(&mut pool, 32, TextureFormat::Rg32Float);
        let sampler = pool.sampler(SamplerState::point());
        let op = Operation::new(OperationKind::ComputeStatistics)
            .with_input(0, depth, sampler)
            .with_output(stats);

        let mut device = RecordingDevice::new();
        let mut dirty = false;
        let mut ctx = PostOpContext {
            device: &mut device,
            pool: &mut pool,
            settings: &settings,
            method: ShadowMethod::VSM,
            resolution: 32,
            depth_range: (0.0, 1.0),
            mask_channels: ChannelMask::EMPTY,
            mask_dirty: &mut dirty,
        };
        PostOpTable::shadow().execute(&mut ctx, &op).unwrap();

        let draws = device.draws();
        assert_eq!(draws.len(), 4);
        assert!(matches!(draws[0], ImageProgram::StatisticsBlur { vertical: true, convert_depth: true, .. }));
        assert!(matches!(draws[2], ImageProgram::StatisticsBlur { vertical: true, convert_depth: false, .. }));
    }

    #[test]
    fn edge_mask_only_updates_when_dirty() {
        let mut pool = pool();
        let settings = crate::settings::ShadowSettings::default();
        let depth = target(&mut pool, 64, TextureFormat::R32Float);
        let edge = target(&mut pool, 16, TextureFormat::Rgba8Unorm);
        let sampler = pool.sampler(SamplerState::point());
        let op = Operation::new(OperationKind::ComputeEdgeMask)
            .with_input(0, depth, sampler)
            .with_output(edge);

        let mut device = RecordingDevice::new();
        let mut dirty = true;
        {
            let mut ctx = PostOpContext {
                device: &mut device,
                pool: &mut pool,
                settings: &settings,
                method: ShadowMethod::PCF | ShadowMethod::EDGE_MASK,
                resolution: 64,
                depth_range: (1.0, 11.0),
                mask_channels: ChannelMask::from_bits(0b0010),
                mask_dirty: &mut dirty,
            };
            let table = PostOpTable::shadow();
            table.execute(&mut ctx, &op).unwrap();
            // detect + 2 dilations (64 → 32 → 16) + final filter
            table.execute(&mut ctx, &op).unwrap();
        }
        assert!(!dirty);
        assert_eq!(device.draws().len(), 4);
        assert!(device
            .commands()
            .contains(&DeviceCommand::ColorWrites(ColorWrites::GREEN)));
    }
}
