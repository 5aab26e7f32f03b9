//! Declarative render operations
//!
//! An operation describes one pass: what it samples, what it renders to, how
//! it clears and which raster state it uses. Generators build three lists
//! (write, post-process, read) whenever settings or resource assignment
//! change and replay them every frame.

use crate::device::{ClearFlags, ColorWrites, CullMode};
use crate::generator::SamplerRegisters;
use crate::pool::{LeasedResource, ResourceDescriptor, ResourceId, ResourceRole, SamplerId};
use crate::settings::{IndirectLightingMethod, ShadowMethod, ShadowSettings};
use crate::{Error, Result};

/// Operation type ids shared with the shading system
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    DrawOpaqueShadowCasters = 0,
    DrawTransparentShadowCasters = 1,
    DrawAllShadowCasters = 2,
    DownsampleDepthMin = 3,
    DownsampleDepthMax = 4,
    DownsampleDepthAverage = 5,
    DownsampleDepthMinMax = 6,
    ComputeEdgeMask = 7,
    ComputeStatistics = 8,
    MergeColorAndEdge = 9,
    ComputeShadows = 10,

    WriteGBuffer = 100,
    ReadGBuffer = 101,
    DownsampleRsmMin = 102,
    DownsampleRsmMax = 103,
    DownsampleRsmAverage = 104,
    MergeDepthNormal = 105,
}

impl OperationKind {
    pub fn id(self) -> u32 {
        self as u32
    }
}

/// A texture sampled by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationInput {
    pub slot: u32,
    pub texture: ResourceId,
    pub sampler: SamplerId,
}

/// One render pass description
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub inputs: Vec<OperationInput>,
    pub outputs: Vec<ResourceId>,
    pub depth_stencil: Option<ResourceId>,
    pub clear_flags: ClearFlags,
    pub clear_color: u32,
    pub clear_depth: f32,
    pub clear_stencil: u8,
    pub cull_mode: CullMode,
    pub color_writes: ColorWrites,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            depth_stencil: None,
            clear_flags: ClearFlags::empty(),
            clear_color: 0,
            clear_depth: 1.0,
            clear_stencil: 0,
            cull_mode: CullMode::Back,
            color_writes: ColorWrites::ALL,
        }
    }

    pub fn with_input(mut self, slot: u32, texture: ResourceId, sampler: SamplerId) -> Self {
        self.inputs.push(OperationInput { slot, texture, sampler });
        self
    }

    pub fn with_output(mut self, target: ResourceId) -> Self {
        self.outputs.push(target);
        self
    }

    pub fn with_depth_stencil(mut self, target: ResourceId) -> Self {
        self.depth_stencil = Some(target);
        self
    }

    pub fn with_clear(mut self, flags: ClearFlags, color: u32, depth: f32) -> Self {
        self.clear_flags = flags;
        self.clear_color = color;
        self.clear_depth = depth;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_color_writes(mut self, writes: ColorWrites) -> Self {
        self.color_writes = writes;
        self
    }

    pub fn input_at(&self, slot: u32) -> Option<&OperationInput> {
        self.inputs.iter().find(|i| i.slot == slot)
    }
}

/// Ordered list of operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationList {
    ops: Vec<Operation>,
}

impl OperationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.ops.get(index)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.ops.iter()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

impl<'a> IntoIterator for &'a OperationList {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

/// The three lists a generator replays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationSet {
    pub write: OperationList,
    pub post: OperationList,
    pub read: OperationList,
}

impl OperationSet {
    pub fn clear(&mut self) {
        self.write.clear();
        self.post.clear();
        self.read.clear();
    }
}

/// Inputs for building operation lists
pub struct BuildContext<'a> {
    pub settings: &'a ShadowSettings,
    pub method: ShadowMethod,
    pub descriptors: &'a [ResourceDescriptor],
    pub resources: &'a [LeasedResource],
    /// Interned sampler per descriptor
    pub samplers: &'a [SamplerId],
    pub registers: &'a SamplerRegisters,
    pub random_texture: Option<(ResourceId, SamplerId)>,
}

impl BuildContext<'_> {
    fn find(&self, role: ResourceRole) -> Option<usize> {
        self.descriptors.iter().position(|d| d.role == role)
    }

    fn find_nth(&self, role: ResourceRole, nth: usize) -> Option<usize> {
        self.descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.role == role)
            .nth(nth)
            .map(|(i, _)| i)
    }

    fn id(&self, index: usize) -> Result<ResourceId> {
        self.resources
            .get(index)
            .map(|r| r.id)
            .ok_or_else(|| Error::Resource(format!("no resource bound at index {}", index)))
    }

    fn sampler(&self, index: usize) -> Result<SamplerId> {
        self.samplers
            .get(index)
            .copied()
            .ok_or_else(|| Error::Resource(format!("no sampler for resource {}", index)))
    }

    fn require(&self, role: ResourceRole) -> Result<usize> {
        self.find(role)
            .ok_or_else(|| Error::Resource(format!("no {:?} descriptor", role)))
    }
}

fn add_input(op: &mut Operation, slot: Option<u32>, texture: ResourceId, sampler: SamplerId) {
    if let Some(slot) = slot {
        op.inputs.push(OperationInput { slot, texture, sampler });
    }
}

/// Depth fill, statistics/edge post-processing and the shadow lookup
pub fn build_shadow_operations(ctx: &BuildContext) -> Result<OperationSet> {
    if ctx.descriptors.len() < 2 || ctx.resources.len() != ctx.descriptors.len() {
        return Err(Error::Resource(format!(
            "shadow map needs depth and target resources ({} described, {} bound)",
            ctx.descriptors.len(),
            ctx.resources.len()
        )));
    }

    let method = ctx.method;
    let regs = ctx.registers;
    let mut set = OperationSet::default();

    let mut write = Operation::new(OperationKind::DrawOpaqueShadowCasters)
        .with_clear(ClearFlags::DEPTH, 0, 1.0)
        .with_color_writes(ColorWrites::empty())
        .with_depth_stencil(ctx.id(0)?)
        .with_cull_mode(ctx.settings.cull_mode);
    if ctx.descriptors[1].key.usage.is_render_target() {
        write.outputs.push(ctx.id(1)?);
    }
    if method.contains(ShadowMethod::DEPTH_READS) && !method.contains(ShadowMethod::HARDWARE) {
        write.color_writes = ColorWrites::ALL;
        write.clear_flags |= ClearFlags::TARGET;
        write.clear_color = 0xffff_ffff;
    }
    if method.contains(ShadowMethod::NORMAL_OFFSET) {
        write.cull_mode = CullMode::Back;
    }

    let mut read = Operation::new(OperationKind::ComputeShadows);
    let sampled = if !ctx.descriptors[0].is_shared() {
        Some(0)
    } else if !ctx.descriptors[1].is_shared() {
        Some(1)
    } else {
        None
    };
    if let Some(i) = sampled {
        add_input(&mut read, regs.depth, ctx.id(i)?, ctx.sampler(i)?);
    }

    if method.is_statistical() {
        let stats = ctx.require(ResourceRole::StatisticsMap)?;
        write.cull_mode = CullMode::Back;
        let source = if write.color_writes.is_empty() { 0 } else { 1 };
        set.post.push(
            Operation::new(OperationKind::ComputeStatistics)
                .with_output(ctx.id(stats)?)
                .with_input(0, ctx.id(source)?, ctx.sampler(source)?),
        );
        add_input(&mut read, regs.depth, ctx.id(stats)?, ctx.sampler(stats)?);
    }

    if method.intersects(ShadowMethod::EDGE_MASK | ShadowMethod::DEPTH_EXTENTS_MASK) {
        let edge = ctx.require(ResourceRole::EdgeMap)?;
        let hardware_only = method.contains(ShadowMethod::HARDWARE)
            && method.intersects(ShadowMethod::COMPARE | ShadowMethod::GATHER);
        if hardware_only && write.color_writes.is_empty() && !write.outputs.is_empty() {
            // Edge detection needs plain depth values in the color target
            write.color_writes = ColorWrites::ALL;
            write.clear_flags |= ClearFlags::TARGET;
            write.clear_color = 0xffff_ffff;
        }
        let source = if write.color_writes.is_empty() { 0 } else { 1 };
        set.post.push(
            Operation::new(OperationKind::ComputeEdgeMask)
                .with_output(ctx.id(edge)?)
                .with_input(0, ctx.id(source)?, ctx.sampler(source)?),
        );
        add_input(&mut read, regs.edge, ctx.id(edge)?, ctx.sampler(edge)?);
    }

    set.write.push(write.clone());

    if method.contains(ShadowMethod::TRANSLUCENCY) {
        let color = ctx.require(ResourceRole::ColorMap)?;
        set.write.push(
            Operation::new(OperationKind::DrawTransparentShadowCasters)
                .with_clear(ClearFlags::TARGET, 0xffff_ffff, 1.0)
                .with_depth_stencil(ctx.id(0)?)
                .with_output(ctx.id(color)?)
                .with_cull_mode(write.cull_mode),
        );
        add_input(&mut read, regs.color, ctx.id(color)?, ctx.sampler(color)?);
    }

    set.read.push(read);
    Ok(set)
}

/// G-buffer fill, optional down-sample and merge, and the indirect lookup
pub fn build_reflective_operations(ctx: &BuildContext) -> Result<OperationSet> {
    let regs = ctx.registers;
    let depth_stencil = ctx.require(ResourceRole::DepthStencilBuffer)?;
    let high = [
        ctx.require(ResourceRole::DepthMap)?,
        ctx.require(ResourceRole::NormalMap)?,
        ctx.require(ResourceRole::ColorMap)?,
    ];
    let mut set = OperationSet::default();

    let mut write = Operation::new(OperationKind::WriteGBuffer)
        .with_clear(ClearFlags::TARGET | ClearFlags::DEPTH, 0xffff_ffff, 1.0)
        .with_depth_stencil(ctx.id(depth_stencil)?)
        .with_cull_mode(CullMode::Back);
    for &i in &high {
        write.outputs.push(ctx.id(i)?);
    }
    set.write.push(write);

    let mut sources = high;
    if ctx.settings.box_filter {
        let low = [
            ctx.find_nth(ResourceRole::DepthMap, 1),
            ctx.find_nth(ResourceRole::NormalMap, 1),
            ctx.find_nth(ResourceRole::ColorMap, 1),
        ];
        let [Some(d), Some(n), Some(c)] = low else {
            return Err(Error::Resource("box filtered RSM needs low resolution targets".into()));
        };
        let mut downsample = Operation::new(OperationKind::DownsampleRsmMax);
        for (slot, &i) in high.iter().enumerate() {
            downsample.inputs.push(OperationInput {
                slot: slot as u32,
                texture: ctx.id(i)?,
                sampler: ctx.sampler(i)?,
            });
        }
        for i in [d, n, c] {
            downsample.outputs.push(ctx.id(i)?);
        }
        set.post.push(downsample);
        sources = [d, n, c];
    }

    let [depth, normal, color] = sources;
    let mut read = Operation::new(OperationKind::ReadGBuffer);
    if ctx.settings.indirect_method.contains(IndirectLightingMethod::VTF) {
        let merged = ctx.require(ResourceRole::DepthNormalMap)?;
        set.post.push(
            Operation::new(OperationKind::MergeDepthNormal)
                .with_input(0, ctx.id(depth)?, ctx.sampler(depth)?)
                .with_input(1, ctx.id(normal)?, ctx.sampler(normal)?)
                .with_output(ctx.id(merged)?),
        );
        add_input(&mut read, regs.depth, ctx.id(merged)?, ctx.sampler(merged)?);
    } else {
        add_input(&mut read, regs.depth, ctx.id(depth)?, ctx.sampler(depth)?);
        add_input(&mut read, regs.normal, ctx.id(normal)?, ctx.sampler(normal)?);
    }
    add_input(&mut read, regs.color, ctx.id(color)?, ctx.sampler(color)?);
    if let Some((texture, sampler)) = ctx.random_texture {
        add_input(&mut read, regs.random, texture, sampler);
    }
    set.read.push(read);
    Ok(set)
}
