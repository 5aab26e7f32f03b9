//! Graphics device abstraction
//!
//! Generators never talk to the GPU API directly. Everything they need is a
//! small set of recording primitives: bind targets, clear, set state, bind
//! textures, upload constant blocks, draw full-screen programs.

mod recording;

pub use recording::{DeviceCommand, RecordingDevice};
pub use wgpu::ColorWrites;

use crate::pool::{ResourceId, SamplerId};
use crate::settings::ShadowMethod;
use crate::Result;
use bitflags::bitflags;
use glam::{Mat4, Vec4};

bitflags! {
    /// Buffers touched by a clear
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const TARGET  = 1 << 0;
        const DEPTH   = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// Triangle culling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

impl CullMode {
    pub fn to_wgpu(self) -> Option<wgpu::Face> {
        match self {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        }
    }
}

/// Pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn square(size: u32) -> Self {
        Self { x: 0, y: 0, width: size, height: size }
    }
}

/// View and projection the device renders with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    pub view: Mat4,
    pub projection: Mat4,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

/// Constant blocks shared with the shading system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantBlock {
    Shadow,
    Rsm,
    LightTexProjection,
    ImageProcessing,
}

/// Per-light system states read by the lighting shaders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemState {
    ShadowMethod,
    PrimaryTaps,
    SecondaryTaps,
    SamplingMethod,
}

/// Reduction used when down-sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownsampleMode {
    Min,
    Max,
    Average,
    MinMax,
}

/// Full-screen image programs used by post-processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageProgram {
    DetectEdges { depth_extents: bool, hardware_depth: bool },
    DilateEdges { depth_extents: bool },
    FilterEdges { depth_extents: bool },
    CopyEdgeToAlpha,
    StatisticsBlur {
        vertical: bool,
        convert_depth: bool,
        hardware_depth: bool,
        method: ShadowMethod,
        radius: u32,
    },
    Downsample { mode: DownsampleMode, targets: u32 },
    MergeDepthNormal,
}

/// Recording interface for shadow generation.
pub trait GraphicsDevice {
    /// Bind color outputs and an optional depth-stencil
    fn begin_target_render(&mut self, outputs: &[ResourceId], depth_stencil: Option<ResourceId>) -> Result<()>;

    /// Unbind the targets bound by the matching `begin_target_render`
    fn end_target_render(&mut self) -> Result<()>;

    fn clear(&mut self, rect: Rect, flags: ClearFlags, color: u32, depth: f32, stencil: u8) -> Result<()>;

    fn set_color_writes(&mut self, writes: ColorWrites);

    fn set_cull_mode(&mut self, mode: CullMode);

    fn set_depth_bias(&mut self, constant: f32, slope_scale: f32);

    /// User clip planes, empty to disable
    fn set_clip_planes(&mut self, planes: &[Vec4]);

    fn bind_texture(&mut self, slot: u32, texture: Option<ResourceId>, sampler: Option<SamplerId>);

    fn camera(&self) -> CameraState;

    fn set_camera(&mut self, camera: CameraState);

    fn upload_constants(&mut self, block: ConstantBlock, data: &[u8]) -> Result<()>;

    fn set_system_state(&mut self, state: SystemState, value: u32);

    fn draw_fullscreen(&mut self, program: ImageProgram) -> Result<()>;

    /// Replace the contents of a texture
    fn write_texture(&mut self, texture: ResourceId, data: &[u8]) -> Result<()>;

    /// Hand reflective shadow map targets to a propagation volume injector
    fn bind_vpl_data(&mut self, _depth: ResourceId, _normal: ResourceId) {
        // Default: no propagation volume support
    }
}
