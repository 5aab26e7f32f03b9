//! Command-log device
//!
//! Records every call instead of executing it. Useful for inspecting the
//! command stream a generator produces, and for driving generators without a GPU.

use super::{
    CameraState, ClearFlags, ColorWrites, ConstantBlock, CullMode, GraphicsDevice, ImageProgram,
    Rect, SystemState,
};
use crate::pool::{ResourceId, SamplerId};
use crate::{Error, Result};
use glam::Vec4;

/// One recorded device call
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    BeginTargets { outputs: Vec<ResourceId>, depth_stencil: Option<ResourceId> },
    EndTargets,
    Clear { rect: Rect, flags: ClearFlags, color: u32, depth: f32, stencil: u8 },
    ColorWrites(ColorWrites),
    Cull(CullMode),
    DepthBias { constant: f32, slope_scale: f32 },
    ClipPlanes(Vec<Vec4>),
    BindTexture { slot: u32, texture: Option<ResourceId>, sampler: Option<SamplerId> },
    Camera(CameraState),
    Constants { block: ConstantBlock, data: Vec<u8> },
    SystemState { state: SystemState, value: u32 },
    Draw(ImageProgram),
    WriteTexture { texture: ResourceId, bytes: usize },
    VplData { depth: ResourceId, normal: ResourceId },
}

/// Device that logs commands
#[derive(Debug, Default)]
pub struct RecordingDevice {
    commands: Vec<DeviceCommand>,
    camera: CameraState,
    targets_bound: bool,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<DeviceCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Full-screen programs drawn so far, in order
    pub fn draws(&self) -> Vec<ImageProgram> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                DeviceCommand::Draw(program) => Some(*program),
                _ => None,
            })
            .collect()
    }

    /// Last upload of a constant block
    pub fn last_constants(&self, block: ConstantBlock) -> Option<&[u8]> {
        self.commands.iter().rev().find_map(|c| match c {
            DeviceCommand::Constants { block: b, data } if *b == block => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn targets_bound(&self) -> bool {
        self.targets_bound
    }
}

impl GraphicsDevice for RecordingDevice {
    fn begin_target_render(&mut self, outputs: &[ResourceId], depth_stencil: Option<ResourceId>) -> Result<()> {
        if self.targets_bound {
            return Err(Error::Device("render targets already bound".into()));
        }
        self.targets_bound = true;
        self.commands.push(DeviceCommand::BeginTargets {
            outputs: outputs.to_vec(),
            depth_stencil,
        });
        Ok(())
    }

    fn end_target_render(&mut self) -> Result<()> {
        if !self.targets_bound {
            return Err(Error::Device("no render targets bound".into()));
        }
        self.targets_bound = false;
        self.commands.push(DeviceCommand::EndTargets);
        Ok(())
    }

    fn clear(&mut self, rect: Rect, flags: ClearFlags, color: u32, depth: f32, stencil: u8) -> Result<()> {
        if !self.targets_bound {
            return Err(Error::Device("clear without bound targets".into()));
        }
        self.commands.push(DeviceCommand::Clear { rect, flags, color, depth, stencil });
        Ok(())
    }

    fn set_color_writes(&mut self, writes: ColorWrites) {
        self.commands.push(DeviceCommand::ColorWrites(writes));
    }

    fn set_cull_mode(&mut self, mode: CullMode) {
        self.commands.push(DeviceCommand::Cull(mode));
    }

    fn set_depth_bias(&mut self, constant: f32, slope_scale: f32) {
        self.commands.push(DeviceCommand::DepthBias { constant, slope_scale });
    }

    fn set_clip_planes(&mut self, planes: &[Vec4]) {
        self.commands.push(DeviceCommand::ClipPlanes(planes.to_vec()));
    }

    fn bind_texture(&mut self, slot: u32, texture: Option<ResourceId>, sampler: Option<SamplerId>) {
        self.commands.push(DeviceCommand::BindTexture { slot, texture, sampler });
    }

    fn camera(&self) -> CameraState {
        self.camera
    }

    fn set_camera(&mut self, camera: CameraState) {
        self.camera = camera;
        self.commands.push(DeviceCommand::Camera(camera));
    }

    fn upload_constants(&mut self, block: ConstantBlock, data: &[u8]) -> Result<()> {
        self.commands.push(DeviceCommand::Constants { block, data: data.to_vec() });
        Ok(())
    }

    fn set_system_state(&mut self, state: SystemState, value: u32) {
        self.commands.push(DeviceCommand::SystemState { state, value });
    }

    fn draw_fullscreen(&mut self, program: ImageProgram) -> Result<()> {
        if !self.targets_bound {
            return Err(Error::Device(format!("{:?} drawn without bound targets", program)));
        }
        self.commands.push(DeviceCommand::Draw(program));
        Ok(())
    }

    fn write_texture(&mut self, texture: ResourceId, data: &[u8]) -> Result<()> {
        self.commands.push(DeviceCommand::WriteTexture { texture, bytes: data.len() });
        Ok(())
    }

    fn bind_vpl_data(&mut self, depth: ResourceId, normal: ResourceId) {
        self.commands.push(DeviceCommand::VplData { depth, normal });
    }
}
