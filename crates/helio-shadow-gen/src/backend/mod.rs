//! wgpu implementation of [`GraphicsDevice`]
//!
//! [`WgpuResources`] materializes the pool's bookkeeping as real textures,
//! views and samplers. [`WgpuDevice`] records the generators' commands into a
//! command encoder.
//!
//! Shadow caster geometry is drawn by the owner: between
//! `begin_write_pass` and `end_write_pass` it opens a pass on the bound
//! targets with [`WgpuDevice::target_pass`] and reads the raster state from
//! [`WgpuDevice::raster_state`].

mod programs;

pub use programs::{entry_point, program_params, ImagePipelines, IMAGE_UNIFORM_SIZE};

use crate::device::{
    CameraState, ClearFlags, ColorWrites, ConstantBlock, CullMode, GraphicsDevice, ImageProgram, Rect,
    SystemState,
};
use crate::pool::{bytes_per_texel, is_depth, ResourceId, ResourcePool, SamplerId, TargetKey};
use crate::{Error, Result};
use glam::Vec4;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

struct GpuTarget {
    key: TargetKey,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// GPU objects backing a [`ResourcePool`]
pub struct WgpuResources {
    device: Arc<wgpu::Device>,
    targets: HashMap<ResourceId, GpuTarget>,
    samplers: HashMap<SamplerId, wgpu::Sampler>,
}

impl WgpuResources {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            targets: HashMap::new(),
            samplers: HashMap::new(),
        }
    }

    /// Create textures and samplers for pool entries that have none yet.
    ///
    /// Returns the number of textures created.
    pub fn sync(&mut self, pool: &ResourcePool) -> usize {
        let mut created = 0;
        for (id, resource) in pool.resources() {
            let stale = self.targets.get(&id).map_or(true, |t| t.key != resource.key);
            if !stale {
                continue;
            }
            let label = format!("Shadow Target {}", id.index());
            let texture = self.device.create_texture(&resource.key.to_descriptor(Some(&label)));
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            self.targets.insert(id, GpuTarget { key: resource.key, texture, view });
            created += 1;
        }
        for (id, state) in pool.samplers().iter() {
            if !self.samplers.contains_key(&id) {
                let sampler = self.device.create_sampler(&state.to_wgpu(Some("Shadow Sampler")));
                self.samplers.insert(id, sampler);
            }
        }
        if created > 0 {
            log::debug!("Created {} shadow textures", created);
        }
        created
    }

    pub fn texture(&self, id: ResourceId) -> Option<&wgpu::Texture> {
        self.targets.get(&id).map(|t| &t.texture)
    }

    pub fn view(&self, id: ResourceId) -> Option<&wgpu::TextureView> {
        self.targets.get(&id).map(|t| &t.view)
    }

    pub fn key(&self, id: ResourceId) -> Option<&TargetKey> {
        self.targets.get(&id).map(|t| &t.key)
    }

    pub fn sampler(&self, id: SamplerId) -> Option<&wgpu::Sampler> {
        self.samplers.get(&id)
    }

    fn target(&self, id: ResourceId) -> Result<&GpuTarget> {
        self.targets
            .get(&id)
            .ok_or_else(|| Error::Resource(format!("{:?} has no GPU texture; sync the pool first", id)))
    }
}

/// Raster state the owner applies when drawing shadow casters
#[derive(Debug, Clone, PartialEq)]
pub struct RasterState {
    pub color_writes: ColorWrites,
    pub cull_mode: CullMode,
    pub depth_bias: f32,
    pub slope_scale_bias: f32,
    pub clip_planes: Vec<Vec4>,
    pub camera: CameraState,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            color_writes: ColorWrites::ALL,
            cull_mode: CullMode::Back,
            depth_bias: 0.0,
            slope_scale_bias: 0.0,
            clip_planes: Vec::new(),
            camera: CameraState::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BoundTargets {
    outputs: Vec<ResourceId>,
    depth_stencil: Option<ResourceId>,
}

/// Records generator commands into a wgpu command encoder.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    resources: WgpuResources,
    pipelines: ImagePipelines,
    encoder: Option<wgpu::CommandEncoder>,
    targets: Option<BoundTargets>,
    textures: HashMap<u32, (ResourceId, Option<SamplerId>)>,
    raster: RasterState,
    image_constants: Vec<u8>,
    constant_buffers: HashMap<ConstantBlock, wgpu::Buffer>,
    system_states: HashMap<SystemState, u32>,
    vpl_data: Option<(ResourceId, ResourceId)>,
}

impl WgpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        log::info!("Creating wgpu shadow device");
        Self {
            resources: WgpuResources::new(device.clone()),
            pipelines: ImagePipelines::new(device.clone()),
            device,
            queue,
            encoder: None,
            targets: None,
            textures: HashMap::new(),
            raster: RasterState::default(),
            image_constants: Vec::new(),
            constant_buffers: HashMap::new(),
            system_states: HashMap::new(),
            vpl_data: None,
        }
    }

    pub fn resources(&self) -> &WgpuResources {
        &self.resources
    }

    /// Mirror new pool targets on the GPU
    pub fn sync(&mut self, pool: &ResourcePool) -> usize {
        self.resources.sync(pool)
    }

    /// Start recording a frame
    pub fn begin_frame(&mut self) {
        if self.encoder.is_some() {
            log::warn!("begin_frame while a frame is recording, dropping the previous commands");
        }
        self.encoder = Some(self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Shadow Generation Encoder"),
        }));
    }

    /// Finish the frame; the caller submits the buffer
    pub fn finish_frame(&mut self) -> Option<wgpu::CommandBuffer> {
        if self.targets.is_some() {
            log::warn!("Finishing shadow frame with targets still bound");
            self.targets = None;
        }
        self.encoder.take().map(|e| e.finish())
    }

    pub fn raster_state(&self) -> &RasterState {
        &self.raster
    }

    pub fn system_state(&self, state: SystemState) -> u32 {
        self.system_states.get(&state).copied().unwrap_or(0)
    }

    /// Buffer holding the last upload of `block`
    pub fn constant_buffer(&self, block: ConstantBlock) -> Option<&wgpu::Buffer> {
        self.constant_buffers.get(&block)
    }

    /// Texture and sampler bound to a shader register
    pub fn bound_texture(&self, slot: u32) -> Option<(&wgpu::TextureView, Option<&wgpu::Sampler>)> {
        let (texture, sampler) = self.textures.get(&slot)?;
        let view = self.resources.view(*texture)?;
        Some((view, sampler.and_then(|s| self.resources.sampler(s))))
    }

    pub fn vpl_data(&self) -> Option<(ResourceId, ResourceId)> {
        self.vpl_data
    }

    /// Open a pass on the bound targets that keeps their contents
    pub fn target_pass(&mut self, label: &str) -> Result<wgpu::RenderPass<'_>> {
        self.begin_pass(label, None, None)
    }

    fn bound(&self) -> Result<&BoundTargets> {
        self.targets
            .as_ref()
            .ok_or_else(|| Error::Device("no render targets bound".into()))
    }

    fn begin_pass(
        &mut self,
        label: &str,
        clear_color: Option<wgpu::Color>,
        clear_depth: Option<f32>,
    ) -> Result<wgpu::RenderPass<'_>> {
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| Error::Device("no render targets bound".into()))?;
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| Error::Device("no frame recording; call begin_frame".into()))?;

        let mut color_attachments = Vec::with_capacity(targets.outputs.len());
        for id in &targets.outputs {
            let target = self.resources.target(*id)?;
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: clear_color.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                },
            }));
        }
        let depth_stencil_attachment = match targets.depth_stencil {
            Some(id) => Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.resources.target(id)?.view,
                depth_ops: Some(wgpu::Operations {
                    load: clear_depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            None => None,
        };

        Ok(encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        }))
    }
}

/// D3D-style packed ARGB
fn unpack_color(color: u32) -> wgpu::Color {
    let channel = |shift: u32| ((color >> shift) & 0xff) as f64 / 255.0;
    wgpu::Color {
        r: channel(16),
        g: channel(8),
        b: channel(0),
        a: channel(24),
    }
}

impl GraphicsDevice for WgpuDevice {
    fn begin_target_render(&mut self, outputs: &[ResourceId], depth_stencil: Option<ResourceId>) -> Result<()> {
        if self.targets.is_some() {
            return Err(Error::Device("render targets already bound".into()));
        }
        for id in outputs.iter().chain(depth_stencil.iter()) {
            self.resources.target(*id)?;
        }
        self.targets = Some(BoundTargets {
            outputs: outputs.to_vec(),
            depth_stencil,
        });
        Ok(())
    }

    fn end_target_render(&mut self) -> Result<()> {
        self.targets
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::Device("end_target_render without bound targets".into()))
    }

    fn clear(&mut self, rect: Rect, flags: ClearFlags, color: u32, depth: f32, _stencil: u8) -> Result<()> {
        let targets = self.bound()?;
        if let Some(first) = targets.outputs.first().or(targets.depth_stencil.as_ref()) {
            let key = self.resources.target(*first)?.key;
            if rect.width < key.width || rect.height < key.height {
                log::debug!(
                    "Partial clear {:?} of {}x{} target clears the whole target",
                    rect,
                    key.width,
                    key.height
                );
            }
        }
        let clear_color = flags.contains(ClearFlags::TARGET).then(|| unpack_color(color));
        let clear_depth = flags.contains(ClearFlags::DEPTH).then_some(depth);
        let _pass = self.begin_pass("Shadow Clear", clear_color, clear_depth)?;
        Ok(())
    }

    fn set_color_writes(&mut self, writes: ColorWrites) {
        self.raster.color_writes = writes;
    }

    fn set_cull_mode(&mut self, mode: CullMode) {
        self.raster.cull_mode = mode;
    }

    fn set_depth_bias(&mut self, constant: f32, slope_scale: f32) {
        self.raster.depth_bias = constant;
        self.raster.slope_scale_bias = slope_scale;
    }

    fn set_clip_planes(&mut self, planes: &[Vec4]) {
        self.raster.clip_planes = planes.to_vec();
    }

    fn bind_texture(&mut self, slot: u32, texture: Option<ResourceId>, sampler: Option<SamplerId>) {
        match texture {
            Some(texture) => {
                self.textures.insert(slot, (texture, sampler));
            }
            None => {
                self.textures.remove(&slot);
            }
        }
    }

    fn camera(&self) -> CameraState {
        self.raster.camera
    }

    fn set_camera(&mut self, camera: CameraState) {
        self.raster.camera = camera;
    }

    fn upload_constants(&mut self, block: ConstantBlock, data: &[u8]) -> Result<()> {
        if block == ConstantBlock::ImageProcessing {
            // Consumed by the next draw_fullscreen
            self.image_constants = data.to_vec();
            return Ok(());
        }
        // A fresh buffer per upload so earlier passes keep their values
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Shadow Constants"),
            contents: data,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        self.constant_buffers.insert(block, buffer);
        Ok(())
    }

    fn set_system_state(&mut self, state: SystemState, value: u32) {
        self.system_states.insert(state, value);
    }

    fn draw_fullscreen(&mut self, program: ImageProgram) -> Result<()> {
        let targets = self.bound()?.outputs.clone();
        let mut formats = Vec::with_capacity(targets.len());
        for id in &targets {
            formats.push(self.resources.target(*id)?.key.format);
        }

        let source = self.textures.get(&0).map(|(id, _)| *id);
        let depth_source = match source {
            Some(id) => is_depth(self.resources.target(id)?.key.format),
            None => false,
        };
        let pipeline = self
            .pipelines
            .get_or_create(&program, &formats, depth_source, self.raster.color_writes)?;

        let mut uniform = vec![0u8; IMAGE_UNIFORM_SIZE];
        let constants_len = self.image_constants.len().min(IMAGE_UNIFORM_SIZE - 16);
        uniform[..constants_len].copy_from_slice(&self.image_constants[..constants_len]);
        uniform[IMAGE_UNIFORM_SIZE - 16..].copy_from_slice(bytemuck::cast_slice(&program_params(&program)));
        let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Shadow Image Constants"),
            contents: &uniform,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let placeholder = self.pipelines.placeholder();
        let mut views = [placeholder; 3];
        for (slot, view) in views.iter_mut().enumerate() {
            if slot == 0 && depth_source {
                continue;
            }
            if let Some((id, _)) = self.textures.get(&(slot as u32)) {
                *view = &self.resources.target(*id)?.view;
            }
        }
        let sources = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Shadow Image Sources"),
            layout: self.pipelines.sources_layout(),
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(views[0]) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(views[1]) },
                wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(views[2]) },
                wgpu::BindGroupEntry { binding: 3, resource: uniform.as_entire_binding() },
            ],
        });
        let depth = match (source, depth_source) {
            (Some(id), true) => {
                let view = &self.resources.target(id)?.view;
                Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Shadow Image Depth Source"),
                    layout: self.pipelines.depth_layout(),
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(view),
                    }],
                }))
            }
            _ => None,
        };

        let mut pass = self.begin_pass("Shadow Image Program", None, None)?;
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &sources, &[]);
        if let Some(depth) = depth.as_ref() {
            pass.set_bind_group(1, depth, &[]);
        }
        pass.draw(0..3, 0..1);
        Ok(())
    }

    fn write_texture(&mut self, texture: ResourceId, data: &[u8]) -> Result<()> {
        let target = self.resources.target(texture)?;
        let key = target.key;
        let bytes_per_row = key.width * bytes_per_texel(key.format) as u32;
        let expected = bytes_per_row as usize * key.height as usize;
        if data.len() != expected {
            return Err(Error::Device(format!(
                "texture upload of {} bytes, {}x{} {:?} needs {}",
                data.len(),
                key.width,
                key.height,
                key.format,
                expected
            )));
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout { offset: 0, bytes_per_row: Some(bytes_per_row), rows_per_image: Some(key.height) },
            wgpu::Extent3d { width: key.width, height: key.height, depth_or_array_layers: 1 },
        );
        Ok(())
    }

    fn bind_vpl_data(&mut self, depth: ResourceId, normal: ResourceId) {
        self.vpl_data = Some((depth, normal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_colors_unpack_as_argb() {
        let white = unpack_color(0xffff_ffff);
        assert_eq!((white.r, white.g, white.b, white.a), (1.0, 1.0, 1.0, 1.0));
        let red = unpack_color(0x80ff_0000);
        assert_eq!((red.r, red.g, red.b), (1.0, 0.0, 0.0));
        assert!((red.a - 128.0 / 255.0).abs() < 1e-9);
    }
}
