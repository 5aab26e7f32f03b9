//! Pipeline cache for full-screen image programs

use crate::device::{ColorWrites, DownsampleMode, ImageProgram};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

const SHADER_SOURCE: &str = include_str!("image.wgsl");

/// Size of the uniform block the image shader reads
pub const IMAGE_UNIFORM_SIZE: usize = 80;

const FLAG_VERTICAL: u32 = 1;
const FLAG_CONVERT: u32 = 2;

/// Key for pipeline cache lookup
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
struct PipelineKey {
    entry_point: &'static str,
    targets: Vec<wgpu::TextureFormat>,
    depth_source: bool,
    color_writes: ColorWrites,
}

/// Fragment entry point for a program, `None` when it has no variant for
/// the given source and target count
pub fn entry_point(program: &ImageProgram, depth_source: bool, targets: usize) -> Option<&'static str> {
    let entry = match (*program, depth_source) {
        (ImageProgram::DetectEdges { depth_extents: false, .. }, false) => "fs_detect_edges",
        (ImageProgram::DetectEdges { depth_extents: false, .. }, true) => "fs_detect_edges_depth",
        (ImageProgram::DetectEdges { depth_extents: true, .. }, false) => "fs_detect_extents",
        (ImageProgram::DetectEdges { depth_extents: true, .. }, true) => "fs_detect_extents_depth",
        (ImageProgram::DilateEdges { depth_extents }, false) => {
            if depth_extents {
                "fs_dilate_extents"
            } else {
                "fs_dilate_edges"
            }
        }
        (ImageProgram::FilterEdges { depth_extents }, false) => {
            if depth_extents {
                "fs_filter_extents"
            } else {
                "fs_filter_edges"
            }
        }
        (ImageProgram::CopyEdgeToAlpha, false) => "fs_copy_edge_to_alpha",
        (ImageProgram::StatisticsBlur { .. }, false) => "fs_blur",
        (ImageProgram::StatisticsBlur { convert_depth: true, .. }, true) => "fs_blur_depth",
        (ImageProgram::Downsample { .. }, false) if targets == 1 => "fs_downsample",
        (ImageProgram::Downsample { .. }, false) if targets == 3 => "fs_downsample_gbuffer",
        (ImageProgram::MergeDepthNormal, false) => "fs_merge_depth_normal",
        _ => return None,
    };
    Some(entry)
}

/// Program parameters packed after the image constants: (mode, radius, flags, method)
pub fn program_params(program: &ImageProgram) -> [u32; 4] {
    match *program {
        ImageProgram::StatisticsBlur { vertical, convert_depth, method, radius, .. } => {
            let mut flags = 0;
            if vertical {
                flags |= FLAG_VERTICAL;
            }
            if convert_depth {
                flags |= FLAG_CONVERT;
            }
            [0, radius, flags, method.bits()]
        }
        ImageProgram::Downsample { mode, .. } => {
            let mode = match mode {
                DownsampleMode::Min => 0,
                DownsampleMode::Max => 1,
                DownsampleMode::Average => 2,
                DownsampleMode::MinMax => 3,
            };
            [mode, 0, 0, 0]
        }
        _ => [0; 4],
    }
}

/// Layouts, shader and compiled variants of the image programs
pub struct ImagePipelines {
    device: Arc<wgpu::Device>,
    shader: wgpu::ShaderModule,
    sources_layout: wgpu::BindGroupLayout,
    depth_layout: wgpu::BindGroupLayout,
    color_pipeline_layout: wgpu::PipelineLayout,
    depth_pipeline_layout: wgpu::PipelineLayout,
    placeholder: wgpu::TextureView,
    cache: HashMap<PipelineKey, Arc<wgpu::RenderPipeline>>,
}

impl ImagePipelines {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Shadow Image Programs"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let source_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let sources_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shadow Image Sources Layout"),
            entries: &[
                source_entry(0),
                source_entry(1),
                source_entry(2),
                // Binding 3: image constants + program parameters
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let depth_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shadow Image Depth Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Depth,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            }],
        });

        let color_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Shadow Image Layout"),
            bind_group_layouts: &[&sources_layout],
            push_constant_ranges: &[],
        });
        let depth_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Shadow Image Depth Source Layout"),
            bind_group_layouts: &[&sources_layout, &depth_layout],
            push_constant_ranges: &[],
        });

        // Stands in for unbound source slots
        let placeholder = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("Shadow Image Placeholder"),
                size: wgpu::Extent3d { width: 1, height: 1, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&Default::default());

        Self {
            device,
            shader,
            sources_layout,
            depth_layout,
            color_pipeline_layout,
            depth_pipeline_layout,
            placeholder,
            cache: HashMap::new(),
        }
    }

    pub fn sources_layout(&self) -> &wgpu::BindGroupLayout {
        &self.sources_layout
    }

    pub fn depth_layout(&self) -> &wgpu::BindGroupLayout {
        &self.depth_layout
    }

    pub fn placeholder(&self) -> &wgpu::TextureView {
        &self.placeholder
    }

    /// Get or create the pipeline for a program writing `targets`
    pub fn get_or_create(
        &mut self,
        program: &ImageProgram,
        targets: &[wgpu::TextureFormat],
        depth_source: bool,
        color_writes: ColorWrites,
    ) -> Result<Arc<wgpu::RenderPipeline>> {
        let entry_point = entry_point(program, depth_source, targets.len()).ok_or_else(|| {
            Error::Device(format!(
                "{:?} has no variant for {} targets (depth source: {})",
                program,
                targets.len(),
                depth_source
            ))
        })?;
        let key = PipelineKey {
            entry_point,
            targets: targets.to_vec(),
            depth_source,
            color_writes,
        };

        if let Some(pipeline) = self.cache.get(&key) {
            log::trace!("Using cached image pipeline: {:?}", key);
            return Ok(pipeline.clone());
        }

        log::info!("Creating image pipeline: {:?}", key);
        let color_targets: Vec<_> = targets
            .iter()
            .map(|&format| {
                Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: color_writes,
                })
            })
            .collect();
        let layout = if depth_source {
            &self.depth_pipeline_layout
        } else {
            &self.color_pipeline_layout
        };

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(entry_point),
            layout: Some(layout),
            cache: None,
            vertex: wgpu::VertexState {
                module: &self.shader,
                entry_point: "vs_fullscreen",
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.shader,
                entry_point,
                targets: &color_targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        let pipeline = Arc::new(pipeline);
        self.cache.insert(key, pipeline.clone());
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ShadowMethod;

    #[test]
    fn gbuffer_reduction_needs_three_targets() {
        let program = ImageProgram::Downsample { mode: DownsampleMode::Max, targets: 3 };
        assert_eq!(entry_point(&program, false, 3), Some("fs_downsample_gbuffer"));
        assert_eq!(entry_point(&program, false, 2), None);
        assert_eq!(program_params(&program), [1, 0, 0, 0]);
    }

    #[test]
    fn only_the_conversion_pass_reads_depth() {
        let blur = |convert_depth| ImageProgram::StatisticsBlur {
            vertical: true,
            convert_depth,
            hardware_depth: true,
            method: ShadowMethod::EVSM,
            radius: 2,
        };
        assert_eq!(entry_point(&blur(true), true, 1), Some("fs_blur_depth"));
        assert_eq!(entry_point(&blur(false), true, 1), None);
        assert_eq!(program_params(&blur(true)), [0, 2, 3, ShadowMethod::EVSM.bits()]);
    }

    #[test]
    fn image_uniform_matches_constants_plus_parameters() {
        assert_eq!(
            IMAGE_UNIFORM_SIZE,
            std::mem::size_of::<crate::constants::ImageConstants>() + std::mem::size_of::<[u32; 4]>()
        );
    }
}
