//! Constant block layouts shared with lighting shaders
//!
//! Field order and size must match the shader-side declarations exactly.

use glam::{Mat4, Vec3, Vec4};

/// Fraction of a split's depth range used to blend into the next split
pub const SPLIT_BLEND_FRACTION: f32 = 0.1;

/// Base shadow block (8 x vec4, 128 bytes)
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShadowConstants {
    /// (min distance, max distance, scale, bias)
    pub attenuation: [f32; 4],
    /// (split near, split far, blend scale, blend bias)
    pub split_blend: [f32; 4],
    /// (size, size, 1/size, 1/size)
    pub texture_size: [f32; 4],
    pub edge_mask0: [f32; 4],
    pub edge_mask1: [f32; 4],
    /// (software depth bias, slope scale, surface normal bias, light normal bias)
    pub bias: [f32; 4],
    pub filter: [f32; 4],
    /// (strength, 1 - strength, 0, 0); the shader lerps the shadow term with it
    pub strength: [f32; 4],
}

/// Attenuation (scale, bias) mapping `min → 0` and `max → 1`.
///
/// The bias is `1 - scale * max`, which equals `-scale * min`. Writing it as
/// `1 - scale * min` would break `scale * max + bias == 1`, so the form that
/// satisfies both endpoints is used.
///
/// A degenerate range is widened slightly so the shader never divides by zero.
pub fn attenuation_scale_bias(min_distance: f32, max_distance: f32) -> (f32, f32) {
    let range = max_distance - min_distance;
    let range = if range.abs() < f32::EPSILON {
        log::warn!("Degenerate attenuation range [{}, {}]", min_distance, max_distance);
        f32::EPSILON
    } else {
        range
    };
    let scale = 1.0 / range;
    let max_distance = min_distance + range;
    (scale, 1.0 - scale * max_distance)
}

/// Split blend (near, far, scale, bias) ramping 0 → 1 over the last part of a split
pub fn split_blend(near: f32, far: f32) -> [f32; 4] {
    if far <= near {
        return [0.0; 4];
    }
    let start = far - (far - near) * SPLIT_BLEND_FRACTION;
    let scale = 1.0 / (far - start);
    [near, far, scale, -start * scale]
}

/// Unit vector selecting one channel of an RGBA mask target
pub fn channel_selector(channel: Option<u32>) -> [f32; 4] {
    let mut v = [0.0; 4];
    if let Some(c) = channel {
        // Channels past the first four live in the high byte of a packed target
        let value = if c < 4 { 1.0 } else { 256.0 };
        v[(c % 4) as usize] = value;
    }
    v
}

/// Reflective shadow map block (256 bytes)
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RsmConstants {
    pub texture_size: [f32; 4],
    pub texture_scale_bias: [f32; 4],
    pub screen_to_view_scale_bias: [f32; 4],
    pub depth_unpack: [f32; 4],
    pub position: [f32; 3],
    pub _pad0: f32,
    pub direction: [f32; 3],
    pub _pad1: f32,
    pub color: [f32; 3],
    pub sample_radius: f32,
    pub geometry_bias: f32,
    pub _pad2: [f32; 3],
    pub texture_projection: [[f32; 4]; 4],
    pub inverse_view: [[f32; 4]; 4],
}

impl Default for RsmConstants {
    fn default() -> Self {
        bytemuck::Zeroable::zeroed()
    }
}

/// Everything needed to fill [`RsmConstants`]
#[derive(Debug, Clone, Copy)]
pub struct RsmParams {
    pub size: f32,
    pub merged_size: f32,
    pub view: Mat4,
    pub projection: Mat4,
    pub near: f32,
    pub far: f32,
    pub position: Vec3,
    pub direction: Vec3,
    pub color: Vec3,
    pub sample_radius: f32,
    pub geometry_bias: f32,
}

impl RsmConstants {
    pub fn new(p: &RsmParams) -> Self {
        let size = p.size.max(1.0);
        let proj = p.projection.to_cols_array_2d();
        // Row-major element (row, col) is proj[col][row] in glam's column storage
        let p11 = proj[0][0];
        let p22 = proj[1][1];
        let p31 = proj[2][0];
        let p32 = proj[2][1];

        let range = (p.far - p.near).max(f32::EPSILON);
        let scale = size / p.merged_size.max(1.0);
        Self {
            texture_size: [size, size, 1.0 / size, 1.0 / size],
            texture_scale_bias: [scale, scale, 0.0, 0.0],
            screen_to_view_scale_bias: [
                2.0 / p11,
                -2.0 / p22,
                -1.0 / p11 - p31 / p11,
                1.0 / p22 - p32 / p22,
            ],
            depth_unpack: [range, range / 255.0, range / 65535.0, range * (p.near / range)],
            position: p.position.to_array(),
            _pad0: 0.0,
            direction: p.direction.to_array(),
            _pad1: 0.0,
            color: p.color.to_array(),
            sample_radius: p.sample_radius,
            geometry_bias: p.geometry_bias,
            _pad2: [0.0; 3],
            texture_projection: (p.projection * p.view).to_cols_array_2d(),
            inverse_view: p.view.inverse().to_cols_array_2d(),
        }
    }
}

/// Image processing block used by post-process programs
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ImageConstants {
    /// (width, height, 1/width, 1/height) of the source
    pub texture_size: [f32; 4],
    /// (threshold, near, far, blur factor)
    pub params: [f32; 4],
    pub channel_mask: [f32; 4],
    pub _pad: [f32; 4],
}

impl ImageConstants {
    pub fn new(source_size: u32, params: Vec4, channel_mask: [f32; 4]) -> Self {
        let s = source_size.max(1) as f32;
        Self {
            texture_size: [s, s, 1.0 / s, 1.0 / s],
            params: params.to_array(),
            channel_mask,
            _pad: [0.0; 4],
        }
    }
}
