//! Texture format helpers

use wgpu::TextureFormat;

/// Bytes per texel, used for budget accounting
pub fn bytes_per_texel(format: TextureFormat) -> u64 {
    match format {
        TextureFormat::R8Unorm => 1,
        TextureFormat::Rg8Unorm | TextureFormat::R16Float | TextureFormat::Depth16Unorm => 2,
        TextureFormat::Rgba8Unorm
        | TextureFormat::Rg16Float
        | TextureFormat::R32Float
        | TextureFormat::Depth24Plus
        | TextureFormat::Depth24PlusStencil8
        | TextureFormat::Depth32Float => 4,
        TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
        TextureFormat::Rgba32Float => 16,
        other => other.block_copy_size(None).map(u64::from).unwrap_or(4),
    }
}

/// Number of color channels a format stores
pub fn channel_count(format: TextureFormat) -> u32 {
    match format {
        TextureFormat::R8Unorm
        | TextureFormat::R16Float
        | TextureFormat::R32Float
        | TextureFormat::Depth16Unorm
        | TextureFormat::Depth24Plus
        | TextureFormat::Depth24PlusStencil8
        | TextureFormat::Depth32Float => 1,
        TextureFormat::Rg8Unorm | TextureFormat::Rg16Float | TextureFormat::Rg32Float => 2,
        _ => 4,
    }
}

pub fn is_depth(format: TextureFormat) -> bool {
    format.is_depth_stencil_format()
}

/// Closest color format for a precision (bits per channel) and channel count
pub fn best_render_target_format(precision: u32, channels: u32) -> TextureFormat {
    match (precision, channels) {
        (0..=8, 1) => TextureFormat::R8Unorm,
        (0..=8, 2) => TextureFormat::Rg8Unorm,
        (0..=8, _) => TextureFormat::Rgba8Unorm,
        (9..=16, 1) => TextureFormat::R16Float,
        (9..=16, 2) => TextureFormat::Rg16Float,
        (9..=16, _) => TextureFormat::Rgba16Float,
        (_, 1) => TextureFormat::R32Float,
        (_, 2) => TextureFormat::Rg32Float,
        (_, _) => TextureFormat::Rgba32Float,
    }
}

/// Depth format for a precision in bits
pub fn best_depth_format(precision: u32) -> TextureFormat {
    match precision {
        0..=16 => TextureFormat::Depth16Unorm,
        17..=24 => TextureFormat::Depth24Plus,
        _ => TextureFormat::Depth32Float,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_target_formats() {
        assert_eq!(best_render_target_format(32, 1), TextureFormat::R32Float);
        assert_eq!(best_render_target_format(16, 2), TextureFormat::Rg16Float);
        assert_eq!(best_render_target_format(8, 3), TextureFormat::Rgba8Unorm);
        assert_eq!(best_render_target_format(24, 4), TextureFormat::Rgba32Float);
    }

    #[test]
    fn depth_formats() {
        assert_eq!(best_depth_format(16), TextureFormat::Depth16Unorm);
        assert_eq!(best_depth_format(24), TextureFormat::Depth24Plus);
        assert_eq!(best_depth_format(32), TextureFormat::Depth32Float);
        assert!(is_depth(TextureFormat::Depth32Float));
        assert_eq!(bytes_per_texel(TextureFormat::Rgba16Float), 8);
    }
}
