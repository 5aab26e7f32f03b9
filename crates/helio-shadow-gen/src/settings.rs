//! Layered shadow settings
//!
//! Every light combines one system-wide record with its own per-light record.
//! Both sources are wrapped in [`Versioned`] so generators can tell whether a
//! merge is stale by comparing version numbers instead of tracking dirty flags.

use crate::device::CullMode;
use bitflags::bitflags;
use std::ops::Deref;

bitflags! {
    /// Shadow technique plus the capability bits resolved while building
    /// resource descriptions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShadowMethod: u32 {
        const DEPTH              = 1 << 1;
        const VARIANCE           = 1 << 2;
        const EXPONENTIAL        = 1 << 3;
        const REFLECTIVE         = 1 << 4;

        const BITS_16            = 1 << 9;
        const BITS_24            = 1 << 10;
        const BITS_32            = 1 << 11;
        const EXTENTS_BITS_16    = 1 << 12;
        const PRECOMPUTED        = 1 << 13;
        const PRECOMPUTED_ALPHA  = 1 << 14;

        const HARDWARE           = 1 << 16;
        const COMPARE            = 1 << 17;
        const GATHER             = 1 << 18;
        const RAWZ               = 1 << 19;
        const DEPTH_READS        = 1 << 20;
        const SOFT_SHADOWS       = 1 << 21;
        const CONTACT_HARDENING  = 1 << 22;
        const EDGE_MASK          = 1 << 23;
        const DEPTH_EXTENTS_MASK = 1 << 24;
        const TRANSLUCENCY       = 1 << 25;
        const JITTER             = 1 << 26;
        const ROTATE             = 1 << 27;
        const MANUAL_2X2         = 1 << 28;
        const NORMAL_OFFSET      = 1 << 29;
        const BOX_FILTER         = 1 << 30;

        // Common presets
        const PCF  = Self::DEPTH.bits();
        const PCSS = Self::DEPTH.bits() | Self::SOFT_SHADOWS.bits() | Self::CONTACT_HARDENING.bits();
        const VSM  = Self::VARIANCE.bits();
        const ESM  = Self::EXPONENTIAL.bits();
        const EVSM = Self::VARIANCE.bits() | Self::EXPONENTIAL.bits();
        const RSM  = Self::REFLECTIVE.bits();
    }
}

impl ShadowMethod {
    /// Variance or exponential filtering, which needs a statistics map.
    pub fn is_statistical(self) -> bool {
        self.intersects(Self::VARIANCE | Self::EXPONENTIAL)
    }

    /// Technique bits only, without resolved capability bits.
    pub fn technique(self) -> ShadowMethod {
        self & (Self::DEPTH
            | Self::VARIANCE
            | Self::EXPONENTIAL
            | Self::REFLECTIVE
            | Self::SOFT_SHADOWS
            | Self::CONTACT_HARDENING
            | Self::NORMAL_OFFSET)
    }
}

bitflags! {
    /// How reflective shadow map data is consumed by indirect lighting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IndirectLightingMethod: u32 {
        const RADIANCE_HINTS      = 1 << 1;
        const PROPAGATION_VOLUMES = 1 << 2;
        const SCREEN_SPACE_GI     = 1 << 3;
        const OCCLUSION_2D        = 1 << 10;
        const OCCLUSION_3D        = 1 << 11;
        const VTF                 = 1 << 12;
        const R2VB                = 1 << 13;
    }
}

/// Edge mask variant used to keep filters from crossing silhouettes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EdgeMaskType {
    #[default]
    None,
    /// Single-channel edge flag
    Edge,
    /// Two-channel min/max depth extents
    DepthExtents,
}

/// A settings record with a monotonically increasing version.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    value: T,
    version: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self { value, version: 1 }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace the record and bump the version
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.version += 1;
    }

    /// Edit the record in place and bump the version
    pub fn modify(&mut self, f: impl FnOnce(&mut T)) {
        f(&mut self.value);
        self.version += 1;
    }
}

impl<T> Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default> Default for Versioned<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// System-wide shadow defaults, usually driven by a quality preset.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowSettingsSystem {
    pub method: ShadowMethod,
    pub indirect_method: IndirectLightingMethod,
    pub resolution_adjust: i32,
    /// Depth precision in bits (16, 24 or 32)
    pub precision: u32,
    pub primary_samples: u32,
    pub secondary_samples: u32,
    pub anisotropy_samples: u32,
    pub msaa_samples: u32,
    pub jitter: bool,
    pub rotate: bool,
    pub box_filter: bool,
    pub bilinear: bool,
    pub trilinear: bool,
    pub filter_radius: f32,
    pub filter_passes: u32,
    pub filter_radius_near: f32,
    pub filter_radius_far: f32,
    pub mask_type: EdgeMaskType,
    /// Edge mask precision in bits (8 or 16)
    pub mask_precision: u32,
    /// Drop edge masking instead of sharing the default mask target
    pub mask_cached_only: bool,
    pub translucency: bool,
}

impl Default for ShadowSettingsSystem {
    fn default() -> Self {
        Self {
            method: ShadowMethod::PCF,
            indirect_method: IndirectLightingMethod::empty(),
            resolution_adjust: 0,
            precision: 32,
            primary_samples: 4,
            secondary_samples: 8,
            anisotropy_samples: 0,
            msaa_samples: 0,
            jitter: false,
            rotate: false,
            box_filter: false,
            bilinear: true,
            trilinear: false,
            filter_radius: 1.0,
            filter_passes: 1,
            filter_radius_near: 1.0,
            filter_radius_far: 1.0,
            mask_type: EdgeMaskType::None,
            mask_precision: 8,
            mask_cached_only: false,
            translucency: false,
        }
    }
}

impl ShadowSettingsSystem {
    pub fn with_method(mut self, method: ShadowMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_edge_mask(mut self, mask_type: EdgeMaskType, precision: u32) -> Self {
        self.mask_type = mask_type;
        self.mask_precision = precision;
        self
    }

    pub fn with_filter(mut self, radius: f32, passes: u32) -> Self {
        self.filter_radius = radius;
        self.filter_passes = passes;
        self
    }
}

/// Per-light overrides authored alongside the light.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowSettingsLight {
    pub resolution_adjust: i32,
    pub cull_mode: CullMode,
    pub filter_blur_factor: f32,
    pub filter_distance_near: f32,
    pub filter_distance_far: f32,
    pub depth_bias_sw: f32,
    pub depth_bias_hw: f32,
    pub slope_scale_bias: f32,
    pub normal_bias_surface: f32,
    pub normal_bias_light: f32,
    pub minimum_variance: f32,
    pub exponent: f32,
    pub mask_threshold: f32,
    pub project_cell: bool,
    pub intensity: f32,
    pub minimum_cutoff: f32,
    pub translucency: bool,
}

impl Default for ShadowSettingsLight {
    fn default() -> Self {
        Self {
            resolution_adjust: 0,
            cull_mode: CullMode::Back,
            filter_blur_factor: 1.0,
            filter_distance_near: 0.0,
            filter_distance_far: 1.0,
            depth_bias_sw: 0.0005,
            depth_bias_hw: 0.0,
            slope_scale_bias: 0.0,
            normal_bias_surface: 0.0,
            normal_bias_light: 0.0,
            minimum_variance: 0.00001,
            exponent: 80.0,
            mask_threshold: 0.5,
            project_cell: false,
            intensity: 1.0,
            minimum_cutoff: 0.0,
            translucency: true,
        }
    }
}

impl ShadowSettingsLight {
    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_depth_bias(mut self, software: f32, hardware: f32, slope_scale: f32) -> Self {
        self.depth_bias_sw = software;
        self.depth_bias_hw = hardware;
        self.slope_scale_bias = slope_scale;
        self
    }

    pub fn with_filter_distances(mut self, near: f32, far: f32) -> Self {
        self.filter_distance_near = near;
        self.filter_distance_far = far;
        self
    }
}

/// Source versions a merged record was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SettingsVersion {
    pub system: u64,
    pub light: u64,
}

/// Effective settings for one generator.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowSettings {
    pub method: ShadowMethod,
    pub indirect_method: IndirectLightingMethod,
    pub resolution_adjust: i32,
    pub precision: u32,
    pub primary_samples: u32,
    pub secondary_samples: u32,
    pub anisotropy_samples: u32,
    pub msaa_samples: u32,
    pub jitter: bool,
    pub rotate: bool,
    pub box_filter: bool,
    pub bilinear: bool,
    pub trilinear: bool,
    pub filter_radius: f32,
    pub filter_passes: u32,
    pub filter_radius_near: f32,
    pub filter_radius_far: f32,
    pub mask_type: EdgeMaskType,
    pub mask_precision: u32,
    pub mask_cached_only: bool,

    pub cull_mode: CullMode,
    pub filter_blur_factor: f32,
    pub filter_distance_near: f32,
    pub filter_distance_far: f32,
    pub depth_bias_sw: f32,
    pub depth_bias_hw: f32,
    pub slope_scale_bias: f32,
    pub normal_bias_surface: f32,
    pub normal_bias_light: f32,
    pub minimum_variance: f32,
    pub exponent: f32,
    pub mask_threshold: f32,
    pub project_cell: bool,
    pub intensity: f32,
    pub minimum_cutoff: f32,

    pub translucency: bool,
    pub version: SettingsVersion,
}

impl ShadowSettings {
    /// Merge a system record with a light record.
    ///
    /// Technique and sampling come from the system, biasing and filtering
    /// distances from the light, the resolution shifts add up, and
    /// translucency needs both sides to allow it. Inconsistent values are
    /// clamped and reported.
    pub fn combine(
        system: &Versioned<ShadowSettingsSystem>,
        light: &Versioned<ShadowSettingsLight>,
    ) -> Self {
        let s: &ShadowSettingsSystem = system;
        let l: &ShadowSettingsLight = light;

        let mut settings = Self {
            method: s.method,
            indirect_method: s.indirect_method,
            resolution_adjust: s.resolution_adjust + l.resolution_adjust,
            precision: s.precision,
            primary_samples: s.primary_samples,
            secondary_samples: s.secondary_samples,
            anisotropy_samples: s.anisotropy_samples,
            msaa_samples: s.msaa_samples,
            jitter: s.jitter,
            rotate: s.rotate,
            box_filter: s.box_filter,
            bilinear: s.bilinear,
            trilinear: s.trilinear,
            filter_radius: s.filter_radius,
            filter_passes: s.filter_passes,
            filter_radius_near: s.filter_radius_near,
            filter_radius_far: s.filter_radius_far,
            mask_type: s.mask_type,
            mask_precision: s.mask_precision,
            mask_cached_only: s.mask_cached_only,

            cull_mode: l.cull_mode,
            filter_blur_factor: l.filter_blur_factor,
            filter_distance_near: l.filter_distance_near,
            filter_distance_far: l.filter_distance_far,
            depth_bias_sw: l.depth_bias_sw,
            depth_bias_hw: l.depth_bias_hw,
            slope_scale_bias: l.slope_scale_bias,
            normal_bias_surface: l.normal_bias_surface,
            normal_bias_light: l.normal_bias_light,
            minimum_variance: l.minimum_variance,
            exponent: l.exponent,
            mask_threshold: l.mask_threshold,
            project_cell: l.project_cell,
            intensity: l.intensity,
            minimum_cutoff: l.minimum_cutoff,

            translucency: s.translucency && l.translucency,
            version: SettingsVersion {
                system: system.version(),
                light: light.version(),
            },
        };
        settings.sanitize();
        settings
    }

    /// Clamp combinations that cannot be rendered.
    fn sanitize(&mut self) {
        if !matches!(self.precision, 16 | 24 | 32) {
            log::warn!("Unsupported shadow precision {}, using 32 bits", self.precision);
            self.precision = 32;
        }
        if !matches!(self.mask_precision, 8 | 16) {
            log::warn!("Unsupported edge mask precision {}, using 8 bits", self.mask_precision);
            self.mask_precision = 8;
        }
        if self.method.is_statistical() && self.filter_passes == 0 {
            log::warn!("Statistical shadow method needs at least one filter pass");
            self.filter_passes = 1;
        }
        if self.filter_radius < 1.0 {
            log::warn!("Shadow filter radius {} clamped to 1", self.filter_radius);
            self.filter_radius = 1.0;
        }
        if self.filter_distance_far <= self.filter_distance_near {
            log::warn!(
                "Shadow filter distances inverted ({} >= {}), widening range",
                self.filter_distance_near,
                self.filter_distance_far
            );
            self.filter_distance_far = self.filter_distance_near + 1.0;
        }
        if self.mask_threshold < 0.0 {
            log::warn!("Negative edge mask threshold clamped to zero");
            self.mask_threshold = 0.0;
        }
        if self.primary_samples == 0 {
            self.primary_samples = 1;
        }
    }

    pub fn uses_edge_mask(&self) -> bool {
        self.mask_type != EdgeMaskType::None
    }

    /// Resolution after applying the combined resolution shift.
    ///
    /// Zero or out-of-range results are clamped to `[min, max]`.
    pub fn adjusted_resolution(&self, base: u32, min: u32, max: u32) -> u32 {
        let shifted = if self.resolution_adjust >= 0 {
            base.checked_shr(self.resolution_adjust as u32).unwrap_or(0)
        } else {
            base.checked_shl(self.resolution_adjust.unsigned_abs()).unwrap_or(u32::MAX)
        };
        let min = min.max(1);
        if shifted < min {
            log::warn!("Shadow resolution {} clamped to minimum {}", shifted, min);
            min
        } else if shifted > max {
            log::debug!("Shadow resolution {} clamped to maximum {}", shifted, max);
            max
        } else {
            shifted
        }
    }
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self::combine(&Versioned::default(), &Versioned::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translucency_requires_both_sources() {
        let mut system = Versioned::new(ShadowSettingsSystem::default());
        let mut light = Versioned::new(ShadowSettingsLight::default());
        // Opt-in on the system side
        assert!(!ShadowSettings::combine(&system, &light).translucency);

        system.modify(|s| s.translucency = true);
        assert!(ShadowSettings::combine(&system, &light).translucency);

        light.modify(|l| l.translucency = false);
        assert!(!ShadowSettings::combine(&system, &light).translucency);

        light.modify(|l| l.translucency = true);
        system.modify(|s| s.translucency = false);
        assert!(!ShadowSettings::combine(&system, &light).translucency);
    }

    #[test]
    fn merge_takes_method_from_system_and_bias_from_light() {
        let system = Versioned::new(ShadowSettingsSystem::default().with_method(ShadowMethod::VSM));
        let light = Versioned::new(
            ShadowSettingsLight::default()
                .with_cull_mode(CullMode::Front)
                .with_depth_bias(0.01, 2.0, 1.5),
        );
        let merged = ShadowSettings::combine(&system, &light);
        assert_eq!(merged.method, ShadowMethod::VSM);
        assert_eq!(merged.cull_mode, CullMode::Front);
        assert_eq!(merged.depth_bias_sw, 0.01);
        assert_eq!(merged.depth_bias_hw, 2.0);
        assert_eq!(merged.slope_scale_bias, 1.5);
    }

    #[test]
    fn resolution_adjust_is_summed() {
        let mut system = ShadowSettingsSystem::default();
        system.resolution_adjust = 1;
        let mut light = ShadowSettingsLight::default();
        light.resolution_adjust = 1;
        let merged = ShadowSettings::combine(&Versioned::new(system), &Versioned::new(light));
        assert_eq!(merged.resolution_adjust, 2);
        assert_eq!(merged.adjusted_resolution(1024, 1, 2048), 256);
    }

    #[test]
    fn zero_resolution_clamps_to_minimum() {
        let mut system = ShadowSettingsSystem::default();
        system.resolution_adjust = 40;
        let merged = ShadowSettings::combine(&Versioned::new(system), &Versioned::default());
        assert_eq!(merged.adjusted_resolution(1024, 16, 2048), 16);
        assert_eq!(merged.adjusted_resolution(0, 0, 2048), 1);
    }

    #[test]
    fn version_tracks_sources() {
        let system = Versioned::new(ShadowSettingsSystem::default());
        let mut light = Versioned::new(ShadowSettingsLight::default());
        let first = ShadowSettings::combine(&system, &light).version;
        light.modify(|l| l.intensity = 2.0);
        let second = ShadowSettings::combine(&system, &light).version;
        assert_eq!(first.system, second.system);
        assert_eq!(second.light, first.light + 1);
    }

    #[test]
    fn inconsistent_values_are_clamped() {
        let system = Versioned::new(
            ShadowSettingsSystem::default()
                .with_method(ShadowMethod::ESM)
                .with_precision(12)
                .with_filter(0.0, 0),
        );
        let light = Versioned::new(ShadowSettingsLight::default().with_filter_distances(5.0, 2.0));
        let merged = ShadowSettings::combine(&system, &light);
        assert_eq!(merged.precision, 32);
        assert_eq!(merged.filter_passes, 1);
        assert_eq!(merged.filter_radius, 1.0);
        assert!(merged.filter_distance_far > merged.filter_distance_near);
    }
}
