//! Interned sampler states

/// Arena handle to an interned sampler state
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct SamplerId(pub(crate) u32);

impl SamplerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Point,
    Linear,
    Trilinear,
    Anisotropic(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerAddress {
    Clamp,
    Wrap,
}

/// How a shadow resource is sampled when read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerState {
    pub filter: SamplerFilter,
    pub address: SamplerAddress,
    /// Hardware depth comparison
    pub compare: bool,
}

impl SamplerState {
    pub const fn point() -> Self {
        Self {
            filter: SamplerFilter::Point,
            address: SamplerAddress::Clamp,
            compare: false,
        }
    }

    pub const fn linear() -> Self {
        Self {
            filter: SamplerFilter::Linear,
            address: SamplerAddress::Clamp,
            compare: false,
        }
    }

    /// Linear comparison sampler for hardware PCF
    pub const fn compare() -> Self {
        Self {
            filter: SamplerFilter::Linear,
            address: SamplerAddress::Clamp,
            compare: true,
        }
    }

    pub const fn wrap_point() -> Self {
        Self {
            filter: SamplerFilter::Point,
            address: SamplerAddress::Wrap,
            compare: false,
        }
    }

    pub fn is_point(&self) -> bool {
        self.filter == SamplerFilter::Point
    }

    pub fn to_wgpu<'a>(&self, label: Option<&'a str>) -> wgpu::SamplerDescriptor<'a> {
        let address = match self.address {
            SamplerAddress::Clamp => wgpu::AddressMode::ClampToEdge,
            SamplerAddress::Wrap => wgpu::AddressMode::Repeat,
        };
        let (filter, mip, anisotropy) = match self.filter {
            SamplerFilter::Point => (wgpu::FilterMode::Nearest, wgpu::FilterMode::Nearest, 1),
            SamplerFilter::Linear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Nearest, 1),
            SamplerFilter::Trilinear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Linear, 1),
            SamplerFilter::Anisotropic(n) => (wgpu::FilterMode::Linear, wgpu::FilterMode::Linear, n.clamp(1, 16)),
        };
        wgpu::SamplerDescriptor {
            label,
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: mip,
            compare: self.compare.then_some(wgpu::CompareFunction::LessEqual),
            anisotropy_clamp: anisotropy,
            ..Default::default()
        }
    }
}

impl Default for SamplerState {
    fn default() -> Self {
        Self::point()
    }
}

/// Deduplicating sampler table
#[derive(Debug, Default)]
pub struct SamplerTable {
    states: Vec<SamplerState>,
}

impl SamplerTable {
    pub fn intern(&mut self, state: SamplerState) -> SamplerId {
        if let Some(i) = self.states.iter().position(|s| *s == state) {
            return SamplerId(i as u32);
        }
        self.states.push(state);
        SamplerId((self.states.len() - 1) as u32)
    }

    pub fn get(&self, id: SamplerId) -> Option<&SamplerState> {
        self.states.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SamplerId, &SamplerState)> {
        self.states
            .iter()
            .enumerate()
            .map(|(i, s)| (SamplerId(i as u32), s))
    }
}
