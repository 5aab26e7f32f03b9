//! Helio Shadow Gen - shadow map and reflective shadow map generation
//!
//! Produces per-light shadow and indirect-lighting inputs while sharing a
//! finite pool of render targets between every active light:
//!
//! - Layered system/light settings merged into one versioned record
//! - A resource pool that leases dedicated targets and falls back to shared
//!   defaults when the memory budget runs out
//! - Declarative operation lists (write, post-process, read) replayed each frame
//! - A write → post → read generator state machine per light
//! - A reflective variant that fills and down-samples a light-space G-buffer
//!
//! All GPU work is recorded through the [`GraphicsDevice`] trait; the
//! [`backend`] module implements it on top of wgpu.

pub mod backend;
pub mod constants;
pub mod device;
pub mod generator;
pub mod operation;
pub mod pool;
pub mod postprocess;
pub mod reflectance;
pub mod settings;
pub mod visibility;

pub use backend::{WgpuDevice, WgpuResources};
pub use constants::{RsmConstants, ShadowConstants};
pub use device::{ClearFlags, ColorWrites, CullMode, GraphicsDevice, RecordingDevice};
pub use generator::{FillStatus, GeneratorId, GeneratorKind, Phase, SamplerRegisters, ShadowGenerator};
pub use operation::{Operation, OperationKind, OperationList};
pub use pool::{
    ChannelMask, Lease, LeaseKind, LeasedResource, PoolConfig, Residency, ResourceDescriptor,
    ResourceId, ResourcePool, ResourceRole, SamplerId, SamplerState, TargetUsage,
};
pub use reflectance::ReflectanceGenerator;
pub use settings::{
    IndirectLightingMethod, ShadowMethod, ShadowSettings, ShadowSettingsLight,
    ShadowSettingsSystem, Versioned,
};
pub use visibility::{Aabb, Frustum, LightKind, SceneCamera, SceneObject, ShadowLight, ShadowScene};

/// Result type for shadow generation
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while generating shadows
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Resource exhaustion: {owner:?} could not lease {descriptor}")]
    ResourceExhaustion {
        owner: GeneratorId,
        descriptor: String,
    },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("WGPU error: {0}")]
    Wgpu(String),
}

impl From<wgpu::Error> for Error {
    fn from(err: wgpu::Error) -> Self {
        Error::Wgpu(err.to_string())
    }
}

/// Build a protocol error, failing loudly in debug builds.
///
/// Release builds only log; the caller returns the error without touching
/// any state.
pub(crate) fn protocol_violation(message: impl Into<String>) -> Error {
    let message = message.into();
    log::error!("protocol violation: {}", message);
    debug_assert!(false, "protocol violation: {}", message);
    Error::Protocol(message)
}
