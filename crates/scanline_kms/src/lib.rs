//! Atomic KMS presentation
//!
//! Opens a DRM primary node as master, discovers the output chains the kernel has configured,
//! resolves the properties of their objects by name, and presents framebuffers on them with
//! non-blocking atomic commits. Completion events come back through [`FlipHandler`].
//!
//! Devices without atomic support can be driven with legacy mode-setting instead, see
//! [`SessionConfig::allow_legacy`].

mod atomic;
mod backend;
mod buffer;
mod device;
mod dumb_buffer;
mod edid;
mod error;
mod event;
mod formats;
mod gbm;
mod output;
mod property;
mod session;

#[cfg(test)]
mod fake;

pub use atomic::{AtomicEntry, AtomicRequest, PropertyAdd};
pub use backend::{
    ConnectorInfo, CrtcInfo, EncoderInfo, FramebufferLayout, KmsBackend, KmsEvent, ModeInfo,
    ObjectKind, ObjectProperties, ObjectRef, PlaneInfo, PropertyDef, Resources,
};
pub use buffer::{BufferData, BufferStorage};
pub use device::{DrmDevice, find_drm_devices};
pub use dumb_buffer::DumbBuffer;
pub use error::{KmsError, Result};
pub use event::FlipHandler;
pub use formats::{
    FORMAT_ARGB8888, FORMAT_XRGB8888, MODIFIER_INVALID, MODIFIER_LINEAR, collect_modifiers,
};
pub use gbm::{GbmAllocator, GbmBuffer};
pub use output::{ChainIndices, OutputData, OutputObject};
pub use property::{
    ConnectorProperty, CrtcProperty, EnumEntry, PlaneProperty, PropInfo, PropertyKind,
    PropertyTable, plane_type,
};
pub use session::{DeviceSession, SessionConfig};
