use std::io;

use log::error;
use scanline_shared::ArenaError;

use crate::backend::ObjectKind;

pub type Result<T, E = KmsError> = std::result::Result<T, E>;

/// Errors produced by the KMS pipeline
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("no DRM device is open")]
    DeviceNotOpen,
    #[error("no usable DRM device found")]
    NoDevice,
    #[error("output records have not been allocated")]
    OutputArrayNotAllocated,
    #[error("device is not KMS capable (a resource list is empty)")]
    NotKmsCapable,
    #[error("failed to query {kind}")]
    DrmQueryFailed {
        kind: ObjectKind,
        #[source]
        source: Box<KmsError>,
    },
    #[error("{kind} index {index} is out of range")]
    IndexOutOfRange { kind: ObjectKind, index: usize },
    #[error("{kind} {id} does not exist")]
    UnknownObject { kind: ObjectKind, id: u32 },
    #[error("{object} property {property} disagrees with the kernel about being an enum")]
    PropertyKindMismatch {
        object: ObjectKind,
        property: &'static str,
    },
    #[error("{call} failed: {source}")]
    Ioctl {
        call: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("allocation failed while growing {0}")]
    AllocationFailure(&'static str),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("malformed {0} blob")]
    MalformedBlob(&'static str),
    #[error("connector {0} has no usable mode")]
    NoMode(u32),
    #[error("buffer {0} does not exist")]
    InvalidBuffer(usize),
    #[error("output {0} does not exist or was not enumerated")]
    InvalidOutput(usize),
    #[error("output {0} still has a flip in flight")]
    FlipPending(usize),
    #[error("buffer {0} is still in use by the display")]
    BufferBusy(usize),
    #[error("GBM device was destroyed")]
    GbmDeviceDestroyed,
    #[error("seat: {0:#}")]
    Seat(anyhow::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl KmsError {
    /// The errno of a failed ioctl, if this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Ioctl { source, .. } => source.raw_os_error(),
            Self::DrmQueryFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Wraps the failure of the ioctl named `call`, logging it on the way.
pub(crate) fn ioctl_error(call: &'static str) -> impl FnOnce(io::Error) -> KmsError {
    move |source| {
        error!("{call} failed: {source}");
        KmsError::Ioctl { call, source }
    }
}

/// Wraps a failed object query.
pub(crate) fn query_failed(kind: ObjectKind) -> impl FnOnce(KmsError) -> KmsError {
    move |source| KmsError::DrmQueryFailed {
        kind,
        source: Box::new(source),
    }
}
