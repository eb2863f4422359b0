//! GBM buffer allocation

use std::os::fd::OwnedFd;

use drm::buffer::{DrmFourcc, DrmModifier};
use gbm::{BufferObject, BufferObjectFlags, Device as GbmDevice};
use log::{debug, info};

use crate::backend::FramebufferLayout;
use crate::device::DrmDevice;
use crate::error::ioctl_error;
use crate::formats::{FORMAT_XRGB8888, MODIFIER_INVALID};
use crate::{KmsError, Result};

/// GBM allocator for scanout buffers.
pub struct GbmAllocator {
    device: GbmDevice<DrmDevice>,
}

impl GbmAllocator {
    pub fn new(drm_device: DrmDevice) -> Result<Self> {
        let device = GbmDevice::new(drm_device).map_err(ioctl_error("gbm_create_device"))?;

        info!("GBM allocator created");

        Ok(Self { device })
    }

    /// Allocates an XRGB8888 scanout buffer.
    ///
    /// With a non-empty `modifiers` list the driver picks one of them, otherwise the layout is
    /// left to the driver and the framebuffer is registered without an explicit modifier.
    pub fn create_buffer(&self, width: u32, height: u32, modifiers: &[u64]) -> Result<GbmBuffer> {
        let flags = BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING;

        let bo = if modifiers.is_empty() {
            self.device
                .create_buffer_object::<()>(width, height, DrmFourcc::Xrgb8888, flags)
                .map_err(ioctl_error("gbm_bo_create"))?
        } else {
            self.device
                .create_buffer_object_with_modifiers2::<()>(
                    width,
                    height,
                    DrmFourcc::Xrgb8888,
                    modifiers.iter().map(|&m| DrmModifier::from(m)),
                    flags,
                )
                .map_err(ioctl_error("gbm_bo_create_with_modifiers2"))?
        };

        debug!("Created GBM buffer: {width}x{height}");

        Ok(GbmBuffer {
            bo,
            explicit_modifier: !modifiers.is_empty(),
        })
    }
}

fn destroyed<E>(_: E) -> KmsError {
    KmsError::GbmDeviceDestroyed
}

/// A GBM buffer object used for scanout.
pub struct GbmBuffer {
    bo: BufferObject<()>,
    explicit_modifier: bool,
}

impl GbmBuffer {
    /// Collects the framebuffer layout of the buffer and exports a dma-buf per plane.
    pub fn export(&self) -> Result<(FramebufferLayout, [Option<OwnedFd>; 4])> {
        let planes = self.bo.plane_count().map_err(destroyed)?.min(4);
        let modifier = u64::from(self.bo.modifier().map_err(destroyed)?);

        let mut layout = FramebufferLayout {
            width: self.bo.width().map_err(destroyed)?,
            height: self.bo.height().map_err(destroyed)?,
            format: FORMAT_XRGB8888,
            modifier: (self.explicit_modifier && modifier != MODIFIER_INVALID).then_some(modifier),
            ..Default::default()
        };
        let mut fds: [Option<OwnedFd>; 4] = Default::default();

        for plane in 0..planes as usize {
            let index = plane as i32;
            // SAFETY: every member of the handle union is a view of the same GEM handle
            layout.handles[plane] =
                unsafe { self.bo.handle_for_plane(index).map_err(destroyed)?.u32_ };
            layout.pitches[plane] = self.bo.stride_for_plane(index).map_err(destroyed)?;
            layout.offsets[plane] = self.bo.offset(index).map_err(destroyed)?;
            fds[plane] = Some(
                self.bo
                    .fd_for_plane(index)
                    .map_err(|_| KmsError::AllocationFailure("dma-buf export"))?,
            );
        }

        Ok((layout, fds))
    }
}
