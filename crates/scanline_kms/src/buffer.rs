//! Scanout buffers and their framebuffers

use std::os::fd::OwnedFd;

use log::{debug, info, warn};

use crate::backend::{FramebufferLayout, KmsBackend};
use crate::device::DrmDevice;
use crate::dumb_buffer::DumbBuffer;
use crate::formats::FORMAT_XRGB8888;
use crate::gbm::GbmBuffer;
use crate::session::DeviceSession;
use crate::{KmsError, Result};

/// Memory behind a framebuffer.
#[derive(Default)]
pub enum BufferStorage {
    /// Not owned by the session, or released
    #[default]
    None,
    Gbm(GbmBuffer),
    Dumb(DumbBuffer),
}

/// A framebuffer registered for one output.
#[derive(Default)]
pub struct BufferData {
    /// Output the buffer was sized for
    pub odid: usize,
    pub storage: BufferStorage,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub modifier: Option<u64>,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    /// Exported dma-buf of each plane, kept open as long as the buffer lives
    pub dma_fds: [Option<OwnedFd>; 4],
    pub fb_id: u32,
    /// Scanned out, or part of a commit in flight
    pub in_use: bool,
}

impl BufferData {
    pub fn layout(&self) -> FramebufferLayout {
        FramebufferLayout {
            width: self.width,
            height: self.height,
            format: self.format,
            handles: self.handles,
            pitches: self.pitches,
            offsets: self.offsets,
            modifier: self.modifier,
        }
    }
}

impl<B: KmsBackend> DeviceSession<B> {
    /// Registers a framebuffer for `layout` and records it as a buffer of output `odid`.
    /// Returns the buffer index.
    pub fn wrap_framebuffer(
        &mut self,
        odid: usize,
        layout: FramebufferLayout,
        storage: BufferStorage,
        dma_fds: [Option<OwnedFd>; 4],
    ) -> Result<usize> {
        let Some(backend) = self.backend.as_ref() else {
            return Err(KmsError::DeviceNotOpen);
        };
        if self.outputs.get(odid).is_none_or(|o| !o.is_enumerated()) {
            return Err(KmsError::InvalidOutput(odid));
        }

        let fb_id = backend.add_fb2(&layout)?;
        let index = match self.buffers.reserve(1) {
            Ok(range) => range.start,
            Err(err) => {
                if let Err(err) = backend.remove_fb(fb_id) {
                    warn!("Unable to remove framebuffer {fb_id}: {err}");
                }
                return Err(err.into());
            }
        };

        self.buffers[index] = BufferData {
            odid,
            storage,
            width: layout.width,
            height: layout.height,
            format: layout.format,
            modifier: layout.modifier,
            handles: layout.handles,
            pitches: layout.pitches,
            offsets: layout.offsets,
            dma_fds,
            fb_id,
            in_use: false,
        };

        Ok(index)
    }
}

impl DeviceSession<DrmDevice> {
    /// Allocates `count` CPU mapped buffers the size of output `odid`.
    pub fn create_dumb_buffers(&mut self, odid: usize, count: usize) -> Result<Vec<usize>> {
        let (width, height) = self.output(odid)?.size();

        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let mut dumb = DumbBuffer::new(self.backend()?, width, height)?;
            dumb.draw_gradient(self.backend()?)?;
            let layout = dumb.layout();
            created.push(self.wrap_framebuffer(
                odid,
                layout,
                BufferStorage::Dumb(dumb),
                Default::default(),
            )?);
        }

        info!("Created {count} dumb buffers of {width}x{height} for output {odid}");
        Ok(created)
    }

    /// Allocates `count` GBM scanout buffers the size of output `odid`, using the modifiers
    /// its primary plane advertises.
    pub fn create_gbm_buffers(&mut self, odid: usize, count: usize) -> Result<Vec<usize>> {
        let output = self.output(odid)?;
        let (width, height) = output.size();
        let modifiers = output.modifiers.clone();
        let Some(gbm) = self.gbm.as_ref() else {
            return Err(KmsError::AllocationFailure("GBM device"));
        };

        let mut allocated = Vec::with_capacity(count);
        for _ in 0..count {
            let buffer = gbm.create_buffer(width, height, &modifiers)?;
            let (layout, fds) = buffer.export()?;
            allocated.push((buffer, layout, fds));
        }

        let mut created = Vec::with_capacity(count);
        for (buffer, layout, fds) in allocated {
            debug!(
                "GBM buffer for output {odid}: modifier {:?}, pitch {}",
                layout.modifier, layout.pitches[0]
            );
            created.push(self.wrap_framebuffer(odid, layout, BufferStorage::Gbm(buffer), fds)?);
        }

        info!("Created {count} GBM buffers of {width}x{height} for output {odid}");
        Ok(created)
    }

    /// Redraws the test pattern of a dumb buffer for frame number `frame`. GBM buffers are
    /// left untouched.
    pub fn draw_frame(&mut self, buffer: usize, frame: u32) -> Result<()> {
        let Some(backend) = self.backend.as_ref() else {
            return Err(KmsError::DeviceNotOpen);
        };
        let data = self
            .buffers
            .get_mut(buffer)
            .ok_or(KmsError::InvalidBuffer(buffer))?;
        if data.in_use {
            return Err(KmsError::BufferBusy(buffer));
        }

        match &mut data.storage {
            BufferStorage::Dumb(dumb) => dumb.draw_color_bars(backend, frame),
            _ => Ok(()),
        }
    }
}

/// Layout of a single plane XRGB8888 buffer.
pub(crate) fn xrgb_layout(width: u32, height: u32, handle: u32, pitch: u32) -> FramebufferLayout {
    FramebufferLayout {
        width,
        height,
        format: FORMAT_XRGB8888,
        handles: [handle, 0, 0, 0],
        pitches: [pitch, 0, 0, 0],
        offsets: [0; 4],
        modifier: None,
    }
}
