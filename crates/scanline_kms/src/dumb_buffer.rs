//! DRM dumb buffers for CPU drawn test frames
//!
//! Dumb buffers are linear CPU-writable allocations. They work on every KMS driver, which makes
//! them the fallback when GBM is not available.

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::{Device as ControlDevice, dumbbuffer};
use log::debug;

use crate::backend::FramebufferLayout;
use crate::buffer::xrgb_layout;
use crate::device::DrmDevice;
use crate::error::ioctl_error;
use crate::Result;

const COLOR_BARS: [(u8, u8, u8); 8] = [
    (255, 255, 255),
    (255, 255, 0),
    (0, 255, 255),
    (0, 255, 0),
    (255, 0, 255),
    (255, 0, 0),
    (0, 0, 255),
    (0, 0, 0),
];

/// A CPU-writable XRGB8888 buffer.
pub struct DumbBuffer {
    handle: dumbbuffer::DumbBuffer,
    width: u32,
    height: u32,
    stride: u32,
}

impl DumbBuffer {
    pub fn new(device: &DrmDevice, width: u32, height: u32) -> Result<Self> {
        let handle = device
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, 32)
            .map_err(ioctl_error("DRM_IOCTL_MODE_CREATE_DUMB"))?;
        let stride = handle.pitch();

        debug!("Created dumb buffer: {width}x{height}, stride={stride}");

        Ok(Self {
            handle,
            width,
            height,
            stride,
        })
    }

    /// Framebuffer layout of the buffer.
    pub fn layout(&self) -> FramebufferLayout {
        xrgb_layout(
            self.width,
            self.height,
            u32::from(self.handle.handle()),
            self.stride,
        )
    }

    fn paint(
        &mut self,
        device: &DrmDevice,
        color: impl Fn(u32, u32) -> (u8, u8, u8),
    ) -> Result<()> {
        let (width, height, stride) = (self.width, self.height, self.stride);
        let mut map = device
            .map_dumb_buffer(&mut self.handle)
            .map_err(ioctl_error("DRM_IOCTL_MODE_MAP_DUMB"))?;
        paint_pixels(&mut map, width, height, stride, color);
        Ok(())
    }

    /// Red grows left to right, blue top to bottom.
    pub fn draw_gradient(&mut self, device: &DrmDevice) -> Result<()> {
        let (width, height) = (self.width.max(1), self.height.max(1));
        self.paint(device, |x, y| {
            (((x * 255) / width) as u8, 0, ((y * 255) / height) as u8)
        })
    }

    /// Eight vertical color bars, scrolled horizontally by `frame` pixels.
    pub fn draw_color_bars(&mut self, device: &DrmDevice, frame: u32) -> Result<()> {
        let width = self.width.max(1);
        let bar_width = (width / 8).max(1);
        self.paint(device, |x, _| {
            let shifted = (x + frame) % width;
            COLOR_BARS[(shifted / bar_width).min(7) as usize]
        })
    }
}

/// Writes XRGB8888 pixels, stored as `[B, G, R, X]`, into a mapped buffer.
fn paint_pixels(
    pixels: &mut [u8],
    width: u32,
    height: u32,
    stride: u32,
    color: impl Fn(u32, u32) -> (u8, u8, u8),
) {
    for y in 0..height {
        let row = (y * stride) as usize;
        let Some(line) = pixels.get_mut(row..row + width as usize * 4) else {
            break;
        };
        for (x, pixel) in line.chunks_exact_mut(4).enumerate() {
            let (r, g, b) = color(x as u32, y);
            pixel.copy_from_slice(&[b, g, r, 0xFF]);
        }
    }
}
