//! DRM device ownership
//!
//! A [`DeviceSession`] owns everything tied to one open DRM primary node: the node itself,
//! the GBM allocator built on it, the virtual terminal, and the fixed-capacity output and
//! buffer records the rest of the pipeline indexes into.

use std::ops::Range;
use std::path::{Path, PathBuf};

use drm::{ClientCapability, DriverCapability};
use log::{debug, error, info, warn};
use scanline_seat::VirtualTerminal;
use scanline_shared::Arena;

use crate::backend::KmsBackend;
use crate::buffer::{BufferData, BufferStorage};
use crate::gbm::GbmAllocator;
use crate::output::OutputData;
use crate::{KmsError, Result};

/// Settings of a [`DeviceSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Keep a node whose driver refuses the atomic client capability and drive it with legacy
    /// mode-setting instead of skipping it
    pub allow_legacy: bool,
    /// Use legacy page flips even when atomic commits are available
    pub force_legacy: bool,
    /// Capacity of the output records
    pub max_outputs: usize,
    /// Capacity of the buffer records
    pub max_buffers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allow_legacy: false,
            force_legacy: false,
            max_outputs: 8,
            max_buffers: 32,
        }
    }
}

/// An open DRM device and the per output state built on it.
pub struct DeviceSession<B> {
    config: SessionConfig,
    pub(crate) backend: Option<B>,
    path: Option<PathBuf>,
    atomic_supported: bool,
    pub(crate) gbm: Option<GbmAllocator>,
    vt: Option<VirtualTerminal>,
    pub(crate) outputs: Arena<OutputData>,
    pub(crate) buffers: Arena<BufferData>,
}

impl<B: KmsBackend> DeviceSession<B> {
    /// Creates a session without an open device. Record storage is allocated up front.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            outputs: Arena::with_capacity(config.max_outputs),
            buffers: Arena::with_capacity(config.max_buffers),
            config,
            backend: None,
            path: None,
            atomic_supported: false,
            gbm: None,
            vt: None,
        }
    }

    /// Tries each candidate node in turn and keeps the first one that can be driven.
    ///
    /// A node is usable when `open` yields a device for it, we are its DRM master, and it
    /// accepts the universal planes capability. The atomic capability decides between atomic
    /// and legacy presentation, see [`SessionConfig::allow_legacy`].
    pub fn open_with<F>(&mut self, candidates: &[PathBuf], mut open: F) -> Result<()>
    where
        F: FnMut(&Path) -> Result<B>,
    {
        if self.backend.is_some() {
            warn!("Opening a new node while another one is open, closing the old one");
            self.close();
        }

        for path in candidates {
            match self.try_node(path, &mut open) {
                Ok((backend, atomic)) => {
                    self.atomic_supported = atomic && !self.config.force_legacy;
                    info!(
                        "Using DRM node {} ({} mode-setting)",
                        path.display(),
                        if self.atomic_supported { "atomic" } else { "legacy" }
                    );
                    self.backend = Some(backend);
                    self.path = Some(path.clone());
                    return Ok(());
                }
                Err(err) => warn!("Skipping DRM node {}: {err}", path.display()),
            }
        }

        Err(KmsError::NoDevice)
    }

    fn try_node<F>(&self, path: &Path, open: &mut F) -> Result<(B, bool)>
    where
        F: FnMut(&Path) -> Result<B>,
    {
        let backend = open(path)?;

        backend.authenticate().inspect_err(|_| {
            error!(
                "Not DRM master of {}, another compositor or session owns it",
                path.display()
            )
        })?;

        backend.set_client_cap(ClientCapability::UniversalPlanes, true)?;

        let atomic = match backend.set_client_cap(ClientCapability::Atomic, true) {
            Ok(()) => true,
            Err(err) if self.config.allow_legacy => {
                warn!("Atomic mode-setting unavailable, using legacy: {err}");
                false
            }
            Err(err) => return Err(err),
        };

        let optional = [
            (DriverCapability::AddFB2Modifiers, "ADDFB2_MODIFIERS"),
            (DriverCapability::MonotonicTimestamp, "TIMESTAMP_MONOTONIC"),
        ];
        for (cap, name) in optional {
            match backend.driver_cap(cap) {
                Ok(0) => warn!("{} does not support {name}", path.display()),
                Ok(_) => debug!("{} supports {name}", path.display()),
                Err(err) => warn!("Unable to query {name} on {}: {err}", path.display()),
            }
        }

        Ok((backend, atomic))
    }

    /// Reserves `count` output records. Must happen before outputs are enumerated.
    pub fn allocate_outputs(&mut self, count: usize) -> Result<Range<usize>> {
        Ok(self.outputs.reserve(count)?)
    }

    /// Releases every kernel object the session created and closes the node. The virtual
    /// terminal is restored as well and the output and buffer records start over empty.
    pub fn close(&mut self) {
        if let Some(backend) = self.backend.as_ref() {
            for buffer in self.buffers.iter_mut() {
                if buffer.fb_id != 0 {
                    if let Err(err) = backend.remove_fb(buffer.fb_id) {
                        warn!("Unable to remove framebuffer {}: {err}", buffer.fb_id);
                    }
                    buffer.fb_id = 0;
                }
                buffer.in_use = false;
                buffer.storage = BufferStorage::None;
            }
            for output in self.outputs.iter_mut() {
                if output.mode_blob_id != 0 {
                    if let Err(err) = backend.destroy_blob(output.mode_blob_id) {
                        warn!("Unable to destroy mode blob {}: {err}", output.mode_blob_id);
                    }
                    output.mode_blob_id = 0;
                }
                output.flip_pending = false;
            }
        }

        self.buffers = Arena::with_capacity(self.config.max_buffers);
        self.outputs = Arena::with_capacity(self.config.max_outputs);
        self.gbm = None;
        if self.backend.take().is_some() {
            if let Some(path) = self.path.take() {
                info!("Closed DRM node {}", path.display());
            }
        }
        self.release_vt();
    }

    /// The open device.
    pub fn backend(&self) -> Result<&B> {
        self.backend.as_ref().ok_or(KmsError::DeviceNotOpen)
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    /// Path of the open node.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether frames are presented with atomic commits.
    pub fn atomic_supported(&self) -> bool {
        self.atomic_supported
    }

    pub fn output(&self, index: usize) -> Result<&OutputData> {
        self.outputs.get(index).ok_or(KmsError::InvalidOutput(index))
    }

    pub fn outputs(&self) -> impl Iterator<Item = &OutputData> {
        self.outputs.iter()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn buffer(&self, index: usize) -> Result<&BufferData> {
        self.buffers.get(index).ok_or(KmsError::InvalidBuffer(index))
    }

    /// The buffers belonging to output `odid`, by index.
    pub fn buffers_of(&self, odid: usize) -> Vec<usize> {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.odid == odid && b.fb_id != 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// A buffer of output `odid` that the display does not hold, if any.
    pub fn free_buffer(&self, odid: usize) -> Option<usize> {
        self.buffers
            .iter()
            .enumerate()
            .find(|(_, b)| b.odid == odid && b.fb_id != 0 && !b.in_use)
            .map(|(i, _)| i)
    }
}

impl<B> DeviceSession<B> {
    /// Switches to a free virtual terminal in graphics mode.
    pub fn acquire_vt(&mut self) -> Result<()> {
        if self.vt.is_some() {
            return Ok(());
        }
        let vt = VirtualTerminal::acquire().map_err(KmsError::Seat)?;
        self.vt = Some(vt);
        Ok(())
    }

    /// Restores the virtual terminal, if one was acquired.
    pub fn release_vt(&mut self) {
        if let Some(mut vt) = self.vt.take() {
            vt.release();
        }
    }
}

impl<B> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        // Kernel objects go away with the fd, the VT has to be put back explicitly
        if let Some(mut vt) = self.vt.take() {
            vt.release();
        }
    }
}
