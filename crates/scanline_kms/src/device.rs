//! The DRM device backing a session

use std::ffi::c_char;
use std::fs;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use drm::control::{
    self, AtomicCommitFlags, Device as ControlDevice, Event, Mode, PageFlipFlags,
    RawResourceHandle, atomic::AtomicModeReq, connector, crtc, encoder, framebuffer, plane,
    property,
};
use drm::{ClientCapability, Device, DriverCapability};
use drm_ffi::drm_mode_modeinfo;
use log::{debug, info, trace, warn};
use scanline_seat::SessionHelper;

use crate::atomic::AtomicRequest;
use crate::backend::{
    ConnectorInfo, CrtcInfo, EncoderInfo, FramebufferLayout, KmsBackend, KmsEvent, ModeInfo,
    ObjectKind, ObjectProperties, ObjectRef, PlaneInfo, PropertyDef, Resources,
};
use crate::error::ioctl_error;
use crate::gbm::GbmAllocator;
use crate::session::DeviceSession;
use crate::{KmsError, Result};

/// A DRM primary node.
///
/// The fd comes from the seat helper, which makes us DRM master of it.
#[derive(Debug)]
pub struct DrmDevice {
    fd: OwnedFd,
}

impl Device for DrmDevice {}

impl ControlDevice for DrmDevice {}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl DrmDevice {
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let device = Self { fd };

        match device.get_driver() {
            Ok(driver) => info!(
                "DRM driver: {} - {}",
                driver.name().to_string_lossy(),
                driver.description().to_string_lossy()
            ),
            Err(err) => warn!("Unable to query the DRM driver: {err}"),
        }

        Ok(device)
    }

    /// A second handle on the same open file description.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Lists the `/dev/dri/card*` primary nodes, sorted.
pub fn find_drm_devices() -> Result<Vec<PathBuf>> {
    let dri_path = Path::new("/dev/dri");
    if !dri_path.exists() {
        warn!("/dev/dri does not exist, is the DRM subsystem loaded?");
        return Err(KmsError::NoDevice);
    }

    let mut devices = Vec::new();
    for entry in fs::read_dir(dri_path)? {
        let path = entry?.path();
        // renderD* nodes cannot mode-set
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("card"))
        {
            devices.push(path);
        }
    }
    devices.sort();

    info!("Found {} DRM device(s): {:?}", devices.len(), devices);

    Ok(devices)
}

fn handle<T: From<RawResourceHandle>>(kind: ObjectKind, id: u32) -> Result<T> {
    control::from_u32(id).ok_or(KmsError::UnknownObject { kind, id })
}

fn id_of<T: Into<u32>>(handle: Option<T>) -> u32 {
    handle.map_or(0, Into::into)
}

impl From<&Mode> for ModeInfo {
    fn from(mode: &Mode) -> Self {
        let raw = drm_mode_modeinfo::from(*mode);
        let name = raw
            .name
            .iter()
            .map(|&c| c as u8)
            .take_while(|&b| b != 0)
            .collect::<Vec<_>>();

        Self {
            clock: raw.clock,
            hdisplay: raw.hdisplay,
            hsync_start: raw.hsync_start,
            hsync_end: raw.hsync_end,
            htotal: raw.htotal,
            hskew: raw.hskew,
            vdisplay: raw.vdisplay,
            vsync_start: raw.vsync_start,
            vsync_end: raw.vsync_end,
            vtotal: raw.vtotal,
            vscan: raw.vscan,
            vrefresh: raw.vrefresh,
            flags: raw.flags,
            mode_type: raw.type_,
            name: String::from_utf8_lossy(&name).into_owned(),
        }
    }
}

impl From<&ModeInfo> for drm_mode_modeinfo {
    fn from(mode: &ModeInfo) -> Self {
        let mut name: [c_char; 32] = [0; 32];
        // Keep the terminating nul
        for (dst, &src) in name.iter_mut().zip(mode.name.as_bytes().iter().take(31)) {
            *dst = src as c_char;
        }

        Self {
            clock: mode.clock,
            hdisplay: mode.hdisplay,
            hsync_start: mode.hsync_start,
            hsync_end: mode.hsync_end,
            htotal: mode.htotal,
            hskew: mode.hskew,
            vdisplay: mode.vdisplay,
            vsync_start: mode.vsync_start,
            vsync_end: mode.vsync_end,
            vtotal: mode.vtotal,
            vscan: mode.vscan,
            vrefresh: mode.vrefresh,
            flags: mode.flags,
            type_: mode.mode_type,
            name,
        }
    }
}

impl KmsBackend for DrmDevice {
    // The self-auth handshake is the only way to confirm master status
    #[allow(deprecated)]
    fn authenticate(&self) -> Result<()> {
        let token = self
            .generate_auth_token()
            .map_err(ioctl_error("DRM_IOCTL_GET_MAGIC"))?;
        self.authenticate_auth_token(token)
            .map_err(ioctl_error("DRM_IOCTL_AUTH_MAGIC"))
    }

    fn set_client_cap(&self, cap: ClientCapability, enable: bool) -> Result<()> {
        self.set_client_capability(cap, enable)
            .map_err(ioctl_error("DRM_IOCTL_SET_CLIENT_CAP"))
    }

    fn driver_cap(&self, cap: DriverCapability) -> Result<u64> {
        self.get_driver_capability(cap)
            .map_err(ioctl_error("DRM_IOCTL_GET_CAP"))
    }

    fn resources(&self) -> Result<Resources> {
        let handles = self
            .resource_handles()
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETRESOURCES"))?;
        let planes = self
            .plane_handles()
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETPLANERESOURCES"))?;

        Ok(Resources {
            connectors: handles.connectors().iter().map(|&h| h.into()).collect(),
            encoders: handles.encoders().iter().map(|&h| h.into()).collect(),
            crtcs: handles.crtcs().iter().map(|&h| h.into()).collect(),
            planes: planes.iter().map(|&h| h.into()).collect(),
        })
    }

    fn connector(&self, id: u32) -> Result<ConnectorInfo> {
        let info = self
            .get_connector(handle::<connector::Handle>(ObjectKind::Connector, id)?, false)
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETCONNECTOR"))?;

        Ok(ConnectorInfo {
            id,
            encoder_id: id_of(info.current_encoder()),
            connected: info.state() == connector::State::Connected,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            modes: info.modes().iter().map(ModeInfo::from).collect(),
            encoders: info.encoders().iter().map(|&h| h.into()).collect(),
        })
    }

    fn encoder(&self, id: u32) -> Result<EncoderInfo> {
        let info = self
            .get_encoder(handle::<encoder::Handle>(ObjectKind::Encoder, id)?)
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETENCODER"))?;
        let handles = self
            .resource_handles()
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETRESOURCES"))?;

        Ok(EncoderInfo {
            id,
            crtc_id: id_of(info.crtc()),
            possible_crtcs: handles
                .filter_crtcs(info.possible_crtcs())
                .into_iter()
                .map(u32::from)
                .collect(),
        })
    }

    fn crtc(&self, id: u32) -> Result<CrtcInfo> {
        let info = self
            .get_crtc(handle::<crtc::Handle>(ObjectKind::Crtc, id)?)
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETCRTC"))?;

        Ok(CrtcInfo {
            id,
            buffer_id: id_of(info.framebuffer()),
            mode: info.mode().as_ref().map(ModeInfo::from),
        })
    }

    fn plane(&self, id: u32) -> Result<PlaneInfo> {
        let info = self
            .get_plane(handle::<plane::Handle>(ObjectKind::Plane, id)?)
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETPLANE"))?;
        let handles = self
            .resource_handles()
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETRESOURCES"))?;

        Ok(PlaneInfo {
            id,
            crtc_id: id_of(info.crtc()),
            fb_id: id_of(info.framebuffer()),
            possible_crtcs: handles
                .filter_crtcs(info.possible_crtcs())
                .into_iter()
                .map(u32::from)
                .collect(),
        })
    }

    fn object_properties(&self, object: ObjectRef) -> Result<ObjectProperties> {
        let ObjectRef { kind, id } = object;
        let set = match kind {
            ObjectKind::Connector => self.get_properties(handle::<connector::Handle>(kind, id)?),
            ObjectKind::Crtc => self.get_properties(handle::<crtc::Handle>(kind, id)?),
            ObjectKind::Plane => self.get_properties(handle::<plane::Handle>(kind, id)?),
            _ => return Err(KmsError::UnknownObject { kind, id }),
        }
        .map_err(ioctl_error("DRM_IOCTL_MODE_OBJ_GETPROPERTIES"))?;

        let (ids, values) = set.as_props_and_values();
        Ok(ObjectProperties {
            ids: ids.iter().map(|&h| h.into()).collect(),
            values: values.to_vec(),
        })
    }

    fn property_def(&self, id: u32) -> Result<PropertyDef> {
        let info = self
            .get_property(handle::<property::Handle>(ObjectKind::Property, id)?)
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETPROPERTY"))?;

        let (is_enum, enum_values) = match info.value_type() {
            property::ValueType::Enum(values) => {
                let (_, entries) = values.values();
                let entries = entries
                    .iter()
                    .map(|e| (e.name().to_string_lossy().into_owned(), e.value()))
                    .collect();
                (true, entries)
            }
            _ => (false, Vec::new()),
        };

        Ok(PropertyDef {
            id,
            name: info.name().to_string_lossy().into_owned(),
            is_enum,
            enum_values,
        })
    }

    fn create_mode_blob(&self, mode: &ModeInfo) -> Result<u32> {
        let raw = drm_mode_modeinfo::from(mode);
        let blob = self
            .create_property_blob(&raw)
            .map_err(ioctl_error("DRM_IOCTL_MODE_CREATEPROPBLOB"))?;
        Ok(u64::from(blob) as u32)
    }

    fn blob_data(&self, id: u32) -> Result<Vec<u8>> {
        self.get_property_blob(id as u64)
            .map_err(ioctl_error("DRM_IOCTL_MODE_GETPROPBLOB"))
    }

    fn destroy_blob(&self, id: u32) -> Result<()> {
        self.destroy_property_blob(id as u64)
            .map_err(ioctl_error("DRM_IOCTL_MODE_DESTROYPROPBLOB"))
    }

    fn add_fb2(&self, layout: &FramebufferLayout) -> Result<u32> {
        let (modifiers, flags) = match layout.modifier {
            Some(modifier) => {
                let mut modifiers = [0; 4];
                for (slot, &handle) in modifiers.iter_mut().zip(&layout.handles) {
                    if handle != 0 {
                        *slot = modifier;
                    }
                }
                (modifiers, drm_ffi::DRM_MODE_FB_MODIFIERS)
            }
            None => ([0; 4], 0),
        };

        let cmd = drm_ffi::mode::add_fb2(
            self.fd(),
            layout.width,
            layout.height,
            layout.format,
            &layout.handles,
            &layout.pitches,
            &layout.offsets,
            &modifiers,
            flags,
        )
        .map_err(ioctl_error("DRM_IOCTL_MODE_ADDFB2"))?;

        debug!(
            "Added framebuffer {}: {}x{} format {:#010x}",
            cmd.fb_id, layout.width, layout.height, layout.format
        );

        Ok(cmd.fb_id)
    }

    fn remove_fb(&self, fb_id: u32) -> Result<()> {
        self.destroy_framebuffer(handle::<framebuffer::Handle>(ObjectKind::Framebuffer, fb_id)?)
            .map_err(ioctl_error("DRM_IOCTL_MODE_RMFB"))
    }

    fn commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> Result<()> {
        let mut req = AtomicModeReq::new();

        for entry in request.entries() {
            let property = handle::<property::Handle>(ObjectKind::Property, entry.property)?;
            let value = property::Value::UnsignedRange(entry.value);
            let ObjectRef { kind, id } = entry.object;
            match kind {
                ObjectKind::Connector => {
                    req.add_property(handle::<connector::Handle>(kind, id)?, property, value)
                }
                ObjectKind::Crtc => {
                    req.add_property(handle::<crtc::Handle>(kind, id)?, property, value)
                }
                ObjectKind::Plane => {
                    req.add_property(handle::<plane::Handle>(kind, id)?, property, value)
                }
                _ => return Err(KmsError::UnknownObject { kind, id }),
            }
        }

        ControlDevice::atomic_commit(self, flags, req).map_err(ioctl_error("DRM_IOCTL_MODE_ATOMIC"))
    }

    fn set_crtc_mode(
        &self,
        crtc_id: u32,
        fb_id: u32,
        connector_id: u32,
        mode: &ModeInfo,
    ) -> Result<()> {
        let crtc = handle::<crtc::Handle>(ObjectKind::Crtc, crtc_id)?;
        let fb = handle::<framebuffer::Handle>(ObjectKind::Framebuffer, fb_id)?;
        let connector = handle::<connector::Handle>(ObjectKind::Connector, connector_id)?;
        let mode = Mode::from(drm_mode_modeinfo::from(mode));

        self.set_crtc(crtc, Some(fb), (0, 0), &[connector], Some(mode))
            .map_err(ioctl_error("DRM_IOCTL_MODE_SETCRTC"))
    }

    fn flip(&self, crtc_id: u32, fb_id: u32) -> Result<()> {
        let crtc = handle::<crtc::Handle>(ObjectKind::Crtc, crtc_id)?;
        let fb = handle::<framebuffer::Handle>(ObjectKind::Framebuffer, fb_id)?;

        self.page_flip(crtc, fb, PageFlipFlags::EVENT, None)
            .map_err(ioctl_error("DRM_IOCTL_MODE_PAGE_FLIP"))
    }

    fn read_events(&self) -> Result<Vec<KmsEvent>> {
        let events = self
            .receive_events()
            .map_err(ioctl_error("read(DRM event)"))?;

        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(flip) => Some(KmsEvent::PageFlip {
                    crtc_id: u32::from(flip.crtc),
                    sequence: flip.frame,
                    timestamp: flip.duration,
                }),
                Event::Vblank(vblank) => Some(KmsEvent::Vblank {
                    crtc_id: u32::from(vblank.crtc),
                    sequence: vblank.frame,
                    timestamp: vblank.time,
                }),
                Event::Unknown(data) => {
                    trace!("Ignoring unknown DRM event of {} bytes", data.len());
                    None
                }
            })
            .collect())
    }
}

impl DeviceSession<DrmDevice> {
    /// Opens a DRM node through `seat`.
    ///
    /// With `preferred` only that node is tried, otherwise every primary node in `/dev/dri`.
    /// A GBM allocator is set up on the node when possible.
    pub fn open(&mut self, seat: &mut dyn SessionHelper, preferred: Option<&Path>) -> Result<()> {
        let candidates = match preferred {
            Some(path) => vec![path.to_path_buf()],
            None => find_drm_devices()?,
        };

        self.open_with(&candidates, |path| {
            let fd = seat.open_device(path).map_err(KmsError::Seat)?;
            DrmDevice::from_fd(fd)
        })?;

        let device = self
            .backend()?
            .try_clone()
            .map_err(ioctl_error("F_DUPFD_CLOEXEC"))?;
        match GbmAllocator::new(device) {
            Ok(gbm) => self.gbm = Some(gbm),
            Err(err) => warn!("GBM is unavailable, only dumb buffers can be used: {err}"),
        }

        Ok(())
    }

    /// The raw fd to poll for completion events.
    pub fn event_fd(&self) -> Result<BorrowedFd<'_>> {
        Ok(self.backend()?.fd())
    }
}
