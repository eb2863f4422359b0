//! The kernel seam
//!
//! Every interaction with the DRM device goes through [`KmsBackend`]. Objects are addressed by
//! their raw kernel ids, the same way libdrm exposes them, so the pipeline logic above this
//! layer never depends on a particular binding.

use std::fmt;
use std::time::Duration;

use drm::control::AtomicCommitFlags;
use drm::{ClientCapability, DriverCapability};

use crate::Result;
use crate::atomic::AtomicRequest;

/// The KMS object classes the pipeline deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Connector,
    Encoder,
    Crtc,
    Plane,
    Framebuffer,
    Property,
    Blob,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connector => "connector",
            Self::Encoder => "encoder",
            Self::Crtc => "crtc",
            Self::Plane => "plane",
            Self::Framebuffer => "framebuffer",
            Self::Property => "property",
            Self::Blob => "blob",
        };
        f.write_str(name)
    }
}

/// A KMS object by class and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: u32,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: u32) -> Self {
        Self { kind, id }
    }
}

/// Object ids of a device, in kernel order.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub crtcs: Vec<u32>,
    pub planes: Vec<u32>,
}

impl Resources {
    /// A device without any of the four object classes cannot drive a display.
    pub fn is_kms_capable(&self) -> bool {
        !(self.connectors.is_empty()
            || self.encoders.is_empty()
            || self.crtcs.is_empty()
            || self.planes.is_empty())
    }
}

/// A display mode line, mirroring `struct drm_mode_modeinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeInfo {
    /// Pixel clock in kHz
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl ModeInfo {
    /// `DRM_MODE_TYPE_PREFERRED`
    pub const TYPE_PREFERRED: u32 = 1 << 3;

    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    pub fn is_preferred(&self) -> bool {
        self.mode_type & Self::TYPE_PREFERRED != 0
    }

    /// Refresh rate derived from the timings, in mHz. Falls back to `vrefresh` when the
    /// totals are not filled in.
    pub fn refresh_millihz(&self) -> u64 {
        let pixels = self.htotal as u64 * self.vtotal as u64;
        if self.clock == 0 || pixels == 0 {
            return self.vrefresh as u64 * 1000;
        }
        (self.clock as u64 * 1_000_000).div_ceil(pixels)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorInfo {
    pub id: u32,
    /// Currently bound encoder, 0 when none
    pub encoder_id: u32,
    pub connected: bool,
    /// Kernel style name, e.g. `HDMI-A-1`
    pub name: String,
    pub modes: Vec<ModeInfo>,
    pub encoders: Vec<u32>,
}

impl ConnectorInfo {
    /// The mode the connector advertises as preferred, or its first mode.
    pub fn preferred_mode(&self) -> Option<&ModeInfo> {
        self.modes
            .iter()
            .find(|m| m.is_preferred())
            .or_else(|| self.modes.first())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncoderInfo {
    pub id: u32,
    /// Currently bound crtc, 0 when none
    pub crtc_id: u32,
    pub possible_crtcs: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct CrtcInfo {
    pub id: u32,
    /// Framebuffer currently scanned out, 0 when none
    pub buffer_id: u32,
    pub mode: Option<ModeInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct PlaneInfo {
    pub id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: Vec<u32>,
}

/// Definition of a property as returned by `drmModeGetProperty`.
#[derive(Debug, Clone, Default)]
pub struct PropertyDef {
    pub id: u32,
    pub name: String,
    /// Whether the kernel flags the property as `DRM_MODE_PROP_ENUM`
    pub is_enum: bool,
    /// Symbolic name and raw value of each enum entry
    pub enum_values: Vec<(String, u64)>,
}

/// The live property ids and values of one object.
#[derive(Debug, Clone, Default)]
pub struct ObjectProperties {
    pub ids: Vec<u32>,
    pub values: Vec<u64>,
}

impl ObjectProperties {
    /// The current value of property `id`, if the object has it.
    pub fn value_of(&self, id: u32) -> Option<u64> {
        self.ids
            .iter()
            .position(|&p| p == id)
            .and_then(|i| self.values.get(i).copied())
    }
}

/// Arguments of the ADDFB2 ioctl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramebufferLayout {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc code
    pub format: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    /// Explicit modifier, `None` leaves the layout to the driver
    pub modifier: Option<u64>,
}

/// A completion event read from the DRM fd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmsEvent {
    PageFlip {
        crtc_id: u32,
        sequence: u32,
        timestamp: Duration,
    },
    Vblank {
        crtc_id: u32,
        sequence: u32,
        timestamp: Duration,
    },
}

/// Raw access to a KMS device.
pub trait KmsBackend {
    /// Runs the auth-magic handshake against ourselves, which only succeeds for DRM master.
    fn authenticate(&self) -> Result<()>;
    fn set_client_cap(&self, cap: ClientCapability, enable: bool) -> Result<()>;
    fn driver_cap(&self, cap: DriverCapability) -> Result<u64>;

    fn resources(&self) -> Result<Resources>;
    fn connector(&self, id: u32) -> Result<ConnectorInfo>;
    fn encoder(&self, id: u32) -> Result<EncoderInfo>;
    fn crtc(&self, id: u32) -> Result<CrtcInfo>;
    fn plane(&self, id: u32) -> Result<PlaneInfo>;

    fn object_properties(&self, object: ObjectRef) -> Result<ObjectProperties>;
    fn property_def(&self, id: u32) -> Result<PropertyDef>;

    fn create_mode_blob(&self, mode: &ModeInfo) -> Result<u32>;
    fn blob_data(&self, id: u32) -> Result<Vec<u8>>;
    fn destroy_blob(&self, id: u32) -> Result<()>;

    fn add_fb2(&self, layout: &FramebufferLayout) -> Result<u32>;
    fn remove_fb(&self, fb_id: u32) -> Result<()>;

    /// Submits an atomic request. Never blocks when `NONBLOCK` is set.
    fn commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> Result<()>;
    /// Blocking legacy mode-set of one connector on one crtc.
    fn set_crtc_mode(&self, crtc_id: u32, fb_id: u32, connector_id: u32, mode: &ModeInfo)
    -> Result<()>;
    /// Legacy page flip requesting a completion event.
    fn flip(&self, crtc_id: u32, fb_id: u32) -> Result<()>;

    /// Reads the pending completion events. Blocks if none are queued.
    fn read_events(&self) -> Result<Vec<KmsEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_is_derived_from_timings() {
        let mode = ModeInfo {
            clock: 148_500,
            htotal: 2200,
            vtotal: 1125,
            vrefresh: 60,
            ..Default::default()
        };

        assert_eq!(mode.refresh_millihz(), 60_000);
    }

    #[test]
    fn refresh_falls_back_to_vrefresh() {
        let mode = ModeInfo {
            vrefresh: 75,
            ..Default::default()
        };

        assert_eq!(mode.refresh_millihz(), 75_000);
    }

    #[test]
    fn preferred_mode_falls_back_to_first() {
        let first = ModeInfo {
            name: String::from("800x600"),
            ..Default::default()
        };
        let mut connector = ConnectorInfo {
            modes: vec![first.clone()],
            ..Default::default()
        };
        assert_eq!(connector.preferred_mode(), Some(&first));

        let preferred = ModeInfo {
            name: String::from("1920x1080"),
            mode_type: ModeInfo::TYPE_PREFERRED,
            ..Default::default()
        };
        connector.modes.push(preferred.clone());
        assert_eq!(connector.preferred_mode(), Some(&preferred));
    }

    #[test]
    fn missing_property_has_no_value() {
        let props = ObjectProperties {
            ids: vec![3, 4],
            values: vec![30, 40],
        };

        assert_eq!(props.value_of(4), Some(40));
        assert_eq!(props.value_of(5), None);
    }
}
