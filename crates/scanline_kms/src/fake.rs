//! In-memory KMS device for tests

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use drm::control::AtomicCommitFlags;
use drm::{ClientCapability, DriverCapability};

use crate::atomic::AtomicRequest;
use crate::backend::{
    ConnectorInfo, CrtcInfo, EncoderInfo, FramebufferLayout, KmsBackend, KmsEvent, ModeInfo,
    ObjectKind, ObjectProperties, ObjectRef, PlaneInfo, PropertyDef, Resources,
};
use crate::buffer::{BufferStorage, xrgb_layout};
use crate::error::ioctl_error;
use crate::formats::{FORMAT_ARGB8888, FORMAT_XRGB8888, MODIFIER_LINEAR, build_blob};
use crate::session::{DeviceSession, SessionConfig};
use crate::{KmsError, Result};

pub const X_TILED: u64 = 0x0100_0000_0000_0001;

const CONNECTOR: u32 = 10;
const ENCODER: u32 = 20;
const CRTC: u32 = 30;
const PRIMARY_PLANE: u32 = 40;
const OVERLAY_PLANE: u32 = 41;
const BOOT_FB: u32 = 50;

const IN_FORMATS_BLOB: u32 = 200;
const BOOT_MODE_BLOB: u32 = 201;
const EDID_BLOB: u32 = 202;

struct State {
    master: bool,
    atomic_capable: bool,
    optional_caps: bool,
    fail_connectors: bool,

    resources: Resources,
    connectors: HashMap<u32, ConnectorInfo>,
    encoders: HashMap<u32, EncoderInfo>,
    crtcs: HashMap<u32, CrtcInfo>,
    planes: HashMap<u32, PlaneInfo>,

    defs: HashMap<u32, PropertyDef>,
    props: HashMap<ObjectRef, Vec<(u32, u64)>>,
    blobs: HashMap<u32, Vec<u8>>,
    next_blob: u32,
    framebuffers: HashMap<u32, FramebufferLayout>,
    next_fb: u32,

    scanout: HashMap<u32, u32>,
    pending_flips: Vec<(u32, u32)>,
    sequences: HashMap<u32, u32>,
    events: Vec<KmsEvent>,
    commits: usize,
    last_flags: Option<AtomicCommitFlags>,
}

/// A single connector → encoder → crtc → plane chain, lit up by a previous owner.
#[derive(Clone)]
pub struct FakeKms {
    state: Rc<RefCell<State>>,
}

fn errno(call: &'static str, code: i32) -> KmsError {
    ioctl_error(call)(io::Error::from_raw_os_error(code))
}

fn mode_1080p(mode_type: u32) -> ModeInfo {
    ModeInfo {
        clock: 148_500,
        hdisplay: 1920,
        hsync_start: 2008,
        hsync_end: 2052,
        htotal: 2200,
        vdisplay: 1080,
        vsync_start: 1084,
        vsync_end: 1089,
        vtotal: 1125,
        vrefresh: 60,
        mode_type,
        name: String::from("1920x1080"),
        ..Default::default()
    }
}

fn mode_720p() -> ModeInfo {
    ModeInfo {
        clock: 74_250,
        hdisplay: 1280,
        hsync_start: 1390,
        hsync_end: 1430,
        htotal: 1650,
        vdisplay: 720,
        vsync_start: 725,
        vsync_end: 730,
        vtotal: 750,
        vrefresh: 60,
        name: String::from("1280x720"),
        ..Default::default()
    }
}

impl FakeKms {
    pub fn single_output() -> Self {
        let mut defs = HashMap::new();
        let mut def = |id: u32, name: &str, enums: &[(&str, u64)]| {
            defs.insert(
                id,
                PropertyDef {
                    id,
                    name: name.to_string(),
                    is_enum: !enums.is_empty(),
                    enum_values: enums.iter().map(|&(n, v)| (n.to_string(), v)).collect(),
                },
            );
            id
        };

        let plane_props = vec![
            (def(1, "type", &[("Overlay", 0), ("Primary", 1), ("Cursor", 2)]), 1),
            (def(2, "FB_ID", &[]), BOOT_FB as u64),
            (def(3, "CRTC_ID", &[]), CRTC as u64),
            (def(4, "SRC_X", &[]), 0),
            (def(5, "SRC_Y", &[]), 0),
            (def(6, "SRC_W", &[]), 1920 << 16),
            (def(7, "SRC_H", &[]), 1080 << 16),
            (def(8, "CRTC_X", &[]), 0),
            (def(9, "CRTC_Y", &[]), 0),
            (def(10, "CRTC_W", &[]), 1920),
            (def(11, "CRTC_H", &[]), 1080),
            (def(12, "IN_FORMATS", &[]), IN_FORMATS_BLOB as u64),
            (def(13, "zpos", &[]), 0),
            (def(14, "VENDOR_SCALING_FILTER", &[]), 0),
        ];
        let overlay_props = vec![(1, 0), (2, 0), (3, 0)];
        let crtc_props = vec![
            (def(21, "ACTIVE", &[]), 1),
            (def(22, "MODE_ID", &[]), BOOT_MODE_BLOB as u64),
            (def(23, "OUT_FENCE_PTR", &[]), 0),
        ];
        let connector_props = vec![
            (def(31, "CRTC_ID", &[]), CRTC as u64),
            (def(32, "EDID", &[]), EDID_BLOB as u64),
            (
                def(33, "DPMS", &[("On", 0), ("Standby", 1), ("Suspend", 2), ("Off", 3)]),
                0,
            ),
            (def(34, "link-status", &[("Good", 0), ("Bad", 1)]), 0),
        ];

        let props = HashMap::from([
            (ObjectRef::new(ObjectKind::Plane, PRIMARY_PLANE), plane_props),
            (ObjectRef::new(ObjectKind::Plane, OVERLAY_PLANE), overlay_props),
            (ObjectRef::new(ObjectKind::Crtc, CRTC), crtc_props),
            (ObjectRef::new(ObjectKind::Connector, CONNECTOR), connector_props),
        ]);

        let blobs = HashMap::from([
            (
                IN_FORMATS_BLOB,
                build_blob(
                    &[FORMAT_ARGB8888, FORMAT_XRGB8888],
                    &[(0b11, 0, MODIFIER_LINEAR), (0b10, 0, X_TILED)],
                ),
            ),
            (BOOT_MODE_BLOB, Vec::new()),
            (EDID_BLOB, vec![0; 128]),
        ]);

        let state = State {
            master: true,
            atomic_capable: true,
            optional_caps: true,
            fail_connectors: false,
            resources: Resources {
                connectors: vec![CONNECTOR],
                encoders: vec![ENCODER],
                crtcs: vec![CRTC],
                planes: vec![PRIMARY_PLANE, OVERLAY_PLANE],
            },
            connectors: HashMap::from([(
                CONNECTOR,
                ConnectorInfo {
                    id: CONNECTOR,
                    encoder_id: ENCODER,
                    connected: true,
                    name: String::from("DP-1"),
                    modes: vec![mode_1080p(ModeInfo::TYPE_PREFERRED), mode_720p()],
                    encoders: vec![ENCODER],
                },
            )]),
            encoders: HashMap::from([(
                ENCODER,
                EncoderInfo {
                    id: ENCODER,
                    crtc_id: CRTC,
                    possible_crtcs: vec![CRTC],
                },
            )]),
            crtcs: HashMap::from([(
                CRTC,
                CrtcInfo {
                    id: CRTC,
                    buffer_id: BOOT_FB,
                    mode: Some(mode_1080p(0)),
                },
            )]),
            planes: HashMap::from([
                (
                    PRIMARY_PLANE,
                    PlaneInfo {
                        id: PRIMARY_PLANE,
                        crtc_id: CRTC,
                        fb_id: BOOT_FB,
                        possible_crtcs: vec![CRTC],
                    },
                ),
                (
                    OVERLAY_PLANE,
                    PlaneInfo {
                        id: OVERLAY_PLANE,
                        crtc_id: 0,
                        fb_id: 0,
                        possible_crtcs: vec![CRTC],
                    },
                ),
            ]),
            defs,
            props,
            blobs,
            next_blob: 300,
            framebuffers: HashMap::new(),
            next_fb: 100,
            scanout: HashMap::from([(CRTC, BOOT_FB)]),
            pending_flips: Vec::new(),
            sequences: HashMap::new(),
            events: Vec::new(),
            commits: 0,
            last_flags: None,
        };

        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn set_master(&self, master: bool) {
        self.state.borrow_mut().master = master;
    }

    pub fn set_atomic_capable(&self, capable: bool) {
        self.state.borrow_mut().atomic_capable = capable;
    }

    pub fn set_optional_caps(&self, supported: bool) {
        self.state.borrow_mut().optional_caps = supported;
    }

    pub fn fail_connector_queries(&self) {
        self.state.borrow_mut().fail_connectors = true;
    }

    pub fn remove_planes(&self) {
        self.state.borrow_mut().resources.planes.clear();
    }

    pub fn drop_plane_property(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        let Some(&id) = state
            .defs
            .iter()
            .find(|(id, def)| def.name == name && **id < 20)
            .map(|(id, _)| id)
        else {
            return;
        };
        for plane in [PRIMARY_PLANE, OVERLAY_PLANE] {
            if let Some(props) = state.props.get_mut(&ObjectRef::new(ObjectKind::Plane, plane)) {
                props.retain(|&(prop, _)| prop != id);
            }
        }
    }

    pub fn clear_crtc_mode(&self) {
        if let Some(crtc) = self.state.borrow_mut().crtcs.get_mut(&CRTC) {
            crtc.mode = None;
        }
    }

    /// Leaves the crtc without a framebuffer, as after a clean shutdown of the previous owner.
    pub fn detach_framebuffer(&self) {
        let mut state = self.state.borrow_mut();
        if let Some(crtc) = state.crtcs.get_mut(&CRTC) {
            crtc.buffer_id = 0;
        }
        if let Some(plane) = state.planes.get_mut(&PRIMARY_PLANE) {
            plane.crtc_id = 0;
            plane.fb_id = 0;
        }
    }

    /// Completes every pending flip, one refresh cycle later.
    pub fn vblank(&self) {
        let mut state = self.state.borrow_mut();
        for (crtc_id, fb_id) in std::mem::take(&mut state.pending_flips) {
            let sequence = state.sequences.entry(crtc_id).or_default();
            *sequence += 1;
            let sequence = *sequence;
            state.scanout.insert(crtc_id, fb_id);
            state.events.push(KmsEvent::PageFlip {
                crtc_id,
                sequence,
                timestamp: Duration::from_micros(16_667 * sequence as u64),
            });
        }
    }

    pub fn inject_page_flip(&self, crtc_id: u32) {
        self.state.borrow_mut().events.push(KmsEvent::PageFlip {
            crtc_id,
            sequence: 0,
            timestamp: Duration::ZERO,
        });
    }

    pub fn inject_vblank(&self, crtc_id: u32) {
        self.state.borrow_mut().events.push(KmsEvent::Vblank {
            crtc_id,
            sequence: 0,
            timestamp: Duration::ZERO,
        });
    }

    pub fn blob_exists(&self, id: u32) -> bool {
        self.state.borrow().blobs.contains_key(&id)
    }

    pub fn commit_count(&self) -> usize {
        self.state.borrow().commits
    }

    pub fn last_commit_flags(&self) -> Option<AtomicCommitFlags> {
        self.state.borrow().last_flags
    }

    /// Framebuffer scanned out by `crtc_id`.
    pub fn scanout_fb(&self, crtc_id: u32) -> u32 {
        self.state
            .borrow()
            .scanout
            .get(&crtc_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn framebuffer_layout(&self, fb_id: u32) -> Option<FramebufferLayout> {
        self.state.borrow().framebuffers.get(&fb_id).cloned()
    }

    /// Framebuffers added through this device.
    pub fn framebuffer_count(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    fn check_master(&self, call: &'static str) -> Result<()> {
        if self.state.borrow().master {
            Ok(())
        } else {
            Err(errno(call, libc::EACCES))
        }
    }
}

impl State {
    fn value(&self, object: ObjectRef, property: u32) -> Option<u64> {
        self.props
            .get(&object)?
            .iter()
            .find(|&&(id, _)| id == property)
            .map(|&(_, value)| value)
    }

    fn property_named(&self, object: ObjectRef, name: &str) -> Option<u64> {
        let (&id, _) = self.defs.iter().find(|(id, def)| {
            def.name == name
                && self
                    .props
                    .get(&object)
                    .is_some_and(|props| props.iter().any(|(p, _)| p == *id))
        })?;
        self.value(object, id)
    }

    fn needs_modeset(&self, object: ObjectRef, property: u32) -> bool {
        let Some(def) = self.defs.get(&property) else {
            return false;
        };
        match object.kind {
            ObjectKind::Crtc => matches!(def.name.as_str(), "MODE_ID" | "ACTIVE"),
            ObjectKind::Connector => def.name == "CRTC_ID",
            _ => false,
        }
    }
}

impl KmsBackend for FakeKms {
    fn authenticate(&self) -> Result<()> {
        self.check_master("DRM_IOCTL_AUTH_MAGIC")
    }

    fn set_client_cap(&self, cap: ClientCapability, _enable: bool) -> Result<()> {
        match cap {
            ClientCapability::Atomic if !self.state.borrow().atomic_capable => {
                Err(errno("DRM_IOCTL_SET_CLIENT_CAP", libc::EOPNOTSUPP))
            }
            _ => Ok(()),
        }
    }

    fn driver_cap(&self, _cap: DriverCapability) -> Result<u64> {
        Ok(self.state.borrow().optional_caps as u64)
    }

    fn resources(&self) -> Result<Resources> {
        Ok(self.state.borrow().resources.clone())
    }

    fn connector(&self, id: u32) -> Result<ConnectorInfo> {
        let state = self.state.borrow();
        if state.fail_connectors {
            return Err(errno("DRM_IOCTL_MODE_GETCONNECTOR", libc::EIO));
        }
        state
            .connectors
            .get(&id)
            .cloned()
            .ok_or_else(|| errno("DRM_IOCTL_MODE_GETCONNECTOR", libc::ENOENT))
    }

    fn encoder(&self, id: u32) -> Result<EncoderInfo> {
        self.state
            .borrow()
            .encoders
            .get(&id)
            .cloned()
            .ok_or_else(|| errno("DRM_IOCTL_MODE_GETENCODER", libc::ENOENT))
    }

    fn crtc(&self, id: u32) -> Result<CrtcInfo> {
        self.state
            .borrow()
            .crtcs
            .get(&id)
            .cloned()
            .ok_or_else(|| errno("DRM_IOCTL_MODE_GETCRTC", libc::ENOENT))
    }

    fn plane(&self, id: u32) -> Result<PlaneInfo> {
        self.state
            .borrow()
            .planes
            .get(&id)
            .cloned()
            .ok_or_else(|| errno("DRM_IOCTL_MODE_GETPLANE", libc::ENOENT))
    }

    fn object_properties(&self, object: ObjectRef) -> Result<ObjectProperties> {
        let state = self.state.borrow();
        let props = state
            .props
            .get(&object)
            .ok_or_else(|| errno("DRM_IOCTL_MODE_OBJ_GETPROPERTIES", libc::ENOENT))?;
        Ok(ObjectProperties {
            ids: props.iter().map(|&(id, _)| id).collect(),
            values: props.iter().map(|&(_, value)| value).collect(),
        })
    }

    fn property_def(&self, id: u32) -> Result<PropertyDef> {
        self.state
            .borrow()
            .defs
            .get(&id)
            .cloned()
            .ok_or_else(|| errno("DRM_IOCTL_MODE_GETPROPERTY", libc::ENOENT))
    }

    fn create_mode_blob(&self, mode: &ModeInfo) -> Result<u32> {
        let mut state = self.state.borrow_mut();
        let id = state.next_blob;
        state.next_blob += 1;
        state.blobs.insert(id, mode.name.clone().into_bytes());
        Ok(id)
    }

    fn blob_data(&self, id: u32) -> Result<Vec<u8>> {
        self.state
            .borrow()
            .blobs
            .get(&id)
            .cloned()
            .ok_or_else(|| errno("DRM_IOCTL_MODE_GETPROPBLOB", libc::ENOENT))
    }

    fn destroy_blob(&self, id: u32) -> Result<()> {
        match self.state.borrow_mut().blobs.remove(&id) {
            Some(_) => Ok(()),
            None => Err(errno("DRM_IOCTL_MODE_DESTROYPROPBLOB", libc::ENOENT)),
        }
    }

    fn add_fb2(&self, layout: &FramebufferLayout) -> Result<u32> {
        if layout.width == 0 || layout.height == 0 || layout.handles[0] == 0 {
            return Err(errno("DRM_IOCTL_MODE_ADDFB2", libc::EINVAL));
        }
        let mut state = self.state.borrow_mut();
        let id = state.next_fb;
        state.next_fb += 1;
        state.framebuffers.insert(id, layout.clone());
        Ok(id)
    }

    fn remove_fb(&self, fb_id: u32) -> Result<()> {
        match self.state.borrow_mut().framebuffers.remove(&fb_id) {
            Some(_) => Ok(()),
            None => Err(errno("DRM_IOCTL_MODE_RMFB", libc::ENOENT)),
        }
    }

    fn commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> Result<()> {
        const CALL: &str = "DRM_IOCTL_MODE_ATOMIC";
        self.check_master(CALL)?;
        let mut state = self.state.borrow_mut();

        let mut crtcs = Vec::new();
        for entry in request.entries() {
            let Some(current) = state.value(entry.object, entry.property) else {
                return Err(errno(CALL, libc::EINVAL));
            };
            if current != entry.value
                && state.needs_modeset(entry.object, entry.property)
                && !flags.contains(AtomicCommitFlags::ALLOW_MODESET)
            {
                return Err(errno(CALL, libc::EINVAL));
            }

            let crtc = match entry.object.kind {
                ObjectKind::Crtc => entry.object.id,
                ObjectKind::Plane if state.defs[&entry.property].name == "CRTC_ID" => {
                    entry.value as u32
                }
                _ => continue,
            };
            if !crtcs.contains(&crtc) {
                crtcs.push(crtc);
            }
        }

        if flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT)
            && state.pending_flips.iter().any(|(c, _)| crtcs.contains(c))
        {
            return Err(errno(CALL, libc::EBUSY));
        }

        for entry in request.entries() {
            if let Some(props) = state.props.get_mut(&entry.object) {
                for (id, value) in props.iter_mut() {
                    if *id == entry.property {
                        *value = entry.value;
                    }
                }
            }
        }

        if flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
            let plane = ObjectRef::new(ObjectKind::Plane, PRIMARY_PLANE);
            let fb = state.property_named(plane, "FB_ID").unwrap_or(0) as u32;
            for crtc in crtcs {
                state.pending_flips.push((crtc, fb));
            }
        }
        state.commits += 1;
        state.last_flags = Some(flags);
        Ok(())
    }

    fn set_crtc_mode(
        &self,
        crtc_id: u32,
        fb_id: u32,
        _connector_id: u32,
        mode: &ModeInfo,
    ) -> Result<()> {
        self.check_master("DRM_IOCTL_MODE_SETCRTC")?;
        let mut state = self.state.borrow_mut();
        if !state.framebuffers.contains_key(&fb_id) {
            return Err(errno("DRM_IOCTL_MODE_SETCRTC", libc::ENOENT));
        }
        let Some(crtc) = state.crtcs.get_mut(&crtc_id) else {
            return Err(errno("DRM_IOCTL_MODE_SETCRTC", libc::ENOENT));
        };
        crtc.mode = Some(mode.clone());
        crtc.buffer_id = fb_id;
        state.scanout.insert(crtc_id, fb_id);
        Ok(())
    }

    fn flip(&self, crtc_id: u32, fb_id: u32) -> Result<()> {
        self.check_master("DRM_IOCTL_MODE_PAGE_FLIP")?;
        let mut state = self.state.borrow_mut();
        if state.pending_flips.iter().any(|&(c, _)| c == crtc_id) {
            return Err(errno("DRM_IOCTL_MODE_PAGE_FLIP", libc::EBUSY));
        }
        state.pending_flips.push((crtc_id, fb_id));
        Ok(())
    }

    fn read_events(&self) -> Result<Vec<KmsEvent>> {
        Ok(std::mem::take(&mut self.state.borrow_mut().events))
    }
}

pub fn open_session(fake: FakeKms) -> DeviceSession<FakeKms> {
    open_session_with(fake, SessionConfig::default())
}

pub fn open_session_with(fake: FakeKms, config: SessionConfig) -> DeviceSession<FakeKms> {
    let mut session = DeviceSession::new(config);
    session
        .open_with(&[PathBuf::from("/dev/dri/card0")], move |_| Ok(fake.clone()))
        .unwrap();
    session
}

/// Registers `count` full screen framebuffers for output `odid`.
pub fn add_buffers(session: &mut DeviceSession<FakeKms>, odid: usize, count: usize) -> Vec<usize> {
    let (width, height) = session.output(odid).unwrap().size();
    (0..count)
        .map(|i| {
            let layout = xrgb_layout(width, height, 1 + i as u32, width * 4);
            session
                .wrap_framebuffer(odid, layout, BufferStorage::None, Default::default())
                .unwrap()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_refuses_mode_change_without_allow_modeset() {
        let fake = FakeKms::single_output();
        let mut request = AtomicRequest::new();
        request
            .push(ObjectRef::new(ObjectKind::Crtc, CRTC), 22, 999)
            .unwrap();

        let err = fake
            .commit(&request, AtomicCommitFlags::NONBLOCK)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        fake.commit(&request, AtomicCommitFlags::ALLOW_MODESET)
            .unwrap();
        assert_eq!(fake.commit_count(), 1);
    }
}
