//! Atomic requests and frame presentation

use drm::control::AtomicCommitFlags;
use log::{debug, trace, warn};

use crate::backend::{KmsBackend, ObjectKind, ObjectRef};
use crate::output::{OutputData, OutputObject};
use crate::property::{ConnectorProperty, CrtcProperty, PlaneProperty};
use crate::session::DeviceSession;
use crate::{KmsError, Result};

/// One property assignment of an atomic request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicEntry {
    pub object: ObjectRef,
    pub property: u32,
    pub value: u64,
}

/// A set of property assignments committed together.
#[derive(Debug, Clone, Default)]
pub struct AtomicRequest {
    entries: Vec<AtomicEntry>,
    modeset: bool,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an assignment. Assignments are never merged, the kernel applies the last one.
    pub fn push(&mut self, object: ObjectRef, property: u32, value: u64) -> Result<()> {
        self.entries
            .try_reserve(1)
            .map_err(|_| KmsError::AllocationFailure("atomic request"))?;
        self.entries.push(AtomicEntry {
            object,
            property,
            value,
        });
        Ok(())
    }

    pub fn entries(&self) -> &[AtomicEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the request assigns a property that can only change with `ALLOW_MODESET`.
    pub fn touches_modeset(&self) -> bool {
        self.modeset
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.modeset = false;
    }
}

/// Outcome of adding an output property to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAdd {
    Appended,
    /// The driver does not expose the property, nothing was added
    Skipped,
}

fn is_modeset_property<K: OutputObject>(kind: K) -> bool {
    match K::OBJECT {
        ObjectKind::Crtc => matches!(kind.name(), "MODE_ID" | "ACTIVE"),
        ObjectKind::Connector => kind.name() == "CRTC_ID",
        _ => false,
    }
}

fn add_property<K: OutputObject>(
    request: &mut AtomicRequest,
    output: &OutputData,
    kind: K,
    value: u64,
) -> Result<PropertyAdd> {
    let property = K::table(output).id(kind);
    if property == 0 {
        trace!("{}: {} not exposed, skipping", output.name, kind.name());
        return Ok(PropertyAdd::Skipped);
    }

    request.push(ObjectRef::new(K::OBJECT, K::object_id(output)), property, value)?;
    if is_modeset_property(kind) {
        request.modeset = true;
    }
    Ok(PropertyAdd::Appended)
}

impl<B: KmsBackend> DeviceSession<B> {
    /// Creates an empty request.
    pub fn atomic_alloc(&self) -> AtomicRequest {
        AtomicRequest::new()
    }

    pub fn atomic_free(&self, request: AtomicRequest) {
        drop(request);
    }

    fn enumerated_output(&self, odid: usize) -> Result<&OutputData> {
        self.outputs
            .get(odid)
            .filter(|o| o.is_enumerated())
            .ok_or(KmsError::InvalidOutput(odid))
    }

    /// Assigns a property of the primary plane of output `odid`.
    pub fn add_plane_prop(
        &self,
        request: &mut AtomicRequest,
        odid: usize,
        kind: PlaneProperty,
        value: u64,
    ) -> Result<PropertyAdd> {
        add_property(request, self.enumerated_output(odid)?, kind, value)
    }

    /// Assigns a property of the crtc of output `odid`.
    pub fn add_crtc_prop(
        &self,
        request: &mut AtomicRequest,
        odid: usize,
        kind: CrtcProperty,
        value: u64,
    ) -> Result<PropertyAdd> {
        add_property(request, self.enumerated_output(odid)?, kind, value)
    }

    /// Assigns a property of the connector of output `odid`.
    pub fn add_conn_prop(
        &self,
        request: &mut AtomicRequest,
        odid: usize,
        kind: ConnectorProperty,
        value: u64,
    ) -> Result<PropertyAdd> {
        add_property(request, self.enumerated_output(odid)?, kind, value)
    }

    /// Builds the request showing `buffer` full screen on its output.
    ///
    /// With `modeset` the request also carries the output's mode, activates the crtc and routes
    /// the connector to it.
    pub fn build_frame_request(&self, buffer: usize, modeset: bool) -> Result<AtomicRequest> {
        let data = self.buffer(buffer)?;
        let output = self.enumerated_output(data.odid)?;
        let (width, height) = output.size();

        let mut request = self.atomic_alloc();
        let plane = [
            (PlaneProperty::CrtcId, output.crtc_id as u64),
            (PlaneProperty::FbId, data.fb_id as u64),
            (PlaneProperty::SrcX, 0),
            (PlaneProperty::SrcY, 0),
            // 16.16 fixed point
            (PlaneProperty::SrcW, (width as u64) << 16),
            (PlaneProperty::SrcH, (height as u64) << 16),
            (PlaneProperty::CrtcX, 0),
            (PlaneProperty::CrtcY, 0),
            (PlaneProperty::CrtcW, width as u64),
            (PlaneProperty::CrtcH, height as u64),
        ];
        for (kind, value) in plane {
            add_property(&mut request, output, kind, value)?;
        }

        if modeset {
            add_property(
                &mut request,
                output,
                CrtcProperty::ModeId,
                output.mode_blob_id as u64,
            )?;
            add_property(&mut request, output, CrtcProperty::Active, 1)?;
            add_property(
                &mut request,
                output,
                ConnectorProperty::CrtcId,
                output.crtc_id as u64,
            )?;
        }

        Ok(request)
    }

    /// Submits `request` as a non-blocking commit presenting `buffer`.
    ///
    /// The commit always asks for a page flip event. `ALLOW_MODESET` is only passed when
    /// `allow_modeset` is set; a request changing the mode without it is refused by the kernel.
    /// On success the output has a flip pending until [`DeviceSession::handle_event`] sees its
    /// completion.
    pub fn commit(
        &mut self,
        buffer: usize,
        request: &AtomicRequest,
        allow_modeset: bool,
        user_data: u64,
    ) -> Result<()> {
        let odid = self.buffer(buffer)?.odid;
        let output = self.enumerated_output(odid)?;
        if output.flip_pending {
            return Err(KmsError::FlipPending(odid));
        }
        if self.buffers[buffer].in_use {
            return Err(KmsError::BufferBusy(buffer));
        }

        let mut flags = AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT;
        if allow_modeset {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        } else if request.touches_modeset() {
            debug!(
                "{}: request changes the mode but ALLOW_MODESET is not set",
                output.name
            );
        }

        self.backend()?.commit(request, flags)?;

        let output = &mut self.outputs[odid];
        output.flip_pending = true;
        output.pending_buffer = Some(buffer);
        output.pending_user_data = user_data;
        if allow_modeset && request.touches_modeset() {
            output.needs_modeset = false;
        }
        self.buffers[buffer].in_use = true;

        trace!("Committed buffer {buffer} on output {odid}");
        Ok(())
    }

    /// Blocking legacy mode-set scanning out `buffer`.
    ///
    /// Used for the first frame of an output. No completion event follows.
    pub fn modeset_legacy(&mut self, buffer: usize) -> Result<()> {
        let data = self.buffer(buffer)?;
        let odid = data.odid;
        let fb_id = data.fb_id;
        let output = self.enumerated_output(odid)?;
        if output.flip_pending {
            return Err(KmsError::FlipPending(odid));
        }

        self.backend()?
            .set_crtc_mode(output.crtc_id, fb_id, output.conn_id, &output.mode)?;

        let output = &mut self.outputs[odid];
        let previous = output.current_buffer.replace(buffer);
        output.needs_modeset = false;
        if let Some(previous) = previous.filter(|&p| p != buffer) {
            self.buffers[previous].in_use = false;
        }
        self.buffers[buffer].in_use = true;

        debug!("Mode-set output {odid} with buffer {buffer}");
        Ok(())
    }

    /// Legacy page flip to `buffer`, completing with a page flip event.
    pub fn page_flip_legacy(&mut self, buffer: usize, user_data: u64) -> Result<()> {
        let odid = self.buffer(buffer)?.odid;
        let output = self.enumerated_output(odid)?;
        if output.flip_pending {
            return Err(KmsError::FlipPending(odid));
        }
        if self.buffers[buffer].in_use {
            return Err(KmsError::BufferBusy(buffer));
        }

        self.backend()?.flip(output.crtc_id, self.buffers[buffer].fb_id)?;

        let output = &mut self.outputs[odid];
        output.flip_pending = true;
        output.pending_buffer = Some(buffer);
        output.pending_user_data = user_data;
        self.buffers[buffer].in_use = true;
        Ok(())
    }

    /// Shows `buffer` on its output with whatever mechanism the device supports.
    ///
    /// Outputs that were never mode-set get the full mode in their first commit.
    pub fn present(&mut self, buffer: usize, user_data: u64) -> Result<()> {
        let odid = self.buffer(buffer)?.odid;
        let needs_modeset = self.enumerated_output(odid)?.needs_modeset;

        if !self.atomic_supported() {
            if needs_modeset {
                warn!("Output {odid} was never mode-set, doing a blocking mode-set");
                return self.modeset_legacy(buffer);
            }
            return self.page_flip_legacy(buffer, user_data);
        }

        let request = self.build_frame_request(buffer, needs_modeset)?;
        let result = self.commit(buffer, &request, needs_modeset, user_data);
        self.atomic_free(request);
        result
    }
}
