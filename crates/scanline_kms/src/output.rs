//! Output discovery and enumeration
//!
//! An output is one connector → encoder → crtc → plane chain. [`DeviceSession::discover`]
//! finds the chains the kernel already has configured, [`DeviceSession::enumerate`] turns one
//! of them into an [`OutputData`] record the presentation code can drive.

use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::backend::{KmsBackend, ObjectKind, ObjectProperties, ObjectRef, PlaneInfo};
use crate::edid::log_edid;
use crate::error::query_failed;
use crate::formats::populate_modifiers;
use crate::property::{
    ConnectorProperty, CrtcProperty, PlaneProperty, PropertyKind, PropertyTable, plane_type,
};
use crate::session::DeviceSession;
use crate::{KmsError, ModeInfo, Result};

/// Everything needed to drive one output.
#[derive(Debug, Default)]
pub struct OutputData {
    /// Connector name, e.g. `DP-1`
    pub name: String,
    pub conn_id: u32,
    pub enc_id: u32,
    pub crtc_id: u32,
    /// Primary plane
    pub pp_id: u32,
    /// Mode the output is driven with
    pub mode: ModeInfo,
    /// Property blob holding `mode`, 0 until enumerated
    pub mode_blob_id: u32,
    /// Duration of one refresh cycle
    pub refresh: Duration,
    /// Set by a successful commit or flip, cleared by its completion event
    pub flip_pending: bool,
    pub(crate) pending_user_data: u64,
    /// Modifiers the primary plane accepts for XRGB8888
    pub modifiers: Vec<u64>,
    pub plane_props: PropertyTable<PlaneProperty>,
    pub crtc_props: PropertyTable<CrtcProperty>,
    pub conn_props: PropertyTable<ConnectorProperty>,
    /// Buffer the display scans out
    pub current_buffer: Option<usize>,
    /// Buffer of the commit in flight
    pub pending_buffer: Option<usize>,
    /// The next commit has to carry the full mode
    pub needs_modeset: bool,
}

impl OutputData {
    pub fn is_enumerated(&self) -> bool {
        self.mode_blob_id != 0
    }

    pub fn size(&self) -> (u32, u32) {
        let (w, h) = self.mode.size();
        (w as u32, h as u32)
    }
}

/// Property tables of an output, by object class.
pub trait OutputObject: PropertyKind {
    fn table(output: &OutputData) -> &PropertyTable<Self>;
    fn object_id(output: &OutputData) -> u32;
}

impl OutputObject for PlaneProperty {
    fn table(output: &OutputData) -> &PropertyTable<Self> {
        &output.plane_props
    }

    fn object_id(output: &OutputData) -> u32 {
        output.pp_id
    }
}

impl OutputObject for CrtcProperty {
    fn table(output: &OutputData) -> &PropertyTable<Self> {
        &output.crtc_props
    }

    fn object_id(output: &OutputData) -> u32 {
        output.crtc_id
    }
}

impl OutputObject for ConnectorProperty {
    fn table(output: &OutputData) -> &PropertyTable<Self> {
        &output.conn_props
    }

    fn object_id(output: &OutputData) -> u32 {
        output.conn_id
    }
}

/// Positions of one output chain in the device resource lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainIndices {
    pub connector: usize,
    pub encoder: usize,
    pub crtc: usize,
    pub plane: usize,
}

/// Reads the live properties of an object and resolves them against the table of `K`.
pub(crate) fn load_properties<K: PropertyKind>(
    backend: &impl KmsBackend,
    id: u32,
) -> Result<(PropertyTable<K>, ObjectProperties)> {
    let live = backend
        .object_properties(ObjectRef::new(K::OBJECT, id))
        .map_err(query_failed(K::OBJECT))?;
    let defs = live
        .ids
        .iter()
        .map(|&prop| backend.property_def(prop))
        .collect::<Result<Vec<_>>>()
        .map_err(query_failed(ObjectKind::Property))?;

    let mut table: PropertyTable<K> = PropertyTable::new();
    table.populate(&defs)?;
    for (kind, _) in table.iter().filter(|(_, info)| !info.is_resolved()) {
        trace!("{} {id} does not expose {}", K::OBJECT, kind.name());
    }
    Ok((table, live))
}

fn is_primary_plane(backend: &impl KmsBackend, plane: &PlaneInfo) -> bool {
    match load_properties::<PlaneProperty>(backend, plane.id) {
        Ok((table, live)) => {
            table.value(PlaneProperty::Type, &live, plane_type::OVERLAY) == plane_type::PRIMARY
        }
        Err(err) => {
            debug!("Unable to read the type of plane {}: {err}", plane.id);
            false
        }
    }
}

fn pick(ids: &[u32], index: usize, kind: ObjectKind) -> Result<u32> {
    ids.get(index)
        .copied()
        .ok_or(KmsError::IndexOutOfRange { kind, index })
}

impl<B: KmsBackend> DeviceSession<B> {
    /// Finds the output chains of every connected connector.
    ///
    /// The chain follows the objects the kernel currently has bound. The plane is the one
    /// scanning out the crtc's framebuffer, or the first free primary plane that can drive the
    /// crtc when nothing is scanned out yet. Connectors without a complete chain are skipped.
    pub fn discover(&self) -> Result<Vec<ChainIndices>> {
        let backend = self.backend()?;
        let res = backend.resources()?;
        if !res.is_kms_capable() {
            return Err(KmsError::NotKmsCapable);
        }

        let encoders = res
            .encoders
            .iter()
            .map(|&id| backend.encoder(id))
            .collect::<Result<Vec<_>>>()
            .map_err(query_failed(ObjectKind::Encoder))?;
        let crtcs = res
            .crtcs
            .iter()
            .map(|&id| backend.crtc(id))
            .collect::<Result<Vec<_>>>()
            .map_err(query_failed(ObjectKind::Crtc))?;
        let planes = res
            .planes
            .iter()
            .map(|&id| backend.plane(id))
            .collect::<Result<Vec<_>>>()
            .map_err(query_failed(ObjectKind::Plane))?;

        let mut chains: Vec<ChainIndices> = Vec::new();
        for (connector_index, &connector_id) in res.connectors.iter().enumerate() {
            let connector = backend
                .connector(connector_id)
                .map_err(query_failed(ObjectKind::Connector))?;
            if !connector.connected {
                debug!("{} is disconnected", connector.name);
                continue;
            }

            let Some(encoder_index) = encoders
                .iter()
                .position(|e| connector.encoder_id != 0 && e.id == connector.encoder_id)
            else {
                debug!("{} has no encoder bound", connector.name);
                continue;
            };
            let crtc_id = encoders[encoder_index].crtc_id;
            let Some(crtc_index) = crtcs.iter().position(|c| crtc_id != 0 && c.id == crtc_id)
            else {
                debug!("{} has no crtc bound", connector.name);
                continue;
            };
            let crtc = &crtcs[crtc_index];

            let taken = |index: usize| chains.iter().any(|c| c.plane == index);
            let scanning_out = planes.iter().enumerate().position(|(i, p)| {
                !taken(i)
                    && crtc.buffer_id != 0
                    && p.crtc_id == crtc.id
                    && p.fb_id == crtc.buffer_id
            });
            let plane_index = scanning_out.or_else(|| {
                planes.iter().enumerate().position(|(i, p)| {
                    !taken(i) && p.possible_crtcs.contains(&crtc.id) && is_primary_plane(backend, p)
                })
            });
            let Some(plane_index) = plane_index else {
                warn!("No primary plane can drive crtc {} of {}", crtc.id, connector.name);
                continue;
            };

            info!(
                "Found output {}: encoder {}, crtc {}, plane {}",
                connector.name, encoders[encoder_index].id, crtc.id, planes[plane_index].id
            );
            chains.push(ChainIndices {
                connector: connector_index,
                encoder: encoder_index,
                crtc: crtc_index,
                plane: plane_index,
            });
        }

        Ok(chains)
    }

    /// Fills output record `out` from the objects at the given resource list positions.
    ///
    /// `refresh_millihz` overrides the refresh rate derived from the mode when non-zero.
    /// Enumerating an already enumerated record replaces it and releases its buffers. That is
    /// refused while the record has a flip in flight.
    #[allow(clippy::too_many_arguments)]
    pub fn enumerate(
        &mut self,
        out: usize,
        conn_index: usize,
        enc_index: usize,
        crtc_index: usize,
        plane_index: usize,
        refresh_millihz: u32,
        name: &str,
    ) -> Result<()> {
        let Some(backend) = self.backend.as_ref() else {
            return Err(KmsError::DeviceNotOpen);
        };
        if out >= self.outputs.len() {
            return Err(KmsError::OutputArrayNotAllocated);
        }
        if self.outputs[out].flip_pending {
            return Err(KmsError::FlipPending(out));
        }

        let res = backend.resources()?;
        if !res.is_kms_capable() {
            return Err(KmsError::NotKmsCapable);
        }

        let connector = backend
            .connector(pick(&res.connectors, conn_index, ObjectKind::Connector)?)
            .map_err(query_failed(ObjectKind::Connector))?;
        let encoder = backend
            .encoder(pick(&res.encoders, enc_index, ObjectKind::Encoder)?)
            .map_err(query_failed(ObjectKind::Encoder))?;
        let crtc = backend
            .crtc(pick(&res.crtcs, crtc_index, ObjectKind::Crtc)?)
            .map_err(query_failed(ObjectKind::Crtc))?;
        let plane = backend
            .plane(pick(&res.planes, plane_index, ObjectKind::Plane)?)
            .map_err(query_failed(ObjectKind::Plane))?;

        let mode = match crtc.mode {
            Some(mode) => mode,
            None => {
                let mode = connector
                    .preferred_mode()
                    .cloned()
                    .ok_or(KmsError::NoMode(connector.id))?;
                warn!(
                    "{name}: crtc {} has no mode set, using {}",
                    crtc.id, mode.name
                );
                mode
            }
        };

        let (plane_props, plane_live) = load_properties::<PlaneProperty>(backend, plane.id)?;
        let (crtc_props, _) = load_properties::<CrtcProperty>(backend, crtc.id)?;
        let (conn_props, conn_live) = load_properties::<ConnectorProperty>(backend, connector.id)?;

        let mut modifiers = Vec::new();
        populate_modifiers(backend, &plane_props, &plane_live, &mut modifiers)?;
        log_edid(backend, &conn_props, &conn_live, name);

        let millihz = match refresh_millihz {
            0 => mode.refresh_millihz(),
            rate => rate as u64,
        };
        let refresh = Duration::from_nanos(1_000_000_000_000 / millihz.max(1));

        let mode_blob_id = backend.create_mode_blob(&mode)?;

        let output = &mut self.outputs[out];
        if output.mode_blob_id != 0 {
            if let Err(err) = backend.destroy_blob(output.mode_blob_id) {
                warn!("Unable to destroy old mode blob {}: {err}", output.mode_blob_id);
            }
        }

        info!(
            "{name}: {}x{}@{}.{:03}Hz on crtc {}, {} modifiers",
            mode.hdisplay,
            mode.vdisplay,
            millihz / 1000,
            millihz % 1000,
            crtc.id,
            modifiers.len()
        );

        *output = OutputData {
            name: name.to_string(),
            conn_id: connector.id,
            enc_id: encoder.id,
            crtc_id: crtc.id,
            pp_id: plane.id,
            mode,
            mode_blob_id,
            refresh,
            modifiers,
            plane_props,
            crtc_props,
            conn_props,
            needs_modeset: true,
            ..Default::default()
        };
        for buffer in self.buffers.iter_mut().filter(|b| b.odid == out) {
            buffer.in_use = false;
        }

        Ok(())
    }

    /// Discovers every connected output and enumerates as many as there are free records.
    /// Returns the indices of the enumerated records.
    pub fn enumerate_all(&mut self) -> Result<Vec<usize>> {
        let chains = self.discover()?;
        let backend = self.backend()?;
        let res = backend.resources()?;
        let names = chains
            .iter()
            .map(|chain| {
                backend
                    .connector(res.connectors[chain.connector])
                    .map(|c| c.name)
            })
            .collect::<Result<Vec<_>>>()?;

        let available = self.outputs.capacity() - self.outputs.len();
        if chains.len() > available {
            warn!(
                "{} outputs found but only {available} can be driven",
                chains.len()
            );
        }
        let count = chains.len().min(available);
        let range = self.allocate_outputs(count)?;

        let mut enumerated = Vec::with_capacity(count);
        for (out, (chain, name)) in range.zip(chains.iter().zip(&names)) {
            match self.enumerate(
                out,
                chain.connector,
                chain.encoder,
                chain.crtc,
                chain.plane,
                0,
                name,
            ) {
                Ok(()) => enumerated.push(out),
                Err(err) => warn!("Unable to enumerate {name}: {err}"),
            }
        }

        Ok(enumerated)
    }
}
