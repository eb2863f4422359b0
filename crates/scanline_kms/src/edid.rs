//! EDID logging

use log::{info, warn};

use crate::backend::{KmsBackend, ObjectProperties};
use crate::property::{ConnectorProperty, PropertyTable};

/// Logs what the EDID of a connector says about the attached monitor. Failures only warn.
pub(crate) fn log_edid(
    backend: &impl KmsBackend,
    props: &PropertyTable<ConnectorProperty>,
    live: &ObjectProperties,
    name: &str,
) {
    let blob_id = props.value(ConnectorProperty::Edid, live, 0);
    if blob_id == 0 {
        warn!("{name}: no EDID");
        return;
    }

    match backend.blob_data(blob_id as u32) {
        Ok(data) => describe(&data, name),
        Err(err) => warn!("{name}: unable to read EDID: {err}"),
    }
}

#[cfg(feature = "edid")]
fn describe(data: &[u8], name: &str) {
    match libdisplay_info::info::Info::parse_edid(data) {
        Ok(info) => info!(
            "{name}: {} {} (serial {})",
            info.make().unwrap_or_else(|| String::from("Unknown")),
            info.model().unwrap_or_else(|| String::from("Unknown")),
            info.serial().unwrap_or_default()
        ),
        Err(err) => warn!("{name}: unable to parse EDID: {err}"),
    }
}

#[cfg(not(feature = "edid"))]
fn describe(data: &[u8], name: &str) {
    info!("{name}: EDID of {} bytes", data.len());
}
