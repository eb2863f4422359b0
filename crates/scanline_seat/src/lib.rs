//! Permissioned device access and virtual terminal handling
//!
//! Opening a DRM primary node with master privileges normally needs root. A session helper
//! (libseat talking to logind or seatd) hands out device fds to unprivileged processes instead.
//! Without the `libseat` feature the nodes are opened directly.

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::Context;
use log::{debug, info};

#[cfg(feature = "libseat")]
mod libseat_crate;
mod vt;

#[cfg(feature = "libseat")]
pub use libseat_crate::LibSeat;
pub use vt::VirtualTerminal;

/// Something that can hand out file descriptors for device nodes.
pub trait SessionHelper {
    /// Opens the device node at `path` for reading and writing.
    fn open_device(&mut self, path: &Path) -> anyhow::Result<OwnedFd>;

    /// Name of the seat the devices belong to.
    fn seat_name(&self) -> &str;
}

/// Opens device nodes with plain `open(2)`. Only works for root or members of the `video`
/// group that are not competing with a running compositor.
#[derive(Debug, Default)]
pub struct DirectSession;

impl SessionHelper for DirectSession {
    fn open_device(&mut self, path: &Path) -> anyhow::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        debug!("Opened {} directly", path.display());

        Ok(file.into())
    }

    fn seat_name(&self) -> &str {
        "seat0"
    }
}

/// Opens the session helper available in this build.
pub fn open_session() -> anyhow::Result<Box<dyn SessionHelper>> {
    #[cfg(feature = "libseat")]
    {
        let seat = LibSeat::new()?;
        info!("Using libseat session on {}", seat.seat_name());
        Ok(Box::new(seat))
    }

    #[cfg(not(feature = "libseat"))]
    {
        info!("Using direct device access");
        Ok(Box::new(DirectSession))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_session_reports_missing_node() {
        let mut session = DirectSession;
        let err = session
            .open_device(Path::new("/dev/dri/this-node-does-not-exist"))
            .unwrap_err();

        assert!(format!("{err}").contains("this-node-does-not-exist"));
    }

    #[test]
    fn direct_session_opens_regular_nodes() {
        let mut session = DirectSession;
        assert!(session.open_device(Path::new("/dev/null")).is_ok());
        assert_eq!(session.seat_name(), "seat0");
    }
}
