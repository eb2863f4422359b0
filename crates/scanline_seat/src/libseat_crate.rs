//! Session helper backed by the `libseat` crate

use std::cell::Cell;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use libseat::{Device, Seat, SeatEvent};
use log::{debug, warn};

use crate::SessionHelper;

/// How long to wait for the seat to become active before giving up
const ENABLE_TIMEOUT_MS: i32 = 2000;

/// Safe wrapper around libseat using the `libseat` crate
pub struct LibSeat {
    seat: Seat,
    name: String,
    active: Rc<Cell<bool>>,
    /// Devices stay open for as long as the seat lives, closing them revokes the fds
    opened_devices: Vec<Device>,
}

impl LibSeat {
    /// Opens a seat and waits until it is enabled.
    pub fn new() -> anyhow::Result<Self> {
        let active = Rc::new(Cell::new(false));
        let active_clone = active.clone();

        let mut seat = Seat::open(move |_seat_ref, event| {
            debug!("Seat event received: {:?}", event);
            match event {
                SeatEvent::Enable => active_clone.set(true),
                SeatEvent::Disable => active_clone.set(false),
            }
        })
        .map_err(|e| anyhow::anyhow!("Failed to open seat: {}", e))?;

        while !active.get() {
            let count = seat
                .dispatch(ENABLE_TIMEOUT_MS)
                .map_err(|e| anyhow::anyhow!("Failed to dispatch seat events: {}", e))?;
            if count == 0 && !active.get() {
                anyhow::bail!("Seat was not enabled within {ENABLE_TIMEOUT_MS}ms");
            }
        }

        let name = seat.name().to_string();

        Ok(Self {
            seat,
            name,
            active,
            opened_devices: Vec::new(),
        })
    }

    /// Returns whether the session currently owns the seat.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}

impl SessionHelper for LibSeat {
    fn open_device(&mut self, path: &Path) -> anyhow::Result<OwnedFd> {
        if !self.is_active() {
            warn!("Opening {} while the seat is disabled", path.display());
        }

        let device = self
            .seat
            .open_device(&path)
            .map_err(|e| anyhow::anyhow!("Failed to open device {}: {}", path.display(), e))?;

        let fd = device
            .as_fd()
            .try_clone_to_owned()
            .context("Failed to duplicate seat device fd")?;
        self.opened_devices.push(device);

        Ok(fd)
    }

    fn seat_name(&self) -> &str {
        &self.name
    }
}

impl Drop for LibSeat {
    fn drop(&mut self) {
        for device in self.opened_devices.drain(..) {
            if let Err(e) = self.seat.close_device(device) {
                warn!("Failed to close seat device: {}", e);
            }
        }
    }
}
