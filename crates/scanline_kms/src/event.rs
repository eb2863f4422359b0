//! Completion event dispatch

use std::time::Duration;

use log::{trace, warn};

use crate::backend::{KmsBackend, KmsEvent};
use crate::session::DeviceSession;
use crate::Result;

/// Receives completion events read by [`DeviceSession::handle_event`].
pub trait FlipHandler {
    /// The commit or flip of `output` completed. `user_data` is the value passed when it was
    /// submitted.
    fn page_flip(&mut self, output: usize, sequence: u32, timestamp: Duration, user_data: u64);

    fn vblank(&mut self, crtc_id: u32, sequence: u32, timestamp: Duration) {
        trace!("vblank {sequence} on crtc {crtc_id} at {timestamp:?}");
    }
}

impl<B: KmsBackend> DeviceSession<B> {
    /// Reads the pending events from the device and dispatches them to `handler`.
    ///
    /// A page flip event ends the flip pending on the output driving its crtc: the committed
    /// buffer becomes the one on screen and the buffer it replaced is free again. Flip events
    /// for outputs without a flip pending are ignored. Returns the number of events read.
    pub fn handle_event(&mut self, handler: &mut impl FlipHandler) -> Result<usize> {
        let events = self.backend()?.read_events()?;

        for event in &events {
            match *event {
                KmsEvent::PageFlip {
                    crtc_id,
                    sequence,
                    timestamp,
                } => self.complete_flip(crtc_id, sequence, timestamp, handler),
                KmsEvent::Vblank {
                    crtc_id,
                    sequence,
                    timestamp,
                } => handler.vblank(crtc_id, sequence, timestamp),
            }
        }

        Ok(events.len())
    }

    fn complete_flip(
        &mut self,
        crtc_id: u32,
        sequence: u32,
        timestamp: Duration,
        handler: &mut impl FlipHandler,
    ) {
        let Some(odid) = self
            .outputs
            .iter()
            .position(|o| o.is_enumerated() && o.crtc_id == crtc_id && o.flip_pending)
        else {
            warn!("Ignoring page flip on crtc {crtc_id} without a flip pending");
            return;
        };

        let output = &mut self.outputs[odid];
        output.flip_pending = false;
        let user_data = std::mem::take(&mut output.pending_user_data);
        let previous = match output.pending_buffer.take() {
            Some(buffer) => output.current_buffer.replace(buffer),
            None => None,
        };
        let current = output.current_buffer;
        if let Some(previous) = previous.filter(|&p| Some(p) != current) {
            self.buffers[previous].in_use = false;
        }

        trace!("Flip {sequence} completed on output {odid}");
        handler.page_flip(odid, sequence, timestamp, user_data);
    }
}
