use std::{
    fs::OpenOptions,
    io::{self, Write},
    os::fd::AsRawFd,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use env_logger::{Builder, Target};
use log::{debug, error, info, trace, warn};
use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use scanline_kms::{DeviceSession, DrmDevice, FlipHandler, KmsError, SessionConfig};
use scanline_seat::open_session;
use scanline_shared::GlobalArgs;

const DRM_TOKEN: Token = Token(0);
const MAX_OUTPUTS: usize = 8;

fn main() -> anyhow::Result<()> {
    let Some(global_args) = GlobalArgs::parse_from_env() else {
        return Ok(());
    };

    init_logger(global_args.log_file.as_deref())?;

    run_app(&global_args).inspect_err(|err| error!("An error occurred: {err:#}"))
}

fn init_logger(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = Builder::from_default_env();
    if let Some(log_file) = log_file {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("Failed to open log file")?;
        builder.target(Target::Pipe(Box::new(log_file)));
    }
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{:<5}] {}: {}",
            record.level(),
            thread::current().name().unwrap_or("<unnamed>"),
            record.args()
        )
    });
    builder.init();

    Ok(())
}

/// Collects the completion events of the presentation loop
#[derive(Debug, Default)]
struct FrameStats {
    completed: u64,
    last_flip: Option<Duration>,
    slowest_interval: Duration,
}

impl FlipHandler for FrameStats {
    fn page_flip(&mut self, output: usize, sequence: u32, timestamp: Duration, user_data: u64) {
        trace!("Frame {user_data} of output {output} shown at vblank {sequence}");
        if let Some(last) = self.last_flip {
            self.slowest_interval = self.slowest_interval.max(timestamp.saturating_sub(last));
        }
        self.last_flip = Some(timestamp);
        self.completed += 1;
    }
}

/// Opens the device, lights up every connected output and presents `frames` frames on them.
fn run_app(args: &GlobalArgs) -> anyhow::Result<()> {
    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&terminate))
            .context("Unable to register signal handler")?;
    }

    let mut seat = open_session().context("Unable to open a seat")?;
    info!("Using seat {}", seat.seat_name());

    let buffers_per_output = args.buffers as usize;
    let mut session = DeviceSession::<DrmDevice>::new(SessionConfig {
        allow_legacy: args.allow_legacy,
        force_legacy: args.legacy,
        max_outputs: MAX_OUTPUTS,
        max_buffers: MAX_OUTPUTS * buffers_per_output,
    });
    session
        .open(seat.as_mut(), args.device.as_deref())
        .context("Unable to open a DRM device")?;

    if !args.no_vt {
        session
            .acquire_vt()
            .context("Unable to switch to a free virtual terminal")?;
    }

    let outputs = session.enumerate_all()?;
    if outputs.is_empty() {
        anyhow::bail!("No connected output could be enumerated");
    }

    for &odid in &outputs {
        if args.gbm {
            session.create_gbm_buffers(odid, buffers_per_output)?;
        } else {
            session.create_dumb_buffers(odid, buffers_per_output)?;
        }
    }

    // The first frame of every output goes through a blocking mode-set
    for &odid in &outputs {
        let buffer = session
            .free_buffer(odid)
            .context("Output has no scanout buffer")?;
        session.draw_frame(buffer, 0)?;
        session.modeset_legacy(buffer)?;
    }

    let mut stats = FrameStats::default();
    let presented = present_loop(&mut session, &outputs, args.frames, &terminate, &mut stats)?;

    drain_flips(&mut session, &mut stats)?;
    session.close();

    info!(
        "Presented {presented} frames, {} completed, slowest interval {:?}",
        stats.completed, stats.slowest_interval
    );

    Ok(())
}

/// Presents frames on every output that has no flip pending, then waits for completions.
fn present_loop(
    session: &mut DeviceSession<DrmDevice>,
    outputs: &[usize],
    frames: u32,
    terminate: &AtomicBool,
    stats: &mut FrameStats,
) -> anyhow::Result<u64> {
    let mut poll = Poll::new().context("Unable to create poll")?;
    let mut events = Events::with_capacity(16);
    let fd = session.event_fd()?.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), DRM_TOKEN, Interest::READABLE)
        .context("Unable to register the DRM fd")?;

    let refresh = session.output(outputs[0])?.refresh;
    let timeout = (refresh * 4).max(Duration::from_millis(50));

    let mut presented = 0;
    let mut frame = 1;
    while frame < frames && !terminate.load(Ordering::Relaxed) {
        let mut submitted = false;
        for &odid in outputs {
            if session.output(odid)?.flip_pending {
                continue;
            }
            let Some(buffer) = session.free_buffer(odid) else {
                debug!("Output {odid} has no free buffer");
                continue;
            };

            session.draw_frame(buffer, frame)?;
            match session.present(buffer, frame as u64) {
                Ok(()) => {
                    presented += 1;
                    submitted = true;
                }
                Err(err @ (KmsError::FlipPending(_) | KmsError::BufferBusy(_))) => {
                    debug!("Skipping output {odid}: {err}");
                }
                Err(err) => return Err(err).context("Unable to present a frame"),
            }
        }
        if submitted {
            frame += 1;
        }

        match poll.poll(&mut events, Some(timeout)) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => result.context("Unable to poll the DRM fd")?,
        }
        if events.iter().any(|event| event.token() == DRM_TOKEN) {
            session.handle_event(stats)?;
        } else {
            warn!("No completion event within {timeout:?}");
        }
    }

    Ok(presented)
}

/// Waits for the flips still in flight so their buffers are not removed while scanned out.
fn drain_flips(
    session: &mut DeviceSession<DrmDevice>,
    stats: &mut FrameStats,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + Duration::from_millis(500);
    while session.outputs().any(|o| o.flip_pending) {
        if Instant::now() > deadline {
            warn!("Flips still pending at shutdown");
            break;
        }
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(4);
        let fd = session.event_fd()?.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), DRM_TOKEN, Interest::READABLE)?;
        poll.poll(&mut events, Some(Duration::from_millis(100)))?;
        if !events.is_empty() {
            session.handle_event(stats)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_stats_track_the_slowest_interval() {
        let mut stats = FrameStats::default();

        stats.page_flip(0, 1, Duration::from_millis(100), 1);
        stats.page_flip(0, 2, Duration::from_millis(117), 2);
        stats.page_flip(0, 3, Duration::from_millis(150), 3);

        assert_eq!(stats.completed, 3);
        assert_eq!(stats.slowest_interval, Duration::from_millis(33));
        assert_eq!(stats.last_flip, Some(Duration::from_millis(150)));
    }
}
