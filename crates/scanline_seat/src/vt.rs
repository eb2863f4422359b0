//! Virtual terminal switching
//!
//! While a KMS client owns the display the kernel console must neither draw on top of it nor
//! turn keystrokes into tty input. [`VirtualTerminal::acquire`] moves to an unused VT, turns
//! the keyboard off and puts the VT in graphics mode. The previous state is put back by
//! [`VirtualTerminal::release`], which also runs on drop.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use anyhow::Context;
use log::{debug, info, warn};

const VT_OPENQRY: libc::c_ulong = 0x5600;
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;
const KDSETMODE: libc::c_ulong = 0x4B3A;
const KDGKBMODE: libc::c_ulong = 0x4B44;
const KDSKBMODE: libc::c_ulong = 0x4B45;

const KD_TEXT: libc::c_int = 0x00;
const KD_GRAPHICS: libc::c_int = 0x01;
const K_OFF: libc::c_int = 0x04;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

/// An acquired virtual terminal. Dropping it restores keyboard and text mode.
pub struct VirtualTerminal {
    tty: File,
    number: i32,
    previous: Option<i32>,
    saved_kb_mode: libc::c_int,
    released: bool,
}

fn vt_ioctl(
    file: &File,
    request: libc::c_ulong,
    arg: libc::c_ulong,
    call: &str,
) -> anyhow::Result<()> {
    // SAFETY: the fd is valid for the lifetime of `file` and `arg` is either a plain integer or
    // a pointer to storage the caller keeps alive for the duration of the call.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("{call} failed"));
    }
    Ok(())
}

fn open_tty(path: &str) -> anyhow::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
        .open(path)
        .with_context(|| format!("Failed to open {path}"))
}

impl VirtualTerminal {
    /// Switches to a free virtual terminal and prepares it for direct display output.
    pub fn acquire() -> anyhow::Result<Self> {
        let tty0 = open_tty("/dev/tty0")?;

        let mut state = VtStat::default();
        vt_ioctl(
            &tty0,
            VT_GETSTATE,
            &mut state as *mut VtStat as libc::c_ulong,
            "VT_GETSTATE",
        )?;

        let mut number: libc::c_int = -1;
        vt_ioctl(
            &tty0,
            VT_OPENQRY,
            &mut number as *mut libc::c_int as libc::c_ulong,
            "VT_OPENQRY",
        )?;
        if number <= 0 {
            anyhow::bail!("No free virtual terminal available");
        }

        let tty = open_tty(&format!("/dev/tty{number}"))?;
        debug!("Opened VT {number}, previously active VT {}", state.v_active);

        // From here on the partially set up VT is restored on every exit path by Drop
        let mut vt = Self {
            tty,
            number,
            previous: Some(state.v_active as i32).filter(|&n| n > 0 && n != number),
            saved_kb_mode: -1,
            released: false,
        };

        vt_ioctl(&vt.tty, VT_ACTIVATE, number as libc::c_ulong, "VT_ACTIVATE")?;
        vt_ioctl(&vt.tty, VT_WAITACTIVE, number as libc::c_ulong, "VT_WAITACTIVE")?;

        let mut kb_mode: libc::c_int = 0;
        vt_ioctl(
            &vt.tty,
            KDGKBMODE,
            &mut kb_mode as *mut libc::c_int as libc::c_ulong,
            "KDGKBMODE",
        )?;
        vt.saved_kb_mode = kb_mode;

        vt_ioctl(&vt.tty, KDSKBMODE, K_OFF as libc::c_ulong, "KDSKBMODE")?;
        vt_ioctl(&vt.tty, KDSETMODE, KD_GRAPHICS as libc::c_ulong, "KDSETMODE")?;

        info!("Acquired VT {number}");

        Ok(vt)
    }

    /// Restores keyboard and text mode and switches back to the previous VT. Safe to call more
    /// than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.saved_kb_mode >= 0 {
            let mode = self.saved_kb_mode as libc::c_ulong;
            if let Err(e) = vt_ioctl(&self.tty, KDSKBMODE, mode, "KDSKBMODE") {
                warn!("Unable to restore keyboard mode: {e:#}");
            }
        }
        if let Err(e) = vt_ioctl(&self.tty, KDSETMODE, KD_TEXT as libc::c_ulong, "KDSETMODE") {
            warn!("Unable to restore text mode: {e:#}");
        }
        if let Some(previous) = self.previous {
            let target = previous as libc::c_ulong;
            if let Err(e) = vt_ioctl(&self.tty, VT_ACTIVATE, target, "VT_ACTIVATE") {
                warn!("Unable to switch back to VT {previous}: {e:#}");
            }
        }

        info!("Released VT {}", self.number);
    }
}

impl Drop for VirtualTerminal {
    fn drop(&mut self) {
        self.release();
    }
}
