use std::path::PathBuf;

use clap::Parser;

/// Global arguments provided at process start
#[derive(Debug, Clone, Parser)]
#[command(name = "scanline", about = "Drive DRM/KMS outputs with atomic commits")]
pub struct GlobalArgs {
    /// Preferred DRM primary node. All /dev/dri/card* nodes are tried otherwise
    #[arg(long)]
    pub device: Option<PathBuf>,
    /// Number of frames to present before exiting
    #[arg(long, default_value_t = 300)]
    pub frames: u32,
    /// Do not switch to a fresh virtual terminal
    #[arg(long)]
    pub no_vt: bool,
    /// Present with legacy page flips even if atomic mode-setting is available
    #[arg(long)]
    pub legacy: bool,
    /// Fall back to legacy mode-setting when the driver refuses the atomic capability
    #[arg(long)]
    pub allow_legacy: bool,
    /// Scanout buffers per output
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(2..=4))]
    pub buffers: u8,
    /// Allocate scanout buffers through GBM instead of CPU drawn dumb buffers
    #[arg(long)]
    pub gbm: bool,
    /// Log file, stderr is used when absent
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl GlobalArgs {
    /// Parse global arguments. `None` indicates that the program should exit.
    pub fn parse_from_env() -> Option<Self> {
        match Self::try_parse() {
            Ok(args) => Some(args),
            Err(err) => {
                // --help and --version end up here as well
                let _ = err.print();
                None
            }
        }
    }
}

impl Default for GlobalArgs {
    fn default() -> Self {
        Self {
            device: None,
            frames: 300,
            no_vt: false,
            legacy: false,
            allow_legacy: false,
            buffers: 2,
            gbm: false,
            log_file: None,
        }
    }
}
