//! Runtime configuration shared by the engine's components, assembled once
//! from [`cli::Opts`] and injected rather than read from globals (§9).

use std::{path::PathBuf, time::Duration};

use crate::cli::Opts;

/// Tunables of §6 `Configuration`, carried by every [`crate::session::Session`],
/// [`crate::pipe::StreamPipe`] and [`crate::transcoder::TranscoderEntry`] that
/// needs them.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Filesystem path to the transcoder executable.
    pub transcoder_path: PathBuf,
    /// Maximum chunks retained in a room's recent-chunk ring buffer.
    pub max_recent_buffer: usize,
    /// Grace period between `SIGTERM` and `SIGKILL` for a shut-down entry.
    pub child_shutdown_grace: Duration,
    /// Interval between periodic per-entry metrics ticks.
    pub metrics_interval: Duration,
    /// Leading bytes of a chunk scanned for the container-header magic.
    pub header_scan_limit: usize,
}

impl From<&Opts> for EngineConfig {
    fn from(opts: &Opts) -> Self {
        Self {
            transcoder_path: opts.transcoder_path.clone(),
            max_recent_buffer: opts.max_recent_buffer,
            child_shutdown_grace: Duration::from_millis(
                opts.child_shutdown_grace_ms,
            ),
            metrics_interval: Duration::from_millis(
                opts.metrics_interval_ms,
            ),
            header_scan_limit: opts.header_scan_limit,
        }
    }
}

#[cfg(test)]
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transcoder_path: PathBuf::from("/usr/local/bin/ffmpeg"),
            max_recent_buffer: 10,
            child_shutdown_grace: Duration::from_millis(2000),
            metrics_interval: Duration::from_millis(1000),
            header_scan_limit: 8192,
        }
    }
}
