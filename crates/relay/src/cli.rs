//! CLI (command line interface).

use std::{net::IpAddr, path::PathBuf, str::FromStr as _};

use anyhow::anyhow;
use relay_log::slog;
use structopt::StructOpt;

/// CLI (command line interface) of the ingest relay server.
#[derive(Clone, Debug, StructOpt)]
#[structopt(about = "Live-stream ingest-to-RTMP relay server")]
pub struct Opts {
    /// Debug mode of the server.
    #[structopt(short, long, help = "Enables debug mode")]
    pub debug: bool,

    /// IP address for the server to listen client connections on.
    #[structopt(
        long,
        env = "RELAY_CLIENT_IP",
        default_value = "0.0.0.0",
        help = "IP to listen client gateway connections on"
    )]
    pub client_ip: IpAddr,

    /// Port for the server to listen client connections on.
    #[structopt(
        long,
        env = "RELAY_CLIENT_PORT",
        default_value = "8080",
        help = "Port to listen client gateway connections on"
    )]
    pub client_port: u16,

    /// Path to the transcoder binary.
    #[structopt(
        short,
        long,
        env = "RELAY_TRANSCODER_PATH",
        default_value = "/usr/local/bin/ffmpeg",
        help = "Path to the transcoder binary"
    )]
    pub transcoder_path: PathBuf,

    /// Maximum number of recent chunks retained per room for late-joining
    /// destinations to replay, per §5.
    #[structopt(
        long,
        env = "RELAY_MAX_RECENT_BUFFER",
        default_value = "10",
        help = "Max recent chunks retained per room"
    )]
    pub max_recent_buffer: usize,

    /// Grace period between `SIGTERM` and `SIGKILL` when shutting a
    /// transcoder entry down.
    #[structopt(
        long,
        env = "RELAY_CHILD_SHUTDOWN_GRACE_MS",
        default_value = "2000",
        help = "Grace period (ms) between SIGTERM and SIGKILL"
    )]
    pub child_shutdown_grace_ms: u64,

    /// Interval between periodic per-entry metrics ticks.
    #[structopt(
        long,
        env = "RELAY_METRICS_INTERVAL_MS",
        default_value = "1000",
        help = "Interval (ms) between metrics ticks"
    )]
    pub metrics_interval_ms: u64,

    /// Number of leading bytes of a chunk scanned for the container-header
    /// magic.
    #[structopt(
        long,
        env = "RELAY_HEADER_SCAN_LIMIT",
        default_value = "8192",
        help = "Leading bytes scanned for the container-header magic"
    )]
    pub header_scan_limit: usize,

    /// Verbosity level of the server logs.
    #[structopt(
        short,
        long,
        parse(try_from_str = Self::parse_log_level),
        help = "Logs verbosity level: \
                OFF | CRIT | ERRO | WARN | INFO | DEBG | TRCE"
    )]
    pub verbose: Option<slog::Level>,
}

impl Opts {
    /// Parses CLI [`Opts`] from command line arguments.
    ///
    /// Prints the error message and quits the program in case of failure.
    #[inline]
    #[must_use]
    pub fn from_args() -> Self {
        <Self as StructOpt>::from_args()
    }

    /// Parses [`slog::Level`] from the given string.
    ///
    /// # Errors
    ///
    /// If [`slog::Level`] failed to parse from the string.
    pub fn parse_log_level(lvl: &str) -> Result<slog::Level, anyhow::Error> {
        #[allow(clippy::map_err_ignore)]
        slog::Level::from_str(lvl).map_err(|_| {
            anyhow!(
                "'{}' is invalid verbosity level, allowed levels are: \
                 OFF | CRIT | ERRO | WARN | INFO | DEBG | TRCE",
                lvl,
            )
        })
    }
}
