//! Live-stream ingest-to-RTMP relay server: ingests a WebM/Matroska byte
//! stream over a message-channel (§6) and fans it out to `N` external
//! RTMP/RTMPS ingest endpoints via per-destination transcoder child
//! processes, through a per-room [`pipe::StreamPipe`].

#![forbid(non_ascii_idents, unsafe_code)]
#![deny(
    deprecated_in_future,
    macro_use_extern_crate,
    rust_2018_idioms,
    rust_2021_compatibility,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces
)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    unreachable_pub,
    unused_lifetimes,
    unused_qualifications
)]

pub mod cli;
pub mod config;
pub mod destination;
pub mod error;
pub mod event;
pub mod gateway;
pub mod header;
pub mod pipe;
pub mod process;
pub mod room;
pub mod server;
pub mod session;
pub mod transcoder;

pub use cli::Opts;

/// Runs the ingest relay server to completion: parses CLI [`Opts`],
/// initializes logging, and serves the gateway until an OS shutdown signal
/// is received.
///
/// Returns the process [`std::process::ExitCode`] documented in §6 of the
/// specification this crate implements.
pub async fn run() -> std::process::ExitCode {
    let opts = Opts::from_args();

    let level = if opts.debug {
        Some(relay_log::slog::Level::Debug)
    } else {
        opts.verbose
    };
    let _guard = relay_log::init(level);

    server::run(opts).await
}
