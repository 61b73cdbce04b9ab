//! Logging tools and their initialization.
//!
//! Thin wrapper around [`slog`] giving the rest of the workspace a single
//! place to install and reach the global logger, mirroring how the ingest
//! engine this crate supports is itself a thin wrapper around an external
//! process.

#![deny(
    missing_debug_implementations,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code
)]
#![warn(
    deprecated_in_future,
    missing_docs,
    unreachable_pub,
    unused_import_braces,
    unused_labels,
    unused_lifetimes,
    unused_qualifications
)]

pub use slog::{self, Drain};
pub use slog_scope::{self as log, logger};

/// Initializes the global logger with the given verbosity `level` ([`Error`]
/// by default, if [`None`]), returning its guard that should be held as long
/// as the program runs.
///
/// [`Error`]: slog::Level::Error
#[must_use]
pub fn init(level: Option<slog::Level>) -> slog_scope::GlobalLoggerGuard {
    let guard = slog_scope::set_global_logger(main_logger(
        level.unwrap_or(slog::Level::Error),
    ));
    slog_stdlog::init().unwrap();
    guard
}

/// Creates, configures and returns the main [`Logger`] of the application.
///
/// [`Logger`]: slog::Logger
#[must_use]
pub fn main_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain as _;
    use slog_async::OverflowStrategy::Drop;

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();

    let drain = drain
        .filter_level(level)
        .filter(|rec| {
            // Disable annoying DEBUG logs from `hyper`, pulled in transitively
            // by the `axum` gateway.
            !(rec.level() == slog::Level::Debug
                && rec.module().starts_with("hyper::"))
        })
        .fuse();

    let drain = slog_async::Async::new(drain)
        .overflow_strategy(Drop)
        .build()
        .fuse();

    slog::Logger::root(drain, slog::o!())
}
