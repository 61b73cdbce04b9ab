//! Typed errors that cross the wire to a connected client.
//!
//! Internal plumbing (state mutation, process spawning, file IO) propagates
//! [`anyhow::Error`] with added context, following the teacher's own style
//! throughout `state.rs`/`srs.rs`. Errors that are surfaced to a broadcaster
//! over the gateway, however, need a stable `code` and a `Display` message,
//! so they are a closed [`thiserror`]-derived enum instead.

use serde::Serialize;

/// Error surfaced to a connected client via `rtmp-stream-error` or an
/// ack-callback `error` field.
#[derive(Clone, Debug, thiserror::Error, Serialize)]
#[serde(tag = "code", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayError {
    /// A destination descriptor failed validation (§3 `Destination
    /// Descriptor` invariants).
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// The transcoder binary failed to spawn for a destination.
    #[error("failed to start transcoder: {0}")]
    SpawnFailed(String),

    /// A write to a transcoder's standard input failed.
    #[error("write to transcoder failed: {0}")]
    WriteFailed(String),

    /// The stderr classifier observed a fatal ingest signal (§4.3).
    #[error("transcoder reported a fatal error: {0}")]
    FatalIngestSignal(String),

    /// An inbound gateway message was malformed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The room named in a request has no active stream pipe.
    #[error("no active stream for room '{0}'")]
    UnknownRoom(String),
}

impl RelayError {
    /// Short machine-readable category, suitable for the stderr-classifier
    /// parallel in `rtmp-platform-status{error}` payloads.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidDestination(_) => "invalid_destination",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::WriteFailed(_) => "write_failed",
            Self::FatalIngestSignal(_) => "fatal_ingest_signal",
            Self::InvalidMessage(_) => "invalid_message",
            Self::UnknownRoom(_) => "unknown_room",
        }
    }
}
