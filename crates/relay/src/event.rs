//! Outbound events of §6, flowing from the engine back towards the gateway
//! and, through it, to connected clients.
//!
//! Each [`crate::pipe::StreamPipe`] owns a broadcast channel of these; the
//! gateway layer subscribes to a room's channel for as long as any client is
//! joined to it and re-emits them over the wire.

use serde::Serialize;
use serde_json::json;
use smart_default::SmartDefault;

use crate::{
    destination::Platform,
    room::{RoomId, UserId},
    transcoder::Stats,
};

/// Status of a single destination's transcoder, mirroring the badge states a
/// broadcaster sees transition in §7.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, SmartDefault)]
#[serde(rename_all = "lowercase")]
pub enum PlatformStatus {
    /// No transcoder running for this destination.
    #[default]
    Idle,
    /// Transcoder spawned, awaiting the streaming-confirmed stderr signal.
    Connecting,
    /// Streaming confirmed by the stderr classifier.
    Streaming,
    /// Destination failed (spawn failure, write failure or fatal ingest
    /// signal).
    Error,
    /// A `test-rtmp-stream` probe is in flight.
    Testing,
}

/// Queue status of a single [`crate::transcoder::TranscoderEntry`], as
/// reported by `getQueueStatus` in §4.3.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct QueueStatus {
    /// Whether a write is currently in flight.
    pub is_writing: bool,
    /// Whether the entry can currently accept more data.
    pub can_accept_data: bool,
    /// Consecutive pushes that observed backpressure on this entry.
    pub consecutive_backpressure: u32,
}

/// Event emitted by the engine, scoped to a room unless noted otherwise.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum EngineEvent {
    /// `rtmp-stream-started`, addressed to the caller of `start-rtmp-stream`.
    RtmpStreamStarted {
        /// Room this event concerns.
        room_id: RoomId,
        /// Platforms that started successfully.
        destinations: Vec<Platform>,
        /// Platforms that failed to start, with a reason each.
        failed: Vec<(Platform, String)>,
        /// `true` once a header has been captured and flush ran; `false`
        /// while destinations are merely queued awaiting a header.
        queued: bool,
    },

    /// `rtmp-stream-stopped`.
    RtmpStreamStopped {
        /// Room this event concerns.
        room_id: RoomId,
        /// The specific platform stopped, or `None` if the whole pipe was
        /// torn down.
        platform: Option<Platform>,
    },

    /// `rtmp-stream-error`, a room- or destination-scoped failure that does
    /// not stop the whole pipe.
    RtmpStreamError {
        /// Room this event concerns.
        room_id: RoomId,
        /// The platform this error concerns, if destination-scoped.
        platform: Option<Platform>,
        /// Human-readable message.
        message: String,
        /// Machine-readable error category, e.g. `invalid_destination`.
        details: Option<String>,
    },

    /// `rtmp-platform-status`.
    RtmpPlatformStatus {
        /// Room this event concerns.
        room_id: RoomId,
        /// Platform whose status changed.
        platform: Platform,
        /// The new status.
        status: PlatformStatus,
        /// Present when `status == Error`.
        error: Option<String>,
    },

    /// `rtmp-platform-metrics`, emitted on the periodic metrics tick of
    /// §4.3.
    RtmpPlatformMetrics {
        /// Room this event concerns.
        room_id: RoomId,
        /// Platform these metrics concern.
        platform: Platform,
        /// OS process id of the transcoder.
        pid: u32,
        /// Current counters.
        stats: Stats,
        /// Current write-queue status.
        queue: QueueStatus,
        /// Tail of the transcoder's stderr, capped at 16 KiB upstream.
        last_stderr: String,
    },

    /// `request-media-header`, broadcast to the room so the broadcaster
    /// restarts its encoder to regenerate a header.
    RequestMediaHeader {
        /// Room this event concerns.
        room_id: RoomId,
    },

    /// `user-connected`, forwarded to the other members of a room on
    /// `join-room`.
    UserConnected {
        /// Room this event concerns.
        room_id: RoomId,
        /// The user that joined.
        user_id: UserId,
    },

    /// `user-disconnected`, forwarded to a room on `disconnect`.
    UserDisconnected {
        /// Room this event concerns.
        room_id: RoomId,
        /// The user that left.
        user_id: UserId,
    },
}

impl EngineEvent {
    /// Room this event is scoped to.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::RtmpStreamStarted { room_id, .. }
            | Self::RtmpStreamStopped { room_id, .. }
            | Self::RtmpStreamError { room_id, .. }
            | Self::RtmpPlatformStatus { room_id, .. }
            | Self::RtmpPlatformMetrics { room_id, .. }
            | Self::RequestMediaHeader { room_id }
            | Self::UserConnected { room_id, .. }
            | Self::UserDisconnected { room_id, .. } => room_id,
        }
    }

    /// The wire event name this variant is emitted under, per §6's outbound
    /// events table. Distinct from the internal Rust variant name, which
    /// exists only for this process's own bookkeeping.
    #[must_use]
    pub fn io_event_name(&self) -> &'static str {
        match self {
            Self::RtmpStreamStarted { .. } => "rtmp-stream-started",
            Self::RtmpStreamStopped { .. } => "rtmp-stream-stopped",
            Self::RtmpStreamError { .. } => "rtmp-stream-error",
            Self::RtmpPlatformStatus { .. } => "rtmp-platform-status",
            Self::RtmpPlatformMetrics { .. } => "rtmp-platform-metrics",
            Self::RequestMediaHeader { .. } => "request-media-header",
            Self::UserConnected { .. } => "user-connected",
            Self::UserDisconnected { .. } => "user-disconnected",
        }
    }

    /// The JSON payload this variant is emitted with, matching the shapes
    /// documented in §6's outbound events table (which differ slightly from
    /// this type's own serialization, e.g. dropping the `room_id` that the
    /// gateway already conveys via the socket.io room scope).
    #[must_use]
    pub fn io_payload(&self) -> serde_json::Value {
        match self {
            Self::RtmpStreamStarted {
                destinations,
                failed,
                queued,
                ..
            } => json!({
                "success": failed.is_empty(),
                "message": if *queued {
                    "queued"
                } else if failed.is_empty() {
                    "streaming"
                } else {
                    "partial"
                },
                "destinations": destinations,
                "failed": failed.iter().map(|(platform, error)| {
                    json!({ "platform": platform, "error": error })
                }).collect::<Vec<_>>(),
            }),
            Self::RtmpStreamStopped { platform, .. } => json!({
                "success": true,
                "platform": platform,
                "message": "stopped",
            }),
            Self::RtmpStreamError {
                platform,
                message,
                details,
                ..
            } => json!({
                "success": false,
                "message": message,
                "platform": platform,
                "details": details,
            }),
            Self::RtmpPlatformStatus {
                platform,
                status,
                error,
                ..
            } => json!({
                "platform": platform,
                "status": status,
                "error": error,
            }),
            Self::RtmpPlatformMetrics {
                room_id,
                platform,
                pid,
                stats,
                queue,
                last_stderr,
            } => json!({
                "roomId": room_id,
                "platform": platform,
                "pid": pid,
                "stats": stats,
                "queue": queue,
                "lastStderr": last_stderr,
            }),
            Self::RequestMediaHeader { room_id } => json!({
                "roomId": room_id,
            }),
            Self::UserConnected { user_id, .. }
            | Self::UserDisconnected { user_id, .. } => json!(user_id),
        }
    }
}
