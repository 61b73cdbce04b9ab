//! Session Manager (§4.5): one instance per server. Owns the `room → Stream
//! Pipe` mapping, serializes per-room chunk processing and handles the
//! inbound message-channel protocol of §6.

use std::{collections::HashMap, sync::Arc, time::Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use relay_log::log;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::{
    config::EngineConfig,
    destination::Destination,
    error::RelayError,
    event::EngineEvent,
    header,
    pipe::StreamPipe,
    room::{RoomId, UserId},
};

/// Result of [`Session::stream_data`], matching the ack-callback shape of
/// §6's `stream-data` row.
#[derive(Clone, Debug, serde::Serialize)]
pub struct StreamDataAck {
    /// Backpressure signal: `false` tells the broadcaster to pause.
    #[serde(rename = "shouldContinue")]
    pub should_continue: bool,
    /// Wall-clock time this chunk took to process, in milliseconds.
    #[serde(rename = "processingTime")]
    pub processing_time_ms: u128,
    /// Unix timestamp (milliseconds) this ack was produced at.
    pub timestamp: u64,
    /// Present if the inbound message was rejected outright.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of [`Session::can_resume`], matching §6's `can-resume` callback
/// shape.
#[derive(Clone, Debug, serde::Serialize)]
pub struct CanResumeReply {
    /// Whether the broadcaster may resume sending chunks.
    #[serde(rename = "shouldResume")]
    pub should_resume: bool,
    /// `idle` if there is no active pipe for the room, `streaming` if one
    /// exists and can accept data, `backpressure` otherwise.
    pub status: &'static str,
}

/// Outcome of [`Session::start_rtmp_stream`]: the event addressed to the
/// caller plus the pipe now backing the room, used by the gateway to attach
/// its per-room forwarder if this is the first activity in the room.
#[derive(Debug)]
pub struct StartOutcome {
    /// Event to emit back to the caller only (not broadcast to the room).
    pub to_caller: EngineEvent,
    /// The room's [`StreamPipe`], for the gateway to subscribe to if it has
    /// not already.
    pub pipe: Arc<StreamPipe>,
}

/// One instance per server: owns the `room → Stream Pipe` mapping and
/// enforces the single-writer-per-room rule of §4.5.
#[derive(Debug)]
pub struct Session {
    config: Arc<EngineConfig>,
    rooms: Mutex<HashMap<RoomId, Arc<StreamPipe>>>,
    processing_locks: Mutex<HashMap<RoomId, Arc<AsyncMutex<()>>>>,
    socket_users: Mutex<HashMap<String, UserId>>,
}

impl Session {
    /// Creates a new, empty [`Session`].
    #[must_use]
    pub fn new(config: Arc<EngineConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms: Mutex::new(HashMap::new()),
            processing_locks: Mutex::new(HashMap::new()),
            socket_users: Mutex::new(HashMap::new()),
        })
    }

    /// Obtains the [`StreamPipe`] for `room_id`, creating it (per the
    /// lifecycle of §3: "created on first activity for a room") if absent.
    fn ensure_pipe(&self, room_id: &RoomId) -> Arc<StreamPipe> {
        let mut rooms = self.rooms.lock();
        Arc::clone(
            rooms
                .entry(room_id.clone())
                .or_insert_with(|| {
                    StreamPipe::new(room_id.clone(), Arc::clone(&self.config))
                }),
        )
    }

    /// Looks up an existing [`StreamPipe`] for `room_id`, without creating
    /// one.
    #[must_use]
    pub fn find_pipe(&self, room_id: &RoomId) -> Option<Arc<StreamPipe>> {
        self.rooms.lock().get(room_id).cloned()
    }

    fn processing_lock(&self, room_id: &RoomId) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.processing_locks
                .lock()
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// `register-user(userId)` of §4.5.
    pub fn register_user(&self, connection_id: &str, user_id: UserId) {
        self.socket_users
            .lock()
            .insert(connection_id.to_owned(), user_id);
    }

    /// Looks up the user registered for `connection_id`, if any.
    #[must_use]
    pub fn user_for(&self, connection_id: &str) -> Option<UserId> {
        self.socket_users.lock().get(connection_id).cloned()
    }

    /// `join-room(roomId, userId)` of §4.5: ensures the room's pipe exists
    /// and returns it, along with the event to forward to the room's other
    /// members.
    #[must_use]
    pub fn join_room(
        &self,
        room_id: &RoomId,
        user_id: UserId,
    ) -> (Arc<StreamPipe>, EngineEvent) {
        let pipe = self.ensure_pipe(room_id);
        let event = EngineEvent::UserConnected {
            room_id: room_id.clone(),
            user_id,
        };
        (pipe, event)
    }

    /// `disconnect` of §4.5: forwards `user-disconnected`, discards the
    /// connection's registered user. Does **not** stop any active RTMP
    /// stream — a reconnect is allowed to resume.
    pub fn disconnect(
        &self,
        connection_id: &str,
        room_id: Option<&RoomId>,
    ) -> Option<EngineEvent> {
        let user_id = self.socket_users.lock().remove(connection_id)?;
        let room_id = room_id?;
        Some(EngineEvent::UserDisconnected {
            room_id: room_id.clone(),
            user_id,
        })
    }

    /// `start-rtmp-stream(roomId, destinations[])` of §4.5.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidDestination`] if `destinations` is empty or any
    /// entry fails validation; no destinations are queued in that case.
    pub async fn start_rtmp_stream(
        &self,
        room_id: &RoomId,
        destinations: Vec<Destination>,
    ) -> Result<StartOutcome, RelayError> {
        if destinations.is_empty() {
            return Err(RelayError::InvalidDestination(
                "at least one destination is required".to_owned(),
            ));
        }

        let mut urls = Vec::with_capacity(destinations.len());
        for d in &destinations {
            urls.push(d.rtmp_url()?);
        }

        let pipe = self.ensure_pipe(room_id);
        for (destination, url) in destinations.into_iter().zip(urls) {
            pipe.queue_pending(destination, url);
        }

        let to_caller = if pipe.has_header() {
            let result = pipe.flush_pending().await;
            EngineEvent::RtmpStreamStarted {
                room_id: room_id.clone(),
                destinations: result.started,
                failed: result.failed,
                queued: false,
            }
        } else {
            pipe.emit(EngineEvent::RequestMediaHeader {
                room_id: room_id.clone(),
            });
            EngineEvent::RtmpStreamStarted {
                room_id: room_id.clone(),
                destinations: Vec::new(),
                failed: Vec::new(),
                queued: true,
            }
        };

        Ok(StartOutcome { to_caller, pipe })
    }

    /// `stream-data(roomId, data, isHeader)` of §4.5.
    ///
    /// Returns `None` if another `stream-data` call for this room is
    /// already in flight — the caller should ack `{shouldContinue: false}`
    /// immediately without further processing, per the single-writer rule.
    pub async fn stream_data(
        &self,
        room_id: &RoomId,
        data: RawChunk,
        is_header: bool,
    ) -> Option<StreamDataAck> {
        let lock = self.processing_lock(room_id);
        let _guard = lock.try_lock().ok()?;

        let started = Instant::now();

        let buf = match data.into_bytes() {
            Ok(buf) => buf,
            Err(e) => {
                log::warn!(
                    "[{}] rejected malformed stream-data payload: {}",
                    room_id,
                    e,
                );
                return Some(StreamDataAck {
                    should_continue: false,
                    processing_time_ms: started.elapsed().as_millis(),
                    timestamp: now_millis(),
                    error: Some(e),
                });
            }
        };

        let pipe = self.ensure_pipe(room_id);

        let should_flush = if is_header {
            pipe.mark_header(buf.clone());
            true
        } else if !pipe.has_header() {
            if let Some(pos) =
                header::find_magic(&buf, self.config.header_scan_limit)
            {
                pipe.mark_header(buf.slice(pos..));
                true
            } else {
                false
            }
        } else {
            false
        };

        if should_flush {
            let result = pipe.flush_pending().await;
            if !result.started.is_empty() || !result.failed.is_empty() {
                pipe.emit(EngineEvent::RtmpStreamStarted {
                    room_id: room_id.clone(),
                    destinations: result.started,
                    failed: result.failed,
                    queued: false,
                });
            }
        }

        let push_ok = pipe.push_chunk(buf).await;

        Some(StreamDataAck {
            should_continue: push_ok && pipe.can_accept_data(),
            processing_time_ms: started.elapsed().as_millis(),
            timestamp: now_millis(),
            error: None,
        })
    }

    /// `can-resume(roomId)` of §4.5.
    #[must_use]
    pub fn can_resume(&self, room_id: &RoomId) -> CanResumeReply {
        let Some(pipe) = self.find_pipe(room_id) else {
            return CanResumeReply {
                should_resume: false,
                status: "idle",
            };
        };

        let is_processing = self
            .processing_locks
            .lock()
            .get(room_id)
            .is_some_and(|lock| lock.try_lock().is_err());

        let can_accept = pipe.can_accept_data();
        CanResumeReply {
            should_resume: !is_processing && can_accept,
            status: if is_processing || !can_accept {
                "backpressure"
            } else {
                "streaming"
            },
        }
    }

    /// `stop-rtmp-stream(roomId, platform?)` of §4.5.
    pub async fn stop_rtmp_stream(
        &self,
        room_id: &RoomId,
        platform: Option<crate::destination::Platform>,
    ) -> Option<EngineEvent> {
        let pipe = self.find_pipe(room_id)?;

        match platform {
            Some(platform) => {
                let removed = pipe.remove_platform(platform).await;
                removed.then_some(EngineEvent::RtmpPlatformStatus {
                    room_id: room_id.clone(),
                    platform,
                    status: crate::event::PlatformStatus::Idle,
                    error: None,
                })
            }
            None => {
                pipe.shutdown_all().await;
                self.rooms.lock().remove(room_id);
                self.processing_locks.lock().remove(room_id);
                Some(EngineEvent::RtmpStreamStopped {
                    room_id: room_id.clone(),
                    platform: None,
                })
            }
        }
    }

    /// Subscribes to `room_id`'s pipe event stream, creating the pipe if
    /// this is the room's first activity.
    #[must_use]
    pub fn subscribe(
        &self,
        room_id: &RoomId,
    ) -> broadcast::Receiver<EngineEvent> {
        self.ensure_pipe(room_id).subscribe()
    }

    /// Shuts every room down, per server-shutdown orchestration in §5.
    pub async fn shutdown_all(&self) {
        let pipes: Vec<_> =
            self.rooms.lock().drain().map(|(_, pipe)| pipe).collect();
        for pipe in pipes {
            pipe.shutdown_all().await;
        }
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Normalizes the polymorphic `data` field of an inbound `stream-data`
/// message (§9 "Buffer-type polymorphism"): raw bytes, a byte-view, or a
/// base64 string are all accepted at the gateway edge; everything inward
/// receives a strict [`Bytes`] contract.
#[derive(Debug)]
pub enum RawChunk {
    /// Already-decoded bytes (the common case for a binary socket.io frame).
    Bytes(Bytes),
    /// A base64-encoded string, as sent by some non-binary-capable clients.
    Base64(String),
}

impl RawChunk {
    fn into_bytes(self) -> Result<Bytes, String> {
        match self {
            Self::Bytes(b) => Ok(b),
            Self::Base64(s) => {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map(Bytes::from)
                    .map_err(|e| format!("invalid base64 chunk: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_stream_data_is_mutually_exclusive() {
        let session = Session::new(Arc::new(EngineConfig::default()));
        let room = RoomId::from("r1");

        let lock = session.processing_lock(&room);
        let _held = lock.try_lock().unwrap();

        let ack = session
            .stream_data(&room, RawChunk::Bytes(Bytes::from_static(b"x")), false)
            .await;
        assert!(ack.is_none());
    }

    #[tokio::test]
    async fn can_resume_reports_idle_for_unknown_room() {
        let session = Session::new(Arc::new(EngineConfig::default()));
        let reply = session.can_resume(&RoomId::from("nope"));
        assert!(!reply.should_resume);
        assert_eq!(reply.status, "idle");
    }

    #[tokio::test]
    async fn start_rtmp_stream_rejects_empty_destinations() {
        let session = Session::new(Arc::new(EngineConfig::default()));
        let result = session
            .start_rtmp_stream(&RoomId::from("r1"), Vec::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn base64_chunk_decodes() {
        use base64::Engine as _;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(b"hello");
        let chunk = RawChunk::Base64(encoded).into_bytes().unwrap();
        assert_eq!(&chunk[..], b"hello");
    }
}
