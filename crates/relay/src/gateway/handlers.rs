//! Socket.io event handlers, one per row of §6's inbound-events table.
//!
//! Registration happens eagerly inside [`on_connect`], before any `await`,
//! following `broz-matching`'s own discipline so that events raised by the
//! client immediately after connecting are never dropped.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use socketioxide::extract::{AckSender, Data, SocketRef};

use crate::{
    destination::{Destination, Platform},
    event::{EngineEvent, PlatformStatus},
    room::{RoomId, UserId},
    session::RawChunk,
    transcoder::{classify_stderr_line, LineEvent},
};

use super::GatewayState;

#[derive(Debug, Deserialize)]
struct RegisterUserPayload {
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinRoomPayload {
    #[serde(rename = "roomId")]
    room_id: String,
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct StartRtmpPayload {
    #[serde(rename = "roomId")]
    room_id: String,
    destinations: Vec<Destination>,
}

#[derive(Debug, Deserialize)]
struct StopRtmpPayload {
    #[serde(rename = "roomId")]
    room_id: String,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct TestRtmpPayload {
    #[serde(rename = "roomId")]
    room_id: String,
    platform: Platform,
    url: Option<String>,
    #[serde(rename = "streamKey")]
    stream_key: String,
    duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamDataPayload {
    #[serde(rename = "roomId")]
    room_id: String,
    #[serde(rename = "isHeader", default)]
    is_header: bool,
    /// Present when the client sends a base64-encoded chunk instead of a
    /// binary socket.io attachment (§9 "Buffer-type polymorphism").
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CanResumePayload {
    #[serde(rename = "roomId")]
    room_id: String,
}

/// Registers every handler of §6's inbound-events table on a freshly
/// connected `socket`, then joins it to nothing until `join-room` arrives.
pub async fn on_connect(socket: SocketRef, state: Arc<GatewayState>) {
    socket.on("register-user", {
        let state = Arc::clone(&state);
        move |socket: SocketRef, Data(payload): Data<RegisterUserPayload>| {
            let state = Arc::clone(&state);
            async move { on_register_user(socket, state, payload) }
        }
    });

    socket.on("join-room", {
        let state = Arc::clone(&state);
        move |socket: SocketRef, Data(payload): Data<JoinRoomPayload>| {
            let state = Arc::clone(&state);
            async move { on_join_room(socket, state, payload).await }
        }
    });

    socket.on("start-rtmp-stream", {
        let state = Arc::clone(&state);
        move |socket: SocketRef, Data(payload): Data<StartRtmpPayload>| {
            let state = Arc::clone(&state);
            async move { on_start_rtmp_stream(socket, state, payload).await }
        }
    });

    socket.on("stop-rtmp-stream", {
        let state = Arc::clone(&state);
        move |socket: SocketRef, Data(payload): Data<StopRtmpPayload>| {
            let state = Arc::clone(&state);
            async move { on_stop_rtmp_stream(socket, state, payload).await }
        }
    });

    socket.on("test-rtmp-stream", {
        let state = Arc::clone(&state);
        move |socket: SocketRef, Data(payload): Data<TestRtmpPayload>| {
            let state = Arc::clone(&state);
            async move { on_test_rtmp_stream(socket, state, payload).await }
        }
    });

    socket.on("stream-data", {
        let state = Arc::clone(&state);
        move |socket: SocketRef,
              Data(payload): Data<StreamDataPayload>,
              bin: socketioxide::extract::Bin,
              ack: AckSender| {
            let state = Arc::clone(&state);
            async move {
                on_stream_data(socket, state, payload, bin, ack).await
            }
        }
    });

    socket.on("can-resume", {
        let state = Arc::clone(&state);
        move |socket: SocketRef,
              Data(payload): Data<CanResumePayload>,
              ack: AckSender| {
            let state = Arc::clone(&state);
            async move { on_can_resume(socket, state, payload, ack) }
        }
    });

    // `signal` is a thin pass-through to WebRTC signaling peers; it is not
    // part of the fan-out engine (§1 "Out of scope") but is relayed so the
    // room-level protocol stays complete.
    socket.on(
        "signal",
        |socket: SocketRef, Data(payload): Data<serde_json::Value>| async move {
            if let Some(room_id) =
                payload.get("roomId").and_then(|v| v.as_str())
            {
                let _ = socket.to(room_id.to_owned()).emit("signal", &payload);
            }
        },
    );

    socket.on_disconnect({
        let state = Arc::clone(&state);
        move |socket: SocketRef| {
            let state = Arc::clone(&state);
            async move { on_disconnect(socket, state) }
        }
    });
}

fn on_register_user(
    socket: SocketRef,
    state: Arc<GatewayState>,
    payload: RegisterUserPayload,
) {
    state
        .session
        .register_user(&socket.id.to_string(), UserId::from(payload.user_id));
}

async fn on_join_room(
    socket: SocketRef,
    state: Arc<GatewayState>,
    payload: JoinRoomPayload,
) {
    let room_id = RoomId::from(payload.room_id);
    let user_id = UserId::from(payload.user_id);

    let _ = socket.join(room_id.to_string());
    state.remember_room(&socket.id.to_string(), room_id.clone());
    state.ensure_forwarder(&room_id);

    let (_pipe, event) = state.session.join_room(&room_id, user_id);
    if let EngineEvent::UserConnected { user_id, .. } = &event {
        let _ = socket
            .to(room_id.to_string())
            .emit("user-connected", user_id);
    }
}

async fn on_start_rtmp_stream(
    socket: SocketRef,
    state: Arc<GatewayState>,
    payload: StartRtmpPayload,
) {
    let room_id = RoomId::from(payload.room_id);
    state.ensure_forwarder(&room_id);

    match state
        .session
        .start_rtmp_stream(&room_id, payload.destinations)
        .await
    {
        Ok(outcome) => {
            let _ = socket.emit(
                outcome.to_caller.io_event_name(),
                &outcome.to_caller.io_payload(),
            );
        }
        Err(e) => {
            let event = EngineEvent::RtmpStreamError {
                room_id: room_id.clone(),
                platform: None,
                message: e.to_string(),
                details: Some(e.category().to_owned()),
            };
            let _ = socket.emit(event.io_event_name(), &event.io_payload());
        }
    }
}

async fn on_stop_rtmp_stream(
    socket: SocketRef,
    state: Arc<GatewayState>,
    payload: StopRtmpPayload,
) {
    let room_id = RoomId::from(payload.room_id);
    if let Some(event) = state
        .session
        .stop_rtmp_stream(&room_id, payload.platform)
        .await
    {
        let _ = socket
            .to(room_id.to_string())
            .emit(event.io_event_name(), &event.io_payload());
        let _ = socket.emit(event.io_event_name(), &event.io_payload());
    }
}

async fn on_test_rtmp_stream(
    socket: SocketRef,
    state: Arc<GatewayState>,
    payload: TestRtmpPayload,
) {
    // Synthetic test-source probing (§4.5 `test-rtmp-stream`) spawns a
    // short-lived transcoder outside any room's Stream Pipe; it shares the
    // URL Constructor and stderr classifier but not the fan-out barrier, so
    // it is driven directly here rather than through `Session`/`StreamPipe`.
    let room_id = RoomId::from(payload.room_id);
    let duration = std::time::Duration::from_secs(
        payload.duration.unwrap_or(5).clamp(3, 120),
    );
    let platform = payload.platform;

    let rtmp_url = match crate::destination::construct_rtmp_url(
        platform,
        &payload.stream_key,
        payload.url.as_deref(),
    ) {
        Ok(url) => url,
        Err(e) => {
            let _ = socket.emit(
                "rtmp-platform-status",
                &json!({
                    "platform": platform,
                    "status": PlatformStatus::Error,
                    "error": e.to_string(),
                }),
            );
            return;
        }
    };

    // `Testing` (rather than `Connecting`) distinguishes a synthetic probe's
    // badge from a real destination's, per the status value set in §6.
    let _ = socket.to(room_id.to_string()).emit(
        "rtmp-platform-status",
        &json!({ "platform": platform, "status": PlatformStatus::Testing }),
    );

    let args = crate::destination::build_test_args(&rtmp_url, duration);
    let handle =
        match crate::process::run(&state.config.transcoder_path, &args) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = socket.to(room_id.to_string()).emit(
                    "rtmp-platform-status",
                    &json!({
                        "platform": platform,
                        "status": PlatformStatus::Error,
                        "error": e.to_string(),
                    }),
                );
                return;
            }
        };

    // No input is read from the test source's stdin (it is `lavfi`-driven);
    // dropping it promptly avoids an idle open pipe.
    drop(handle.stdin);

    let io = state.io.clone();
    let room = room_id.to_string();
    drop(tokio::spawn(run_test_probe(
        handle.child,
        handle.stderr_lines,
        io,
        room,
        platform,
        duration,
    )));
}

/// Drives one `test-rtmp-stream` probe to completion: classifies its
/// standard error the same way [`crate::pipe::StreamPipe::supervise`] does,
/// killing the process once `duration` elapses or a fatal signal fires.
async fn run_test_probe(
    mut child: tokio::process::Child,
    mut stderr_lines: tokio::sync::mpsc::UnboundedReceiver<String>,
    io: socketioxide::SocketIo,
    room: String,
    platform: Platform,
    duration: std::time::Duration,
) {
    let mut confirmed = false;
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = stderr_lines.recv() => {
                let Some(line) = line else { continue };
                match classify_stderr_line(&line) {
                    LineEvent::Started if !confirmed => {
                        confirmed = true;
                        let _ = io.to(room.clone()).emit(
                            "rtmp-platform-status",
                            &json!({
                                "platform": platform,
                                "status": PlatformStatus::Streaming,
                            }),
                        ).await;
                    }
                    LineEvent::Fatal(category) => {
                        let _ = child.start_kill();
                        let _ = io.to(room).emit(
                            "rtmp-platform-status",
                            &json!({
                                "platform": platform,
                                "status": PlatformStatus::Error,
                                "error": category.message(),
                            }),
                        ).await;
                        return;
                    }
                    _ => {}
                }
            }
            _ = &mut deadline => {
                let _ = child.start_kill();
                let _ = io.to(room).emit(
                    "rtmp-platform-status",
                    &json!({ "platform": platform, "status": PlatformStatus::Idle }),
                ).await;
                return;
            }
            status = child.wait() => {
                let _ = status;
                let _ = io.to(room).emit(
                    "rtmp-platform-status",
                    &json!({ "platform": platform, "status": PlatformStatus::Idle }),
                ).await;
                return;
            }
        }
    }
}

async fn on_stream_data(
    socket: SocketRef,
    state: Arc<GatewayState>,
    payload: StreamDataPayload,
    bin: socketioxide::extract::Bin,
    ack: AckSender,
) {
    let room_id = RoomId::from(payload.room_id);
    state.ensure_forwarder(&room_id);

    let chunk = match payload.data {
        Some(b64) => RawChunk::Base64(b64),
        None => {
            let bytes = bin.0.into_iter().next().unwrap_or_default();
            RawChunk::Bytes(Bytes::from(bytes))
        }
    };

    match state
        .session
        .stream_data(&room_id, chunk, payload.is_header)
        .await
    {
        Some(result) => {
            let _ = ack.send(&result);
        }
        None => {
            // Another `stream-data` call for this room is already in
            // flight: per §4.5's single-writer-per-room rule, acknowledge
            // backpressure immediately without touching the pipe.
            let _ = ack.send(&json!({
                "shouldContinue": false,
                "processingTime": 0,
                "timestamp": 0,
            }));
        }
    }
    let _ = socket;
}

fn on_can_resume(
    socket: SocketRef,
    state: Arc<GatewayState>,
    payload: CanResumePayload,
    ack: AckSender,
) {
    let room_id = RoomId::from(payload.room_id);
    let reply = state.session.can_resume(&room_id);
    let _ = ack.send(&reply);
    let _ = socket;
}

fn on_disconnect(socket: SocketRef, state: Arc<GatewayState>) {
    let connection_id = socket.id.to_string();
    if let Some(room_id) = state.forget_connection(&connection_id) {
        if let Some(event) =
            state.session.disconnect(&connection_id, Some(&room_id))
        {
            let _ = socket
                .to(room_id.to_string())
                .emit(event.io_event_name(), &event.io_payload());
        }
    } else {
        let _ = state.session.disconnect(&connection_id, None);
    }
}
