//! Gateway transport (§11): binds the message-channel protocol of §6 to the
//! [`Session`] via an `axum` + `socketioxide` stack, grounded in
//! `broz-matching`'s own registration-before-first-await discipline.

mod handlers;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use axum::Router;
use parking_lot::Mutex;
use relay_log::log;
use socketioxide::SocketIo;

use crate::{config::EngineConfig, room::RoomId, session::Session};

/// Shared state handed to every socket.io handler.
#[derive(Debug)]
pub struct GatewayState {
    /// The engine's single [`Session`].
    pub session: Arc<Session>,
    /// Runtime tunables, needed directly by handlers (e.g.
    /// `test-rtmp-stream`) that spawn transcoders outside any `Session`
    /// operation.
    pub config: Arc<EngineConfig>,
    /// Handle used to broadcast to rooms independently of any one socket.
    pub io: SocketIo,
    /// `connectionId → roomId` the connection last joined, so `disconnect`
    /// knows which room to forward `user-disconnected` to.
    joined_rooms: Mutex<HashMap<String, RoomId>>,
    /// Rooms that already have a broadcast-forwarder task attached, so a
    /// room's [`crate::pipe::StreamPipe`] event stream is only drained once.
    forwarding: Mutex<HashSet<RoomId>>,
}

impl GatewayState {
    fn remember_room(&self, connection_id: &str, room_id: RoomId) {
        self.joined_rooms
            .lock()
            .insert(connection_id.to_owned(), room_id);
    }

    fn forget_connection(&self, connection_id: &str) -> Option<RoomId> {
        self.joined_rooms.lock().remove(connection_id)
    }

    /// Ensures a background task forwarding `room_id`'s pipe broadcast
    /// channel into `io.to(room_id).emit(...)` is running, spawning one on
    /// first use.
    fn ensure_forwarder(self: &Arc<Self>, room_id: &RoomId) {
        {
            let mut forwarding = self.forwarding.lock();
            if !forwarding.insert(room_id.clone()) {
                return;
            }
        }

        let mut events = self.session.subscribe(room_id);
        let io = self.io.clone();
        let room = room_id.to_string();
        drop(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let name = event.io_event_name();
                        let payload = event.io_payload();
                        if let Err(e) =
                            io.to(room.clone()).emit(name, &payload).await
                        {
                            log::warn!(
                                "[{}] failed to emit '{}': {}",
                                room,
                                name,
                                e,
                            );
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        break;
                    }
                    Err(
                        tokio::sync::broadcast::error::RecvError::Lagged(n),
                    ) => {
                        log::warn!(
                            "[{}] event forwarder lagged, dropped {} events",
                            room,
                            n,
                        );
                    }
                }
            }
        }));
    }
}

/// Builds the `axum` router serving the socket.io gateway at `/`, wired to
/// `session`.
#[must_use]
pub fn router(session: Arc<Session>, config: Arc<EngineConfig>) -> Router {
    let (layer, io) = SocketIo::builder().build_layer();

    let state = Arc::new(GatewayState {
        session,
        config,
        io,
        joined_rooms: Mutex::new(HashMap::new()),
        forwarding: Mutex::new(HashSet::new()),
    });

    state.io.ns("/", {
        let state = Arc::clone(&state);
        move |socket| {
            let state = Arc::clone(&state);
            async move { handlers::on_connect(socket, state).await }
        }
    });

    Router::new().layer(layer)
}
