//! Stream Pipe (§4.4): the per-room aggregate coordinating sequential
//! fan-out of media chunks to every active [`TranscoderEntry`] and the
//! flush of destinations still awaiting process start.

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use futures::future;
use parking_lot::Mutex;
use relay_log::log;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use url::Url;

use crate::{
    config::EngineConfig,
    destination::{build_args, Destination, Platform},
    event::{EngineEvent, PlatformStatus},
    process::{self, SpawnError},
    room::RoomId,
    transcoder::{classify_stderr_line, LineEvent, TranscoderEntry},
};

/// Outcome of [`StreamPipe::flush_pending`]: which destinations started and
/// which failed, with a reason each.
#[derive(Debug, Default)]
pub struct FlushResult {
    /// Platforms whose transcoder started and received header + backlog.
    pub started: Vec<Platform>,
    /// Platforms that failed to start, with a human-readable reason.
    pub failed: Vec<(Platform, String)>,
}

/// The per-room aggregate of §3 `Stream Pipe`.
#[derive(Debug)]
pub struct StreamPipe {
    room_id: RoomId,
    config: Arc<EngineConfig>,
    entries: Mutex<Vec<Arc<TranscoderEntry>>>,
    pending: Mutex<VecDeque<(Destination, Url)>>,
    header_chunk: Mutex<Option<Bytes>>,
    recent_buffer: Mutex<VecDeque<Bytes>>,
    flushing: AsyncMutex<()>,
    events: broadcast::Sender<EngineEvent>,
}

impl StreamPipe {
    /// Creates a new, empty [`StreamPipe`] for `room_id`.
    #[must_use]
    pub fn new(room_id: RoomId, config: Arc<EngineConfig>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            room_id,
            config,
            entries: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            header_chunk: Mutex::new(None),
            recent_buffer: Mutex::new(VecDeque::new()),
            flushing: AsyncMutex::new(()),
            events,
        })
    }

    /// Subscribes to this pipe's outbound event stream, consumed by the
    /// gateway's per-room forwarder.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        // No receivers (no gateway forwarder attached yet, or all dropped)
        // is a normal, non-erroneous condition.
        let _ = self.events.send(event);
    }

    /// `markHeader(buf)` of §4.4: records the captured header once;
    /// subsequent calls are ignored.
    pub fn mark_header(&self, buf: Bytes) {
        let mut header = self.header_chunk.lock();
        if header.is_some() {
            return;
        }
        log::info!(
            "[{}] captured container header ({} bytes)",
            self.room_id,
            buf.len(),
        );
        *header = Some(buf);
    }

    /// `true` once [`StreamPipe::mark_header`] has captured a header.
    #[must_use]
    pub fn has_header(&self) -> bool {
        self.header_chunk.lock().is_some()
    }

    /// `queuePending(destination, rtmpUrl)` of §4.4.
    pub fn queue_pending(&self, destination: Destination, rtmp_url: Url) {
        self.pending.lock().push_back((destination, rtmp_url));
    }

    /// `canAcceptData()` of §4.4: `true` iff there are no entries, or every
    /// entry reports `canAcceptData`.
    #[must_use]
    pub fn can_accept_data(&self) -> bool {
        self.entries.lock().iter().all(|e| e.can_accept_data())
    }

    /// Number of currently active entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// `pushChunk(buf)` of §4.4: the cross-destination fan-out barrier.
    ///
    /// Appends `buf` to the rolling recent-chunk buffer, then (if any
    /// entries are active) writes it to every live entry in parallel and
    /// awaits all completions, writing each entry's pending header first.
    /// Returns `true` iff every entry's media write succeeded; entries whose
    /// header or media write failed are removed and excluded from siblings.
    pub async fn push_chunk(&self, buf: Bytes) -> bool {
        {
            let mut recent = self.recent_buffer.lock();
            recent.push_back(buf.clone());
            while recent.len() > self.config.max_recent_buffer {
                let _ = recent.pop_front();
            }
        }

        let entries = self.entries.lock().clone();
        if entries.is_empty() {
            return true;
        }

        let header = self.header_chunk.lock().clone();

        let outcomes = future::join_all(entries.into_iter().map(|entry| {
            let buf = buf.clone();
            let header = header.clone();
            async move {
                if !entry.wrote_header() {
                    if let Some(h) = header {
                        if !entry.write_async(h).await {
                            return (entry, None);
                        }
                        entry.mark_header_written();
                    }
                }
                let ok = entry.write_async(buf).await;
                (entry, Some(ok))
            }
        }))
        .await;

        let mut all_ok = true;
        for (entry, outcome) in outcomes {
            match outcome {
                None => {
                    log::warn!(
                        "[{}] {} header write failed, removing entry",
                        self.room_id,
                        entry.platform,
                    );
                    self.remove_entry(&entry, "header write failed").await;
                }
                Some(true) => {}
                Some(false) => {
                    all_ok = false;
                    self.remove_entry(&entry, "write failed").await;
                }
            }
        }
        all_ok
    }

    /// `flushPending(buildArgsFn)` of §4.4, serialized by the internal
    /// `flushing` lock so concurrent flushes (e.g. from `start-rtmp-stream`
    /// racing a header-bearing `stream-data`) never interleave.
    pub async fn flush_pending(self: &Arc<Self>) -> FlushResult {
        let _guard = self.flushing.lock().await;

        let mut result = FlushResult::default();
        loop {
            let next = self.pending.lock().pop_front();
            let Some((destination, rtmp_url)) = next else {
                break;
            };

            match self.start_one(&destination, &rtmp_url).await {
                Ok(()) => result.started.push(destination.platform),
                Err(reason) => {
                    self.emit(EngineEvent::RtmpPlatformStatus {
                        room_id: self.room_id.clone(),
                        platform: destination.platform,
                        status: PlatformStatus::Error,
                        error: Some(reason.clone()),
                    });
                    result.failed.push((destination.platform, reason));
                }
            }
        }
        result
    }

    /// Spawns one transcoder for `destination`, delivers the captured
    /// header (if any) and replays the recent-chunk backlog, per the
    /// late-join invariant of §4.4.
    async fn start_one(
        self: &Arc<Self>,
        destination: &Destination,
        rtmp_url: &Url,
    ) -> Result<(), String> {
        let args = build_args(rtmp_url);
        let handle = process::run(&self.config.transcoder_path, &args)
            .map_err(|SpawnError(msg)| msg)?;

        let entry = Arc::new(TranscoderEntry::new(
            destination.platform,
            self.room_id.clone(),
            handle.pid,
            handle.stdin,
            self.config.child_shutdown_grace,
        ));

        self.emit(EngineEvent::RtmpPlatformStatus {
            room_id: self.room_id.clone(),
            platform: destination.platform,
            status: PlatformStatus::Connecting,
            error: None,
        });

        tokio::spawn(Arc::clone(self).supervise(
            Arc::clone(&entry),
            handle.child,
            handle.stderr_lines,
        ));

        // Deliberately NOT yet visible in `self.entries`: until header +
        // backlog replay below have completed, a concurrent `push_chunk`
        // fan-out (driven from a different room-processing call) must not
        // see this entry, or it could race `write_async` against this same
        // replay and duplicate the header / interleave bytes out of order
        // (P1, P4). Only `entries.lock().push` below makes it a fan-out
        // target.
        let header = self.header_chunk.lock().clone();
        if let Some(header) = header {
            if !entry.write_async(header).await {
                entry.shutdown().await;
                return Err("failed to deliver captured header".to_owned());
            }
            entry.mark_header_written();
        }

        let backlog: Vec<Bytes> =
            self.recent_buffer.lock().iter().cloned().collect();
        for chunk in backlog {
            if !entry.write_async(chunk).await {
                entry.shutdown().await;
                return Err("failed to replay buffered chunks".to_owned());
            }
        }

        self.entries.lock().push(entry);
        Ok(())
    }

    /// Background task owning one entry's lifetime: drains its classified
    /// standard error, forwards status transitions and periodic metrics,
    /// and removes the entry from this pipe once the child exits.
    async fn supervise(
        self: Arc<Self>,
        entry: Arc<TranscoderEntry>,
        mut child: tokio::process::Child,
        mut stderr_lines: tokio::sync::mpsc::UnboundedReceiver<String>,
    ) {
        let mut metrics = tokio::time::interval(self.config.metrics_interval);

        loop {
            tokio::select! {
                line = stderr_lines.recv() => {
                    let Some(line) = line else { continue };
                    entry.push_stderr_line(&line);
                    match classify_stderr_line(&line) {
                        LineEvent::Started => {
                            if entry.mark_streaming() {
                                self.emit(EngineEvent::RtmpPlatformStatus {
                                    room_id: self.room_id.clone(),
                                    platform: entry.platform,
                                    status: PlatformStatus::Streaming,
                                    error: None,
                                });
                            }
                        }
                        LineEvent::Fatal(category) => {
                            entry.shutdown().await;
                            self.emit(EngineEvent::RtmpPlatformStatus {
                                room_id: self.room_id.clone(),
                                platform: entry.platform,
                                status: PlatformStatus::Error,
                                error: Some(category.message().to_owned()),
                            });
                            self.drop_entry(&entry);
                            return;
                        }
                        LineEvent::Progress { frames, fps } => {
                            entry.record_progress(frames, fps);
                        }
                        LineEvent::Other => {}
                    }
                }
                status = child.wait() => {
                    if entry.is_dead() {
                        // Already torn down by a fatal signal or explicit
                        // shutdown; avoid a duplicate removal/emit.
                        return;
                    }
                    entry.mark_dead();
                    let reason = match status {
                        Ok(status) if status.success() => None,
                        Ok(status) => Some(format!(
                            "transcoder exited with {status}",
                        )),
                        Err(e) => Some(format!(
                            "failed to wait for transcoder: {e}",
                        )),
                    };
                    self.emit(EngineEvent::RtmpPlatformStatus {
                        room_id: self.room_id.clone(),
                        platform: entry.platform,
                        status: PlatformStatus::Error,
                        error: reason,
                    });
                    self.drop_entry(&entry);
                    return;
                }
                _ = metrics.tick() => {
                    let status = entry.queue_status();
                    if status.is_writing || status.consecutive_backpressure > 0 {
                        self.emit(EngineEvent::RtmpPlatformMetrics {
                            room_id: self.room_id.clone(),
                            platform: entry.platform,
                            pid: entry.pid,
                            stats: entry.stats(),
                            queue: status,
                            last_stderr: entry.stderr_tail(),
                        });
                    }
                }
            }
        }
    }

    /// Removes `entry` from this pipe and shuts it down, emitting no
    /// additional status event (the caller already did, or the removal is
    /// silent — e.g. an explicit `stop-rtmp-stream`).
    async fn remove_entry(&self, entry: &Arc<TranscoderEntry>, reason: &str) {
        log::debug!(
            "[{}] {} removing entry: {}",
            self.room_id,
            entry.platform,
            reason,
        );
        self.drop_entry(entry);
        entry.shutdown().await;
    }

    /// Removes `entry` from the live list without shutting it down (the
    /// caller has already done so, or the process already exited).
    fn drop_entry(&self, entry: &Arc<TranscoderEntry>) {
        self.entries.lock().retain(|e| !Arc::ptr_eq(e, entry));
    }

    /// `removeEntry(entry)` of §4.4, used by `stop-rtmp-stream` to tear a
    /// single destination down explicitly.
    pub async fn remove_platform(&self, platform: Platform) -> bool {
        let entry = {
            let entries = self.entries.lock();
            entries.iter().find(|e| e.platform == platform).cloned()
        };
        let Some(entry) = entry else { return false };
        self.drop_entry(&entry);
        entry.shutdown().await;
        true
    }

    /// `shutdownAll()` of §4.4: shuts every entry down and clears all
    /// pending/buffered state.
    pub async fn shutdown_all(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        future::join_all(entries.iter().map(|e| e.shutdown())).await;
        self.pending.lock().clear();
        self.recent_buffer.lock().clear();
    }

    /// Room this pipe belongs to.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_chunk_with_no_entries_succeeds_trivially() {
        let pipe = StreamPipe::new(
            RoomId::from("r1"),
            Arc::new(EngineConfig::default()),
        );
        assert!(pipe.push_chunk(Bytes::from_static(b"abc")).await);
        assert!(pipe.can_accept_data());
    }

    #[tokio::test]
    async fn mark_header_is_idempotent() {
        let pipe = StreamPipe::new(
            RoomId::from("r1"),
            Arc::new(EngineConfig::default()),
        );
        pipe.mark_header(Bytes::from_static(b"first"));
        pipe.mark_header(Bytes::from_static(b"second"));
        assert!(pipe.has_header());
    }

    #[tokio::test]
    async fn recent_buffer_caps_at_configured_size() {
        let mut cfg = EngineConfig::default();
        cfg.max_recent_buffer = 3;
        let pipe = StreamPipe::new(RoomId::from("r1"), Arc::new(cfg));
        for i in 0..10u8 {
            assert!(pipe.push_chunk(Bytes::from(vec![i])).await);
        }
        assert_eq!(pipe.recent_buffer.lock().len(), 3);
    }
}
