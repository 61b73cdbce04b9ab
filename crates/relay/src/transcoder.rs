//! Transcoder Entry (§4.3): wraps one child transcoder process, owns its
//! standard input, tracks liveness and classifies its standard-error output.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use relay_log::log;
use serde::Serialize;
use tokio::{
    io::AsyncWriteExt as _,
    process::ChildStdin,
    sync::Mutex as AsyncMutex,
    time,
};

use crate::{destination::Platform, event::QueueStatus, room::RoomId};

/// Cap on the retained tail of a single entry's standard error, per §5.
const STDERR_TAIL_CAP: usize = 16 * 1024;

/// Monotonically increasing counters plus the latest sampled rates of a
/// single [`TranscoderEntry`], per §3 `Transcoder Entry`.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Stats {
    /// Number of media chunks written (header excluded).
    pub chunks: u64,
    /// Total bytes written to standard input (header included).
    pub bytes: u64,
    /// Most recently observed `frame=N` counter from standard error.
    pub frames: u64,
    /// Most recently observed `fps=F` rate from standard error.
    pub fps: f32,
    /// Number of pushes that observed `!can_accept_data()` on this entry.
    pub backpressure_events: u32,
}

/// Category of a fatal ingest signal recognized by the stderr classifier,
/// the minimum compatible substring set from §4.3.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FatalCategory {
    /// `Connection refused`.
    ConnectionRefused,
    /// `403 Forbidden`.
    Forbidden,
    /// `401 Unauthorized`.
    Unauthorized,
    /// `timed out`.
    TimedOut,
    /// `Failed to open`.
    FailedToOpen,
    /// `Could not write header`.
    CouldNotWriteHeader,
    /// `Invalid data found when processing input`.
    InvalidInputData,
}

impl FatalCategory {
    /// Human-readable message surfaced in `rtmp-platform-status{error}`.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::ConnectionRefused => "RTMP connection failed",
            Self::Forbidden => "destination rejected stream (403 Forbidden)",
            Self::Unauthorized => {
                "destination rejected stream (401 Unauthorized)"
            }
            Self::TimedOut => "connection to destination timed out",
            Self::FailedToOpen => "failed to open RTMP output",
            Self::CouldNotWriteHeader => "destination rejected stream header",
            Self::InvalidInputData => {
                "invalid data found when processing input"
            }
        }
    }

    /// Machine-readable category string.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection_refused",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::TimedOut => "timed_out",
            Self::FailedToOpen => "failed_to_open",
            Self::CouldNotWriteHeader => "could_not_write_header",
            Self::InvalidInputData => "invalid_input_data",
        }
    }
}

/// Outcome of classifying a single drained standard-error line, replacing
/// the source's ad-hoc substring checks with a small state machine (§9).
#[derive(Clone, Debug)]
pub enum LineEvent {
    /// `Stream mapping:` or `frame=` observed: streaming is confirmed.
    Started,
    /// A fatal ingest signal was recognized.
    Fatal(FatalCategory),
    /// A `frame=N`/`fps=F` progress line.
    Progress {
        /// Parsed `frame=N`, if present.
        frames: Option<u64>,
        /// Parsed `fps=F`, if present.
        fps: Option<f32>,
    },
    /// A line that matched none of the above; still appended to the tail.
    Other,
}

/// Classifies a single line drained from a transcoder's standard error.
#[must_use]
pub fn classify_stderr_line(line: &str) -> LineEvent {
    const FATAL_SIGNALS: &[(&str, FatalCategory)] = &[
        ("Connection refused", FatalCategory::ConnectionRefused),
        ("403 Forbidden", FatalCategory::Forbidden),
        ("401 Unauthorized", FatalCategory::Unauthorized),
        ("timed out", FatalCategory::TimedOut),
        ("Failed to open", FatalCategory::FailedToOpen),
        ("Could not write header", FatalCategory::CouldNotWriteHeader),
        (
            "Invalid data found when processing input",
            FatalCategory::InvalidInputData,
        ),
    ];

    for (needle, category) in FATAL_SIGNALS {
        if line.contains(needle) {
            return LineEvent::Fatal(*category);
        }
    }

    if line.contains("Stream mapping:") {
        return LineEvent::Started;
    }

    if let Some(pos) = line.find("frame=") {
        let frames = parse_after(&line[pos + "frame=".len()..])
            .and_then(|s| s.trim().parse().ok());
        let fps = line
            .find("fps=")
            .and_then(|p| parse_after(&line[p + "fps=".len()..]))
            .and_then(|s| s.trim().parse().ok());
        return LineEvent::Progress { frames, fps };
    }

    LineEvent::Other
}

/// Extracts the whitespace-delimited token immediately following a `key=`
/// marker, e.g. `"123 fps=30"` from `parse_after("123 fps=30 q=...")`.
fn parse_after(rest: &str) -> Option<&str> {
    Some(rest.split_whitespace().next()?)
}

/// The `spawning → idle → streaming → dead` lifecycle of a [`TranscoderEntry`]
/// described in §4.3.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryState {
    /// Process spawned, standard error not yet confirmed streaming.
    Spawning,
    /// Streaming confirmed by the stderr classifier.
    Streaming,
    /// Process exited, errored, had its stdin closed, or was shut down.
    Dead,
}

/// One child transcoder process feeding a single RTMP/RTMPS destination,
/// per §3 `Transcoder Entry`.
#[derive(Debug)]
pub struct TranscoderEntry {
    /// Destination platform this entry feeds.
    pub platform: Platform,
    /// Room this entry belongs to.
    pub room_id: RoomId,
    /// OS process id of the transcoder child.
    pub pid: u32,

    stdin: AsyncMutex<Option<ChildStdin>>,
    wrote_header: AtomicBool,
    dead: AtomicBool,
    is_writing: AtomicBool,
    consecutive_backpressure: AtomicU32,
    stats: Mutex<Stats>,
    last_stderr: Mutex<String>,
    state: Mutex<EntryState>,
    grace: Duration,
}

impl TranscoderEntry {
    /// Constructs a new, still-`spawning` entry wrapping an already-running
    /// child's `stdin`.
    #[must_use]
    pub fn new(
        platform: Platform,
        room_id: RoomId,
        pid: u32,
        stdin: ChildStdin,
        grace: Duration,
    ) -> Self {
        Self {
            platform,
            room_id,
            pid,
            stdin: AsyncMutex::new(Some(stdin)),
            wrote_header: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            is_writing: AtomicBool::new(false),
            consecutive_backpressure: AtomicU32::new(0),
            stats: Mutex::new(Stats::default()),
            last_stderr: Mutex::new(String::new()),
            state: Mutex::new(EntryState::Spawning),
            grace,
        }
    }

    /// Current position in the `spawning → streaming → dead` lifecycle of
    /// §4.3.
    #[must_use]
    pub fn state(&self) -> EntryState {
        *self.state.lock()
    }

    /// Transitions this entry to `Streaming` the first time the stderr
    /// classifier confirms it (a `Stream mapping:`/`frame=` line). Returns
    /// `true` the one time it actually performs that transition, so the
    /// caller emits `rtmp-platform-status{streaming}` exactly once.
    pub fn mark_streaming(&self) -> bool {
        let mut state = self.state.lock();
        if *state == EntryState::Spawning {
            *state = EntryState::Streaming;
            true
        } else {
            false
        }
    }

    /// `true` once the Stream Pipe's header has been delivered to this
    /// entry's standard input.
    #[must_use]
    pub fn wrote_header(&self) -> bool {
        self.wrote_header.load(Ordering::Acquire)
    }

    /// `true` once this entry has died (process exit, error, stdin close,
    /// or explicit shutdown). Never reset once `true`.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// `canAcceptData()` of §4.3: `!dead && !stdinEnded && !isWriting`. This
    /// implementation does not distinguish a closed stdin from a dead entry,
    /// since both are terminal and indistinguishable from the outside.
    #[must_use]
    pub fn can_accept_data(&self) -> bool {
        !self.is_dead() && !self.is_writing.load(Ordering::Acquire)
    }

    /// `getQueueStatus()` of §4.3.
    #[must_use]
    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            is_writing: self.is_writing.load(Ordering::Acquire),
            can_accept_data: self.can_accept_data(),
            consecutive_backpressure: self
                .consecutive_backpressure
                .load(Ordering::Acquire),
        }
    }

    /// Current [`Stats`] snapshot.
    #[must_use]
    pub fn stats(&self) -> Stats {
        *self.stats.lock()
    }

    /// Tail of this entry's standard error, capped at
    /// [`STDERR_TAIL_CAP`].
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.last_stderr.lock().clone()
    }

    /// Appends a freshly-drained standard-error `line` to the capped tail.
    pub fn push_stderr_line(&self, line: &str) {
        let mut tail = self.last_stderr.lock();
        if !tail.is_empty() {
            tail.push('\n');
        }
        tail.push_str(line);
        let overflow = tail.len().saturating_sub(STDERR_TAIL_CAP);
        if overflow > 0 {
            let _ = tail.drain(..overflow);
        }
    }

    /// Records a `Progress` line's counters into [`Stats`].
    pub fn record_progress(&self, frames: Option<u64>, fps: Option<f32>) {
        let mut stats = self.stats.lock();
        if let Some(frames) = frames {
            stats.frames = frames;
        }
        if let Some(fps) = fps {
            stats.fps = fps;
        }
    }

    /// `writeAsync(buf)` of §4.3: writes `buf` to the child's standard
    /// input, completing only once the OS has accepted the whole buffer.
    ///
    /// Calls are serialized per entry by the internal `stdin` lock: a
    /// concurrent call queues behind the in-flight write and completes in
    /// order, with no buffering beyond that single in-flight write.
    ///
    /// Returns `false` if the entry is dead, its stdin has been closed, or
    /// the OS write itself failed — in all three cases the entry is also
    /// marked dead.
    pub async fn write_async(&self, buf: bytes::Bytes) -> bool {
        if self.is_dead() {
            return false;
        }

        if !self.can_accept_data() {
            self.consecutive_backpressure
                .fetch_add(1, Ordering::AcqRel);
            let mut stats = self.stats.lock();
            stats.backpressure_events += 1;
        }

        self.is_writing.store(true, Ordering::Release);
        let mut guard = self.stdin.lock().await;
        let result = match guard.as_mut() {
            Some(stdin) => stdin.write_all(&buf).await,
            None => {
                self.is_writing.store(false, Ordering::Release);
                return false;
            }
        };
        self.is_writing.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                self.consecutive_backpressure.store(0, Ordering::Release);
                let mut stats = self.stats.lock();
                stats.bytes += buf.len() as u64;
                stats.chunks += 1;
                true
            }
            Err(e) => {
                log::warn!(
                    "[pid {}] write to transcoder stdin failed: {}",
                    self.pid,
                    e,
                );
                self.mark_dead();
                false
            }
        }
    }

    /// Records that this entry has received the Stream Pipe's captured
    /// header.
    pub fn mark_header_written(&self) {
        self.wrote_header.store(true, Ordering::Release);
    }

    /// Marks this entry dead without sending a signal (used when the child
    /// has already exited on its own).
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
        *self.state.lock() = EntryState::Dead;
    }

    /// `waitForSpace()` of §4.3: completes once the current in-flight write
    /// (if any) has finished, without itself writing anything. Serialized
    /// through the same `stdin` lock [`TranscoderEntry::write_async`] uses,
    /// so a writer queued behind an in-flight write completes first.
    pub async fn wait_for_space(&self) {
        drop(self.stdin.lock().await);
    }

    /// `shutdown(graceMs)` of §4.3: idempotent. Marks the entry dead, closes
    /// its stdin, sends `SIGTERM` and schedules `SIGKILL` after the grace
    /// period.
    pub async fn shutdown(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = EntryState::Dead;

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }

        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            log::debug!(
                "[pid {}] SIGTERM failed (process likely already exited): {}",
                self.pid,
                e,
            );
            return;
        }

        let grace = self.grace;
        tokio::spawn(async move {
            time::sleep(grace).await;
            if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
                log::debug!(
                    "[pid {}] SIGKILL failed (process likely already \
                     reaped): {}",
                    pid,
                    e,
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_fatal_signals() {
        assert!(matches!(
            classify_stderr_line("Error: Connection refused"),
            LineEvent::Fatal(FatalCategory::ConnectionRefused)
        ));
        assert!(matches!(
            classify_stderr_line("HTTP error 403 Forbidden"),
            LineEvent::Fatal(FatalCategory::Forbidden)
        ));
        assert!(matches!(
            classify_stderr_line("rtmp handshake timed out"),
            LineEvent::Fatal(FatalCategory::TimedOut)
        ));
        assert!(matches!(
            classify_stderr_line("Could not write header for output"),
            LineEvent::Fatal(FatalCategory::CouldNotWriteHeader)
        ));
    }

    #[test]
    fn recognizes_stream_started() {
        assert!(matches!(
            classify_stderr_line("Stream mapping:"),
            LineEvent::Started
        ));
    }

    #[test]
    fn parses_progress_counters() {
        match classify_stderr_line(
            "frame=  120 fps= 30 q=-1.0 size=    256kB time=00:00:04.00 \
             bitrate= 524.3kbits/s speed=1.0x",
        ) {
            LineEvent::Progress { frames, fps } => {
                assert_eq!(frames, Some(120));
                assert_eq!(fps, Some(30.0));
            }
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn progress_without_fps_still_parses_frames() {
        match classify_stderr_line("frame=   42") {
            LineEvent::Progress { frames, fps } => {
                assert_eq!(frames, Some(42));
                assert_eq!(fps, None);
            }
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_line_is_other() {
        assert!(matches!(
            classify_stderr_line("libx264 @ 0x55f: using cpu capabilities"),
            LineEvent::Other
        ));
    }

    #[test]
    fn fatal_signals_take_priority_over_progress() {
        assert!(matches!(
            classify_stderr_line(
                "frame=1 Connection refused while writing"
            ),
            LineEvent::Fatal(FatalCategory::ConnectionRefused)
        ));
    }
}
