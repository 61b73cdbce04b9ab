//! Black-box end-to-end scenarios of `SPEC_FULL.md` §8, driven through
//! [`ingest_relay::session::Session`] against the `fake-transcoder` binary
//! target (see `tests/bin/fake_transcoder.rs`) standing in for a real one.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use ingest_relay::{
    config::EngineConfig,
    destination::{Destination, Platform},
    event::EngineEvent,
    room::{RoomId, UserId},
    session::{RawChunk, Session},
};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn test_config() -> EngineConfig {
    EngineConfig {
        transcoder_path: env!("CARGO_BIN_EXE_fake-transcoder").into(),
        max_recent_buffer: 10,
        child_shutdown_grace: Duration::from_millis(100),
        metrics_interval: Duration::from_millis(50),
        header_scan_limit: 8192,
    }
}

fn header_chunk() -> Bytes {
    let mut buf = ingest_relay::header::MAGIC.to_vec();
    buf.extend_from_slice(b"-fake-ebml-header-");
    Bytes::from(buf)
}

fn media_chunk(i: u8) -> Bytes {
    Bytes::from(vec![i; 256])
}

/// Waits for the first event matching `pred`, failing the test if none
/// arrives within a short deadline.
async fn expect_event(
    rx: &mut broadcast::Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event was not observed in time")
}

#[tokio::test]
async fn single_destination_happy_path() {
    let session = Session::new(Arc::new(test_config()));
    let room = RoomId::from("r1");

    let _ = session.join_room(&room, UserId::from("u1"));
    let mut events = session.subscribe(&room);

    let outcome = session
        .start_rtmp_stream(
            &room,
            vec![Destination {
                platform: Platform::Youtube,
                stream_key: "aaaa-bbbb-cccc-dddd".to_owned(),
                custom_url: None,
            }],
        )
        .await
        .expect("valid destination");

    // No header captured yet: the destination is only queued.
    assert!(matches!(
        outcome.to_caller,
        EngineEvent::RtmpStreamStarted { queued: true, .. }
    ));
    assert_eq!(outcome.pipe.entry_count(), 0);

    let ack = session
        .stream_data(&room, RawChunk::Bytes(header_chunk()), true)
        .await
        .expect("room is not processing");
    assert!(ack.error.is_none());

    expect_event(&mut events, |e| {
        matches!(e, EngineEvent::RtmpStreamStarted { queued: false, .. })
    })
    .await;

    for i in 0..50u8 {
        let ack = session
            .stream_data(&room, RawChunk::Bytes(media_chunk(i)), false)
            .await
            .expect("room is not processing");
        assert!(ack.should_continue, "chunk {i} should not backpressure");
    }

    expect_event(&mut events, |e| {
        matches!(
            e,
            EngineEvent::RtmpPlatformStatus {
                status: ingest_relay::event::PlatformStatus::Streaming,
                ..
            }
        )
    })
    .await;

    assert_eq!(outcome.pipe.entry_count(), 1);

    session.stop_rtmp_stream(&room, None).await;
}

#[tokio::test]
async fn late_added_destination_joins_with_backlog() {
    let session = Session::new(Arc::new(test_config()));
    let room = RoomId::from("r2");

    session
        .start_rtmp_stream(
            &room,
            vec![Destination {
                platform: Platform::Youtube,
                stream_key: "aaaa".to_owned(),
                custom_url: None,
            }],
        )
        .await
        .unwrap();

    session
        .stream_data(&room, RawChunk::Bytes(header_chunk()), true)
        .await
        .unwrap();

    for i in 0..50u8 {
        session
            .stream_data(&room, RawChunk::Bytes(media_chunk(i)), false)
            .await
            .unwrap();
    }

    let pipe = session.find_pipe(&room).expect("pipe exists");
    assert_eq!(pipe.entry_count(), 1);

    let mut events = session.subscribe(&room);
    session
        .start_rtmp_stream(
            &room,
            vec![Destination {
                platform: Platform::Twitch,
                stream_key: "live_123".to_owned(),
                custom_url: None,
            }],
        )
        .await
        .unwrap();

    expect_event(&mut events, |e| {
        matches!(
            e,
            EngineEvent::RtmpStreamStarted { destinations, .. }
                if destinations.contains(&Platform::Twitch)
        )
    })
    .await;

    assert_eq!(pipe.entry_count(), 2);

    for i in 50..60u8 {
        let ack = session
            .stream_data(&room, RawChunk::Bytes(media_chunk(i)), false)
            .await
            .unwrap();
        assert!(ack.should_continue);
    }

    session.stop_rtmp_stream(&room, None).await;
}

#[tokio::test]
async fn destination_fails_mid_stream_is_isolated() {
    let session = Session::new(Arc::new(test_config()));
    let room = RoomId::from("r3");

    let mut events = session.subscribe(&room);
    session
        .start_rtmp_stream(
            &room,
            vec![Destination {
                platform: Platform::Custom,
                stream_key: "k".to_owned(),
                custom_url: Some(
                    "rtmp://fake.test/app?fatal_after=2000".to_owned(),
                ),
            }],
        )
        .await
        .unwrap();

    session
        .stream_data(&room, RawChunk::Bytes(header_chunk()), true)
        .await
        .unwrap();

    for i in 0..50u8 {
        session
            .stream_data(&room, RawChunk::Bytes(media_chunk(i)), false)
            .await
            .unwrap();
    }

    expect_event(&mut events, |e| {
        matches!(
            e,
            EngineEvent::RtmpPlatformStatus {
                status: ingest_relay::event::PlatformStatus::Error,
                ..
            }
        )
    })
    .await;

    let pipe = session.find_pipe(&room).expect("pipe exists");
    // Give the supervisor task a moment to drop the dead entry.
    for _ in 0..20 {
        if pipe.entry_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pipe.entry_count(), 0);

    // Further chunks fan out to zero entries and trivially succeed.
    let ack = session
        .stream_data(&room, RawChunk::Bytes(media_chunk(99)), false)
        .await
        .unwrap();
    assert!(ack.should_continue);
}

#[tokio::test]
async fn backpressure_reports_should_continue_false() {
    let session = Session::new(Arc::new(test_config()));
    let room = RoomId::from("r4");

    session
        .start_rtmp_stream(
            &room,
            vec![Destination {
                platform: Platform::Custom,
                stream_key: "k".to_owned(),
                custom_url: Some(
                    "rtmp://fake.test/app?stall_after=256".to_owned(),
                ),
            }],
        )
        .await
        .unwrap();

    session
        .stream_data(&room, RawChunk::Bytes(header_chunk()), true)
        .await
        .unwrap();

    // Keep writing from a background task until the fake transcoder stops
    // reading its standard input and the OS pipe buffer saturates; the
    // iteration whose write blocks on a full pipe holds the room's
    // processing lock open for as long as it is in flight.
    let background_session = Arc::clone(&session);
    let background_room = room.clone();
    drop(tokio::spawn(async move {
        loop {
            let _ = background_session
                .stream_data(
                    &background_room,
                    RawChunk::Bytes(Bytes::from(vec![0u8; 4096])),
                    false,
                )
                .await;
        }
    }));

    // Give the background task time to saturate the pipe and block.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ack = session
        .stream_data(&room, RawChunk::Bytes(Bytes::from_static(b"x")), false)
        .await;
    assert!(
        ack.is_none(),
        "a concurrent stream-data call should observe backpressure",
    );

    let reply = session.can_resume(&room);
    assert!(!reply.should_resume);
    assert_eq!(reply.status, "backpressure");
}

#[tokio::test]
async fn header_delayed_queues_then_flushes_on_header() {
    let session = Session::new(Arc::new(test_config()));
    let room = RoomId::from("r5");

    let mut events = session.subscribe(&room);

    let outcome = session
        .start_rtmp_stream(
            &room,
            vec![Destination {
                platform: Platform::Youtube,
                stream_key: "aaaa".to_owned(),
                custom_url: None,
            }],
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome.to_caller,
        EngineEvent::RtmpStreamStarted { queued: true, .. }
    ));

    expect_event(&mut events, |e| {
        matches!(e, EngineEvent::RequestMediaHeader { .. })
    })
    .await;

    session
        .stream_data(&room, RawChunk::Bytes(header_chunk()), true)
        .await
        .unwrap();

    expect_event(&mut events, |e| {
        matches!(
            e,
            EngineEvent::RtmpPlatformStatus {
                status: ingest_relay::event::PlatformStatus::Streaming,
                ..
            }
        )
    })
    .await;

    session.stop_rtmp_stream(&room, None).await;
}
