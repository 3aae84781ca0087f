//! Integration tests for the connection multiplexer.
//!
//! These tests bind a real listener on `127.0.0.1:0` and drive it with
//! plain `TcpStream` clients, so partial writes, coalesced frames, and
//! disconnects all go through the kernel exactly as in production.

use std::time::Duration;

use roomgate_protocol::{
    DEFAULT_MAX_FRAME_LEN, Frame, FrameDecoder, FramingError, Heartbeat, Message, RequestId,
    RoomId, RoomRequest, encode_frame,
};
use roomgate_transport::{CloseReason, ConnectionId, Multiplexer, Readiness};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn join(id: u64) -> Frame {
    Frame::new(
        RequestId(id),
        Message::JoinRoom(RoomRequest {
            room_id: RoomId::new("arena1").unwrap(),
        }),
    )
}

fn encoded(frame: &Frame) -> Vec<u8> {
    encode_frame(frame, DEFAULT_MAX_FRAME_LEN).unwrap().to_vec()
}

async fn bound() -> (Multiplexer, String) {
    let mux = Multiplexer::bind("127.0.0.1:0", DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    let addr = mux.local_addr().unwrap().to_string();
    (mux, addr)
}

/// Collects events until `done` returns true for one of them.
async fn collect_until(
    mux: &mut Multiplexer,
    mut done: impl FnMut(&Readiness) -> bool,
) -> Vec<Readiness> {
    let mut events = Vec::new();
    timeout(WAIT, async {
        loop {
            for event in mux.wait().await {
                let stop = done(&event);
                events.push(event);
                if stop {
                    return;
                }
            }
        }
    })
    .await
    .expect("multiplexer should produce the expected event");
    events
}

async fn accept_one(mux: &mut Multiplexer, addr: &str) -> (TcpStream, ConnectionId) {
    let client = TcpStream::connect(addr).await.unwrap();
    let events = collect_until(mux, |e| matches!(e, Readiness::Accepted { .. })).await;
    let id = events.last().unwrap().connection();
    (client, id)
}

async fn read_frame(client: &mut TcpStream, decoder: &mut FrameDecoder) -> Option<Frame> {
    timeout(WAIT, async {
        loop {
            if let Some(frame) = decoder.next_frame().unwrap() {
                return Some(frame);
            }
            let n = client.read_buf(decoder.buffer_mut()).await.unwrap();
            if n == 0 {
                return None;
            }
        }
    })
    .await
    .expect("client should read a frame or EOF")
}

// =========================================================================
// Inbound frames
// =========================================================================

#[tokio::test]
async fn test_wait_reports_accept_then_frame() {
    let (mut mux, addr) = bound().await;
    let (mut client, id) = accept_one(&mut mux, &addr).await;

    client.write_all(&encoded(&join(1))).await.unwrap();

    let events = collect_until(&mut mux, |e| matches!(e, Readiness::Frame { .. })).await;
    match events.last().unwrap() {
        Readiness::Frame { id: got, frame } => {
            assert_eq!(*got, id);
            assert_eq!(*frame, join(1));
        }
        other => panic!("expected frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_partial_writes_are_reassembled() {
    let (mut mux, addr) = bound().await;
    let (mut client, _) = accept_one(&mut mux, &addr).await;

    let bytes = encoded(&join(7));
    let (head, tail) = bytes.split_at(5);
    client.write_all(head).await.unwrap();
    client.flush().await.unwrap();

    // Nothing complete yet: wait() must not produce a frame.
    let early = timeout(Duration::from_millis(100), mux.wait()).await;
    assert!(early.is_err(), "no event expected for a partial frame");

    client.write_all(tail).await.unwrap();
    let events = collect_until(&mut mux, |e| matches!(e, Readiness::Frame { .. })).await;
    assert!(matches!(
        events.last().unwrap(),
        Readiness::Frame { frame, .. } if frame.request_id == RequestId(7)
    ));
}

#[tokio::test]
async fn test_frames_on_one_connection_keep_their_order() {
    let (mut mux, addr) = bound().await;
    let (mut client, _) = accept_one(&mut mux, &addr).await;

    let mut burst = Vec::new();
    for id in 1..=5 {
        burst.extend(encoded(&join(id)));
    }
    client.write_all(&burst).await.unwrap();

    let mut seen = Vec::new();
    collect_until(&mut mux, |e| {
        if let Readiness::Frame { frame, .. } = e {
            seen.push(frame.request_id.0);
        }
        seen.len() == 5
    })
    .await;
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_two_connections_are_served_by_one_wait_loop() {
    let (mut mux, addr) = bound().await;
    let (mut a, id_a) = accept_one(&mut mux, &addr).await;
    let (mut b, id_b) = accept_one(&mut mux, &addr).await;
    assert_ne!(id_a, id_b);
    assert_eq!(mux.len(), 2);

    a.write_all(&encoded(&join(1))).await.unwrap();
    b.write_all(&encoded(&join(2))).await.unwrap();

    let mut from = Vec::new();
    collect_until(&mut mux, |e| {
        if let Readiness::Frame { id, .. } = e {
            from.push(*id);
        }
        from.len() == 2
    })
    .await;
    from.sort();
    let mut expected = vec![id_a, id_b];
    expected.sort();
    assert_eq!(from, expected);
}

// =========================================================================
// Framing errors
// =========================================================================

#[tokio::test]
async fn test_unknown_type_is_rejected_and_connection_survives() {
    let (mut mux, addr) = bound().await;
    let (mut client, id) = accept_one(&mut mux, &addr).await;

    let body = br#"{"request_id": 3, "type": "TELEPORT", "payload": {}}"#;
    let mut bad = (body.len() as u32).to_be_bytes().to_vec();
    bad.extend_from_slice(body);
    client.write_all(&bad).await.unwrap();
    client.write_all(&encoded(&join(4))).await.unwrap();

    let events = collect_until(&mut mux, |e| matches!(e, Readiness::Frame { .. })).await;
    let rejected = events
        .iter()
        .find_map(|e| match e {
            Readiness::Rejected { error, .. } => Some(error),
            _ => None,
        })
        .expect("unknown type should be rejected");
    assert_eq!(rejected.request_id(), Some(RequestId(3)));
    assert!(mux.contains(id));
}

#[tokio::test]
async fn test_oversized_prefix_closes_only_that_connection() {
    let (mut mux, addr) = bound().await;
    let (mut bad, bad_id) = accept_one(&mut mux, &addr).await;
    let (_good, good_id) = accept_one(&mut mux, &addr).await;

    bad.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    let events = collect_until(&mut mux, |e| matches!(e, Readiness::Closed { .. })).await;
    match events.last().unwrap() {
        Readiness::Closed { id, reason } => {
            assert_eq!(*id, bad_id);
            assert!(matches!(
                reason,
                CloseReason::Corrupt(FramingError::Oversized { .. })
            ));
        }
        other => panic!("expected close, got {other:?}"),
    }
    assert!(!mux.contains(bad_id));
    assert!(mux.contains(good_id));
}

// =========================================================================
// Outbound and close
// =========================================================================

#[tokio::test]
async fn test_send_delivers_frame_to_client() {
    let (mut mux, addr) = bound().await;
    let (mut client, id) = accept_one(&mut mux, &addr).await;

    let reply = Frame::new(RequestId(1), Message::Heartbeat(Heartbeat { sent_at_ms: 5 }));
    mux.send(id, &reply).unwrap();

    let mut decoder = FrameDecoder::default();
    assert_eq!(read_frame(&mut client, &mut decoder).await, Some(reply));
}

#[tokio::test]
async fn test_close_flushes_queued_output_then_eof() {
    let (mut mux, addr) = bound().await;
    let (mut client, id) = accept_one(&mut mux, &addr).await;

    for n in 1..=3 {
        mux.send(id, &Frame::new(RequestId(n), Message::LeaveRoom)).unwrap();
    }
    mux.close(id).unwrap();
    assert!(!mux.contains(id));

    let events = mux.wait().await;
    assert!(matches!(
        events.first(),
        Some(Readiness::Closed { reason: CloseReason::Local, .. })
    ));

    let mut decoder = FrameDecoder::default();
    for n in 1..=3 {
        let frame = read_frame(&mut client, &mut decoder).await.unwrap();
        assert_eq!(frame.request_id, RequestId(n));
    }
    assert_eq!(read_frame(&mut client, &mut decoder).await, None);
}

#[tokio::test]
async fn test_peer_disconnect_is_reported_as_peer_closed() {
    let (mut mux, addr) = bound().await;
    let (client, id) = accept_one(&mut mux, &addr).await;
    drop(client);

    let events = collect_until(&mut mux, |e| matches!(e, Readiness::Closed { .. })).await;
    assert!(matches!(
        events.last().unwrap(),
        Readiness::Closed { id: got, reason: CloseReason::PeerClosed | CloseReason::Reset(_) }
            if *got == id
    ));
    assert!(mux.is_empty());
}

#[tokio::test]
async fn test_register_adopts_stream_with_buffered_bytes() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut peer = TcpStream::connect(addr).await.unwrap();
    let (server_side, _) = listener.accept().await.unwrap();

    // A frame that was already read into the decoder before handover.
    let mut decoder = FrameDecoder::default();
    decoder.extend_from_slice(&encoded(&join(11)));

    let mut mux = Multiplexer::unbound(DEFAULT_MAX_FRAME_LEN);
    let id = mux.register(server_side, decoder);

    peer.write_all(&encoded(&join(12))).await.unwrap();

    let mut seen = Vec::new();
    collect_until(&mut mux, |e| {
        if let Readiness::Frame { id: got, frame } = e {
            assert_eq!(*got, id);
            seen.push(frame.request_id.0);
        }
        seen.len() == 2
    })
    .await;
    assert_eq!(seen, vec![11, 12]);
}

#[tokio::test]
async fn test_stop_accepting_drops_listener() {
    let (mut mux, addr) = bound().await;
    let (_client, id) = accept_one(&mut mux, &addr).await;

    mux.stop_accepting();
    assert!(!mux.is_accepting());
    assert!(mux.contains(id));
    assert!(TcpStream::connect(&addr).await.is_err());
}
