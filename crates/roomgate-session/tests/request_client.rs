//! Integration tests for the client half of the retry protocol.
//!
//! Each test runs a scripted fake server on `127.0.0.1:0` that drops,
//! delays, or reorders responses, and checks what [`RequestClient`] does
//! about it. Timeouts are shortened to keep the tests fast.

use std::time::Duration;

use roomgate_protocol::{
    DEFAULT_MAX_FRAME_LEN, ErrorKind, Frame, FrameDecoder, Heartbeat, Message, RequestId,
    RoomId, StateUpdate, encode_frame,
};
use roomgate_session::{ClientError, RequestClient, RetryPolicy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_millis(150),
        max_retries,
    }
}

/// One accepted server-side connection, with raw access to the bytes.
struct FakeServer {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl FakeServer {
    /// Reads the next frame together with its exact encoded bytes.
    async fn recv(&mut self) -> Option<(Frame, Vec<u8>)> {
        loop {
            let snapshot = self.decoder.buffer_mut().clone();
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                let used = snapshot.len() - self.decoder.buffered_len();
                return Some((frame, snapshot[..used].to_vec()));
            }
            if self.stream.read_buf(self.decoder.buffer_mut()).await.unwrap() == 0 {
                return None;
            }
        }
    }

    async fn send(&mut self, frame: Frame) {
        let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_LEN).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }
}

async fn fake_server<F, Fut>(script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(FakeServer) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(FakeServer {
            stream,
            decoder: FrameDecoder::default(),
        })
        .await;
    });
    (addr, handle)
}

fn beat(ms: u64) -> Message {
    Message::Heartbeat(Heartbeat { sent_at_ms: ms })
}

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn test_request_returns_matching_response() {
    let (addr, server) = fake_server(|mut s| async move {
        let (frame, _) = s.recv().await.unwrap();
        s.send(Frame::new(frame.request_id, frame.message)).await;
    })
    .await;

    let mut client = RequestClient::connect(&addr, fast_policy(3)).await.unwrap();
    let echoed = client.heartbeat(42).await.unwrap();
    assert_eq!(echoed.sent_at_ms, 42);
    server.await.unwrap();
}

#[tokio::test]
async fn test_request_ids_start_at_one_and_increase() {
    let (addr, server) = fake_server(|mut s| async move {
        for expected in 1..=3 {
            let (frame, _) = s.recv().await.unwrap();
            assert_eq!(frame.request_id, RequestId(expected));
            s.send(Frame::new(frame.request_id, frame.message)).await;
        }
    })
    .await;

    let mut client = RequestClient::connect(&addr, fast_policy(3)).await.unwrap();
    for n in 0..3 {
        client.heartbeat(n).await.unwrap();
    }
    server.await.unwrap();
}

// =========================================================================
// Lost responses
// =========================================================================

#[tokio::test]
async fn test_lost_response_is_retried_with_identical_bytes() {
    let (addr, server) = fake_server(|mut s| async move {
        let (_, first) = s.recv().await.unwrap();
        // Drop the first attempt on the floor.
        let (frame, second) = s.recv().await.unwrap();
        assert_eq!(first, second, "retry must resend the same bytes");
        s.send(Frame::new(frame.request_id, frame.message)).await;
    })
    .await;

    let mut client = RequestClient::connect(&addr, fast_policy(3)).await.unwrap();
    assert_eq!(client.heartbeat(7).await.unwrap().sent_at_ms, 7);
    server.await.unwrap();
}

#[tokio::test]
async fn test_retries_exhausted_returns_timed_out() {
    let (addr, server) = fake_server(|mut s| async move {
        // Swallow the original and both retries, then hold the socket.
        for _ in 0..3 {
            s.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    })
    .await;

    let mut client = RequestClient::connect(&addr, fast_policy(2)).await.unwrap();
    let err = client.heartbeat(1).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::RequestTimedOut {
            request_id: RequestId(1),
            attempts: 3
        }
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_late_response_to_abandoned_request_is_discarded() {
    let (addr, server) = fake_server(|mut s| async move {
        let (first, _) = s.recv().await.unwrap();
        s.recv().await.unwrap(); // the only retry
        let (second, _) = s.recv().await.unwrap(); // the next request

        // Answer the abandoned request first, then the live one.
        s.send(Frame::new(first.request_id, beat(111))).await;
        s.send(Frame::new(second.request_id, second.message)).await;
    })
    .await;

    let mut client = RequestClient::connect(&addr, fast_policy(1)).await.unwrap();
    assert!(client.heartbeat(1).await.is_err());
    assert_eq!(client.heartbeat(2).await.unwrap().sent_at_ms, 2);
    server.await.unwrap();
}

// =========================================================================
// Server errors and broadcasts
// =========================================================================

#[tokio::test]
async fn test_error_response_is_distinct_from_timeout() {
    let (addr, server) = fake_server(|mut s| async move {
        let (frame, _) = s.recv().await.unwrap();
        s.send(Frame::new(
            frame.request_id,
            Message::error(ErrorKind::RoomUnavailable, "spawn failed"),
        ))
        .await;
    })
    .await;

    let mut client = RequestClient::connect(&addr, fast_policy(3)).await.unwrap();
    let err = client
        .join_room(RoomId::new("arena1").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.server_kind(), Some(ErrorKind::RoomUnavailable));
    server.await.unwrap();
}

#[tokio::test]
async fn test_state_updates_received_while_waiting_are_buffered() {
    let (addr, server) = fake_server(|mut s| async move {
        let (frame, _) = s.recv().await.unwrap();
        for n in 1..=2 {
            s.send(Frame::unsolicited(Message::StateUpdate(StateUpdate {
                room_id: RoomId::new("arena1").unwrap(),
                frame: n,
                changes: Vec::new(),
            })))
            .await;
        }
        s.send(Frame::new(frame.request_id, frame.message)).await;
    })
    .await;

    let mut client = RequestClient::connect(&addr, fast_policy(3)).await.unwrap();
    client.heartbeat(0).await.unwrap();

    let frames: Vec<u64> = client.drain_updates().iter().map(|u| u.frame).collect();
    assert_eq!(frames, vec![1, 2]);
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_close_while_waiting_returns_disconnected() {
    let (addr, server) = fake_server(|mut s| async move {
        s.recv().await.unwrap();
    })
    .await;

    let mut client = RequestClient::connect(&addr, fast_policy(3)).await.unwrap();
    let err = client.heartbeat(0).await.unwrap_err();
    assert!(matches!(err, ClientError::Disconnected));
    server.await.unwrap();
}
