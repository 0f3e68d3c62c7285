//! End-to-end flows over real TCP: listener → dispatch → backend.

use bytes::Bytes;
use futures_util::SinkExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stream_gateway::load_balancer::HealthState;
use stream_gateway::net::{next_frame, FrameCodec, InboundMetadata, ProtocolKind};
use stream_gateway::session::{ClientFrame, EndStatus};

mod common;
use common::TestGateway;

fn two_backend_config(a: std::net::SocketAddr, b: std::net::SocketAddr, extra: &str) -> String {
    format!(
        r#"
        [routing]
        default_pool = "api"

        [[backends]]
        name = "a"
        group = "api"
        address = "{a}"

        [[backends]]
        name = "b"
        group = "api"
        address = "{b}"

        [health_check]
        enabled = false

        {extra}
        "#
    )
}

fn unary() -> InboundMetadata {
    InboundMetadata::application(0, "/rpc", ProtocolKind::Unary)
}

fn stream() -> InboundMetadata {
    InboundMetadata::application(0, "/events", ProtocolKind::EventStream)
}

#[tokio::test]
async fn ten_unary_requests_split_evenly() {
    let a = common::start_backend(|s| common::respond_with_prefix(s, b"a")).await;
    let b = common::start_backend(|s| common::respond_with_prefix(s, b"b")).await;
    let gw = TestGateway::start(&two_backend_config(a, b, "")).await;

    let mut served: HashMap<u8, usize> = HashMap::new();
    for _ in 0..10 {
        let mut client = gw.connect(&unary()).await;
        client.send(b"!").await.unwrap();
        match client.recv().await {
            Some(ClientFrame::Response(body)) => *served.entry(body[0]).or_default() += 1,
            other => panic!("unexpected reply {other:?}"),
        }
    }
    assert_eq!(served.get(&b'a'), Some(&5));
    assert_eq!(served.get(&b'b'), Some(&5));
}

#[tokio::test]
async fn keep_alive_connection_serves_many_requests() {
    let a = common::start_backend(|s| common::respond_with_prefix(s, b"a:")).await;
    let gw = TestGateway::start(&format!(
        r#"
        [routing]
        default_pool = "api"

        [[backends]]
        name = "a"
        group = "api"
        address = "{a}"

        [health_check]
        enabled = false
        "#
    ))
    .await;

    let mut client = gw.connect(&unary().with_keep_alive(true)).await;
    for i in 0..3 {
        let body = format!("req-{i}");
        client.send(body.as_bytes()).await.unwrap();
        assert_eq!(
            client.recv().await,
            Some(ClientFrame::Response(Bytes::from(format!("a:{body}"))))
        );
    }
}

#[tokio::test]
async fn stream_survives_one_backend_loss_without_gaps() {
    let opened = Arc::new(AtomicUsize::new(0));
    let handler = {
        let opened = opened.clone();
        move |s: tokio::net::TcpStream| {
            let n = opened.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    let frames = (1..=7).map(|i| format!("f{i}")).collect();
                    common::push_frames(s, frames, false).await
                } else {
                    common::push_frames(s, vec!["f8".to_string()], true).await
                }
            }
        }
    };
    let a = common::start_backend(handler.clone()).await;
    let b = common::start_backend(handler).await;
    let gw = TestGateway::start(&two_backend_config(a, b, "")).await;

    let mut client = gw.connect(&stream()).await;
    client.send(b"subscribe").await.unwrap();
    let frames = client.drain(Duration::from_secs(3)).await;

    let mut expected: Vec<ClientFrame> = (1..=8)
        .map(|seq| ClientFrame::Data {
            seq,
            payload: Bytes::from(format!("f{seq}")),
        })
        .collect();
    expected.push(ClientFrame::End(EndStatus::Clean));
    assert_eq!(frames, expected);
    assert_eq!(opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stream_fails_when_the_reselect_also_fails() {
    let a = common::start_backend(|s| common::push_frames(s, vec!["only".to_string()], false)).await;
    let gw = TestGateway::start(&format!(
        r#"
        [routing]
        default_pool = "api"

        [[backends]]
        name = "a"
        group = "api"
        address = "{a}"

        [health_check]
        enabled = false
        "#
    ))
    .await;

    let mut client = gw.connect(&stream()).await;
    client.send(b"subscribe").await.unwrap();
    let frames = client.drain(Duration::from_secs(3)).await;
    assert_eq!(frames.last(), Some(&ClientFrame::End(EndStatus::Failed)));
}

#[tokio::test]
async fn concurrent_idempotent_requests_reach_the_backend_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let a = {
        let hits = hits.clone();
        common::start_backend(move |s| {
            let hits = hits.clone();
            async move {
                let mut frames = FrameCodec::default().framed(s);
                while let Ok(Some(frame)) = next_frame(&mut frames).await {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let reply = format!("{}#{n}", String::from_utf8_lossy(&frame));
                    if frames.send(Bytes::from(reply)).await.is_err() {
                        break;
                    }
                }
            }
        })
        .await
    };
    let gw = TestGateway::start(&format!(
        r#"
        [routing]
        default_pool = "api"

        [[backends]]
        name = "a"
        group = "api"
        address = "{a}"

        [health_check]
        enabled = false
        "#
    ))
    .await;

    let keyed = unary().with_header("Idempotency-Key", "order-42");
    let mut first = gw.connect(&keyed).await;
    let mut second = gw.connect(&keyed).await;
    first.send(b"charge").await.unwrap();
    second.send(b"charge").await.unwrap();

    let expected = Some(ClientFrame::Response(Bytes::from_static(b"charge#1")));
    assert_eq!(first.recv().await, expected);
    assert_eq!(second.recv().await, expected);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // a later retry with the same key gets the recorded outcome
    let mut retry = gw.connect(&keyed).await;
    retry.send(b"charge").await.unwrap();
    assert_eq!(retry.recv().await, expected);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnecting_client_gets_exactly_the_missed_frames() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let a = {
        let accepted = accepted.clone();
        common::start_backend(move |s| {
            accepted.fetch_add(1, Ordering::SeqCst);
            let first: Vec<String> = (1..=5).map(|n| format!("f{n}")).collect();
            let second: Vec<String> = (6..=10).map(|n| format!("f{n}")).collect();
            common::push_batches(s, vec![first, second], Duration::from_millis(150))
        })
        .await
    };
    let gw = TestGateway::start(&format!(
        r#"
        [routing]
        default_pool = "api"

        [[backends]]
        name = "a"
        group = "api"
        address = "{a}"

        [health_check]
        enabled = false
        "#
    ))
    .await;
    let frame = |seq: u64| ClientFrame::Data {
        seq,
        payload: Bytes::from(format!("f{seq}")),
    };

    let mut client = gw.connect(&stream().with_header("x-session-id", "feed-1")).await;
    client.send(b"subscribe").await.unwrap();
    for seq in 1..=5 {
        assert_eq!(client.recv().await, Some(frame(seq)));
    }
    // gone before the second batch; the gateway keeps recording it
    drop(client);

    let sessions = gw.gateway.sessions().clone();
    assert!(
        common::eventually(Duration::from_secs(2), || gw.gateway.tracker().active_count() == 0).await,
        "first connection never closed"
    );
    assert!(sessions.directory.get("feed-1").is_some());
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut client = gw
        .connect(
            &stream()
                .with_header("x-session-id", "feed-1")
                .with_header("last-event-id", "3"),
        )
        .await;
    client.send(b"subscribe").await.unwrap();
    for seq in 4..=10 {
        assert_eq!(client.recv().await, Some(frame(seq)));
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_listener_splices_raw_bytes() {
    let a = common::start_backend(|mut s| async move {
        let mut buf = [0u8; 1024];
        while let Ok(n) = s.read(&mut buf).await {
            if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    })
    .await;
    let gw = TestGateway::start(&format!(
        r#"
        [routing]
        default_pool = "api"

        [[backends]]
        name = "a"
        group = "api"
        address = "{a}"

        [health_check]
        enabled = false
        "#
    ))
    .await;
    let raw = gw.bind_transport("api").await;

    let mut client = tokio::net::TcpStream::connect(raw).await.unwrap();
    client.write_all(b"not framed at all").await.unwrap();
    let mut echoed = [0u8; 17];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"not framed at all");
}

#[tokio::test]
async fn prober_takes_dead_backends_out_of_rotation() {
    let live = common::start_backend(|s| common::respond_with_prefix(s, b"live")).await;
    let dead = common::closed_port().await;
    let gw = TestGateway::start(&format!(
        r#"
        [routing]
        default_pool = "api"

        [[backends]]
        name = "live"
        group = "api"
        address = "{live}"

        [[backends]]
        name = "dead"
        group = "api"
        address = "{dead}"

        [health_check]
        enabled = true
        interval_ms = 20
        max_interval_ms = 100
        timeout_ms = 200
        soft_failure_threshold = 1
        hard_failure_threshold = 3
        "#
    ))
    .await;

    let registry = gw.gateway.registry().clone();
    let state = |id: &str| registry.snapshot(&id.into()).map(|b| b.state);
    assert!(common::eventually(Duration::from_secs(3), || state("live") == Some(HealthState::Healthy)).await);
    // never probed successfully: unknown until the hard threshold, then unhealthy
    assert!(common::eventually(Duration::from_secs(3), || state("dead") == Some(HealthState::Unhealthy)).await);

    for _ in 0..4 {
        let mut client = gw.connect(&unary()).await;
        client.send(b"?").await.unwrap();
        assert_eq!(client.recv().await, Some(ClientFrame::Response(Bytes::from_static(b"live?"))));
    }
}
