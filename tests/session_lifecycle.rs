mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{TOKEN, counting_provider, mock_client, mock_client_with, test_config, wait_for_status};
use session_ws::core::{CLOSE_NORMAL, WsFrame};
use session_ws::testing::recorder;
use session_ws::{Inbound, Outbound, SessionError, SessionStatus};
use sonic_rs::JsonValueTrait;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_opens_socket_with_token_query() {
    let (client, _transport, mut server) = mock_client(test_config());
    let (rec, mut statuses) = recorder();
    client.on_status(move |status| rec.record(status));

    client.connect().await.expect("connect");
    let conn = server.accept_timeout(WAIT).await.expect("socket accepted");

    assert_eq!(
        conn.url(),
        format!("ws://mock.local/client-ws?token={TOKEN}")
    );
    assert_eq!(
        statuses.take(3, WAIT).await,
        vec![SessionStatus::Idle, SessionStatus::Connecting, SessionStatus::Open]
    );
    assert_eq!(client.status().await.unwrap(), SessionStatus::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_without_session_id_carries_generated_id() {
    let (client, _transport, mut server) = mock_client(test_config());
    client.connect().await.expect("connect");
    let mut conn = server.accept_timeout(WAIT).await.expect("socket accepted");

    client.send(Outbound::chat("hi"));

    let sent = conn.recv_json_timeout(WAIT).await.expect("chat frame");
    assert_eq!(sent.get("action").and_then(|v| v.as_str()), Some("chat"));
    assert_eq!(sent.get("text").and_then(|v| v.as_str()), Some("hi"));
    assert_eq!(sent.get("sessionId").and_then(|v| v.as_str()), Some(client.session_id()));
    assert!(sent.get("meta").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_session_id_is_preserved() {
    let (client, _transport, mut server) = mock_client(test_config());
    client.connect().await.expect("connect");
    let mut conn = server.accept_timeout(WAIT).await.expect("socket accepted");

    client.send(Outbound::chat("hi").with_session_id("caller-chosen"));

    let sent = conn.recv_json_timeout(WAIT).await.expect("chat frame");
    assert_eq!(sent.get("sessionId").and_then(|v| v.as_str()), Some("caller-chosen"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_id_is_stable_across_reconnects() {
    let (client, _transport, mut server) = mock_client(test_config());
    client.connect().await.expect("connect");
    let mut first = server.accept_timeout(WAIT).await.expect("first socket");

    client.send(Outbound::chat("before"));
    let before = first.recv_json_timeout(WAIT).await.expect("first chat");

    first.drop_socket();
    let mut second = server.accept_timeout(WAIT).await.expect("reconnected socket");
    wait_for_status(&client, SessionStatus::Open, WAIT).await;

    client.send(Outbound::chat("after"));
    let after = second.recv_json_timeout(WAIT).await.expect("second chat");

    assert_eq!(before.get("sessionId").and_then(|v| v.as_str()), Some(client.session_id()));
    assert_eq!(after.get("sessionId").and_then(|v| v.as_str()), Some(client.session_id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_reply_is_delivered_in_order() {
    let (client, _transport, mut server) = mock_client(test_config());
    let (rec, mut messages) = recorder();
    client.on_message(move |msg| rec.record(msg.clone()));

    client.connect().await.expect("connect");
    let conn = server.accept_timeout(WAIT).await.expect("socket accepted");

    conn.send_text(r#"{"type":"assistant_text_delta","text":"Hel"}"#).unwrap();
    conn.send_text(r#"{"type":"assistant_text_delta","text":"lo"}"#).unwrap();
    conn.send_text(r#"{"type":"assistant_done"}"#).unwrap();

    assert_eq!(
        messages.take(3, WAIT).await,
        vec![
            Inbound::AssistantTextDelta {
                text: "Hel".to_string()
            },
            Inbound::AssistantTextDelta {
                text: "lo".to_string()
            },
            Inbound::AssistantDone,
        ]
    );
    assert!(messages.next_timeout(Duration::from_millis(50)).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_message_subscriber_sees_every_message() {
    let (client, _transport, mut server) = mock_client(test_config());
    let (rec_a, mut seen_a) = recorder();
    let (rec_b, mut seen_b) = recorder();
    client.on_message(move |msg| rec_a.record(msg.kind().to_string()));
    client.on_message(move |msg| rec_b.record(msg.kind().to_string()));

    client.connect().await.expect("connect");
    let conn = server.accept_timeout(WAIT).await.expect("socket accepted");
    conn.send_text(r#"{"type":"error","message":"quota"}"#).unwrap();

    assert_eq!(seen_a.take(1, WAIT).await, vec!["error".to_string()]);
    assert_eq!(seen_b.take(1, WAIT).await, vec!["error".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_connects_share_one_attempt() {
    let provider = || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Some(TOKEN.to_string())
    };
    let (client, transport, mut server) = mock_client_with(test_config(), provider);

    let (a, b, c) = tokio::join!(client.connect(), client.connect(), client.connect());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    // Already open: resolves without a new socket.
    client.connect().await.expect("connect while open");

    let _conn = server.accept_timeout(WAIT).await.expect("single socket");
    assert!(server.accept_timeout(Duration::from_millis(100)).await.is_none());
    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_terminal() {
    let (client, _transport, mut server) = mock_client(test_config());
    client.connect().await.expect("connect");
    let mut conn = server.accept_timeout(WAIT).await.expect("socket accepted");

    let (rec, mut statuses) = recorder();
    client.on_status(move |status| rec.record(status));
    assert_eq!(statuses.take(1, WAIT).await, vec![SessionStatus::Open]);

    client.close();
    client.close();

    match conn.recv_outbound_timeout(WAIT).await {
        Some(WsFrame::Close(Some(close))) => assert_eq!(close.code, CLOSE_NORMAL),
        other => panic!("expected normal close frame, got {other:?}"),
    }
    assert_eq!(conn.recv_outbound_timeout(WAIT).await, None);

    assert_eq!(client.status().await.unwrap(), SessionStatus::Closed);
    assert_eq!(statuses.take(1, WAIT).await, vec![SessionStatus::Closed]);
    assert!(statuses.next_timeout(Duration::from_millis(100)).await.is_none());

    // No reconnect after a manual close, and the instance is not reusable.
    assert!(server.accept_timeout(Duration::from_millis(150)).await.is_none());
    assert_eq!(client.connect().await, Err(SessionError::Closed));

    client.send(Outbound::chat("ignored"));
    assert!(server.accept_timeout(Duration::from_millis(100)).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_during_connect_rejects_pending_connect() {
    let provider = || async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Some(TOKEN.to_string())
    };
    let (client, transport, mut server) = mock_client_with(test_config(), provider);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    wait_for_status(&client, SessionStatus::Connecting, WAIT).await;
    client.close();

    assert_eq!(pending.await.unwrap(), Err(SessionError::Closed));
    assert!(server.accept_timeout(Duration::from_millis(400)).await.is_none());
    assert_eq!(transport.connect_attempts(), 0);
    assert_eq!(client.status().await.unwrap(), SessionStatus::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_before_connect_goes_straight_to_closed() {
    let (client, transport, _server) = mock_client(test_config());
    let (rec, mut statuses) = recorder();
    client.on_status(move |status| rec.record(status));

    client.close();

    assert_eq!(
        statuses.take(2, WAIT).await,
        vec![SessionStatus::Idle, SessionStatus::Closed]
    );
    assert_eq!(transport.connect_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_while_disconnected_drops_and_triggers_connect() {
    let (client, _transport, mut server) = mock_client(test_config());

    client.send(Outbound::chat("lost"));

    let mut conn = server.accept_timeout(WAIT).await.expect("send triggered a connect");
    wait_for_status(&client, SessionStatus::Open, WAIT).await;
    assert!(
        conn.recv_outbound_timeout(Duration::from_millis(100))
            .await
            .is_none(),
        "message sent while disconnected must not be replayed"
    );

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.outbound_dropped, 1);
    assert_eq!(stats.frames_out, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callbacks_may_close_the_session() {
    let (client, _transport, mut server) = mock_client(test_config());
    let closer = client.clone();
    client.on_message(move |msg| {
        if matches!(msg, Inbound::AssistantDone) {
            closer.close();
        }
    });

    client.connect().await.expect("connect");
    let conn = server.accept_timeout(WAIT).await.expect("socket accepted");
    conn.send_text(r#"{"type":"assistant_done"}"#).unwrap();

    wait_for_status(&client, SessionStatus::Closed, WAIT).await;
    assert!(server.accept_timeout(Duration::from_millis(150)).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_subscriber_does_not_kill_the_session() {
    let (client, _transport, mut server) = mock_client(test_config());
    client.on_message(|_| panic!("subscriber bug"));
    let (rec, mut messages) = recorder();
    client.on_message(move |msg| rec.record(msg.clone()));

    client.connect().await.expect("connect");
    let conn = server.accept_timeout(WAIT).await.expect("socket accepted");
    conn.send_text(r#"{"type":"assistant_done"}"#).unwrap();

    assert_eq!(messages.take(1, WAIT).await, vec![Inbound::AssistantDone]);
    assert_eq!(client.status().await.unwrap(), SessionStatus::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_is_fetched_before_every_attempt() {
    let (provider, calls) = counting_provider();
    let (client, _transport, mut server) = mock_client_with(test_config(), provider);

    client.connect().await.expect("connect");
    let mut first = server.accept_timeout(WAIT).await.expect("first socket");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    first.drop_socket();
    let _second = server.accept_timeout(WAIT).await.expect("reconnected socket");
    wait_for_status(&client, SessionStatus::Open, WAIT).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_track_traffic() {
    let (client, _transport, mut server) = mock_client(test_config());
    client.connect().await.expect("connect");
    let mut conn = server.accept_timeout(WAIT).await.expect("socket accepted");

    client.send(Outbound::chat("one"));
    client.send(Outbound::chat("two"));
    conn.recv_json_timeout(WAIT).await.expect("first chat");
    conn.recv_json_timeout(WAIT).await.expect("second chat");

    let (rec, mut messages) = recorder();
    client.on_message(move |msg| rec.record(msg.clone()));
    conn.send_text(r#"{"type":"assistant_done"}"#).unwrap();
    messages.take(1, WAIT).await;

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.session_id, client.session_id());
    assert_eq!(stats.status, SessionStatus::Open);
    assert_eq!(stats.opens, 1);
    assert_eq!(stats.frames_out, 2);
    assert_eq!(stats.frames_in, 1);
    assert_eq!(stats.reconnect_attempts, 0);
    assert!(!stats.reconnect_exhausted);
    assert!(stats.connection_uptime.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_every_handle_releases_the_socket() {
    let (client, _transport, mut server) = mock_client(test_config());
    client.connect().await.expect("connect");
    let mut conn = server.accept_timeout(WAIT).await.expect("socket accepted");

    drop(client);

    match conn.recv_outbound_timeout(WAIT).await {
        Some(WsFrame::Close(Some(close))) => assert_eq!(close.code, CLOSE_NORMAL),
        other => panic!("expected normal close frame, got {other:?}"),
    }
    assert_eq!(conn.recv_outbound_timeout(WAIT).await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_does_not_wait_for_a_stalled_writer() {
    let (client, _transport, mut server) = mock_client(test_config().with_outbound_capacity(1));
    client.connect().await.expect("connect");
    let mut conn = server.accept_timeout(WAIT).await.expect("socket accepted");

    conn.stall_writes();
    for text in ["a", "b", "c", "d"] {
        client.send(Outbound::chat(text));
    }

    client.close();
    let status = tokio::time::timeout(Duration::from_millis(500), client.status())
        .await
        .expect("session actor stays responsive")
        .unwrap();
    assert_eq!(status, SessionStatus::Closed);

    // The stuck writer is killed and releases the socket.
    let released = tokio::time::timeout(Duration::from_secs(5), conn.recv_outbound()).await;
    assert_eq!(released, Ok(None));
}
