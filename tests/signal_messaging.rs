//! End-to-end: `Signal`s resolve their identity, join/leave rooms, and
//! exchange custom messages (fire-and-forget and acked-with-reply) over a
//! fake relay server.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cfgo_client::config::SignalConfigure;
use cfgo_client::signal::{keep_alive, make_keep_alive_callback};
use cfgo_client::{CloseSignal, Error, Signal};

fn cfg(url: &str) -> SignalConfigure {
    SignalConfigure {
        url: url.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn connect_resolves_identity_and_join_adds_room() {
    let server = common::FakeServer::start().await;
    let closer = CloseSignal::new();
    let signal = Signal::connect(&closer, &cfg(&server.ws_url())).await.unwrap();

    let id = signal.id(&closer).await.unwrap();
    assert!(!id.is_empty());
    assert!(signal.rooms().is_empty());

    signal.join(&closer, "room").await.unwrap();
    assert_eq!(signal.rooms(), vec!["room".to_string()]);
    assert!(!signal.raw().is_closed());
}

#[tokio::test]
async fn join_rejection_surfaces_as_server_error_and_leaves_rooms_unchanged() {
    let server = common::FakeServer::start().await;
    let closer = CloseSignal::new();
    let signal = Signal::connect(&closer, &cfg(&server.ws_url())).await.unwrap();

    let err = signal.join(&closer, "forbidden-room").await.unwrap_err();
    match err {
        Error::Server(e) => assert_eq!(e.msg, "no right for room forbidden-room"),
        other => panic!("expected a server error, got {other:?}"),
    }
    assert!(signal.rooms().is_empty());
}

#[tokio::test]
async fn two_signals_exchange_fire_and_forget_messages() {
    let server = common::FakeServer::start().await;
    let closer = CloseSignal::new();

    let a = Signal::connect(&closer, &cfg(&server.ws_url())).await.unwrap();
    let b = Signal::connect(&closer, &cfg(&server.ws_url())).await.unwrap();
    a.join(&closer, "room").await.unwrap();
    b.join(&closer, "room").await.unwrap();
    let a_id = a.id(&closer).await.unwrap();
    let b_id = b.id(&closer).await.unwrap();

    let received_by_a: Arc<Mutex<Vec<(String, String, serde_json::Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_by_b: Arc<Mutex<Vec<(String, String, serde_json::Value)>>> = Arc::new(Mutex::new(Vec::new()));

    let ra = received_by_a.clone();
    a.on_message(move |msg| ra.lock().unwrap().push((msg.room.clone(), msg.from.clone(), msg.content.clone())));
    let rb = received_by_b.clone();
    b.on_message(move |msg| rb.lock().unwrap().push((msg.room.clone(), msg.from.clone(), msg.content.clone())));

    let send_closer = closer.create_child();
    send_closer.set_timeout(Duration::from_secs(5), "message round trip timed out");

    let ack_a = a.send_message(&send_closer, "room", &b_id, "hello", serde_json::json!("hi from a"), false).await.unwrap();
    let ack_b = b.send_message(&send_closer, "room", &a_id, "hello", serde_json::json!("hi from b"), false).await.unwrap();
    assert_eq!(ack_a, "");
    assert_eq!(ack_b, "");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let a_inbox = received_by_a.lock().unwrap().clone();
    let b_inbox = received_by_b.lock().unwrap().clone();
    assert_eq!(a_inbox.len(), 1);
    assert_eq!(b_inbox.len(), 1);
    assert_eq!(a_inbox[0].2, serde_json::json!("hi from b"));
    assert_eq!(b_inbox[0].2, serde_json::json!("hi from a"));
}

#[tokio::test]
async fn thirty_parallel_acked_messages_each_get_an_accepted_reply() {
    let server = common::FakeServer::start().await;
    let closer = CloseSignal::new();

    let a = Signal::connect(&closer, &cfg(&server.ws_url())).await.unwrap();
    let b = Signal::connect(&closer, &cfg(&server.ws_url())).await.unwrap();
    a.join(&closer, "room").await.unwrap();
    b.join(&closer, "room").await.unwrap();
    let b_id = b.id(&closer).await.unwrap();

    b.on_message(|msg| msg.reply("accepted"));

    let send_closer = closer.create_child();
    send_closer.set_timeout(Duration::from_secs(5), "message round trip timed out");

    let mut handles = Vec::new();
    for i in 0..30 {
        let a = a.clone();
        let send_closer = send_closer.clone();
        let b_id = b_id.clone();
        handles.push(tokio::spawn(async move {
            a.send_message(&send_closer, "room", &b_id, &format!("hello{i:03}"), serde_json::Value::Null, true).await
        }));
    }

    let mut accepted = 0;
    for h in handles {
        assert_eq!(h.await.unwrap().unwrap(), "accepted");
        accepted += 1;
    }
    assert_eq!(accepted, 30);
}

#[tokio::test]
async fn active_and_passive_keep_alive_see_no_missed_beats() {
    let server = common::FakeServer::start().await;
    let closer = CloseSignal::new();

    let a = Signal::connect(&closer, &cfg(&server.ws_url())).await.unwrap();
    let b = Signal::connect(&closer, &cfg(&server.ws_url())).await.unwrap();
    a.join(&closer, "room").await.unwrap();
    b.join(&closer, "room").await.unwrap();

    let a_closer = a.notify_closer();
    let b_closer = b.notify_closer();

    let a_cb = make_keep_alive_callback(a_closer.clone(), 1, Duration::from_secs(30));
    let a_raw = a.raw().clone();
    let a_socket = a.id(&closer).await.unwrap();
    let a_run_closer = a_closer.clone();
    let a_task = tokio::spawn(async move {
        keep_alive(&a_raw, &a_run_closer, "room", &a_socket, true, Duration::from_millis(300), Duration::from_millis(200), a_cb).await;
    });

    let b_raw = b.raw().clone();
    let b_socket = b.id(&closer).await.unwrap();
    let b_task = tokio::spawn(async move {
        keep_alive(&b_raw, &b_closer, "room", &b_socket, false, Duration::from_millis(800), Duration::from_millis(200), |_ctx| false).await;
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!a_closer.is_closed(), "active side's keep-alive closer should still be open after a quiet second");

    a_task.abort();
    b_task.abort();
}
