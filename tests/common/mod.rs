//! A minimal in-process fake signaling server: assigns socket ids on the
//! `ready` handshake, handles `join`/`leave` room membership (rejecting a
//! sentinel `forbidden-room` with an ack-error), routes `custom:*` /
//! `custom-ack` frames point-to-point by `router.socketTo`, and broadcasts
//! anything else (pings and their acks) to the sender's current
//! roommates. Good enough to drive `RawSignal`/`Signal`/keep-alive end to
//! end without a real SFU.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use cfgo_client::signal::{Flag, Frame};

#[derive(Default)]
struct State {
    next_id: u64,
    sockets: HashMap<String, mpsc::UnboundedSender<WsMessage>>,
    rooms: HashMap<String, HashSet<String>>,
}

/// A running fake server. Dropping this does not stop it; call [`Self::ws_url`]
/// to build a `ws://` URL and let the test's signals outlive the process.
pub struct FakeServer {
    pub addr: std::net::SocketAddr,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let state = state.clone();
                tokio::spawn(handle_connection(stream, state));
            }
        });
        Self { addr }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

fn ack_frame(msg_id: u64, flag: Flag, payload: serde_json::Value) -> Frame {
    Frame {
        event: String::new(),
        msg_id,
        flag,
        payload_json: payload.to_string(),
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<State>>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut sender, mut receiver) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();

    let write_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut socket_id: Option<String> = None;
    let mut joined_rooms: HashSet<String> = HashSet::new();

    while let Some(Ok(WsMessage::Text(text))) = receiver.next().await {
        let Ok(frame) = Frame::decode(&text) else { continue };

        match frame.event.as_str() {
            "ready" => {
                let id = {
                    let mut s = state.lock();
                    s.next_id += 1;
                    let id = format!("sock-{}", s.next_id);
                    s.sockets.insert(id.clone(), out_tx.clone());
                    id
                };
                socket_id = Some(id.clone());
                let ack = ack_frame(frame.msg_id, Flag::AckNormal, serde_json::json!({ "socketId": id, "rooms": [] }));
                let _ = out_tx.send(WsMessage::Text(ack.encode().into()));
            }
            "join" => {
                let payload: serde_json::Value = serde_json::from_str(&frame.payload_json).unwrap_or_default();
                let room = payload.get("room").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                if room == "forbidden-room" {
                    let err = serde_json::json!({ "code": 403, "msg": format!("no right for room {room}"), "data": serde_json::Value::Null });
                    let ack = ack_frame(frame.msg_id, Flag::AckError, err);
                    let _ = out_tx.send(WsMessage::Text(ack.encode().into()));
                } else {
                    if let Some(id) = &socket_id {
                        state.lock().rooms.entry(room.clone()).or_default().insert(id.clone());
                        joined_rooms.insert(room);
                    }
                    let ack = ack_frame(frame.msg_id, Flag::AckNormal, serde_json::json!({}));
                    let _ = out_tx.send(WsMessage::Text(ack.encode().into()));
                }
            }
            "leave" => {
                let payload: serde_json::Value = serde_json::from_str(&frame.payload_json).unwrap_or_default();
                let room = payload.get("room").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                if let Some(id) = &socket_id {
                    if let Some(members) = state.lock().rooms.get_mut(&room) {
                        members.remove(id);
                    }
                }
                joined_rooms.remove(&room);
                let ack = ack_frame(frame.msg_id, Flag::AckNormal, serde_json::json!({}));
                let _ = out_tx.send(WsMessage::Text(ack.encode().into()));
            }
            event if event.starts_with("custom:") || event == "custom-ack" => {
                let payload: serde_json::Value = serde_json::from_str(&frame.payload_json).unwrap_or_default();
                let to = payload.get("router").and_then(|r| r.get("socketTo")).and_then(|v| v.as_str());
                if let Some(to) = to {
                    if let Some(tx) = state.lock().sockets.get(to) {
                        let _ = tx.send(WsMessage::Text(text.clone()));
                    }
                }
            }
            _ => {
                // Pings (and their acks) have no routing info of their own:
                // broadcast to everyone sharing a room with the sender.
                if let Some(id) = &socket_id {
                    let peers: Vec<_> = {
                        let s = state.lock();
                        let mut targets = HashSet::new();
                        for room in &joined_rooms {
                            if let Some(members) = s.rooms.get(room) {
                                targets.extend(members.iter().filter(|m| *m != id).cloned());
                            }
                        }
                        targets.into_iter().filter_map(|m| s.sockets.get(&m).cloned()).collect()
                    };
                    for tx in peers {
                        let _ = tx.send(WsMessage::Text(text.clone()));
                    }
                }
            }
        }
    }

    if let Some(id) = socket_id {
        let mut s = state.lock();
        s.sockets.remove(&id);
        for room in &joined_rooms {
            if let Some(members) = s.rooms.get_mut(room) {
                members.remove(&id);
            }
        }
    }
    write_task.abort();
}
