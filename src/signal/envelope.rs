//! `Signal` — the identity/rooms façade over [`RawSignal`]: a ready-gated
//! identity handshake, room membership, custom application messages with
//! a receive-side reply channel, and the subscribe/publish handshakes that
//! hand off into WebRTC negotiation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::cancel::CloseSignal;
use crate::config::SignalConfigure;
use crate::error::{Error, Result, ServerError};
use crate::select::Selected;
use crate::signal::raw::RawSignal;
use crate::sync::StateNotifier;

const CUSTOM_PREFIX: &str = "custom:";

/// A track advertised by `subscribed`/`published`, before WebRTC
/// negotiation binds it to a media section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackAdvert {
    #[serde(rename = "bindId")]
    pub bind_id: String,
    #[serde(rename = "pubId")]
    pub pub_id: String,
    #[serde(rename = "globalId")]
    pub global_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub rid: Option<String>,
    #[serde(rename = "streamId")]
    pub stream_id: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOp {
    Add = 0,
    Remove = 1,
    Update = 2,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub op: SubscribeOp,
    pub req_types: Vec<String>,
    pub pattern: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Subscribed {
    pub sub_id: String,
    pub pub_id: String,
    pub sdp_id: String,
    pub tracks: Vec<TrackAdvert>,
}

struct SubscribedWait {
    tx: Option<oneshot::Sender<Subscribed>>,
}

/// An inbound custom application message, handed to [`Signal::on_message`]
/// callbacks. Carries a `reply` method so the handler can acknowledge it
/// back to the sender.
pub struct CustomMessage {
    pub room: String,
    pub from: String,
    pub content: serde_json::Value,
    signal: Signal,
    msg_id: u64,
}

impl CustomMessage {
    /// Reply to the sender with a `custom-ack` carrying `content`,
    /// fulfilling the sender's `send_message(..., ack: true)` wait. Safe to
    /// call from inside the synchronous `on_message` callback; does not
    /// suspend and never fails silently-droppable acks twice.
    pub fn reply(&self, content: impl Into<serde_json::Value>) {
        let payload = serde_json::json!({
            "msgId": self.msg_id,
            "router": {
                "room": self.room,
                "socketFrom": self.signal.socket_id(),
                "socketTo": self.from,
            },
            "content": content.into(),
            "err": serde_json::Value::Null,
        });
        self.signal.inner.raw.send_no_ack("custom-ack", payload);
    }

    /// Reply to the sender with a `ServerError` instead of a content ack.
    pub fn reply_error(&self, err: ServerError) {
        let payload = serde_json::json!({
            "msgId": self.msg_id,
            "router": {
                "room": self.room,
                "socketFrom": self.signal.socket_id(),
                "socketTo": self.from,
            },
            "content": serde_json::Value::Null,
            "err": { "code": err.code, "msg": err.msg, "data": err.data },
        });
        self.signal.inner.raw.send_no_ack("custom-ack", payload);
    }
}

type CustomCallback = Box<dyn FnMut(String, String, u64, serde_json::Value) + Send>;

struct Inner {
    raw: RawSignal,
    /// Resolves to the server-assigned socket id once the `ready` ack
    /// arrives; `id`/`socket_id` block on this.
    identity: StateNotifier<Option<String>>,
    rooms: Mutex<HashSet<String>>,
    next_custom_msg_id: AtomicU64,
    custom_acks: Mutex<HashMap<(u64, String, String), oneshot::Sender<std::result::Result<String, ServerError>>>>,
    subscribed_waiters: Mutex<HashMap<String, SubscribedWait>>,
    message_callbacks: Mutex<HashMap<u64, Option<CustomCallback>>>,
    next_message_callback_id: AtomicU64,
}

/// Identity/rooms envelope façade over [`RawSignal`].
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

/// Auto-unregistering handle returned by [`Signal::publish_handle`].
pub struct PublishHandle {
    signal: Signal,
    callback_id: u64,
}

impl Drop for PublishHandle {
    fn drop(&mut self) {
        self.signal.inner.message_callbacks.lock().remove(&self.callback_id);
    }
}

impl Signal {
    /// Connect and complete the identity/ready handshake. The server
    /// assigns a socket id (and optionally an initial room set) in its
    /// `ready` ack; both are available through [`id`](Self::id) and
    /// [`rooms`](Self::rooms) once this returns.
    pub async fn connect(closer: &CloseSignal, cfg: &SignalConfigure) -> Result<Signal> {
        let raw = RawSignal::connect(closer, cfg).await?;

        let signal = Signal {
            inner: Arc::new(Inner {
                raw,
                identity: StateNotifier::new(None),
                rooms: Mutex::new(HashSet::new()),
                next_custom_msg_id: AtomicU64::new(1),
                custom_acks: Mutex::new(HashMap::new()),
                subscribed_waiters: Mutex::new(HashMap::new()),
                message_callbacks: Mutex::new(HashMap::new()),
                next_message_callback_id: AtomicU64::new(1),
            }),
        };
        signal.install_dispatch();

        let ack = signal.inner.raw.send(closer, "ready", serde_json::json!({}), true).await?;
        let socket_id = ack
            .get("socketId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol("ready ack missing socketId".into()))?
            .to_string();
        let initial_rooms: Vec<String> = ack
            .get("rooms")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        signal.inner.rooms.lock().extend(initial_rooms);
        signal.inner.identity.set(Some(socket_id.clone()));
        tracing::info!(%socket_id, "signal ready");

        Ok(signal)
    }

    /// Resolve the server-assigned socket id, blocking until the `ready`
    /// handshake completes (or `closer` fires).
    pub async fn id(&self, closer: &CloseSignal) -> Result<String> {
        match self.inner.identity.wait_for(|v| v.is_some(), closer).await {
            Selected::Completed(Some(id)) => Ok(id),
            Selected::Completed(None) => unreachable!("invariant violated: wait_for predicate guarantees Some"),
            Selected::Cancelled => Err(closer.to_error()),
        }
    }

    /// Best-effort synchronous socket id; empty until `connect` has
    /// resolved the `ready` handshake, which it always does before
    /// returning — safe to call unconditionally after `connect` succeeds.
    pub fn socket_id(&self) -> String {
        self.inner.identity.get().unwrap_or_default()
    }

    /// Rooms currently joined, as last confirmed by the server.
    pub fn rooms(&self) -> Vec<String> {
        self.inner.rooms.lock().iter().cloned().collect()
    }

    /// Join `room`. On rejection the server's [`ServerError`] is returned
    /// and `rooms()` is left unchanged.
    pub async fn join(&self, closer: &CloseSignal, room: impl Into<String>) -> Result<()> {
        let room = room.into();
        self.inner
            .raw
            .send(closer, "join", serde_json::json!({ "room": room }), true)
            .await?;
        self.inner.rooms.lock().insert(room);
        Ok(())
    }

    /// Leave `room`. On rejection the server's [`ServerError`] is returned
    /// and `rooms()` is left unchanged.
    pub async fn leave(&self, closer: &CloseSignal, room: impl Into<String>) -> Result<()> {
        let room = room.into();
        self.inner
            .raw
            .send(closer, "leave", serde_json::json!({ "room": room }), true)
            .await?;
        self.inner.rooms.lock().remove(&room);
        Ok(())
    }

    pub fn raw(&self) -> &RawSignal {
        &self.inner.raw
    }

    pub fn notify_closer(&self) -> CloseSignal {
        self.inner.raw.notify_closer()
    }

    pub fn close(&self, reason: impl Into<String>) {
        self.inner.raw.close(reason);
    }

    fn install_dispatch(&self) {
        let inner = self.inner.clone();
        let signal = self.clone();
        self.inner.raw.on_msg(move |msg, _acker| {
            match msg.event.as_str() {
                "subscribed" => {
                    if let Ok(sub) = parse_subscribed(&msg.payload) {
                        if let Some(mut w) = inner.subscribed_waiters.lock().remove(&sub.sub_id) {
                            if let Some(tx) = w.tx.take() {
                                let _ = tx.send(sub);
                            }
                        }
                    }
                }
                "published" => {
                    let ids: Vec<u64> = inner.message_callbacks.lock().keys().copied().collect();
                    for id in ids {
                        invoke_custom_callback(&signal, id, String::new(), String::new(), 0, msg.payload.clone());
                    }
                }
                "custom-ack" => {
                    let room = msg.payload.get("router").and_then(|r| r.get("room")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let user_id = msg.payload.get("router").and_then(|r| r.get("socketTo")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let msg_id = msg.payload.get("msgId").and_then(|v| v.as_u64()).unwrap_or(msg.msg_id);
                    let key = (msg_id, room, user_id);
                    if let Some(tx) = inner.custom_acks.lock().remove(&key) {
                        let err = msg.payload.get("err");
                        let result = match err {
                            Some(e) if !e.is_null() => Err(ServerError {
                                code: e.get("code").and_then(|v| v.as_i64()).unwrap_or(-1),
                                msg: e.get("msg").and_then(|v| v.as_str()).unwrap_or("error").to_string(),
                                data: e.get("data").cloned(),
                            }),
                            _ => Ok(msg
                                .payload
                                .get("content")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string()),
                        };
                        let _ = tx.send(result);
                    }
                }
                event if event.starts_with(CUSTOM_PREFIX) => {
                    let room = msg.payload.get("router").and_then(|r| r.get("room")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let socket_from = msg.payload.get("router").and_then(|r| r.get("socketFrom")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let content = msg.payload.get("content").cloned().unwrap_or(serde_json::Value::Null);
                    let msg_id = msg.payload.get("msgId").and_then(|v| v.as_u64()).unwrap_or(msg.msg_id);
                    let ids: Vec<u64> = inner.message_callbacks.lock().keys().copied().collect();
                    for id in ids {
                        invoke_custom_callback(&signal, id, room.clone(), socket_from.clone(), msg_id, content.clone());
                    }
                }
                _ => {}
            }
            true
        });
    }

    /// Send an application-level message to `to_socket_id` within `room`.
    /// If `ack`, suspends for the recipient's [`CustomMessage::reply`] and
    /// returns its content string, surfacing a [`ServerError`] if the
    /// recipient replied with one instead.
    pub async fn send_message(
        &self,
        closer: &CloseSignal,
        room: &str,
        to_socket_id: &str,
        event: &str,
        content: serde_json::Value,
        ack: bool,
    ) -> Result<String> {
        let msg_id = self.inner.next_custom_msg_id.fetch_add(1, Ordering::Relaxed);
        let socket_id = self.socket_id();
        let rx = if ack {
            let (tx, rx) = oneshot::channel();
            self.inner.custom_acks.lock().insert((msg_id, room.to_string(), to_socket_id.to_string()), tx);
            Some(rx)
        } else {
            None
        };
        let payload = serde_json::json!({
            "router": { "room": room, "socketFrom": socket_id, "socketTo": to_socket_id },
            "content": content,
            "msgId": msg_id,
            "ack": ack,
        });
        self.inner
            .raw
            .send(closer, format!("{CUSTOM_PREFIX}{event}"), payload, false)
            .await?;

        match rx {
            None => Ok(String::new()),
            Some(rx) => {
                tokio::select! {
                    biased;
                    _ = closer.wait() => {
                        self.inner.custom_acks.lock().remove(&(msg_id, room.to_string(), to_socket_id.to_string()));
                        Err(closer.to_error())
                    }
                    res = rx => match res {
                        Ok(Ok(content)) => Ok(content),
                        Ok(Err(e)) => Err(Error::Server(e)),
                        Err(_) => Err(Error::Transport("signal closed before custom-ack arrived".into())),
                    },
                }
            }
        }
    }

    /// Register a handler for inbound custom messages. Returns a handle
    /// usable with [`remove_message_callback`](Self::remove_message_callback).
    pub fn on_message<F>(&self, mut cb: F) -> u64
    where
        F: FnMut(CustomMessage) + Send + 'static,
    {
        let signal = self.clone();
        let id = self.inner.next_message_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner.message_callbacks.lock().insert(
            id,
            Some(Box::new(move |room, from, msg_id, content| {
                cb(CustomMessage {
                    room,
                    from,
                    content,
                    signal: signal.clone(),
                    msg_id,
                });
            })),
        );
        id
    }

    pub fn remove_message_callback(&self, id: u64) {
        self.inner.message_callbacks.lock().remove(&id);
    }

    /// Send a `subscribe` request and await the server's ack carrying a
    /// `sub_id`. Does *not* wait for the `subscribed` envelope — see
    /// [`wait_subscribed`](Self::wait_subscribed).
    pub async fn subscribe(&self, closer: &CloseSignal, req: SubscribeRequest) -> Result<String> {
        let payload = serde_json::json!({
            "op": req.op as i64,
            "reqTypes": req.req_types,
            "pattern": req.pattern,
        });
        let ack = self.inner.raw.send(closer, "subscribe", payload, true).await?;
        let sub_id = ack
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol("subscribe ack missing id".into()))?
            .to_string();
        self.inner.subscribed_waiters.lock().insert(sub_id.clone(), SubscribedWait { tx: None });
        Ok(sub_id)
    }

    /// Suspend for the inbound `subscribed` envelope matching `sub_id`,
    /// consuming the registered wait exactly once.
    pub async fn wait_subscribed(&self, closer: &CloseSignal, sub_id: &str) -> Result<Subscribed> {
        let rx = {
            let mut waiters = self.inner.subscribed_waiters.lock();
            let entry = waiters
                .get_mut(sub_id)
                .ok_or_else(|| Error::Invariant(format!("wait_subscribed called twice for {sub_id}")))?;
            if entry.tx.is_some() {
                return Err(Error::Invariant(format!("wait_subscribed called twice for {sub_id}")));
            }
            let (tx, rx) = oneshot::channel();
            entry.tx = Some(tx);
            rx
        };
        tokio::select! {
            biased;
            _ = closer.wait() => {
                self.inner.subscribed_waiters.lock().remove(sub_id);
                Err(closer.to_error())
            }
            res = rx => res.map_err(|_| Error::Transport("signal closed before subscribed envelope arrived".into())),
        }
    }

    /// Register a `published` handler bound to this publication. The
    /// returned handle auto-unregisters when dropped.
    pub fn publish_handle<F>(&self, mut on_published: F) -> PublishHandle
    where
        F: FnMut(serde_json::Value) + Send + 'static,
    {
        let id = self.on_message_raw(move |_room, _from, _msg_id, payload| on_published(payload));
        PublishHandle {
            signal: self.clone(),
            callback_id: id,
        }
    }

    fn on_message_raw<F>(&self, mut cb: F) -> u64
    where
        F: FnMut(String, String, u64, serde_json::Value) + Send + 'static,
    {
        let id = self.inner.next_message_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .message_callbacks
            .lock()
            .insert(id, Some(Box::new(move |room, from, msg_id, payload| cb(room, from, msg_id, payload))));
        id
    }

    /// Send a `publish` request and return once the server acks it.
    pub async fn publish(&self, closer: &CloseSignal, pattern: serde_json::Value) -> Result<String> {
        let ack = self
            .inner
            .raw
            .send(closer, "publish", serde_json::json!({ "pattern": pattern }), true)
            .await?;
        ack.get("pubId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("publish ack missing pubId".into()))
    }
}

fn invoke_custom_callback(signal: &Signal, id: u64, room: String, from: String, msg_id: u64, content: serde_json::Value) {
    let cb = {
        let mut callbacks = signal.inner.message_callbacks.lock();
        match callbacks.get_mut(&id) {
            Some(slot) => slot.take(),
            None => None,
        }
    };
    let Some(mut cb) = cb else { return };
    cb(room, from, msg_id, content);
    let mut callbacks = signal.inner.message_callbacks.lock();
    if let Some(slot) = callbacks.get_mut(&id) {
        *slot = Some(cb);
    }
}

fn parse_subscribed(payload: &serde_json::Value) -> Result<Subscribed> {
    let sub_id = payload
        .get("subId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Protocol("subscribed envelope missing subId".into()))?
        .to_string();
    let pub_id = payload.get("pubId").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let sdp_id = payload.get("sdpId").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let tracks: Vec<TrackAdvert> = payload
        .get("tracks")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(Error::Serialization)?
        .unwrap_or_default();
    Ok(Subscribed {
        sub_id,
        pub_id,
        sdp_id,
        tracks,
    })
}
