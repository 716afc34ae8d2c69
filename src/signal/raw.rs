//! `RawSignal` — the WebSocket wire layer: msg-id correlation, per-message
//! ack channels, and a lazy-remove callback registry for unsolicited
//! frames. Built on `tokio-tungstenite`, mirroring the split
//! sender/receiver + spawned writer task shape of a federation client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::cancel::CloseSignal;
use crate::config::SignalConfigure;
use crate::error::{Error, Result, ServerError};
use crate::signal::wire::{Flag, Frame};

/// An inbound, not-yet-acked message handed to registered callbacks.
#[derive(Debug, Clone)]
pub struct RawMsg {
    pub msg_id: u64,
    pub event: String,
    pub payload: serde_json::Value,
    pub wants_ack: bool,
}

/// Lets a message callback reply with an ack, at most once.
#[derive(Clone)]
pub struct Acker {
    write_tx: mpsc::UnboundedSender<WsMessage>,
    msg_id: u64,
    wants_ack: bool,
    acked: Arc<AtomicBool>,
}

impl Acker {
    fn send_frame(&self, flag: Flag, payload_json: String) {
        if !self.wants_ack {
            return;
        }
        if self.acked.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = Frame {
            event: String::new(),
            msg_id: self.msg_id,
            flag,
            payload_json,
        };
        let _ = self.write_tx.send(WsMessage::Text(frame.encode().into()));
    }

    pub fn ack(&self, payload: serde_json::Value) {
        self.send_frame(Flag::AckNormal, payload.to_string());
    }

    pub fn ack_error(&self, err: &ServerError) {
        let payload = serde_json::json!({ "code": err.code, "msg": err.msg, "data": err.data });
        self.send_frame(Flag::AckError, payload.to_string());
    }
}

type MsgCallback = Box<dyn FnMut(RawMsg, Acker) -> bool + Send>;

struct Shared {
    write_tx: mpsc::UnboundedSender<WsMessage>,
    next_msg_id: AtomicU64,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<std::result::Result<serde_json::Value, Error>>>>,
    next_callback_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, Option<MsgCallback>>>,
    /// The closer observers (keep-alive, readers of convenience) should
    /// depend on; a child of `true_closer` so closing it never tears the
    /// socket down.
    notify_closer: CloseSignal,
    /// The closer that actually owns the socket; closing it stops the
    /// reader/writer tasks and cancels every pending ack.
    true_closer: CloseSignal,
}

/// The WebSocket wire layer for one signaling connection.
#[derive(Clone)]
pub struct RawSignal {
    shared: Arc<Shared>,
}

impl RawSignal {
    /// Connect, perform the WebSocket handshake with `Authorization` and
    /// `Signal-Id` headers, and spawn the reader/writer tasks. `closer`
    /// becomes (a parent of) the connection's true closer: closing it
    /// tears the socket down.
    pub async fn connect(closer: &CloseSignal, cfg: &SignalConfigure) -> Result<RawSignal> {
        let mut request = cfg
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Handshake(e.to_string()))?;
        if let Some(token) = &cfg.auth_token {
            let value = token
                .parse()
                .map_err(|_| Error::Handshake("invalid auth token header value".into()))?;
            request.headers_mut().insert("Authorization", value);
        }
        let signal_id = Uuid::new_v4().to_string();
        request.headers_mut().insert(
            "Signal-Id",
            signal_id.parse().map_err(|_| Error::Handshake("invalid signal id".into()))?,
        );

        let connect_fut = tokio_tungstenite::connect_async(request);
        let (ws_stream, _response) = tokio::select! {
            biased;
            _ = closer.wait() => return Err(closer.to_error()),
            res = connect_fut => res.map_err(|e| Error::Handshake(e.to_string()))?,
        };
        tracing::info!(url = %cfg.url, %signal_id, "signal connected");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WsMessage>();

        let true_closer = closer.create_child();
        let notify_closer = true_closer.create_child();

        let shared = Arc::new(Shared {
            write_tx,
            next_msg_id: AtomicU64::new(1),
            pending_acks: Mutex::new(HashMap::new()),
            next_callback_id: AtomicU64::new(1),
            callbacks: Mutex::new(HashMap::new()),
            notify_closer,
            true_closer: true_closer.clone(),
        });

        let writer_closer = true_closer.clone();
        let writer_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = writer_closer.wait() => break,
                    msg = write_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = ws_sender.send(msg).await {
                                tracing::warn!(error = %e, "signal writer failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_shared = shared.clone();
        let reader_closer = true_closer.clone();
        let reader_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = reader_closer.wait() => break,
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => reader_shared.handle_frame(&text),
                        Some(Ok(WsMessage::Close(_))) => {
                            tracing::info!("signal received close frame");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "signal read error");
                            break;
                        }
                        None => break,
                    },
                }
            }
            reader_closer.close("websocket reader stopped");
        });

        true_closer.after_close(move || {
            writer_handle.abort();
            reader_handle.abort();
        });

        Ok(RawSignal { shared })
    }

    /// A closer that is closed whenever the connection tears down, but
    /// closing it does not itself tear the connection down.
    pub fn notify_closer(&self) -> CloseSignal {
        self.shared.notify_closer.clone()
    }

    /// Tear the connection down: closes the socket and cancels every
    /// pending ack.
    pub fn close(&self, reason: impl Into<String>) {
        self.shared.true_closer.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.true_closer.is_closed()
    }

    /// Register a callback for unsolicited inbound frames. Returns a
    /// handle usable with [`remove_msg_callback`](Self::remove_msg_callback).
    /// The callback returning `false` deregisters it.
    pub fn on_msg<F>(&self, cb: F) -> u64
    where
        F: FnMut(RawMsg, Acker) -> bool + Send + 'static,
    {
        let id = self.shared.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.shared.callbacks.lock().insert(id, Some(Box::new(cb)));
        id
    }

    pub fn remove_msg_callback(&self, id: u64) {
        self.shared.callbacks.lock().remove(&id);
    }

    /// Fire a frame with no ack tracking and no suspension; safe to call
    /// from a synchronous callback (e.g. replying to an inbound message).
    pub fn send_no_ack(&self, event: impl Into<String>, payload: serde_json::Value) {
        let msg_id = self.shared.next_msg_id.fetch_add(2, Ordering::Relaxed);
        let frame = Frame {
            event: event.into(),
            msg_id,
            flag: Flag::NoAck,
            payload_json: payload.to_string(),
        };
        let _ = self.shared.write_tx.send(WsMessage::Text(frame.encode().into()));
    }

    /// Send a frame. If `wants_ack`, suspends for the peer's ack (or
    /// `closer`), returning the ack payload or a [`Error::Server`].
    pub async fn send(
        &self,
        closer: &CloseSignal,
        event: impl Into<String>,
        payload: serde_json::Value,
        wants_ack: bool,
    ) -> Result<serde_json::Value> {
        let msg_id = self.shared.next_msg_id.fetch_add(2, Ordering::Relaxed);
        let flag = if wants_ack { Flag::NeedAck } else { Flag::NoAck };
        let frame = Frame {
            event: event.into(),
            msg_id,
            flag,
            payload_json: payload.to_string(),
        };

        let rx = if wants_ack {
            let (tx, rx) = oneshot::channel();
            self.shared.pending_acks.lock().insert(msg_id, tx);
            Some(rx)
        } else {
            None
        };

        if self.shared.write_tx.send(WsMessage::Text(frame.encode().into())).is_err() {
            if wants_ack {
                self.shared.pending_acks.lock().remove(&msg_id);
            }
            return Err(Error::Transport("signal writer task is gone".into()));
        }

        match rx {
            None => Ok(serde_json::Value::Null),
            Some(rx) => {
                tokio::select! {
                    biased;
                    _ = closer.wait() => {
                        self.shared.pending_acks.lock().remove(&msg_id);
                        Err(closer.to_error())
                    }
                    res = rx => match res {
                        Ok(Ok(v)) => Ok(v),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(Error::Transport("signal closed before ack arrived".into())),
                    },
                }
            }
        }
    }
}

impl Shared {
    fn handle_frame(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed signal frame");
                return;
            }
        };
        match frame.flag {
            Flag::AckNormal | Flag::AckError => self.deliver_ack(frame),
            Flag::NeedAck | Flag::NoAck => self.dispatch_msg(frame),
        }
    }

    fn deliver_ack(&self, frame: Frame) {
        let Some(tx) = self.pending_acks.lock().remove(&frame.msg_id) else {
            tracing::trace!(msg_id = frame.msg_id, "ack for unknown or already-resolved msg_id");
            return;
        };
        let payload: serde_json::Value = serde_json::from_str(&frame.payload_json).unwrap_or(serde_json::Value::Null);
        let result = match frame.flag {
            Flag::AckNormal => Ok(payload),
            Flag::AckError => {
                let code = payload.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
                let msg = payload
                    .get("msg")
                    .and_then(|v| v.as_str())
                    .unwrap_or("server error")
                    .to_string();
                let data = payload.get("data").cloned();
                tracing::error!(code, %msg, "signal ack-error frame");
                Err(Error::Server(ServerError { code, msg, data }))
            }
            _ => unreachable!("invariant violated: deliver_ack called with a non-ack flag"),
        };
        let _ = tx.send(result);
    }

    fn dispatch_msg(&self, frame: Frame) {
        let wants_ack = frame.flag == Flag::NeedAck;
        let payload: serde_json::Value = serde_json::from_str(&frame.payload_json).unwrap_or(serde_json::Value::Null);
        let raw = RawMsg {
            msg_id: frame.msg_id,
            event: frame.event,
            payload,
            wants_ack,
        };
        let acker = Acker {
            write_tx: self.write_tx.clone(),
            msg_id: frame.msg_id,
            wants_ack,
            acked: Arc::new(AtomicBool::new(false)),
        };

        let ids: Vec<u64> = self.callbacks.lock().keys().copied().collect();
        for id in ids {
            let cb = {
                let mut callbacks = self.callbacks.lock();
                match callbacks.get_mut(&id) {
                    Some(slot) => slot.take(),
                    None => None,
                }
            };
            let Some(mut cb) = cb else { continue };
            let keep = cb(raw.clone(), acker.clone());
            let mut callbacks = self.callbacks.lock();
            if keep {
                if let Some(slot) = callbacks.get_mut(&id) {
                    *slot = Some(cb);
                }
            } else {
                callbacks.remove(&id);
            }
        }
    }
}
