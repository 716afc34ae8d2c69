//! The signal protocol layer: a raw, msg-id-correlated WebSocket wire
//! format (`raw`), a room/user-scoped envelope façade over it
//! (`envelope`), and the keep-alive state machine (`keepalive`) that rides
//! on top of both.

pub mod envelope;
pub mod keepalive;
pub mod raw;
pub mod wire;

pub use envelope::{CustomMessage, PublishHandle, Signal, SubscribeOp, SubscribeRequest, Subscribed, TrackAdvert};
pub use keepalive::{keep_alive, make_keep_alive_callback, KeepAliveContext};
pub use raw::{Acker, RawMsg, RawSignal};
pub use wire::{Flag, Frame};
