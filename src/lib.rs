//! # cfgo-client
//!
//! An async client library for a conferencing SFU: subscribe to remote
//! media tracks, publish local media, and exchange application-level
//! messages over a signaling channel, all on top of Tokio.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CFGO-CLIENT LAYERS                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  L3  ┌─────────────┐  ┌──────────────────┐                             │
//! │      │   Webrtc    │  │ Track/Subscription│                            │
//! │      │  negotiate  │  │  rtp/rtcp caches  │                            │
//! │      └──────┬──────┘  └─────────┬─────────┘                            │
//! │             │                   │                                      │
//! │  L2  ┌──────┴───────────────────┴──────┐                                │
//! │      │            Signal                │ room/user envelope,         │
//! │      │          RawSignal                │ keep-alive, custom acks     │
//! │      └──────────────────┬───────────────┘                             │
//! │                         │                                              │
//! │  L1  ┌──────────────────┴───────────────────────────────┐              │
//! │      │ select/chan_*  task_group  AsyncMutex  InitOnce   │              │
//! │      │ StateNotifier  AsyncBlockerManager                │              │
//! │      └──────────────────────┬───────────────────────────┘              │
//! │                             │                                          │
//! │  L0  ┌──────────────────────┴────────────────┐                         │
//! │      │  CloseSignal   AdaptiveRingBuffer<T>   │                         │
//! │      └─────────────────────────────────────────┘                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - error taxonomy for the entire library
//! - [`config`] - configuration surface and its defaults
//! - [`cancel`] - `CloseSignal`, the hierarchical cancellation primitive
//! - [`select`] - cancellable channel operations over a `CloseSignal`
//! - [`task_group`] - `all_tasks`/`any_tasks`/`some_tasks` combinators
//! - [`sync`] - `AsyncMutex`, `StateNotifier`, `InitOnce`, `AsyncBlockerManager`
//! - [`buffer`] - `AdaptiveRingBuffer<T>`
//! - [`signal`] - the wire protocol, room/user envelope, and keep-alive
//! - [`webrtc`] - peer connection lifecycle and negotiation
//! - [`track`] - per-track packet buffering and subscriptions

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod buffer;
pub mod cancel;
pub mod config;
pub mod error;
pub mod select;
pub mod signal;
pub mod sync;
pub mod task_group;
pub mod track;
pub mod webrtc;

pub use cancel::CloseSignal;
pub use config::{Configuration, SignalConfigure, TrackConfigure};
pub use error::{Error, Result};
pub use select::Selected;
pub use signal::{CustomMessage, PublishHandle, Signal, SubscribeOp, SubscribeRequest, Subscribed, TrackAdvert};
pub use track::{Subscription, Track};
pub use webrtc::Webrtc;

/// Returns the version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
