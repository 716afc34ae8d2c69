//! Keep-alive ping/pong state machine, run in either an active (sender)
//! or passive (receiver/watchdog) role.

use std::time::{Duration, Instant};

use crate::cancel::CloseSignal;
use crate::error::Error;
use crate::signal::raw::RawSignal;
use crate::sync::StateNotifier;

const PING_EVENT: &str = "ping";

/// Reported to the keep-alive callback on every tick.
#[derive(Debug, Clone)]
pub struct KeepAliveContext {
    pub err: Option<String>,
    pub timeout_num: u32,
    pub timeout_dur: Duration,
    /// True while still inside the warmup grace period, where a missed
    /// beat does not yet count toward `timeout_num`.
    pub warmup: bool,
}

/// Run a keep-alive loop until `closer` fires or `cb` returns `true`.
///
/// `active` pings the peer every `timeout` and expects an ack back within
/// that same window. `!active` (passive) acks every inbound ping and runs
/// its own watchdog: if no ping arrives within `timeout`, that's a missed
/// beat too.
pub async fn keep_alive<F>(
    raw: &RawSignal,
    closer: &CloseSignal,
    room: &str,
    socket_id: &str,
    active: bool,
    timeout: Duration,
    warmup: Duration,
    mut cb: F,
) where
    F: FnMut(KeepAliveContext) -> bool + Send,
{
    let start = Instant::now();
    let mut timeout_num: u32 = 0;

    if active {
        loop {
            let in_warmup = start.elapsed() < warmup;
            let payload = serde_json::json!({ "room": room, "socketId": socket_id });
            let round_closer = closer.create_child();
            round_closer.set_timeout(timeout, "keep-alive round timed out");
            let result = raw.send(&round_closer, PING_EVENT, payload, true).await;
            match result {
                Ok(_) => timeout_num = 0,
                Err(e) => {
                    if closer.is_closed() {
                        return;
                    }
                    if !in_warmup {
                        timeout_num += 1;
                    }
                    let ctx = KeepAliveContext {
                        err: Some(e.to_string()),
                        timeout_num,
                        timeout_dur: timeout,
                        warmup: in_warmup,
                    };
                    if cb(ctx) {
                        closer.close("keep-alive callback requested stop");
                        return;
                    }
                }
            }
            tokio::select! {
                biased;
                _ = closer.wait() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
        }
    } else {
        let last_ping: std::sync::Arc<StateNotifier<u64>> = std::sync::Arc::new(StateNotifier::new(0));
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let lp = last_ping.clone();
        let ctr = counter.clone();
        let callback_id = raw.on_msg(move |msg, acker| {
            if msg.event == PING_EVENT {
                acker.ack(serde_json::json!({ "room": room, "socketId": socket_id }));
                let v = ctr.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                lp.set(v);
            }
            true
        });
        let mut seen = 0u64;
        loop {
            let in_warmup = start.elapsed() < warmup;
            let target = seen + 1;
            let waited = last_ping.wait_for(|v| *v >= target, closer).await;
            match waited {
                crate::select::Selected::Completed(v) => {
                    seen = v;
                    timeout_num = 0;
                }
                crate::select::Selected::Cancelled => {
                    raw.remove_msg_callback(callback_id);
                    return;
                }
            }
            tokio::select! {
                biased;
                _ = closer.wait() => {
                    raw.remove_msg_callback(callback_id);
                    return;
                }
                _ = tokio::time::sleep(timeout) => {
                    if last_ping.get() <= seen {
                        if !in_warmup {
                            timeout_num += 1;
                        }
                        let ctx = KeepAliveContext {
                            err: Some(Error::timeout("no ping received in time").to_string()),
                            timeout_num,
                            timeout_dur: timeout,
                            warmup: in_warmup,
                        };
                        if cb(ctx) {
                            raw.remove_msg_callback(callback_id);
                            closer.close("keep-alive callback requested stop");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// A policy constructor: closes `signal_closer` once `max_timeouts`
/// consecutive missed beats accumulate, or `max_dur` total keep-alive
/// runtime elapses.
pub fn make_keep_alive_callback(
    signal_closer: CloseSignal,
    max_timeouts: u32,
    max_dur: Duration,
) -> impl FnMut(KeepAliveContext) -> bool + Send {
    let start = Instant::now();
    move |ctx: KeepAliveContext| {
        if ctx.timeout_num > max_timeouts {
            signal_closer.close(format!("keep-alive exceeded {max_timeouts} missed beats"));
            return true;
        }
        if start.elapsed() > max_dur {
            signal_closer.close("keep-alive exceeded its maximum duration");
            return true;
        }
        false
    }
}
