//! # Structured Cancellation
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     CLOSE SIGNAL TREE                      │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                             │
//! │   root ──create_child──▶ child ──create_child──▶ grand     │
//! │    │                       │                       │       │
//! │    │ close()                │                       │       │
//! │    ▼                       ▼                       ▼       │
//! │  closed ───────────▶ cascades down ───────▶ cascades down  │
//! │                                                             │
//! │  set_timeout / stop / resume propagate the same way.       │
//! │  Never(): a sentinel leaf that is never closed.            │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`CloseSignal`] is a node in a tree of cancellation scopes. Closing a
//! node closes every descendant. Waiters registered on a node resolve the
//! instant it (or an ancestor) closes — even if they subscribed after the
//! fact, since registration and close both serialize on the same lock.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{CancelError, CancelReason, Error, Result};

/// The outcome handed to every waiter when a signal closes.
#[derive(Debug, Clone)]
struct CloseOutcome {
    is_timeout: bool,
    reason: String,
}

struct TimerHandle {
    generation: u64,
    handle: AbortHandle,
    /// The instant the *current* countdown started; preserved across
    /// `set_timeout` rearms so a rearm shifts the deadline rather than
    /// restarting it from now.
    armed_at: Instant,
}

struct Inner {
    closed: bool,
    is_timeout: bool,
    close_reason: String,
    stopped: bool,
    timeout: Duration,
    timeout_reason: String,
    timer: Option<TimerHandle>,
    /// Captured remaining duration while stopped, rearmed on resume.
    remaining_on_stop: Option<Duration>,
    waiters: Vec<oneshot::Sender<CloseOutcome>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    children: Vec<Arc<CloseSignalState>>,
}

/// Shared state behind a [`CloseSignal`]. Never constructed directly;
/// reached through `CloseSignal::new` / `create_child`.
pub struct CloseSignalState {
    inner: Mutex<Inner>,
    parent: Option<Weak<CloseSignalState>>,
}

static NEXT_TIMER_GENERATION: AtomicU64 = AtomicU64::new(1);

impl CloseSignalState {
    fn new(parent: Option<Weak<CloseSignalState>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                closed: false,
                is_timeout: false,
                close_reason: String::new(),
                stopped: false,
                timeout: Duration::ZERO,
                timeout_reason: String::new(),
                timer: None,
                remaining_on_stop: None,
                waiters: Vec::new(),
                stop_waiters: Vec::new(),
                children: Vec::new(),
            }),
            parent,
        }
    }

    fn register_waiter(self: &Arc<Self>) -> oneshot::Receiver<CloseOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.closed {
            let _ = tx.send(CloseOutcome {
                is_timeout: inner.is_timeout,
                reason: inner.close_reason.clone(),
            });
        } else {
            inner.waiters.push(tx);
        }
        rx
    }

    fn close_internal(self: &Arc<Self>, is_timeout: bool, reason: String) {
        let (waiters, stop_waiters, children) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.stopped = false;
            inner.is_timeout = is_timeout;
            inner.close_reason = reason.clone();
            if let Some(t) = inner.timer.take() {
                t.handle.abort();
            }
            (
                std::mem::take(&mut inner.waiters),
                std::mem::take(&mut inner.stop_waiters),
                std::mem::take(&mut inner.children),
            )
        };

        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            let mut pinner = parent.inner.lock();
            pinner.children.retain(|c| !Arc::ptr_eq(c, self));
        }

        let outcome = CloseOutcome {
            is_timeout,
            reason: reason.clone(),
        };
        for w in waiters {
            let _ = w.send(outcome.clone());
        }
        for w in stop_waiters {
            let _ = w.send(());
        }
        for child in children {
            child.close_internal(is_timeout, reason.clone());
        }
    }

    fn set_timeout_internal(self: &Arc<Self>, dur: Duration, reason: String) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.timeout_reason = reason;
        if let Some(existing) = inner.timer.take() {
            existing.handle.abort();
        }
        if dur.is_zero() {
            inner.timeout = Duration::ZERO;
            return;
        }
        let armed_at = Instant::now();
        inner.timeout = dur;
        let generation = NEXT_TIMER_GENERATION.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let join = tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            if let Some(state) = weak.upgrade() {
                state.on_timer_fire(generation);
            }
        });
        inner.timer = Some(TimerHandle {
            generation,
            handle: join.abort_handle(),
            armed_at,
        });
    }

    fn on_timer_fire(self: &Arc<Self>, generation: u64) {
        let reason = {
            let inner = self.inner.lock();
            let matches = matches!(&inner.timer, Some(t) if t.generation == generation);
            if inner.closed || inner.stopped || !matches {
                return;
            }
            inner.timeout_reason.clone()
        };
        self.close_internal(true, reason);
    }

    fn stop_internal(self: &Arc<Self>, stop_timer: bool) {
        let children = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Vec::new();
            }
            inner.stopped = true;
            if stop_timer {
                if let Some(t) = inner.timer.take() {
                    t.handle.abort();
                    let deadline = t.armed_at + inner.timeout;
                    inner.remaining_on_stop = Some(deadline.saturating_duration_since(Instant::now()));
                }
            }
            inner.children.clone()
        };
        for child in children {
            child.stop_internal(stop_timer);
        }
    }

    fn resume_internal(self: &Arc<Self>) {
        let (rearm, reason, waiters, children) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.stopped = false;
            let rearm = inner.remaining_on_stop.take();
            let reason = inner.timeout_reason.clone();
            (
                rearm,
                reason,
                std::mem::take(&mut inner.stop_waiters),
                inner.children.clone(),
            )
        };
        if let Some(rem) = rearm {
            self.set_timeout_internal(rem, reason);
        }
        for w in waiters {
            let _ = w.send(());
        }
        for child in children {
            child.resume_internal();
        }
    }

    fn stop_waiter(self: &Arc<Self>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if !inner.stopped || inner.closed {
            let _ = tx.send(());
        } else {
            inner.stop_waiters.push(tx);
        }
        rx
    }
}

/// A node in a cancellation tree, or the sentinel [`CloseSignal::Never`].
///
/// Cloning a `CloseSignal` clones the handle, not the node: all clones
/// observe the same close.
#[derive(Clone)]
pub enum CloseSignal {
    /// A signal that never closes. `create_child` on it returns another
    /// `Never`; `close`/`set_timeout`/`stop`/`resume` panic, since calling
    /// them is always a programmer error — there is nothing to cancel.
    Never,
    /// A real node in the tree.
    Node(Arc<CloseSignalState>),
}

impl std::fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseSignal::Never => write!(f, "CloseSignal::Never"),
            CloseSignal::Node(s) => {
                let inner = s.inner.lock();
                f.debug_struct("CloseSignal")
                    .field("closed", &inner.closed)
                    .field("is_timeout", &inner.is_timeout)
                    .field("stopped", &inner.stopped)
                    .finish()
            }
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        CloseSignal::new()
    }
}

impl CloseSignal {
    /// Create a fresh root node, not closed, no parent.
    pub fn new() -> Self {
        CloseSignal::Node(Arc::new(CloseSignalState::new(None)))
    }

    /// The sentinel that is never closed. Useful as a default argument when
    /// a caller has no cancellation scope of their own to offer.
    pub fn never() -> Self {
        CloseSignal::Never
    }

    fn state(&self) -> Option<&Arc<CloseSignalState>> {
        match self {
            CloseSignal::Never => None,
            CloseSignal::Node(s) => Some(s),
        }
    }

    fn state_or_panic(&self, op: &'static str) -> &Arc<CloseSignalState> {
        self.state()
            .unwrap_or_else(|| panic!("invariant violated: {op} called on CloseSignal::Never"))
    }

    /// Create a child node. If this node is already closed the child is
    /// born closed with the same reason. Closing the parent later cascades
    /// to every live child; closing this child never affects the parent.
    pub fn create_child(&self) -> CloseSignal {
        match self {
            CloseSignal::Never => CloseSignal::Never,
            CloseSignal::Node(parent) => {
                let child = Arc::new(CloseSignalState::new(Some(Arc::downgrade(parent))));
                let already_closed = {
                    let mut pinner = parent.inner.lock();
                    if pinner.closed {
                        Some((pinner.is_timeout, pinner.close_reason.clone()))
                    } else {
                        pinner.children.push(child.clone());
                        None
                    }
                };
                if let Some((is_timeout, reason)) = already_closed {
                    child.close_internal(is_timeout, reason);
                }
                CloseSignal::Node(child)
            }
        }
    }

    /// Close with an explicit reason. Idempotent: the first call wins, every
    /// later call is a no-op.
    pub fn close(&self, reason: impl Into<String>) {
        self.state_or_panic("close").close_internal(false, reason.into());
    }

    /// Close with the empty reason. Equivalent to `close("")`.
    pub fn close_infallible(&self) {
        self.close(String::new());
    }

    pub fn is_closed(&self) -> bool {
        match self.state() {
            None => false,
            Some(s) => s.inner.lock().closed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self.state() {
            None => false,
            Some(s) => s.inner.lock().is_timeout,
        }
    }

    pub fn is_stopped(&self) -> bool {
        match self.state() {
            None => false,
            Some(s) => s.inner.lock().stopped,
        }
    }

    /// The reason this signal closed, or the empty string if it hasn't.
    pub fn reason(&self) -> String {
        match self.state() {
            None => String::new(),
            Some(s) => s.inner.lock().close_reason.clone(),
        }
    }

    /// Build a [`CancelError`] describing this signal's current close state.
    /// Callers whose own operation lost a race against a non-closer event
    /// (e.g. a closed channel) can still use this to report a generic
    /// cancellation.
    pub fn cancel_error(&self) -> CancelError {
        match self.state() {
            None => CancelError::new(CancelReason::Cancel, "CloseSignal::Never cannot cancel"),
            Some(s) => {
                let inner = s.inner.lock();
                let reason = if inner.is_timeout {
                    CancelReason::Timeout
                } else {
                    CancelReason::Cancel
                };
                CancelError::new(reason, inner.close_reason.clone())
            }
        }
    }

    pub fn to_error(&self) -> Error {
        Error::Cancelled(self.cancel_error())
    }

    /// Arm (or rearm) a timeout. A zero duration disarms any running timer
    /// without closing. Rearming while a timer is already running shifts
    /// the deadline by the delta between the old and new duration — not a
    /// restart from now.
    pub fn set_timeout(&self, dur: Duration, reason: impl Into<String>) {
        self.state_or_panic("set_timeout").set_timeout_internal(dur, reason.into());
    }

    /// Pause this signal and every descendant: timers stop counting down
    /// (if `stop_timer`) and remember their remaining time for `resume`.
    pub fn stop(&self, stop_timer: bool) {
        self.state_or_panic("stop").stop_internal(stop_timer);
    }

    /// Resume a stopped signal and every descendant, rearming any timer
    /// that was paused mid-countdown with its remaining duration.
    pub fn resume(&self) {
        self.state_or_panic("resume").resume_internal();
    }

    /// Suspend until this signal is no longer stopped (immediately resolves
    /// if it isn't stopped right now).
    pub async fn wait_resumed(&self) {
        match self.state() {
            None => {}
            Some(s) => {
                let rx = s.stop_waiter();
                let _ = rx.await;
            }
        }
    }

    /// Close this signal when `other` closes, carrying its reason forward.
    /// If `other` is dropped without ever closing, this closes with the
    /// reason `"dependent closer released"`.
    pub fn depend_on(&self, other: &CloseSignal, reason: Option<String>) {
        let this = self.clone();
        match other {
            CloseSignal::Never => {}
            CloseSignal::Node(other_state) => {
                let weak_other = Arc::downgrade(other_state);
                tokio::spawn(async move {
                    let rx = match weak_other.upgrade() {
                        Some(arc) => arc.register_waiter(),
                        None => {
                            this.close("dependent closer released");
                            return;
                        }
                    };
                    match rx.await {
                        Ok(outcome) => {
                            let r = reason.unwrap_or(outcome.reason);
                            if let Some(state) = this.state() {
                                state.close_internal(outcome.is_timeout, r);
                            }
                        }
                        Err(_) => this.close("dependent closer released"),
                    }
                });
            }
        }
    }

    /// Run `cb` once this signal closes. Fires immediately (on a spawned
    /// task) if it's already closed.
    pub fn after_close<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.state() {
            None => {}
            Some(s) => {
                let rx = s.register_waiter();
                tokio::spawn(async move {
                    let _ = rx.await;
                    cb();
                });
            }
        }
    }

    /// Suspend until this signal closes. Resolves `true` for an explicit
    /// close, `false` for a timeout. Never resolves for `CloseSignal::Never`.
    pub fn wait(&self) -> Waiter {
        match self.state() {
            None => Waiter::Never,
            Some(s) => Waiter::Node(s.register_waiter()),
        }
    }
}

/// Future returned by [`CloseSignal::wait`].
pub enum Waiter {
    Never,
    Node(oneshot::Receiver<CloseOutcome>),
}

impl Future for Waiter {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match self.get_mut() {
            Waiter::Never => Poll::Pending,
            Waiter::Node(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(outcome)) => Poll::Ready(!outcome.is_timeout),
                Poll::Ready(Err(_)) => Poll::Ready(true),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn close_is_idempotent_and_resolves_waiters() {
        let sig = CloseSignal::new();
        let w1 = sig.wait();
        sig.close("bye");
        sig.close("ignored second reason");
        assert!(sig.is_closed());
        assert_eq!(sig.reason(), "bye");
        assert!(w1.await);
    }

    #[tokio::test]
    async fn waiter_registered_after_close_resolves_immediately() {
        let sig = CloseSignal::new();
        sig.close("already gone");
        assert!(sig.wait().await);
    }

    #[tokio::test]
    async fn close_cascades_to_children() {
        let parent = CloseSignal::new();
        let child = parent.create_child();
        let grandchild = child.create_child();
        parent.close("shutdown");
        assert!(child.is_closed());
        assert!(grandchild.is_closed());
        assert_eq!(grandchild.reason(), "shutdown");
    }

    #[tokio::test]
    async fn child_of_closed_parent_is_born_closed() {
        let parent = CloseSignal::new();
        parent.close("already down");
        let child = parent.create_child();
        assert!(child.is_closed());
        assert_eq!(child.reason(), "already down");
    }

    #[tokio::test]
    async fn never_signal_never_resolves_and_panics_on_close() {
        let never = CloseSignal::never();
        assert!(!never.is_closed());
        assert!(std::panic::catch_unwind(|| never.close("nope")).is_err());
    }

    #[tokio::test]
    async fn timeout_closes_with_is_timeout_true() {
        let sig = CloseSignal::new();
        sig.set_timeout(Duration::from_millis(10), "slow");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sig.is_closed());
        assert!(sig.is_timeout());
        assert_eq!(sig.reason(), "slow");
    }

    #[tokio::test]
    async fn disarming_timer_with_zero_duration_prevents_close() {
        let sig = CloseSignal::new();
        sig.set_timeout(Duration::from_millis(10), "slow");
        sig.set_timeout(Duration::ZERO, "slow");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sig.is_closed());
    }

    #[tokio::test]
    async fn stop_pauses_timer_and_resume_honors_remaining() {
        let sig = CloseSignal::new();
        sig.set_timeout(Duration::from_millis(40), "slow");
        sig.stop(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sig.is_closed(), "stopped timer must not fire");
        sig.resume();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sig.is_closed());
    }

    #[tokio::test]
    async fn depend_on_propagates_close_reason() {
        let upstream = CloseSignal::new();
        let downstream = CloseSignal::new();
        downstream.depend_on(&upstream, None);
        upstream.close("upstream gone");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(downstream.is_closed());
        assert_eq!(downstream.reason(), "upstream gone");
    }

    #[tokio::test]
    async fn depend_on_fires_when_upstream_dropped_without_closing() {
        let downstream = CloseSignal::new();
        {
            let upstream = CloseSignal::new();
            downstream.depend_on(&upstream, None);
            // upstream drops here without ever closing
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(downstream.is_closed());
        assert_eq!(downstream.reason(), "dependent closer released");
    }

    #[tokio::test]
    async fn after_close_runs_hook() {
        let sig = CloseSignal::new();
        let (tx, rx) = oneshot::channel();
        sig.after_close(move || {
            let _ = tx.send(());
        });
        sig.close("done");
        rx.await.unwrap();
    }
}
