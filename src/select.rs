//! Cancellable selection over channel operations, built on `tokio::select!`.
//!
//! Every op here races the channel operation against the closer's
//! `wait()`. The closer branch is listed first with `biased`, so an
//! already-closed signal wins a tie against an already-ready channel —
//! no spurious read or write ever completes after the closer fired.

use tokio::sync::{mpsc, oneshot};

use crate::cancel::CloseSignal;
use crate::error::Result;

/// Outcome of a cancellable operation: either it completed, or the closer
/// fired (or the channel was closed) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selected<T> {
    Completed(T),
    Cancelled,
}

impl<T> Selected<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Selected::Cancelled)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Selected::Completed(v) => Some(v),
            Selected::Cancelled => None,
        }
    }
}

/// Read from an mpsc channel, or report cancellation. A closed channel is
/// reported the same way as a fired closer: nothing more will ever arrive.
pub async fn chan_read<T>(ch: &mut mpsc::Receiver<T>, closer: &CloseSignal) -> Selected<T> {
    tokio::select! {
        biased;
        _ = closer.wait() => Selected::Cancelled,
        v = ch.recv() => match v {
            Some(v) => Selected::Completed(v),
            None => Selected::Cancelled,
        },
    }
}

/// Same as [`chan_read`] but raises [`crate::error::Error::Cancelled`]
/// instead of returning a sentinel.
pub async fn chan_read_or_throw<T>(ch: &mut mpsc::Receiver<T>, closer: &CloseSignal) -> Result<T> {
    match chan_read(ch, closer).await {
        Selected::Completed(v) => Ok(v),
        Selected::Cancelled => Err(closer.to_error()),
    }
}

/// Send on an mpsc channel, or report cancellation. If the closer wins the
/// race the value being sent is dropped with the losing future — no
/// spurious write is ever observed by the receiver.
pub async fn chan_write<T>(ch: &mpsc::Sender<T>, val: T, closer: &CloseSignal) -> Selected<()> {
    tokio::select! {
        biased;
        _ = closer.wait() => Selected::Cancelled,
        res = ch.send(val) => match res {
            Ok(()) => Selected::Completed(()),
            Err(_) => Selected::Cancelled,
        },
    }
}

pub async fn chan_write_or_throw<T>(ch: &mpsc::Sender<T>, val: T, closer: &CloseSignal) -> Result<()> {
    match chan_write(ch, val, closer).await {
        Selected::Completed(()) => Ok(()),
        Selected::Cancelled => Err(closer.to_error()),
    }
}

/// Write to a single-slot notifier that is known to be empty (e.g. a
/// freshly-created `oneshot::Sender`). Panics if the receiver is already
/// gone, since that can only mean two writers raced for the same slot.
pub fn chan_must_write<T>(tx: oneshot::Sender<T>, val: T) {
    if tx.send(val).is_err() {
        panic!("invariant violated: chan_must_write found no receiver");
    }
}

/// Write to a single-slot notifier, silently dropping the value if nobody
/// is listening anymore.
pub fn chan_maybe_write<T>(tx: oneshot::Sender<T>, val: T) {
    let _ = tx.send(val);
}

/// Expand into a `tokio::select!` with a closer branch prepended, yielding
/// a uniform [`Selected<T>`] whose arms construct their own tagged value.
///
/// ```ignore
/// let out = select!(closer,
///     v = chan_a.recv() => Event::A(v),
///     v = chan_b.recv() => Event::B(v),
/// );
/// ```
#[macro_export]
macro_rules! select {
    ($closer:expr, $( $pat:pat = $fut:expr => $body:expr ),+ $(,)?) => {{
        tokio::select! {
            biased;
            _ = $closer.wait() => $crate::select::Selected::Cancelled,
            $( $pat = $fut => $crate::select::Selected::Completed($body) ),+
        }
    }};
}
