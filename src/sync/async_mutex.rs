//! A FIFO, cancellation-aware async mutex.
//!
//! Unlike `tokio::sync::Mutex`, `acquire` takes a [`CloseSignal`] and backs
//! out cleanly if it fires while waiting. Waiters are served strictly in
//! arrival order: `release` hands the lock directly to the head of the
//! queue rather than waking everyone to race for it.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cancel::CloseSignal;

struct State {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A mutex whose `acquire` suspends the calling task, cooperating with a
/// [`CloseSignal`] rather than blocking a thread.
pub struct AsyncMutex {
    state: Mutex<State>,
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                busy: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the lock, suspending in FIFO order behind any earlier
    /// waiter. Returns `false` if `closer` fires first; the caller never
    /// holds the lock in that case.
    pub async fn acquire(&self, closer: &CloseSignal) -> bool {
        let rx = {
            let mut state = self.state.lock();
            if !state.busy {
                state.busy = true;
                return true;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        tokio::select! {
            biased;
            _ = closer.wait() => false,
            res = rx => res.is_ok(),
        }
    }

    /// Release the lock, handing it directly to the next live waiter (FIFO).
    /// A waiter that was cancelled while queued is skipped.
    pub fn release(&self) {
        let mut state = self.state.lock();
        loop {
            match state.waiters.pop_front() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.busy = false;
                    return;
                }
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().busy
    }
}
