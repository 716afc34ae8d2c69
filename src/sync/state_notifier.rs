//! A small piece of shared state plus a way to suspend until it satisfies
//! a predicate. Used wherever a task needs to wait for something else to
//! flip a flag — `Webrtc`'s peer-box lifecycle, `Track`'s readiness.

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cancel::CloseSignal;
use crate::select::Selected;

struct Inner<T> {
    value: T,
    waiters: Vec<oneshot::Sender<T>>,
}

/// Holds a `Clone` value and lets callers suspend until it changes to
/// something matching a predicate.
pub struct StateNotifier<T: Clone> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> StateNotifier<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Overwrite the value and wake every current waiter.
    pub fn set(&self, value: T) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.value = value.clone();
            std::mem::take(&mut inner.waiters)
        };
        for w in waiters {
            let _ = w.send(value.clone());
        }
    }

    /// Suspend until `pred` is satisfied by the current (or some future)
    /// value, or `closer` fires first.
    pub async fn wait_for(&self, mut pred: impl FnMut(&T) -> bool, closer: &CloseSignal) -> Selected<T> {
        loop {
            let rx = {
                let mut inner = self.inner.lock();
                if pred(&inner.value) {
                    return Selected::Completed(inner.value.clone());
                }
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(tx);
                rx
            };
            tokio::select! {
                biased;
                _ = closer.wait() => return Selected::Cancelled,
                v = rx => {
                    if let Ok(val) = v {
                        if pred(&val) {
                            return Selected::Completed(val);
                        }
                    }
                    // spurious wake (value changed but not to a match, or
                    // sender dropped): loop and re-check the live value.
                }
            }
        }
    }
}
