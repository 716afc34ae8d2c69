//! Single-flight, double-checked async initialization.
//!
//! The first caller to observe `New` runs the initializer; everyone else
//! who arrives while it's in flight parks on a notifier and receives the
//! same result. A failed initialization resets to `New` so the next caller
//! can retry.

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

enum Phase<T> {
    New,
    Initializing(Vec<oneshot::Sender<std::result::Result<T, String>>>),
    Initialized(T),
}

/// A lazily, single-flight initialized value.
pub struct InitOnce<T: Clone> {
    phase: Mutex<Phase<T>>,
}

impl<T: Clone> Default for InitOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> InitOnce<T> {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::New),
        }
    }

    /// Drop back to the uninitialized state, forcing the next
    /// `get_or_init` to run the initializer again.
    pub fn reset(&self) {
        *self.phase.lock() = Phase::New;
    }

    pub fn get(&self) -> Option<T> {
        match &*self.phase.lock() {
            Phase::Initialized(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Run `init` if nobody has yet, otherwise park behind whoever is
    /// already running it. Secondary waiters that lose a failing race
    /// observe a generic [`Error::Invariant`], since the original error
    /// isn't necessarily `Clone`.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let rx = {
            let mut phase = self.phase.lock();
            match &mut *phase {
                Phase::Initialized(v) => return Ok(v.clone()),
                Phase::Initializing(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                Phase::New => {
                    *phase = Phase::Initializing(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = rx {
            return match rx.await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(msg)) => Err(Error::Invariant(msg)),
                Err(_) => Err(Error::Invariant("InitOnce initializer vanished without a result".into())),
            };
        }

        let result = init().await;
        let waiters = {
            let mut phase = self.phase.lock();
            let waiters = match std::mem::replace(&mut *phase, Phase::New) {
                Phase::Initializing(w) => w,
                _ => unreachable!("invariant violated: InitOnce phase changed during init"),
            };
            match &result {
                Ok(v) => *phase = Phase::Initialized(v.clone()),
                Err(_) => *phase = Phase::New,
            }
            waiters
        };
        let broadcast = result.as_ref().map(Clone::clone).map_err(|e| e.to_string());
        for w in waiters {
            let _ = w.send(broadcast.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn initializes_once() {
        let once = InitOnce::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = calls.clone();
            let v = once
                .get_or_init(|| async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(v, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_init_allows_retry() {
        let once: InitOnce<i32> = InitOnce::new();
        let first = once.get_or_init(|| async { Err(Error::Invariant("boom".into())) }).await;
        assert!(first.is_err());
        let second = once.get_or_init(|| async { Ok(7) }).await.unwrap();
        assert_eq!(second, 7);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_one_init() {
        let once = Arc::new(InitOnce::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let once = once.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                once.get_or_init(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(9)
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 9);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
