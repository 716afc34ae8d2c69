//! `AsyncBlockerManager` — a cooperative batch scheduler.
//!
//! Workers register a [`Blocker`] under an `id` and a priority, then call
//! [`AsyncBlockerManager::wait_blocker`] in their own loop as a checkpoint.
//! An orchestrator calls [`AsyncBlockerManager::lock`] to pick a batch of
//! blockers (sized by `target_batch`, clamped into `[min_batch,
//! num_blockers]`), flag them, and wait until each is synchronously
//! observed as blocked — bounded by `block_timeout` so a straggler can
//! never wedge the lock forever. [`AsyncBlockerManager::unlock`] releases
//! every flagged blocker and flushes any registrations that arrived while
//! locked. A blocker selected in one lock advances its epoch on unlock, so
//! the next lock prefers whoever hasn't run recently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CloseSignal;
use crate::sync::state_notifier::StateNotifier;

/// Tuning knobs for an [`AsyncBlockerManager`].
#[derive(Debug, Clone, Copy)]
pub struct Configure {
    /// How long `lock` waits for a selected blocker to report itself
    /// blocked before giving up on it.
    pub block_timeout: Duration,
    /// Desired batch size. `>= 1` is used directly (then clamped into
    /// `[min_batch, num_blockers]`); `0` means "use `min_batch`";
    /// negative means "all blockers minus `|target_batch|`".
    pub target_batch: i64,
    /// Floor for the clamped batch size.
    pub min_batch: usize,
}

impl Default for Configure {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(5),
            target_batch: 1,
            min_batch: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Block,
    Blocked,
}

struct BlockerEntry {
    priority: i32,
    epoch: u64,
    phase: Arc<StateNotifier<Phase>>,
}

struct Inner {
    blockers: HashMap<u64, BlockerEntry>,
    pending: Vec<(u64, i32)>,
    locked: bool,
    selected: Vec<u64>,
}

/// A cooperative batch scheduler: pause a bounded cohort of workers while
/// a critical section runs, leaving the rest to keep making progress.
pub struct AsyncBlockerManager {
    configure: Configure,
    inner: parking_lot::Mutex<Inner>,
}

impl AsyncBlockerManager {
    pub fn new(configure: Configure) -> Self {
        Self {
            configure,
            inner: parking_lot::Mutex::new(Inner {
                blockers: HashMap::new(),
                pending: Vec::new(),
                locked: false,
                selected: Vec::new(),
            }),
        }
    }

    fn clamp_target(target_batch: i64, min_batch: usize, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let min_batch = min_batch.max(1).min(n);
        let raw = match target_batch {
            t if t > 0 => t,
            0 => min_batch as i64,
            t => n as i64 - t.abs(),
        };
        raw.clamp(min_batch as i64, n as i64) as usize
    }

    /// Register a [`Blocker`] under `id` with the given priority. If a
    /// `lock` is in progress the registration is queued and only becomes
    /// visible to selection once `unlock` flushes it.
    pub fn register_blocker(&self, id: u64, priority: i32) {
        let mut inner = self.inner.lock();
        if inner.locked {
            inner.pending.push((id, priority));
            return;
        }
        inner
            .blockers
            .entry(id)
            .and_modify(|e| e.priority = priority)
            .or_insert_with(|| BlockerEntry {
                priority,
                epoch: 0,
                phase: Arc::new(StateNotifier::new(Phase::Idle)),
            });
    }

    pub fn is_blocked(&self, id: u64) -> bool {
        self.inner
            .lock()
            .blockers
            .get(&id)
            .map(|e| e.phase.get() == Phase::Blocked)
            .unwrap_or(false)
    }

    pub fn num_blockers(&self) -> usize {
        self.inner.lock().blockers.len()
    }

    /// Select a batch, flag each chosen blocker to block, and wait until
    /// every one of them is synchronously observed as blocked or
    /// `block_timeout` elapses — whichever first. Returns `false` only if
    /// `closer` was already closed.
    pub async fn lock(&self, closer: &CloseSignal) -> bool {
        if closer.is_closed() {
            return false;
        }
        let selected = {
            let mut inner = self.inner.lock();
            inner.locked = true;
            let n = inner.blockers.len();
            let target = Self::clamp_target(self.configure.target_batch, self.configure.min_batch, n);

            let mut entries: Vec<(u64, i32, u64, Arc<StateNotifier<Phase>>)> = inner
                .blockers
                .iter()
                .map(|(id, e)| (*id, e.priority, e.epoch, e.phase.clone()))
                .collect();
            entries.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| b.1.cmp(&a.1)).then_with(|| a.0.cmp(&b.0)));
            entries.truncate(target);

            for (_, _, _, phase) in &entries {
                phase.set(Phase::Block);
            }
            inner.selected = entries.iter().map(|(id, ..)| *id).collect();
            entries
        };

        let timeout_child = closer.create_child();
        timeout_child.set_timeout(self.configure.block_timeout, "blocker batch lock timed out");
        for (_, _, _, phase) in &selected {
            let _ = phase.wait_for(|p| *p == Phase::Blocked, &timeout_child).await;
        }

        // A blocker that never committed within block_timeout "raced past
        // the quota": unflag it so its next wait_blocker call isn't stuck
        // waiting on a lock that has already moved on.
        for (_, _, _, phase) in &selected {
            if phase.get() == Phase::Block {
                phase.set(Phase::Idle);
            }
        }

        !closer.is_closed()
    }

    /// Unblock every blocker flagged by the current `lock`, advance the
    /// epoch of each one that was selected, and flush registrations that
    /// arrived while locked.
    pub fn unlock(&self) {
        let mut inner = self.inner.lock();
        let selected = std::mem::take(&mut inner.selected);
        for id in &selected {
            if let Some(e) = inner.blockers.get_mut(id) {
                e.epoch += 1;
                e.phase.set(Phase::Idle);
            }
        }
        // Defensive: clear any blocker still flagged outside the tracked
        // selection (e.g. left over from a bug elsewhere).
        for e in inner.blockers.values() {
            if e.phase.get() != Phase::Idle {
                e.phase.set(Phase::Idle);
            }
        }
        inner.locked = false;
        let pending = std::mem::take(&mut inner.pending);
        for (id, priority) in pending {
            inner
                .blockers
                .entry(id)
                .and_modify(|e| e.priority = priority)
                .or_insert_with(|| BlockerEntry {
                    priority,
                    epoch: 0,
                    phase: Arc::new(StateNotifier::new(Phase::Idle)),
                });
        }
    }

    /// Cooperative checkpoint for a worker holding `id`'s [`Blocker`].
    /// Returns immediately if not currently flagged to block; otherwise
    /// commits to blocked, waits for the flag to clear, and returns.
    /// Returns `false` if `closer` fires first.
    pub async fn wait_blocker(&self, id: u64, closer: &CloseSignal) -> bool {
        let phase = {
            let inner = self.inner.lock();
            match inner.blockers.get(&id) {
                Some(e) => e.phase.clone(),
                None => return true,
            }
        };
        if phase.get() != Phase::Block {
            return true;
        }
        phase.set(Phase::Blocked);
        phase.wait_for(|p| *p == Phase::Idle, closer).await.into_option().is_some()
    }
}

/// A worker's registration with an [`AsyncBlockerManager`].
///
/// Dropping a `Blocker` does not deregister it — the manager's selection
/// state is keyed by `id`, which callers are expected to reuse across
/// their own process lifetime (e.g. a track's publisher id).
pub struct Blocker {
    id: u64,
}

impl Blocker {
    /// Register `id` with `manager` under `priority` and return a handle.
    pub fn register(manager: &AsyncBlockerManager, id: u64, priority: i32) -> Self {
        manager.register_blocker(id, priority);
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn cfg(target: i64, min: usize) -> Configure {
        Configure {
            block_timeout: StdDuration::from_millis(500),
            target_batch: target,
            min_batch: min,
        }
    }

    #[tokio::test]
    async fn lock_blocks_exactly_the_clamped_target() {
        let mgr = AsyncBlockerManager::new(cfg(2, 1));
        for id in 1..=5 {
            mgr.register_blocker(id, 0);
        }
        let closer = CloseSignal::new();
        assert!(mgr.lock(&closer).await);
        let blocked_count = (1..=5).filter(|id| mgr.is_blocked(*id)).count();
        assert_eq!(blocked_count, 2);
        mgr.unlock();
        assert_eq!((1..=5).filter(|id| mgr.is_blocked(*id)).count(), 0);
    }

    #[tokio::test]
    async fn negative_target_batch_means_all_minus_n() {
        let mgr = AsyncBlockerManager::new(cfg(-1, 1));
        for id in 1..=4 {
            mgr.register_blocker(id, 0);
        }
        let closer = CloseSignal::new();
        assert!(mgr.lock(&closer).await);
        assert_eq!((1..=4).filter(|id| mgr.is_blocked(*id)).count(), 3);
        mgr.unlock();
    }

    #[tokio::test]
    async fn higher_priority_is_selected_first_within_an_epoch() {
        let mgr = AsyncBlockerManager::new(cfg(1, 1));
        mgr.register_blocker(1, 0);
        mgr.register_blocker(2, 10);
        let closer = CloseSignal::new();
        mgr.lock(&closer).await;
        assert!(mgr.is_blocked(2));
        assert!(!mgr.is_blocked(1));
        mgr.unlock();
    }

    #[tokio::test]
    async fn epoch_advances_on_unlock_so_next_lock_prefers_others() {
        let mgr = AsyncBlockerManager::new(cfg(1, 1));
        mgr.register_blocker(1, 5);
        mgr.register_blocker(2, 0);
        let closer = CloseSignal::new();

        mgr.lock(&closer).await;
        assert!(mgr.is_blocked(1), "higher priority goes first");
        mgr.unlock();

        mgr.lock(&closer).await;
        assert!(mgr.is_blocked(2), "1's epoch advanced, so 2 is preferred this round");
        mgr.unlock();
    }

    #[tokio::test]
    async fn wait_blocker_commits_and_waits_for_unlock() {
        let mgr = Arc::new(AsyncBlockerManager::new(cfg(1, 1)));
        mgr.register_blocker(1, 0);
        let closer = CloseSignal::new();
        mgr.lock(&closer).await;
        assert!(mgr.is_blocked(1));

        let worker_closer = CloseSignal::new();
        let mgr2 = mgr.clone();
        let worker = tokio::spawn(async move { mgr2.wait_blocker(1, &worker_closer).await });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!worker.is_finished(), "worker stays parked until unlock");

        mgr.unlock();
        assert!(worker.await.unwrap());
    }

    #[tokio::test]
    async fn wait_blocker_returns_immediately_when_not_flagged() {
        let mgr = AsyncBlockerManager::new(cfg(1, 1));
        mgr.register_blocker(7, 0);
        let closer = CloseSignal::new();
        assert!(mgr.wait_blocker(7, &closer).await);
    }

    #[tokio::test]
    async fn registrations_during_lock_are_queued_until_unlock() {
        let mgr = AsyncBlockerManager::new(cfg(1, 1));
        mgr.register_blocker(1, 0);
        let closer = CloseSignal::new();
        mgr.lock(&closer).await;

        mgr.register_blocker(2, 99);
        assert_eq!(mgr.num_blockers(), 1, "queued registration not yet visible");

        mgr.unlock();
        assert_eq!(mgr.num_blockers(), 2);
    }

    #[tokio::test]
    async fn straggler_past_block_timeout_is_unflagged() {
        let mgr = AsyncBlockerManager::new(Configure {
            block_timeout: StdDuration::from_millis(30),
            target_batch: 1,
            min_batch: 1,
        });
        mgr.register_blocker(1, 0);
        let closer = CloseSignal::new();
        // Nobody ever calls wait_blocker(1, ..), so it can never commit.
        assert!(mgr.lock(&closer).await);
        assert!(!mgr.is_blocked(1), "never committed, so it isn't counted as blocked");
    }

    #[tokio::test]
    async fn lock_returns_false_if_closer_already_closed() {
        let mgr = AsyncBlockerManager::new(cfg(1, 1));
        mgr.register_blocker(1, 0);
        let closer = CloseSignal::new();
        closer.close("shutting down");
        assert!(!mgr.lock(&closer).await);
    }
}
