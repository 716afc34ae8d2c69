//! Synchronization primitives that sit between `parking_lot` (never
//! suspends, for short critical sections) and full cancellable suspension
//! (for anything that can legitimately wait a while).

mod async_mutex;
mod blocker;
mod init_once;
mod state_notifier;

pub use async_mutex::AsyncMutex;
pub use blocker::{AsyncBlockerManager, Blocker, Configure as BlockerConfigure};
pub use init_once::InitOnce;
pub use state_notifier::StateNotifier;
