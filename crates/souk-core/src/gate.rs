//! Single-flight coordination for token refresh.
//!
//! Refresh endpoints rotate the refresh token on use, so two overlapping
//! refresh calls invalidate each other. `RefreshGate` holds at most one
//! pending refresh; every caller that arrives while it is pending awaits the
//! same future and sees the same result.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error};

type PendingRefresh = Shared<BoxFuture<'static, Option<String>>>;

#[derive(Default)]
struct Slot {
    generation: u64,
    pending: Option<PendingRefresh>,
}

/// Single-slot holder for the in-flight refresh.
#[derive(Clone, Default)]
pub struct RefreshGate {
    slot: Arc<Mutex<Slot>>,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    /// Forget any pending refresh. Callers already awaiting it keep their
    /// handle; new callers start fresh.
    pub fn reset(&self) {
        let stale = {
            let mut slot = lock(&self.slot);
            slot.generation += 1;
            slot.pending.take()
        };
        // Dropped unlocked: if this was the last handle, its guard locks the slot
        drop(stale);
    }

    /// Join the pending refresh, or start one with `start` and publish it.
    ///
    /// The handle is published before anything is awaited and is cleared as
    /// soon as the refresh settles. A panicking refresh resolves to `None`
    /// for every waiter.
    pub async fn run<F, Fut>(&self, start: F) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        let pending = {
            let mut slot = lock(&self.slot);
            match &slot.pending {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    slot.generation += 1;
                    let guard = ClearOnDrop {
                        slot: Arc::clone(&self.slot),
                        generation: slot.generation,
                    };
                    let refresh = start();
                    let pending = async move {
                        let _guard = guard;
                        match AssertUnwindSafe(refresh).catch_unwind().await {
                            Ok(token) => token,
                            Err(_) => {
                                error!("Token refresh panicked");
                                None
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    slot.pending = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }
}

/// Clears the slot when the refresh future finishes or is torn down.
struct ClearOnDrop {
    slot: Arc<Mutex<Slot>>,
    generation: u64,
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        // A reset may already have installed a newer refresh
        if slot.generation == self.generation {
            slot.pending = None;
        }
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
