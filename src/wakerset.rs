//! Waker bookkeeping for a shared batch computation.

use std::task::Waker;

use slab::Slab;

/// Handle to one waiter's slot in a [`WakerSet`]. Deliberately not cloneable
/// so a slot can only be refreshed or given up by the future that owns it.
#[derive(Debug)]
pub(crate) struct WakerToken(usize);

/// Tracks every task waiting on one shared batch computation, and which of
/// them is currently driving it.
///
/// Only a single task needs to do the work of polling the shared state
/// forward; the driver is always the most recently registered or refreshed
/// waiter, since that is the task whose poll is currently inside the state
/// machine. If the driver disappears, an arbitrary remaining waiter is
/// promoted and woken, so the shared work always has a path forward as long
/// as futures give up their slots on drop.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    waiters: Slab<Waker>,
    driver: Option<usize>,
}

impl WakerSet {
    /// Register a new waiter and make it the driver. The returned token must
    /// be kept by the owning future for refreshes and for release on drop.
    #[must_use]
    pub(crate) fn register(&mut self, waker: Waker) -> WakerToken {
        let slot = self.waiters.insert(waker);
        self.driver = Some(slot);
        WakerToken(slot)
    }

    /// Store a waiter's latest waker and make it the driver. Panics if the
    /// token does not belong to this set.
    pub(crate) fn refresh(&mut self, token: &WakerToken, waker: &Waker) {
        self.waiters
            .get_mut(token.0)
            .expect("waker token does not belong to this set")
            .clone_from(waker);
        self.driver = Some(token.0);
    }

    /// Wake the current driver so it re-polls the shared state. Used when a
    /// batch is sealed early and its fetch should fire before the window
    /// elapses.
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self.driver.and_then(|slot| self.waiters.get(slot)) {
            waker.wake_by_ref();
        }
    }

    /// Release the slot of a waiter that lost interest. If it was the driver
    /// (or no driver is on record), another waiter is promoted and woken
    /// immediately, in case the departed task was the only one making
    /// progress.
    pub(crate) fn abandon(&mut self, token: WakerToken) {
        if self.waiters.contains(token.0) {
            self.waiters.remove(token.0);
        }
        if self.driver == Some(token.0) || self.driver.is_none() {
            match self.waiters.iter().next() {
                Some((slot, waker)) => {
                    self.driver = Some(slot);
                    waker.wake_by_ref();
                }
                None => self.driver = None,
            }
        }
    }

    /// The shared work is done: wake every waiter so each can collect its
    /// result. The waiter identified by `except` is skipped — it is the one
    /// completing the work and takes its result in the same poll.
    pub(crate) fn finish(self, except: Option<WakerToken>) {
        let skip = except.map(|token| token.0);
        for (slot, waker) in self.waiters {
            if Some(slot) != skip {
                waker.wake();
            }
        }
    }
}
