//! # RawRwMutex
//! The inner reader/writer mutex the robust protocol wraps. It has to satisfy
//! three constraints that rule out everything in `std`:
//!
//! - it must live flat inside a shared-memory segment (no heap, no pointers,
//!   a stable byte layout, and all-zeroes must be the unlocked state);
//! - any process may release it, not just the one that acquired it - the
//!   whole recovery story rests on survivors unlocking for the dead;
//! - the outer protocol only ever *tries* to lock, so no parking or waking
//!   is needed here. Futex-style waiting would buy nothing anyway: the
//!   waiter has to keep waking up to run liveness checks.
//!
//! One atomic word is enough: `0` is free, `1..` counts shared holders, and
//! `u32::MAX` is the writer. Acquire on every lock, Release on every unlock,
//! so whatever the previous holder wrote happens-before whatever the next
//! holder reads.

use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

const WRITER: u32 = u32::MAX;

#[repr(transparent)]
pub struct RawRwMutex {
    /// 0 - free; 1..=N - that many shared holders; u32::MAX - one writer
    state: AtomicU32,
}

impl RawRwMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// One shot at the exclusive lock; never blocks.
    pub fn try_lock(&self) -> bool {
        self.state.compare_exchange(0, WRITER, Acquire, Relaxed).is_ok()
    }

    /// Release the exclusive lock.
    ///
    /// # Safety
    /// The caller must either hold the exclusive lock itself or be reclaiming
    /// it from a holder it has established to be dead. Unlocking a lock some
    /// live process still relies on breaks mutual exclusion for everyone.
    pub unsafe fn unlock(&self) {
        self.state.store(0, Release);
    }

    /// One shot at a shared lock; never blocks. Fails only while a writer
    /// holds the lock (or the CAS races resolve against us long enough to
    /// observe one).
    pub fn try_lock_sharable(&self) -> bool {
        let mut s = self.state.load(Relaxed);
        loop {
            if s == WRITER {
                return false;
            }
            // the protocol caps holders far below this; the assert guards
            // the encoding, not the protocol
            assert!(s < WRITER - 1, "shared holder count overflow");
            match self.state.compare_exchange_weak(s, s + 1, Acquire, Relaxed) {
                Ok(_) => return true,
                Err(witnessed) => s = witnessed,
            }
        }
    }

    /// Give back one shared hold.
    ///
    /// # Safety
    /// Exactly one un-released shared hold must be outstanding on the
    /// caller's account - its own, or one it is reclaiming from a dead
    /// holder. A surplus call corrupts the count for every participant.
    pub unsafe fn unlock_sharable(&self) {
        self.state.fetch_sub(1, Release);
    }
}

impl Default for RawRwMutex {
    fn default() -> Self {
        Self::new()
    }
}
