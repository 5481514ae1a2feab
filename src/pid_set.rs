//! # PidSet
//! A fixed-capacity, lock-free set of process identifiers, open-addressed over
//! an array of atomic words. It lives inside the shared segment next to the
//! lock it serves, so every mutation goes through CAS on the slot words - no
//! inner mutex, no allocation, no pointers.
//!
//! The value `0` marks an empty slot, which means the set cannot store `0`.
//! That is fine for pids: no real process is ever pid 0.
//!
//! ## Memory ordering
//! Every operation here is `Relaxed`. The set only needs its own slots to be
//! individually atomic; ordering against the protected region is supplied by
//! the mutex whose holders this set tracks.

use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

/// Open-addressed hash set of non-zero `u32` keys, capacity `N` slots.
///
/// `N` must be a power of two so probe indices can be masked instead of
/// taken modulo.
#[repr(transparent)]
pub struct PidSet<const N: usize> {
    slots: [AtomicU32; N],
}

impl<const N: usize> PidSet<N> {
    const CAPACITY_IS_POWER_OF_TWO: () = assert!(N.is_power_of_two());

    pub const fn new() -> Self {
        let () = Self::CAPACITY_IS_POWER_OF_TWO;
        Self {
            slots: [const { AtomicU32::new(0) }; N],
        }
    }

    /// The slot a key starts probing from. Note the explicit parentheses:
    /// the mask is `N - 1`, not `(idx & N) - 1`.
    fn home_slot(key: u32) -> usize {
        (mix(key) as usize) & (N - 1)
    }

    /// Add `key` to the set. Returns `true` once the key is present - whether
    /// this call stored it or it was already there.
    ///
    /// A full probe pass that finds no slot returns `false`: the table is
    /// (at least momentarily) full. The caller decides whether to retry;
    /// the table itself is left intact.
    pub fn insert(&self, key: u32) -> bool {
        assert!(key != 0, "0 marks an empty slot and cannot be stored");
        let mut idx = Self::home_slot(key);
        for _ in 0..N {
            let slot = &self.slots[idx];
            let probed = slot.load(Relaxed);
            if probed == key {
                // set semantics: already present
                return true;
            }
            if probed == 0 {
                match slot.compare_exchange(0, key, Relaxed, Relaxed) {
                    Ok(_) => return true,
                    // Somebody filled the slot under us. If they stored our
                    // own key we are done; otherwise keep probing.
                    Err(witnessed) if witnessed == key => return true,
                    Err(_) => {}
                }
            }
            idx = (idx + 1) & (N - 1);
        }
        false
    }

    /// Remove `key`. Returns `true` iff THIS call flipped the key from
    /// present to absent - concurrent removers of the same key get at most
    /// one `true` between them. Callers use that to arbitrate work that must
    /// happen exactly once per entry.
    pub fn remove(&self, key: u32) -> bool {
        assert!(key != 0, "0 marks an empty slot and cannot be stored");
        let mut idx = Self::home_slot(key);
        for _ in 0..N {
            let slot = &self.slots[idx];
            if slot.load(Relaxed) == key
                && slot.compare_exchange(key, 0, Relaxed, Relaxed).is_ok()
            {
                return true;
            }
            // A lost CAS here is not the end of the search: the race may
            // have been against an inserter whose retry landed the same key
            // in a later probe slot.
            idx = (idx + 1) & (N - 1);
        }
        false
    }

    /// A weakly-consistent view of the current entries. Entries inserted or
    /// removed while iterating may or may not appear; good enough for the
    /// pruner, which re-checks every pid it acts on through `remove`.
    pub fn snapshot(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .map(|slot| slot.load(Relaxed))
            .filter(|&key| key != 0)
    }
}

impl<const N: usize> Default for PidSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A 32-bit finalizer (murmur3's) so consecutive pids don't pile into
/// consecutive slots.
fn mix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
