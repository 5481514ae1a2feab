//! # RobustRwLock
//! The reader/writer lock that coordinates the bus ring, built to survive the
//! death of any holder. Every participating process maps the same bytes, any
//! of them can be SIGKILLed mid-critical-section, and the survivors must keep
//! going without a daemon or a janitor process to clean up after the dead.
//!
//! The trick is two pieces of side-channel metadata next to the mutex itself:
//! who holds it exclusively (`exclusive_holder`), and which pids hold it
//! shared (`shared_holders`, a [`PidSet`]). A blocked acquirer that keeps
//! failing `try_lock` consults the side channel, asks the OS whether the
//! registered holder still exists, and if not, recovers:
//!
//! - a would-be **writer** that finds a dead writer *absorbs* the lock: it
//!   breaks out of the retry loop without unlocking and simply records itself
//!   as the holder. The dead process's bookkeeping is unrecoverable anyway,
//!   and the mutex word does not care who it belongs to.
//! - a would-be **reader** that finds a dead writer releases on the dead
//!   process's behalf (clear the side channel, then unlock) and retries.
//! - a would-be **writer** blocked by readers prunes `shared_holders`: every
//!   dead pid it wins the `remove` race for pays back exactly one
//!   `unlock_sharable`.
//!
//! Dead *readers* are only ever noticed by writers. Reader-reader coexistence
//! needs no liveness checks, so a dead reader costs nothing until a writer
//! shows up - that asymmetry is deliberate.
//!
//! ## What a release must not do
//! A reader whose slot was pruned (it was presumed dead, but was merely slow)
//! must not unlock again: `release_shared` only pays the unlock if it wins
//! the `remove` itself. And the side channel is always cleared *before* the
//! mutex is released, so a failed `try_lock` that then reads `NONE` can trust
//! it means "readers", not "stale writer".
//!
//! ## What this does not give you
//! No fairness, no FIFO, no priority inheritance, and no help if a process
//! re-enters the lock it already holds. Pid recycling within one acquisition
//! cycle is accepted: the impostor merely delays recovery by one round.

use std::{
    sync::atomic::{
        AtomicI32,
        Ordering::{Acquire, Release},
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::{liveness::process_exists, pid_set::PidSet, raw_mutex::RawRwMutex, segment::ShmSafe};

/// Capacity of the shared-holder table, and thus the most concurrent readers
/// the lock supports.
pub const MAX_SHARED: usize = 64;

/// "no exclusive holder". Zero doubles as the valid all-zeroes initial state
/// of a fresh segment; no live process is ever pid 0.
const NONE: i32 = 0;

/// Cadence of every retry loop. Long enough to amortize the process-table
/// probe, short enough that handoff latency stays invisible next to a crash.
const RETRY_INTERVAL: Duration = Duration::from_micros(2000);

fn own_pid() -> i32 {
    std::process::id() as i32
}

/// Crash-resilient inter-process reader/writer lock. Lives flat in a shared
/// segment; the byte layout is an ABI commitment between all participants of
/// one bus, so every process must run the same build.
#[repr(C)]
pub struct RobustRwLock {
    inner: RawRwMutex,
    exclusive_holder: AtomicI32,
    shared_holders: PidSet<MAX_SHARED>,
}

// repr(C), atomics only, no pointers, nothing to drop
unsafe impl ShmSafe for RobustRwLock {}

impl RobustRwLock {
    pub const fn new() -> Self {
        Self {
            inner: RawRwMutex::new(),
            exclusive_holder: AtomicI32::new(NONE),
            shared_holders: PidSet::new(),
        }
    }

    /// Block until this process holds the lock exclusively.
    pub fn acquire_exclusive(&self) {
        while !self.inner.try_lock() {
            let holder = self.exclusive_holder.load(Acquire);
            if holder != NONE {
                if process_exists(holder) {
                    // a healthy writer is ahead of us; wait our turn
                } else {
                    // The writer died inside its critical section. Nobody
                    // can unlock correctly on its behalf here - whether the
                    // dead process had finished its own bookkeeping is
                    // unknowable - so the survivor absorbs the lock as-is
                    // and takes over.
                    warn!("exclusive holder {holder} is dead, absorbing its lock");
                    break;
                }
            } else {
                // No writer is registered, so readers are holding us off,
                // and any of them may be dead. Dead readers never release;
                // evict them ourselves.
                self.prune_shared();
            }
            thread::sleep(RETRY_INTERVAL);
        }
        // published only once the lock is held (or absorbed)
        self.exclusive_holder.store(own_pid(), Release);
    }

    /// Release the exclusive lock. Must be paired with a preceding
    /// [`acquire_exclusive`](Self::acquire_exclusive) on this process.
    pub fn release_exclusive(&self) {
        // side channel first: whoever observes the mutex free must not read
        // a stale holder afterwards
        self.exclusive_holder.store(NONE, Release);
        // SAFETY: ours by the pairing contract
        unsafe { self.inner.unlock() };
    }

    /// Block until this process holds the lock shared, and register it in
    /// the holder table.
    pub fn acquire_shared(&self) {
        while !self.inner.try_lock_sharable() {
            // a shared attempt only fails against an exclusive holder
            let holder = self.exclusive_holder.load(Acquire);
            if holder != NONE {
                if process_exists(holder) {
                    // live writer; wait
                } else {
                    warn!("exclusive holder {holder} is dead, unlocking on its behalf");
                    self.exclusive_holder.store(NONE, Release);
                    // SAFETY: the registered holder is confirmed dead
                    unsafe { self.inner.unlock() };
                }
            }
            // holder == NONE here is a transient window between a writer's
            // unlock and its successor's try_lock; the retry resolves it
            thread::sleep(RETRY_INTERVAL);
        }
        let pid = own_pid() as u32;
        while !self.shared_holders.insert(pid) {
            // table full: more registered holders than live slots. Either
            // way a writer's prune or a release frees one eventually.
            warn!("shared holder table is full, waiting for a slot");
            thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Release a shared hold. A no-op if a pruner already reclaimed our slot
    /// (it issued the unlock for us; paying it again would corrupt the
    /// count).
    pub fn release_shared(&self) {
        if self.shared_holders.remove(own_pid() as u32) {
            // SAFETY: winning the remove proves our hold is still unpaid
            unsafe { self.inner.unlock_sharable() };
        }
    }

    /// Evict dead shared holders. Called by a would-be writer that keeps
    /// failing `try_lock` while no exclusive holder is registered.
    fn prune_shared(&self) {
        for pid in self.shared_holders.snapshot() {
            if !process_exists(pid as i32) && self.shared_holders.remove(pid) {
                // the remove arbitrates concurrent pruners: exactly one
                // winner, exactly one unlock per dead reader
                debug!("evicted dead shared holder {pid}");
                // SAFETY: the dead reader's hold is unpaid; we won the
                // right to pay it
                unsafe { self.inner.unlock_sharable() };
            }
        }
    }

    /// Scoped exclusive acquisition; the guard releases on drop.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        self.acquire_exclusive();
        ExclusiveGuard { lock: self }
    }

    /// Scoped shared acquisition; the guard releases on drop.
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        self.acquire_shared();
        SharedGuard { lock: self }
    }
}

impl Default for RobustRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the lock exclusively for its lifetime.
pub struct ExclusiveGuard<'a> {
    lock: &'a RobustRwLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

/// Holds the lock shared for its lifetime. Dropping after an external prune
/// evicted this process is harmless - the release degrades to a no-op.
pub struct SharedGuard<'a> {
    lock: &'a RobustRwLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::segment::Segment;
    use serial_test::serial;
    use std::{
        panic,
        process::Command,
        ptr,
        sync::atomic::{
            AtomicBool, AtomicU32,
            Ordering::{Acquire, Relaxed, Release},
        },
    };

    /// A pid guaranteed to be dead: a reaped child's.
    fn dead_pid() -> i32 {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id() as i32;
        child.wait().expect("wait");
        pid
    }

    fn holder_pids(lock: &RobustRwLock) -> Vec<u32> {
        lock.shared_holders.snapshot().collect()
    }

    // ---- single-process protocol checks ----------------------------------

    #[test]
    fn guards_pair_acquire_with_release() {
        let lock = RobustRwLock::new();
        drop(lock.lock_exclusive());
        drop(lock.lock_shared());
        // both paid back: the writer path is free again
        assert!(lock.inner.try_lock());
    }

    #[test]
    fn shared_holder_is_registered_and_unregistered() {
        let lock = RobustRwLock::new();
        lock.acquire_shared();
        assert_eq!(holder_pids(&lock), vec![own_pid() as u32]);
        lock.release_shared();
        assert_eq!(holder_pids(&lock), vec![]);
    }

    #[test]
    fn writer_blocks_reader_until_release() {
        let lock = RobustRwLock::new();
        let acquired = AtomicBool::new(false);
        lock.acquire_exclusive();
        thread::scope(|s| {
            s.spawn(|| {
                lock.acquire_shared();
                acquired.store(true, Release);
                lock.release_shared();
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!acquired.load(Acquire));
            lock.release_exclusive();
        });
        assert!(acquired.load(Acquire));
    }

    #[test]
    fn reader_blocks_writer_until_release() {
        let lock = RobustRwLock::new();
        let acquired = AtomicBool::new(false);
        lock.acquire_shared();
        thread::scope(|s| {
            s.spawn(|| {
                lock.acquire_exclusive();
                acquired.store(true, Release);
                lock.release_exclusive();
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!acquired.load(Acquire));
            lock.release_shared();
        });
        assert!(acquired.load(Acquire));
    }

    /// Scenario: the holder slot was reclaimed by a pruner while we were
    /// still alive. Our release must degrade to a no-op instead of paying
    /// the unlock twice.
    #[test]
    fn release_after_external_prune_is_a_noop() {
        let lock = RobustRwLock::new();
        lock.acquire_shared();

        // a pruner in another process reclaims our slot and pays our unlock
        assert!(lock.shared_holders.remove(own_pid() as u32));
        unsafe { lock.inner.unlock_sharable() };

        lock.release_shared();
        // had the release paid again, the count would have wrapped and the
        // writer path would be wedged
        assert!(lock.inner.try_lock());
    }

    /// Scenario: a writer died holding the lock; the next writer absorbs it
    /// without ever unlocking.
    #[test]
    fn writer_absorbs_dead_writer() {
        let lock = RobustRwLock::new();
        // the dead writer's leftover state: mutex held, its pid registered
        assert!(lock.inner.try_lock());
        lock.exclusive_holder.store(dead_pid(), Release);

        lock.acquire_exclusive();
        assert_eq!(lock.exclusive_holder.load(Acquire), own_pid());
        // absorbed, not released: the mutex never went through a free state
        assert!(!lock.inner.try_lock_sharable());

        lock.release_exclusive();
        assert!(lock.inner.try_lock_sharable());
        unsafe { lock.inner.unlock_sharable() };
    }

    /// Scenario: a writer died holding the lock; a reader cleans up on its
    /// behalf and then gets its shared hold.
    #[test]
    fn reader_recovers_from_dead_writer() {
        let lock = RobustRwLock::new();
        assert!(lock.inner.try_lock());
        lock.exclusive_holder.store(dead_pid(), Release);

        lock.acquire_shared();
        assert_eq!(lock.exclusive_holder.load(Acquire), NONE);
        assert_eq!(holder_pids(&lock), vec![own_pid() as u32]);

        lock.release_shared();
        assert!(lock.inner.try_lock());
    }

    /// Scenario: readers died holding the lock; the next writer prunes them
    /// and gets through.
    #[test]
    fn writer_prunes_dead_readers() {
        let lock = RobustRwLock::new();
        let dead = [dead_pid(), dead_pid()];
        for d in dead {
            // the dead readers' residue: a shared hold and a table entry each
            assert!(lock.inner.try_lock_sharable());
            assert!(lock.shared_holders.insert(d as u32));
        }

        lock.acquire_exclusive();
        assert_eq!(lock.exclusive_holder.load(Acquire), own_pid());
        assert!(holder_pids(&lock).is_empty());
        lock.release_exclusive();
    }

    /// The "should never happen" branch that does happen: the inner mutex is
    /// write-held while no holder is registered (the window between a
    /// release and the successor's try_lock). A reader must treat it as
    /// transient - no panic, no theft - and get through once it closes.
    #[test]
    fn reader_waits_out_an_unregistered_writer() {
        let lock = RobustRwLock::new();
        // write-held, holder still NONE
        assert!(lock.inner.try_lock());

        let acquired = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                lock.acquire_shared();
                acquired.store(true, Release);
                lock.release_shared();
            });
            thread::sleep(Duration::from_millis(20));
            // politely waiting, not panicking, not stealing
            assert!(!acquired.load(Acquire));
            unsafe { lock.inner.unlock() };
        });
        assert!(acquired.load(Acquire));
    }

    // ---- multi-process crash scenarios -----------------------------------
    //
    // These fork real children over a real segment. The children touch only
    // the shared mapping and then _exit; the parent owns all assertions.

    #[derive(Default)]
    #[repr(C)]
    struct Board {
        lock: RobustRwLock,
        ready: AtomicU32,
        go: AtomicU32,
        value: AtomicU32,
    }
    unsafe impl ShmSafe for Board {}

    fn board(tag: &str) -> Segment<Board> {
        let name = format!("/shmbus-test-{}-{tag}", std::process::id());
        let _ = rustix::shm::unlink(&name);
        Segment::<Board>::create(&name).expect("create segment")
    }

    fn fork_child(f: impl FnOnce()) -> libc::pid_t {
        // SAFETY: plain fork; the child works on the inherited shared
        // mapping and leaves through _exit without running destructors
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            // a child assertion failure must not unwind into the test body
            // this process inherited; it becomes a nonzero exit instead
            let outcome = panic::catch_unwind(panic::AssertUnwindSafe(f));
            unsafe { libc::_exit(if outcome.is_ok() { 0 } else { 101 }) };
        }
        pid
    }

    /// Wait for a child that is expected to finish cleanly; its in-child
    /// assertions surface here as a nonzero exit.
    fn reap(pid: libc::pid_t) {
        let mut status = 0;
        // SAFETY: pid is our direct child
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert!(
            libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
            "child {pid} failed with status {status}"
        );
    }

    fn kill_and_reap(pid: libc::pid_t) {
        // SAFETY: pid is our direct child
        unsafe {
            libc::kill(pid, libc::SIGKILL);
            libc::waitpid(pid, ptr::null_mut(), 0);
        }
    }

    fn wait_for(flag: &AtomicU32, at_least: u32) {
        while flag.load(Acquire) < at_least {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Nobody crashes: two writers hand off through the lock, a reader sees
    /// the final value.
    #[test]
    #[serial]
    fn clean_writer_handoff() {
        let seg = board("handoff");

        let first = fork_child(|| {
            let guard = seg.lock.lock_exclusive();
            seg.value.store(1, Relaxed);
            drop(guard);
        });
        reap(first);

        let second = fork_child(|| {
            let guard = seg.lock.lock_exclusive();
            assert_eq!(seg.value.load(Relaxed), 1);
            seg.value.store(2, Relaxed);
            drop(guard);
        });
        reap(second);

        let guard = seg.lock.lock_shared();
        assert_eq!(seg.value.load(Relaxed), 2);
        drop(guard);
        assert!(holder_pids(&seg.lock).is_empty());
    }

    /// A writer is SIGKILLed inside its critical section; the next writer
    /// detects the death and absorbs the lock.
    #[test]
    #[serial]
    fn crashed_writer_is_absorbed_by_the_next_writer() {
        let seg = board("writer-crash");

        let writer = fork_child(|| {
            seg.lock.acquire_exclusive();
            seg.ready.store(1, Release);
            loop {
                thread::sleep(Duration::from_millis(50));
            }
        });
        wait_for(&seg.ready, 1);
        kill_and_reap(writer);

        seg.lock.acquire_exclusive();
        assert_eq!(seg.lock.exclusive_holder.load(Acquire), own_pid());
        // still write-held end to end: absorbed, never released in between
        assert!(!seg.lock.inner.try_lock_sharable());
        seg.lock.release_exclusive();
    }

    /// A writer is SIGKILLed inside its critical section; a reader unlocks
    /// on the dead writer's behalf and proceeds.
    #[test]
    #[serial]
    fn crashed_writer_is_cleaned_up_by_a_reader() {
        let seg = board("writer-crash-reader");

        let writer = fork_child(|| {
            seg.lock.acquire_exclusive();
            seg.ready.store(1, Release);
            loop {
                thread::sleep(Duration::from_millis(50));
            }
        });
        wait_for(&seg.ready, 1);
        kill_and_reap(writer);

        seg.lock.acquire_shared();
        assert_eq!(seg.lock.exclusive_holder.load(Acquire), NONE);
        assert_eq!(holder_pids(&seg.lock), vec![own_pid() as u32]);
        seg.lock.release_shared();
    }

    /// Three readers, one of them SIGKILLed while holding. The waiting
    /// writer prunes the dead one and acquires once the live ones leave.
    #[test]
    #[serial]
    fn crashed_reader_is_pruned_by_a_waiting_writer() {
        let seg = board("reader-crash");
        let seg = &seg;

        let reader = |hold_forever: bool| {
            move || {
                seg.lock.acquire_shared();
                seg.ready.fetch_add(1, Release);
                if hold_forever {
                    loop {
                        thread::sleep(Duration::from_millis(50));
                    }
                }
                wait_for(&seg.go, 1);
                seg.lock.release_shared();
            }
        };

        let live1 = fork_child(reader(false));
        let doomed = fork_child(reader(true));
        let live2 = fork_child(reader(false));
        wait_for(&seg.ready, 3);

        kill_and_reap(doomed);
        seg.go.store(1, Release);
        reap(live1);
        reap(live2);

        seg.lock.acquire_exclusive();
        assert_eq!(seg.lock.exclusive_holder.load(Acquire), own_pid());
        assert!(!holder_pids(&seg.lock).contains(&(doomed as u32)));
        assert!(holder_pids(&seg.lock).is_empty());
        seg.lock.release_exclusive();
    }

    /// Mutual exclusion across processes: read-modify-write of a plain
    /// counter under the lock loses no updates.
    #[test]
    #[serial]
    fn exclusive_sections_do_not_interleave_across_processes() {
        const WRITERS: u32 = 4;
        const ROUNDS: u32 = 100;
        let seg = board("stress");

        let children: Vec<_> = (0..WRITERS)
            .map(|_| {
                fork_child(|| {
                    for _ in 0..ROUNDS {
                        let guard = seg.lock.lock_exclusive();
                        // deliberately non-atomic read-modify-write; the
                        // lock is the only thing keeping it whole
                        let v = seg.value.load(Relaxed);
                        seg.value.store(v + 1, Relaxed);
                        drop(guard);
                    }
                })
            })
            .collect();
        for child in children {
            reap(child);
        }

        let guard = seg.lock.lock_shared();
        assert_eq!(seg.value.load(Relaxed), WRITERS * ROUNDS);
        drop(guard);
    }
}
