//! # Liveness
//! One question, asked of the OS process table: does this pid still name a
//! live process? The recovery logic in the lock treats a `false` here as a
//! license to seize or release locks on the process's behalf, so the
//! predicate must only say `false` when the OS positively confirms the pid is
//! gone. Any ambiguous answer (permission trouble, a transient errno) counts
//! as alive - the worst that does is delay recovery by one retry.
//!
//! A pid can be recycled between our check and our action. The lock accepts
//! that: a recycled pid masquerades as a live holder and postpones recovery
//! by at most one acquisition cycle.

#[cfg(target_os = "linux")]
use rustix::{fs::stat, io::Errno};

/// `true` iff `pid` currently names a live process.
///
/// On Linux this checks the per-process directory under `/proc`, which exists
/// for zombies too - a crashed-but-unreaped holder is still "alive" here, and
/// that is the conservative answer we want until its parent reaps it.
#[cfg(target_os = "linux")]
pub fn process_exists(pid: i32) -> bool {
    match stat(format!("/proc/{pid}")) {
        Ok(_) => true,
        Err(Errno::NOENT) => false,
        // can't confirm death => treat as alive
        Err(_) => true,
    }
}

/// Fallback for unixes without `/proc`: probe with signal 0, which performs
/// the existence and permission checks but delivers nothing.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_exists(pid: i32) -> bool {
    use rustix::{
        io::Errno,
        process::{test_kill_process, Pid},
    };
    if pid <= 0 {
        return false;
    }
    match Pid::from_raw(pid) {
        // ESRCH is the only confirmation of death; EPERM means it is alive
        // but not ours to signal
        Some(p) => !matches!(test_kill_process(p), Err(Errno::SRCH)),
        None => false,
    }
}
