use std::env::args;
use std::panic;
use std::ptr;
use std::str::FromStr;
use std::string::ToString;
use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};
use std::thread;
use std::time::Duration;

use strum::IntoEnumIterator;
use strum_macros::{self, Display, EnumIter, EnumString};

use shmbus::{RobustRwLock, Segment, ShmSafe};

fn main() -> Result<(), String> {
    env_logger::init();
    args()
        .nth(1)
        .ok_or(format!(
            "no scenario supplied, use one of {}",
            Scenario::iter()
                .map(|s| s.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| Scenario::from_str(&selector).map_err(|e| e.to_string()))
        .and_then(|scenario| match scenario {
            Scenario::CleanHandoff => clean_handoff(),
            Scenario::WriterCrash => writer_crash(),
            Scenario::WriterCrashReader => writer_crash_reader(),
            Scenario::ReaderCrash => reader_crash(),
        })
}

/// Each scenario forks real child processes over one shared segment and
/// narrates what the survivors observe.
#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Scenario {
    CleanHandoff,
    WriterCrash,
    WriterCrashReader,
    ReaderCrash,
}

/// The shared state every scenario works on: the lock plus a little payload
/// and some coordination flags.
#[derive(Default)]
#[repr(C)]
struct Board {
    lock: RobustRwLock,
    ready: AtomicU32,
    go: AtomicU32,
    value: AtomicU32,
}
unsafe impl ShmSafe for Board {}

fn board(tag: &str) -> Result<Segment<Board>, String> {
    let name = format!("/shmbus-demo-{}-{tag}", std::process::id());
    let _ = rustix::shm::unlink(&name);
    Segment::<Board>::create(&name).map_err(|e| e.to_string())
}

fn fork_child(f: impl FnOnce()) -> libc::pid_t {
    // SAFETY: plain fork; the child only touches the inherited shared
    // mapping and leaves through _exit
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let outcome = panic::catch_unwind(panic::AssertUnwindSafe(f));
        unsafe { libc::_exit(if outcome.is_ok() { 0 } else { 101 }) };
    }
    pid
}

fn reap(pid: libc::pid_t) {
    // SAFETY: pid is our direct child
    unsafe { libc::waitpid(pid, ptr::null_mut(), 0) };
}

fn kill_and_reap(pid: libc::pid_t) {
    // SAFETY: pid is our direct child
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    reap(pid);
}

fn wait_for(flag: &AtomicU32, at_least: u32) {
    while flag.load(Acquire) < at_least {
        thread::sleep(Duration::from_millis(1));
    }
}

fn hold_forever() -> ! {
    loop {
        thread::sleep(Duration::from_millis(50));
    }
}

/// Two writers hand off cleanly, a reader sees the second writer's value.
fn clean_handoff() -> Result<(), String> {
    let seg = board("handoff")?;

    let first = fork_child(|| {
        let guard = seg.lock.lock_exclusive();
        seg.value.store(1, Relaxed);
        println!("[writer {}] wrote 1", std::process::id());
        drop(guard);
    });
    reap(first);

    let second = fork_child(|| {
        let guard = seg.lock.lock_exclusive();
        let seen = seg.value.load(Relaxed);
        seg.value.store(2, Relaxed);
        println!("[writer {}] saw {seen}, wrote 2", std::process::id());
        drop(guard);
    });
    reap(second);

    let guard = seg.lock.lock_shared();
    println!("[reader {}] saw {}", std::process::id(), seg.value.load(Relaxed));
    drop(guard);
    Ok(())
}

/// A writer dies inside its critical section; the next writer detects the
/// death and takes the lock over without unlocking.
fn writer_crash() -> Result<(), String> {
    let seg = board("writer-crash")?;

    let writer = fork_child(|| {
        seg.lock.acquire_exclusive();
        println!("[writer {}] holding exclusively, about to die", std::process::id());
        seg.ready.store(1, Release);
        hold_forever();
    });
    wait_for(&seg.ready, 1);
    kill_and_reap(writer);
    println!("[main] killed writer {writer} while it held the lock");

    seg.lock.acquire_exclusive();
    println!("[main] absorbed the dead writer's lock");
    seg.lock.release_exclusive();
    Ok(())
}

/// A writer dies inside its critical section; a reader unlocks on the dead
/// process's behalf and then reads.
fn writer_crash_reader() -> Result<(), String> {
    let seg = board("writer-crash-reader")?;

    let writer = fork_child(|| {
        seg.lock.acquire_exclusive();
        seg.value.store(7, Relaxed);
        seg.ready.store(1, Release);
        hold_forever();
    });
    wait_for(&seg.ready, 1);
    kill_and_reap(writer);
    println!("[main] killed writer {writer} while it held the lock");

    let guard = seg.lock.lock_shared();
    println!(
        "[main] cleaned up after the dead writer, reading {} shared",
        seg.value.load(Relaxed)
    );
    drop(guard);
    Ok(())
}

/// Readers hold the lock, one of them dies. The waiting writer prunes the
/// dead reader's hold and gets through once the live readers leave.
fn reader_crash() -> Result<(), String> {
    let seg = board("reader-crash")?;
    let seg = &seg;

    let reader = |doomed: bool| {
        move || {
            seg.lock.acquire_shared();
            println!("[reader {}] holding shared", std::process::id());
            seg.ready.fetch_add(1, Release);
            if doomed {
                hold_forever();
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
    println!("[main] killed reader {doomed} while it held the lock");
    seg.go.store(1, Release);
    reap(live1);
    reap(live2);

    seg.lock.acquire_exclusive();
    println!("[main] pruned the dead reader and acquired exclusively");
    seg.lock.release_exclusive();
    Ok(())
}
