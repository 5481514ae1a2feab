//! # Segment
//! Placement of the bus state in POSIX shared memory. One process creates the
//! named object, sizes it to the state struct and writes the initial value;
//! everyone else opens it and maps the same bytes. The lock in there outlives
//! any single participant - the name is only unlinked when the creator goes
//! away cleanly.
//!
//! This is the only fallible surface of the crate: mapping can fail in all
//! the usual syscall ways, and an opener can find an object whose size does
//! not match its build's layout. The lock operations themselves never return
//! errors.

use std::{
    fmt, mem,
    ops::Deref,
    ptr::{self, NonNull},
    sync::atomic::{AtomicI32, AtomicU32, AtomicU64},
};

use rustix::{
    fs::{fstat, ftruncate, Mode},
    io::Errno,
    mm::{mmap, munmap, MapFlags, ProtFlags},
    shm,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SegmentError {
    /// The name does not satisfy `shm_open`'s portable form.
    #[error("invalid segment name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// A syscall in the create/open path failed.
    #[error("{op} failed for segment `{name}`: {errno}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        errno: Errno,
    },

    /// The object exists but was created by a build with a different layout.
    #[error("segment `{name}` holds {actual} bytes, this build expects {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: u64,
    },
}

impl SegmentError {
    fn os(op: &'static str, name: &str, errno: Errno) -> Self {
        Self::Os {
            op,
            name: name.to_string(),
            errno,
        }
    }
}

/// Marker for types that may live in a segment shared between processes.
///
/// # Safety
/// Implementers promise the type is `#[repr(C)]` (the mapping is an ABI
/// between separately-compiled processes), contains no pointers or references
/// (addresses do not survive the process boundary), mutates only through
/// atomics, and stays sound if `Drop` never runs (a SIGKILL runs no
/// destructors).
pub unsafe trait ShmSafe: Send + Sync {}

macro_rules! shm_safe {
    ($($t:ty),* $(,)?) => { $(unsafe impl ShmSafe for $t {})* };
}

shm_safe!(u8, u16, u32, u64, i8, i16, i32, i64, AtomicI32, AtomicU32, AtomicU64);

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

/// A named shared-memory object mapped as one `T`.
///
/// The creator initializes the bytes with `T::default()` and unlinks the name
/// on drop; openers map the existing bytes and leave the name alone. Either
/// way the mapping itself is released on drop, and a crashed participant
/// releases it through process teardown - which is exactly the case the lock
/// inside is built to survive.
pub struct Segment<T: ShmSafe> {
    ptr: NonNull<T>,
    name: String,
    owner: bool,
}

// The pointee is shared memory, not thread-local state, and T polices its own
// cross-process access through ShmSafe.
unsafe impl<T: ShmSafe> Send for Segment<T> {}
unsafe impl<T: ShmSafe> Sync for Segment<T> {}

/// Portable `shm_open` names: a leading slash, no other slashes, NAME_MAX.
fn validate_name(name: &str) -> Result<(), SegmentError> {
    let fail = |reason| {
        Err(SegmentError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if !name.starts_with('/') {
        return fail("must start with '/'");
    }
    if name[1..].contains('/') {
        return fail("must not contain further '/' characters");
    }
    if name.len() > 255 {
        return fail("must be at most 255 bytes");
    }
    Ok(())
}

fn map(fd: impl rustix::fd::AsFd, len: usize, name: &str) -> Result<NonNull<u8>, SegmentError> {
    // SAFETY: fresh MAP_SHARED mapping of a valid fd; aliases no Rust object.
    // mmap returns page-aligned addresses, which satisfies any T.
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|errno| SegmentError::os("mmap", name, errno))?;
    // SAFETY: mmap never returns null on success
    Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
}

impl<T: ShmSafe + Default> Segment<T> {
    /// Create the named object, size it to `T` and write the initial state.
    ///
    /// Fails with `EEXIST` if the name is already taken - a stale name from a
    /// crashed creator must be unlinked out-of-band before the bus restarts.
    pub fn create(name: &str) -> Result<Self, SegmentError> {
        validate_name(name)?;
        let fd = shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|errno| SegmentError::os("shm_open", name, errno))?;

        if let Err(errno) = ftruncate(&fd, mem::size_of::<T>() as u64) {
            let _ = shm::unlink(name);
            return Err(SegmentError::os("ftruncate", name, errno));
        }

        let ptr = match map(&fd, mem::size_of::<T>(), name) {
            Ok(ptr) => ptr.cast::<T>(),
            Err(err) => {
                let _ = shm::unlink(name);
                return Err(err);
            }
        };

        // SAFETY: the mapping is fresh, sized for T, and nobody else can have
        // opened the object yet (O_EXCL)
        unsafe { ptr::write(ptr.as_ptr(), T::default()) };

        Ok(Self {
            ptr,
            name: name.to_string(),
            owner: true,
        })
    }
}

impl<T: ShmSafe> Segment<T> {
    /// Map an object some other process created.
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        validate_name(name)?;
        let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty())
            .map_err(|errno| SegmentError::os("shm_open", name, errno))?;

        // a size mismatch means the two sides disagree on the layout ABI;
        // mapping it anyway would be reading someone else's struct
        let stat = fstat(&fd).map_err(|errno| SegmentError::os("fstat", name, errno))?;
        if stat.st_size as u64 != mem::size_of::<T>() as u64 {
            return Err(SegmentError::SizeMismatch {
                name: name.to_string(),
                expected: mem::size_of::<T>(),
                actual: stat.st_size as u64,
            });
        }

        let ptr = map(&fd, mem::size_of::<T>(), name)?.cast::<T>();
        Ok(Self {
            ptr,
            name: name.to_string(),
            owner: false,
        })
    }
}

impl<T: ShmSafe> Deref for Segment<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: mapped at construction, unmapped only in Drop
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ShmSafe> Drop for Segment<T> {
    fn drop(&mut self) {
        // SAFETY: this mapping was created with this length and is dropped once
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), mem::size_of::<T>());
        }
        if self.owner {
            let _ = shm::unlink(&self.name);
        }
    }
}

impl<T: ShmSafe> fmt::Debug for Segment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("len", &mem::size_of::<T>())
            .finish()
    }
}
