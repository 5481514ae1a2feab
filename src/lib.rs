//! Locking layer of a shared-memory publish/subscribe bus: a reader/writer
//! lock that lives inside the mapped segment and survives the death of any
//! holder. See [`robust_lock`] for the protocol.

pub mod liveness;
pub mod pid_set;
pub mod raw_mutex;
pub mod robust_lock;
pub mod segment;

pub use robust_lock::{ExclusiveGuard, RobustRwLock, SharedGuard, MAX_SHARED};
pub use segment::{Segment, SegmentError, ShmSafe};
