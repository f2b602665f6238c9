//! Advisory cross-process locking over filesystem markers.

mod clock;
mod file_lock;

pub use clock::{Backoff, Clock, ManualClock, TokioClock};
pub use file_lock::{
    DEFAULT_LOCK_TIMEOUT, FileLockGuard, LockManager, LockOptions, LockState, marker_path,
};
