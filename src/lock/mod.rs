//! Distributed lock with heartbeat, reentrancy, and expiry-based recovery.

mod awaiter;
mod context;
mod distributed_lock;
mod fingerprint;

pub use context::LockContext;
pub use distributed_lock::{acquire, DistributedLockGuard};
