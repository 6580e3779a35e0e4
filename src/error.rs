//! Error types shared across the storage core.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by storage operations.
///
/// Database failures are passed through untouched in [`Error::Storage`];
/// everything else is raised by the crate itself. Payload deserialization
/// failures on the read path are *not* errors; they travel as sentinel
/// values inside [`crate::connection::JobData`] and
/// [`crate::connection::StateData`] so a dashboard can keep rendering.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required argument was null, empty, or out of range. Raised at the
    /// call boundary before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller's cancellation token was signaled during a blocking wait.
    #[error("operation canceled")]
    Canceled,

    /// The operation targeted a queue that has been disposed.
    #[error("job queue has been disposed")]
    Disposed,

    /// The distributed lock could not be acquired within the caller's
    /// timeout.
    #[error("could not acquire lock on {resource:?} within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },

    /// Releasing a distributed lock found no owning document; the lock was
    /// stolen by TTL expiry or another participant.
    #[error("lock on {resource:?} was lost before release")]
    LockLost { resource: String },

    /// A fetch spanned queues belonging to more than one queue provider.
    #[error("multiple queue providers resolved for the given queues")]
    MixedProviders,

    /// The persisted schema version is newer than this build supports.
    #[error("database schema version {found} is newer than the supported version {required}")]
    UnsupportedSchema { found: i32, required: i32 },

    /// An underlying database error, propagated untouched.
    #[error(transparent)]
    Storage(#[from] mongodb::error::Error),
}

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}
