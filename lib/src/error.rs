//! The typed error kinds surfaced by the store.
//!
//! Most functions return [`anyhow::Result`]; the cases a caller can
//! meaningfully react to are carried as this enum so they survive context
//! wrapping and can be recovered with [`anyhow::Error::downcast_ref`].

use std::sync::atomic::{AtomicBool, Ordering};

use crate::objtype::ObjectName;

/// An error with a recoverable meaning.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The object was not found, locally or anywhere in the parent chain.
    #[error("No such object {0}")]
    ObjectNotFound(ObjectName),
    /// The named remote is not configured in this repository or its parents.
    #[error("Remote \"{0}\" not found")]
    RemoteNotFound(String),
    /// The named ref does not exist.
    #[error("Ref '{0}' not found")]
    RefNotFound(String),
    /// The repository configuration is malformed or from an unsupported era.
    #[error("Invalid repository configuration: {0}")]
    InvalidConfig(String),
    /// The object directory was probed unwritable at open time.
    #[error("Repository is not writable: {0}")]
    NotWritable(String),
    /// A validating write or read recomputed a different digest.
    #[error("Corrupted object; checksum expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The checksum the caller advertised.
        expected: String,
        /// The checksum computed from the actual bytes.
        actual: String,
    },
    /// The entity already exists (remote name, signature from a key, ...).
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// A deprecated or unimplemented repository feature was requested.
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// The operation was cancelled via a [`Cancellable`].
    #[error("Operation was cancelled")]
    Cancelled,
}

/// Whether this error (possibly wrapped in context) denotes a missing
/// object, remote, or ref.  Parent-chain traversal and the optional-file
/// pattern key off this.
pub fn is_not_found(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<Error>(),
        Some(Error::ObjectNotFound(_) | Error::RemoteNotFound(_) | Error::RefNotFound(_))
    )
}

/// A cooperative cancellation flag, polled at syscall boundaries by
/// long-running operations.  Cancelling never rolls back partial work in
/// staging; the next allocator pass reclaims it.
#[derive(Debug, Default)]
pub struct Cancellable(AtomicBool);

impl Cancellable {
    /// Create a new, untriggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; safe to call from any thread.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Return `Err(Error::Cancelled)` if cancellation was requested.
    pub fn check(&self) -> crate::Result<()> {
        if self.0.load(Ordering::SeqCst) {
            return Err(Error::Cancelled.into());
        }
        Ok(())
    }
}

/// Poll an optional cancellable.
pub(crate) fn check_cancel(c: Option<&Cancellable>) -> crate::Result<()> {
    match c {
        Some(c) => c.check(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_through_context() {
        let e: anyhow::Error = Error::RemoteNotFound("origin".into()).into();
        let e = e.context("listing remotes");
        assert!(is_not_found(&e));
        let e: anyhow::Error = Error::Cancelled.into();
        assert!(!is_not_found(&e));
    }

    #[test]
    fn test_cancellable() {
        let c = Cancellable::new();
        c.check().unwrap();
        c.cancel();
        assert!(c.check().is_err());
    }
}
