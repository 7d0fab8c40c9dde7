//! Recoverable collector errors.
//!
//! Structural invariant violations are not errors: they panic.

use std::io;

use thiserror::Error;

/// Errors surfaced to callers of the allocator and collector setup.
#[derive(Debug, Error)]
pub enum GcError {
    /// The OS refused to map memory, or the system allocator returned null.
    #[error("out of memory: could not obtain {requested} bytes")]
    OutOfMemory {
        /// Bytes that were requested.
        requested: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The requested object size cannot be represented.
    #[error("object of {size} bytes is too large")]
    ObjectTooLarge {
        /// Requested payload size.
        size: usize,
    },

    /// A collector worker thread could not be spawned.
    #[error("failed to spawn collector thread")]
    ThreadSpawn(#[source] io::Error),
}

impl GcError {
    pub(crate) fn oom(requested: usize) -> Self {
        Self::OutOfMemory {
            requested,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        }
    }

    /// Returns `true` for [`GcError::OutOfMemory`].
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_display_and_source() {
        let err = GcError::oom(4096);
        assert!(err.is_out_of_memory());
        assert_eq!(err.to_string(), "out of memory: could not obtain 4096 bytes");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn too_large_is_not_oom() {
        let err = GcError::ObjectTooLarge { size: usize::MAX };
        assert!(!err.is_out_of_memory());
    }
}
