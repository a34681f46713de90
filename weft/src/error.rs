//! Error types for the weft runtime
//!
//! Every fallible runtime operation reports one of a small set of status
//! codes; there are no panics on recoverable conditions in non-test code.

use core::fmt;

/// Runtime error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "runtime errors must be handled, not silently discarded"]
pub enum WeftError {
    /// Caller-supplied arguments were rejected (shepherd id out of range,
    /// zero shepherds, calls into an uninitialized runtime, ...)
    BadArgs,
    /// An allocation failed; any partial effects have been undone
    MallocError,
    /// An OS thread primitive failed (shepherd spawn, join)
    PthreadError,
    /// The operation had no effect (e.g. unlocking an unlocked address).
    /// Reported as a status, not a failure.
    Redundant,
}

/// Result type alias for runtime operations
pub type Result<T> = core::result::Result<T, WeftError>;

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArgs => write!(f, "bad arguments"),
            Self::MallocError => write!(f, "allocation failure"),
            Self::PthreadError => write!(f, "OS thread primitive failure"),
            Self::Redundant => write!(f, "redundant operation"),
        }
    }
}

impl std::error::Error for WeftError {}
