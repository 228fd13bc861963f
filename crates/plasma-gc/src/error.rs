//! Error types.

use std::fmt;
use std::io;

/// Why an allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A request for zero words or bytes.
    ZeroSize,
    /// The request is larger than any cell the heap can hand out.
    TooLarge {
        /// Size requested, in bytes.
        requested_bytes: usize,
        /// Largest cell the heap supports, in bytes.
        limit: usize,
    },
    /// No space was left, even after a collection (if one was allowed).
    OutOfMemory {
        /// Size requested, in bytes.
        requested_bytes: usize,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "zero-sized allocation"),
            Self::TooLarge {
                requested_bytes,
                limit,
            } => write!(
                f,
                "allocation of {requested_bytes} bytes exceeds the {limit} byte cell limit"
            ),
            Self::OutOfMemory { requested_bytes } => {
                write!(f, "out of memory allocating {requested_bytes} bytes")
            }
        }
    }
}

impl std::error::Error for AllocError {}

/// Errors creating or checking a heap.
#[derive(Debug)]
pub enum HeapError {
    /// Reserving chunk memory from the operating system failed.
    Map(io::Error),
    /// A consistency check found a broken invariant.
    Corrupt {
        /// What was wrong.
        detail: String,
    },
}

impl HeapError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(err) => write!(f, "failed to reserve heap memory: {err}"),
            Self::Corrupt { detail } => write!(f, "heap corrupted: {detail}"),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Map(err) => Some(err),
            Self::Corrupt { .. } => None,
        }
    }
}

impl From<io::Error> for HeapError {
    fn from(err: io::Error) -> Self {
        Self::Map(err)
    }
}

/// A builtin was called with too few values on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackUnderflow {
    /// The builtin's symbol name.
    pub builtin: &'static str,
    /// Values the builtin consumes.
    pub needed: usize,
    /// Values that were available.
    pub found: usize,
}

impl fmt::Display for StackUnderflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} needs {} stack values but only {} available",
            self.builtin, self.needed, self.found
        )
    }
}

impl std::error::Error for StackUnderflow {}
