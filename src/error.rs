// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Error types for sackdb operations.
//!
//! Provides structured error handling with detailed context for debugging.

use std::fmt;

/// Standard Result type for all sackdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for sackdb operations.
#[derive(Debug)]
pub enum Error {
    /// Key absent on a `get`/`pop` that required it to exist.
    NotFound,

    /// The allocator has no block large enough to satisfy a request.
    OutOfSpace { requested: usize },

    /// A mutating call was attempted on a read-only store.
    ReadOnly,

    /// Decoding failed, a structural invariant was violated, or a descriptor
    /// pointed outside the allocator's address space.
    Corrupt { reason: String },

    /// Underlying stream I/O failure.
    Io(std::io::Error),

    /// Missing required parameters, an unsupported codec tag, or an open
    /// mode mismatch.
    BadArgument { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::OutOfSpace { requested } => {
                write!(f, "allocator out of space: requested {} bytes", requested)
            }
            Self::ReadOnly => write!(f, "store is read-only"),
            Self::Corrupt { reason } => write!(f, "corrupt store: {}", reason),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::BadArgument { reason } => write!(f, "bad argument: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl Error {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt {
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_argument(reason: impl Into<String>) -> Self {
        Error::BadArgument {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        assert_eq!(Error::NotFound.to_string(), "key not found");
    }

    #[test]
    fn out_of_space_display_includes_size() {
        let err = Error::OutOfSpace { requested: 4096 };
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn io_error_roundtrips_through_from() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
