//! Error taxonomy for model mutations and the change history.
//!
//! Invalid references (a pointer that lands outside the buffer or in the middle of another run)
//! are deliberately *not* errors: they are recorded on the owning run via
//! [`Run::in_error`](crate::Run::in_error) so the index stays queryable.

use crate::codec::CodecError;
use std::fmt;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = ModelError> = std::result::Result<T, E>;

/// What a rejected region collided with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// An existing run occupies part of the region.
    Run {
        /// Start address of the conflicting run.
        start: usize,
        /// Allocated length of the conflicting run.
        length: usize,
    },
    /// A named anchor is bound inside the region.
    Anchor {
        /// Anchor name.
        name: String,
        /// Address the anchor is bound to.
        address: usize,
    },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Run { start, length } => {
                write!(f, "run at {:06X} ({} bytes)", start, length)
            }
            Conflict::Anchor { name, address } => {
                write!(f, "anchor '{}' at {:06X}", name, address)
            }
        }
    }
}

/// Errors returned by [`RomModel`](crate::RomModel) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("region {start:06X}..{end:06X} conflicts with {conflict}")]
    /// The requested region overlaps a run or an anchor that is not part of the operation.
    StructuralConflict {
        /// Inclusive start of the rejected region.
        start: usize,
        /// Exclusive end of the rejected region.
        end: usize,
        /// The first collision found.
        conflict: Conflict,
    },

    #[error("no free region of {needed} bytes is available (buffer length {buffer_len:#X})")]
    /// No free region is large enough and the growth policy forbids growing the buffer.
    InsufficientSpace {
        /// Number of bytes that were requested.
        needed: usize,
        /// Buffer length at the time of the request.
        buffer_len: usize,
    },

    #[error("address {address:06X} is outside the buffer (length {len:#X})")]
    /// An address or region extends past the end of the buffer.
    OutOfBounds {
        /// The offending address (or exclusive region end).
        address: usize,
        /// Buffer length.
        len: usize,
    },

    #[error("no run starts at {0:06X}")]
    /// The operation needs a run starting at the address.
    NoRun(usize),

    #[error("run at {address:06X} is not a {expected} run")]
    /// The run at the address has a different kind than the operation needs.
    WrongKind {
        /// Start of the run.
        address: usize,
        /// The kind the operation expected.
        expected: &'static str,
    },

    #[error("bytes at {address:06X} are not valid {format} data")]
    /// The bytes at the address cannot be interpreted in the declared format.
    InvalidData {
        /// Address of the rejected declaration.
        address: usize,
        /// Human-readable format name.
        format: &'static str,
    },

    #[error("'{0}' is not a valid anchor name")]
    /// Anchor names must start with a letter or underscore and contain no whitespace.
    InvalidName(String),

    #[error("unknown anchor '{0}'")]
    /// No anchor with this name exists.
    UnknownAnchor(String),

    #[error("unknown list '{0}'")]
    /// No named list with this name exists.
    UnknownList(String),

    #[error("word '{name}' is {expected} bytes wide elsewhere, not {found}")]
    /// Every copy of a named word must have the same width.
    WordWidth {
        /// Shared word name.
        name: String,
        /// Width of the existing copies.
        expected: u8,
        /// Width of the rejected declaration.
        found: u8,
    },

    #[error("text cannot be encoded: {0}")]
    /// Text contains characters that the character set cannot represent.
    Unencodable(String),

    #[error(transparent)]
    /// The compression codec failed or is missing.
    Codec(#[from] CodecError),

    #[error("cannot {operation} while a revert is in progress")]
    /// A mutation was attempted from inside an undo/redo revert.
    Reentrancy {
        /// The rejected operation.
        operation: &'static str,
    },
}

/// Errors raised by the [`ChangeHistory`](crate::ChangeHistory) state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("cannot {operation} while a revert is in progress")]
    /// Opening, sealing, or starting another revert while one is already running.
    RevertInProgress {
        /// The rejected operation.
        operation: &'static str,
    },

    #[error("no revert is in progress")]
    /// `finish_revert` was called without a matching `begin_undo`/`begin_redo`.
    NoRevertInProgress,
}

impl From<HistoryError> for ModelError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::RevertInProgress { operation } => ModelError::Reentrancy { operation },
            HistoryError::NoRevertInProgress => ModelError::Reentrancy {
                operation: "finish a revert",
            },
        }
    }
}
