//! Compression contract for compressed runs.
//!
//! The core only reasons about two facts of a compressed stream: how many bytes it occupies in
//! the buffer and what it decompresses to. Codec internals live in separate crates
//! (for example `rom-core-lz`) and are plugged into a model with
//! [`RomModel::with_codec`](crate::RomModel::with_codec).

use std::fmt;
use thiserror::Error;

/// Result of decoding a compressed stream found at the front of a byte slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decompressed {
    /// Decompressed content.
    pub data: Vec<u8>,
    /// Number of input bytes the stream occupied (header included).
    pub consumed: usize,
}

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("no codec is configured for compressed runs")]
    /// The model has no codec but the operation needs one.
    Unavailable,

    #[error("input of {len} bytes exceeds the codec limit of {max} bytes")]
    /// The content cannot be represented by the stream header.
    TooLarge {
        /// Input length.
        len: usize,
        /// Largest length the codec can encode.
        max: usize,
    },

    #[error("{0}")]
    /// Codec-specific failure.
    Other(String),
}

/// A compression scheme usable by [`RunKind::Compressed`](crate::RunKind::Compressed) runs.
pub trait Codec: fmt::Debug + Send + Sync {
    /// Short identifier, used in logs.
    fn name(&self) -> &str;

    /// Decode the stream that starts at `data[0]`.
    ///
    /// Returns `None` when the bytes are not a well-formed stream. Must never panic on malformed
    /// input, since the model calls this over arbitrary buffer contents.
    fn decompress(&self, data: &[u8]) -> Option<Decompressed>;

    /// Encode `data` into a complete stream.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}
