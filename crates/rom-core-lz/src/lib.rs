//! `rom-core-lz` - GBA "LZ10" compression for `rom-core` compressed runs.
//!
//! Stream layout:
//!
//! - header: `0x10`, then the decompressed length as 24-bit little-endian
//! - groups of one flag byte followed by up to eight tokens, most significant flag bit first
//! - flag bit `0`: one literal byte
//! - flag bit `1`: two bytes `LD DD`, copying `L + 3` bytes from `DDD + 1` bytes back
//!
//! Plug it into a model with [`RomModel::with_codec`](rom_core::RomModel::with_codec):
//!
//! ```rust
//! use std::sync::Arc;
//! use rom_core::{FormatDescriptor, ModelDelta, RomModel};
//! use rom_core_lz::LzCodec;
//!
//! let stream = rom_core_lz::compress(b"abcabcabcabc").unwrap();
//! let mut bytes = vec![0xFF; 0x80];
//! bytes[..stream.len()].copy_from_slice(&stream);
//!
//! let mut model = RomModel::new(bytes).with_codec(Arc::new(LzCodec));
//! let mut tx = ModelDelta::new();
//! model.declare_run(0, FormatDescriptor::Compressed, &mut tx).unwrap();
//! assert_eq!(model.read_compressed(0).unwrap(), b"abcabcabcabc");
//! ```

use rom_core::{Codec, CodecError, Decompressed};
use thiserror::Error;
use tracing::trace;

/// First byte of every stream.
pub const MAGIC: u8 = 0x10;
/// Largest decompressed length the header can express.
pub const MAX_LEN: usize = 0x00FF_FFFF;

const HEADER_LEN: usize = 4;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 18;
const WINDOW: usize = 0x1000;

/// Decoding and encoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LzError {
    #[error("stream does not start with {MAGIC:#04X}")]
    /// Wrong first byte.
    BadMagic,

    #[error("stream ends after {0} bytes")]
    /// The input ran out before the declared length was produced.
    Truncated(usize),

    #[error("back-reference of {distance} bytes with only {available} bytes decoded")]
    /// A back-reference reaches before the start of the output.
    BadReference {
        /// Requested distance.
        distance: usize,
        /// Bytes decoded so far.
        available: usize,
    },

    #[error("input of {0} bytes exceeds the {MAX_LEN} byte limit")]
    /// The input is too long for the header.
    TooLarge(usize),
}

impl From<LzError> for CodecError {
    fn from(err: LzError) -> Self {
        match err {
            LzError::TooLarge(len) => CodecError::TooLarge { len, max: MAX_LEN },
            other => CodecError::Other(other.to_string()),
        }
    }
}

/// Decode the stream at the front of `data`.
pub fn decompress(data: &[u8]) -> Result<Decompressed, LzError> {
    let header = data.get(..HEADER_LEN).ok_or(LzError::Truncated(data.len()))?;
    if header[0] != MAGIC {
        return Err(LzError::BadMagic);
    }
    let expected = usize::from(header[1]) | usize::from(header[2]) << 8 | usize::from(header[3]) << 16;

    let mut out = Vec::with_capacity(expected);
    let mut position = HEADER_LEN;
    let next = |position: &mut usize| -> Result<u8, LzError> {
        let byte = *data.get(*position).ok_or(LzError::Truncated(data.len()))?;
        *position += 1;
        Ok(byte)
    };

    while out.len() < expected {
        let flags = next(&mut position)?;
        for bit in (0..8).rev() {
            if out.len() >= expected {
                break;
            }
            if flags & (1 << bit) == 0 {
                out.push(next(&mut position)?);
                continue;
            }

            let high = next(&mut position)?;
            let low = next(&mut position)?;
            let length = usize::from(high >> 4) + MIN_MATCH;
            let distance = (usize::from(high & 0x0F) << 8 | usize::from(low)) + 1;
            if distance > out.len() {
                return Err(LzError::BadReference {
                    distance,
                    available: out.len(),
                });
            }
            let from = out.len() - distance;
            for offset in 0..length {
                out.push(out[from + offset]);
            }
        }
    }
    // A final back-reference may overshoot the declared length.
    out.truncate(expected);

    Ok(Decompressed {
        data: out,
        consumed: position,
    })
}

/// Longest earlier match for `input[at..]`, as `(distance, length)`.
fn longest_match(input: &[u8], at: usize) -> Option<(usize, usize)> {
    let max_length = MAX_MATCH.min(input.len() - at);
    if max_length < MIN_MATCH {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    for distance in 1..=WINDOW.min(at) {
        let from = at - distance;
        let length = (0..max_length)
            .take_while(|&offset| input[from + offset] == input[at + offset])
            .count();
        if length >= MIN_MATCH && best.is_none_or(|(_, best_length)| length > best_length) {
            best = Some((distance, length));
            if length == max_length {
                break;
            }
        }
    }
    best
}

/// Encode `input` into a complete stream using greedy matching.
pub fn compress(input: &[u8]) -> Result<Vec<u8>, LzError> {
    if input.len() > MAX_LEN {
        return Err(LzError::TooLarge(input.len()));
    }

    let len = input.len();
    let mut out = vec![MAGIC, len as u8, (len >> 8) as u8, (len >> 16) as u8];
    let mut at = 0;
    while at < len {
        let flag_index = out.len();
        out.push(0);
        for bit in (0..8).rev() {
            if at >= len {
                break;
            }
            match longest_match(input, at) {
                Some((distance, length)) => {
                    out[flag_index] |= 1 << bit;
                    let encoded = distance - 1;
                    out.push(((length - MIN_MATCH) << 4 | encoded >> 8) as u8);
                    out.push(encoded as u8);
                    at += length;
                }
                None => {
                    out.push(input[at]);
                    at += 1;
                }
            }
        }
    }

    trace!(input = len, output = out.len(), "compressed");
    Ok(out)
}

/// [`Codec`] implementation for LZ10 streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LzCodec;

impl Codec for LzCodec {
    fn name(&self) -> &str {
        "lz10"
    }

    fn decompress(&self, data: &[u8]) -> Option<Decompressed> {
        decompress(data).ok()
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(compress(data)?)
    }
}
