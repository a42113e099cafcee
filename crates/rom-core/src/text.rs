//! Text-run character set.
//!
//! Strings are stored one byte per character and end with [`TERMINATOR`]. Two escapes take a
//! parameter byte: [`RAW_ESCAPE`] (written `\\xx`) and [`CONTROL_ESCAPE`] (written `\CCxx`).
//! [`NEWLINE`] is written as `\n`.

use crate::error::{ModelError, Result};

/// End-of-string marker.
pub const TERMINATOR: u8 = 0xFF;
/// Line break.
pub const NEWLINE: u8 = 0xFE;
/// Escape whose parameter byte is emitted verbatim.
pub const RAW_ESCAPE: u8 = 0xFD;
/// Escape whose parameter byte selects a control code.
pub const CONTROL_ESCAPE: u8 = 0xFC;

/// Longest run of one repeated character accepted by [`looks_like_text`].
const MAX_REPEAT: usize = 3;

/// One decoded cell of a text run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Glyph {
    /// A printable character.
    Char(char),
    /// Line break.
    Newline,
    /// Raw escape with its parameter.
    Raw(u8),
    /// Control escape with its parameter.
    Control(u8),
    /// End of string.
    Terminator,
    /// A byte outside the character set.
    Unknown(u8),
}

fn char_for(byte: u8) -> Option<char> {
    let c = match byte {
        0x00 => ' ',
        0xA1..=0xAA => char::from(b'0' + (byte - 0xA1)),
        0xAB => '!',
        0xAC => '?',
        0xAD => '.',
        0xAE => '-',
        0xB4 => '\'',
        0xB7 => '$',
        0xB8 => ',',
        0xB9 => '*',
        0xBA => '/',
        0xBB..=0xD4 => char::from(b'A' + (byte - 0xBB)),
        0xD5..=0xEE => char::from(b'a' + (byte - 0xD5)),
        0xF0 => ':',
        0x2D => '&',
        0x35 => '=',
        0x36 => ';',
        0x5B => '%',
        0x5C => '(',
        0x5D => ')',
        _ => return None,
    };
    Some(c)
}

fn byte_for(c: char) -> Option<u8> {
    let byte = match c {
        ' ' => 0x00,
        '0'..='9' => 0xA1 + (c as u8 - b'0'),
        '!' => 0xAB,
        '?' => 0xAC,
        '.' => 0xAD,
        '-' => 0xAE,
        '\'' => 0xB4,
        '$' => 0xB7,
        ',' => 0xB8,
        '*' => 0xB9,
        '/' => 0xBA,
        'A'..='Z' => 0xBB + (c as u8 - b'A'),
        'a'..='z' => 0xD5 + (c as u8 - b'a'),
        ':' => 0xF0,
        '&' => 0x2D,
        '=' => 0x35,
        ';' => 0x36,
        '%' => 0x5B,
        '(' => 0x5C,
        ')' => 0x5D,
        _ => return None,
    };
    Some(byte)
}

/// Read the glyph starting at `data[offset]`, returning it with its width in bytes.
fn read_glyph(data: &[u8], offset: usize) -> Option<(Glyph, usize)> {
    let byte = *data.get(offset)?;
    let glyph = match byte {
        TERMINATOR => (Glyph::Terminator, 1),
        NEWLINE => (Glyph::Newline, 1),
        RAW_ESCAPE => (Glyph::Raw(*data.get(offset + 1)?), 2),
        CONTROL_ESCAPE => (Glyph::Control(*data.get(offset + 1)?), 2),
        _ => match char_for(byte) {
            Some(c) => (Glyph::Char(c), 1),
            None => (Glyph::Unknown(byte), 1),
        },
    };
    Some(glyph)
}

/// Number of bytes the string at the front of `data` occupies, terminator included.
///
/// Returns `None` when the bytes contain a character outside the set or no terminator is found.
pub fn measure(data: &[u8]) -> Option<usize> {
    let mut offset = 0;
    loop {
        let (glyph, width) = read_glyph(data, offset)?;
        offset += width;
        match glyph {
            Glyph::Terminator => return Some(offset),
            Glyph::Unknown(_) => return None,
            _ => {}
        }
    }
}

/// Decode the string at the front of `data`.
pub fn decode(data: &[u8]) -> Option<String> {
    let mut text = String::new();
    let mut offset = 0;
    loop {
        let (glyph, width) = read_glyph(data, offset)?;
        offset += width;
        match glyph {
            Glyph::Char(c) => text.push(c),
            Glyph::Newline => text.push('\n'),
            Glyph::Raw(param) => text.push_str(&format!("\\\\{:02X}", param)),
            Glyph::Control(param) => text.push_str(&format!("\\CC{:02X}", param)),
            Glyph::Terminator => return Some(text),
            Glyph::Unknown(_) => return None,
        }
    }
}

/// Encode `text`, appending the terminator.
pub fn encode(text: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if c == '\n' {
            bytes.push(NEWLINE);
            rest = &rest[1..];
            continue;
        }
        if c == '\\' {
            let (escape, tail) = if let Some(tail) = rest.strip_prefix("\\\\") {
                (RAW_ESCAPE, tail)
            } else if let Some(tail) = rest.strip_prefix("\\CC") {
                (CONTROL_ESCAPE, tail)
            } else {
                return Err(ModelError::Unencodable(format!(
                    "unrecognized escape in {:?}",
                    text
                )));
            };
            let param = tail
                .get(..2)
                .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| {
                    ModelError::Unencodable(format!("escape needs two hex digits in {:?}", text))
                })?;
            bytes.push(escape);
            bytes.push(param);
            rest = &tail[2..];
            continue;
        }
        let byte = byte_for(c)
            .ok_or_else(|| ModelError::Unencodable(format!("character {:?} has no encoding", c)))?;
        bytes.push(byte);
        rest = &rest[c.len_utf8()..];
    }

    bytes.push(TERMINATOR);
    Ok(bytes)
}

/// Heuristic used by pointer discovery: a terminated string with at least one character and no
/// character repeated more than three times in a row. Returns the measured length.
pub fn looks_like_text(data: &[u8]) -> Option<usize> {
    let length = measure(data)?;
    if length < 2 {
        return None;
    }

    let mut previous = None;
    let mut repeats = 0;
    for &byte in &data[..length - 1] {
        if Some(byte) == previous {
            repeats += 1;
            if repeats >= MAX_REPEAT {
                return None;
            }
        } else {
            previous = Some(byte);
            repeats = 0;
        }
    }

    Some(length)
}

/// Glyph covering `data[offset]`, where `data` starts at the beginning of the string.
///
/// The parameter byte of an escape reports the escape itself.
pub fn glyph_at(data: &[u8], offset: usize) -> Option<Glyph> {
    let mut position = 0;
    while position <= offset {
        let (glyph, width) = read_glyph(data, position)?;
        if offset < position + width {
            return Some(glyph);
        }
        if glyph == Glyph::Terminator {
            return None;
        }
        position += width;
    }
    None
}
