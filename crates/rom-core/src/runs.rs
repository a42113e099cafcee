//! Run variants.
//!
//! A [`Run`] is the metadata describing how to interpret one contiguous byte range. The set of
//! variants is closed ([`RunKind`]); each variant answers the same four questions:
//!
//! - [`Run::declared_length`]: how many bytes the content currently needs,
//! - [`Run::format_at`]: what a single byte inside the run means,
//! - [`Run::on_write`]: which other locations must follow a change to the run's bytes,
//! - [`Run::duplicate`]: the same metadata anchored elsewhere (used by relocation).
//!
//! Runs never hold references to other runs. Back-references are plain addresses in
//! [`Run::pointer_sources`].

use crate::intervals::Keyed;
use crate::model::{RomModel, read_le};
use crate::text::{self, Glyph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Width of a stored pointer.
pub const POINTER_WIDTH: usize = 4;

/// What a stored pointer value resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerTarget {
    /// Stored value `0`.
    Null,
    /// An address inside the buffer.
    Address(usize),
    /// Any other value; the raw value is kept for display.
    Invalid(u32),
}

impl PointerTarget {
    /// Interpret a raw stored value against a pointer base and a buffer length.
    pub fn decode(raw: u32, base: u32, buffer_len: usize) -> Self {
        if raw == 0 {
            return PointerTarget::Null;
        }
        match raw.checked_sub(base) {
            Some(offset) if (offset as usize) < buffer_len => PointerTarget::Address(offset as usize),
            _ => PointerTarget::Invalid(raw),
        }
    }

    /// The destination address, if the pointer resolves inside the buffer.
    pub fn address(self) -> Option<usize> {
        match self {
            PointerTarget::Address(address) => Some(address),
            _ => None,
        }
    }
}

/// Type of one table field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Little-endian unsigned integer of 1, 2 or 4 bytes.
    Integer {
        /// Width in bytes.
        width: u8,
    },
    /// Stored pointer (4 bytes).
    Pointer,
    /// Integer whose value indexes a named list.
    Enum {
        /// Name of the list providing labels.
        list: String,
        /// Width in bytes.
        width: u8,
    },
    /// Fixed-width text.
    Text {
        /// Width in bytes, terminator included.
        width: usize,
    },
}

/// A named field inside a table element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field type.
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl Field {
    /// Create a field.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Bytes occupied by the field in each element.
    pub fn width(&self) -> usize {
        match &self.kind {
            FieldKind::Integer { width } | FieldKind::Enum { width, .. } => usize::from(*width),
            FieldKind::Pointer => POINTER_WIDTH,
            FieldKind::Text { width } => *width,
        }
    }
}

/// How a table's element count is determined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum TableLength {
    /// A fixed number of elements.
    Fixed(usize),
    /// Same element count as the table anchored at `anchor`, plus `offset`.
    Matching {
        /// Anchor name of the table being followed.
        anchor: String,
        /// Difference from the followed table's count.
        offset: i64,
    },
}

impl TableLength {
    /// Element count of a table following one with `parent` elements, never below zero.
    pub fn offset_count(parent: usize, offset: i64) -> usize {
        let parent = i64::try_from(parent).unwrap_or(i64::MAX);
        usize::try_from(parent.saturating_add(offset).max(0)).unwrap_or(usize::MAX)
    }
}

/// Table/array layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Fields of each element, in storage order.
    pub fields: Vec<Field>,
    /// Count rule.
    pub length: TableLength,
    /// Current number of elements.
    pub element_count: usize,
}

impl Table {
    /// Bytes per element.
    pub fn element_width(&self) -> usize {
        self.fields.iter().map(Field::width).sum()
    }

    /// Fields paired with their offset inside an element.
    pub fn field_offsets(&self) -> impl Iterator<Item = (usize, &Field)> {
        self.fields.iter().scan(0, |offset, field| {
            let at = *offset;
            *offset += field.width();
            Some((at, field))
        })
    }

    /// Element count the table should have now.
    ///
    /// For a matching table this follows the other table's current count; `None` when the
    /// followed anchor does not name a table.
    pub fn resolve_count(&self, model: &RomModel) -> Option<usize> {
        match &self.length {
            TableLength::Fixed(_) => Some(self.element_count),
            TableLength::Matching { anchor, offset } => {
                let address = model.anchor_address(anchor)?;
                let RunKind::Table(parent) = model.run_exactly_at(address)?.kind() else {
                    return None;
                };
                Some(TableLength::offset_count(parent.element_count, *offset))
            }
        }
    }
}

/// Closed set of run variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunKind {
    /// Nothing is known; exists to carry pointer sources.
    NoInfo,
    /// A single stored pointer.
    Pointer,
    /// Terminated text.
    Text,
    /// A codec stream.
    Compressed {
        /// Length of the content after decompression.
        decompressed_len: usize,
    },
    /// A named constant; every copy with the same name holds the same value, shifted by the
    /// copy's own offset.
    Word {
        /// Shared name.
        name: String,
        /// Width in bytes (1, 2 or 4).
        width: u8,
        /// Stored value minus the shared value.
        offset: i32,
    },
    /// Array of structured elements.
    Table(Table),
}

impl RunKind {
    /// Short human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            RunKind::NoInfo => "no-info",
            RunKind::Pointer => "pointer",
            RunKind::Text => "text",
            RunKind::Compressed { .. } => "compressed",
            RunKind::Word { .. } => "word",
            RunKind::Table(_) => "table",
        }
    }
}

/// A format a collaborator can declare at an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatDescriptor {
    /// A stored pointer.
    Pointer,
    /// Terminated text.
    Text,
    /// A stream readable by the model's codec.
    Compressed,
    /// A named constant.
    Word {
        /// Shared name.
        name: String,
        /// Width in bytes.
        width: u8,
        /// Stored value minus the shared value, for copies holding `count - 1` and the like.
        #[serde(default, skip_serializing_if = "is_zero")]
        offset: i32,
    },
    /// A table of structured elements.
    Table {
        /// Fields of each element.
        fields: Vec<Field>,
        /// Count rule.
        length: TableLength,
    },
}

fn is_zero(offset: &i32) -> bool {
    *offset == 0
}

impl FormatDescriptor {
    /// Whether runs of this format hold pointer slots.
    pub fn stores_pointers(&self) -> bool {
        match self {
            FormatDescriptor::Pointer => true,
            FormatDescriptor::Table { fields, .. } => {
                fields.iter().any(|field| field.kind == FieldKind::Pointer)
            }
            _ => false,
        }
    }

    /// Whether the format's length depends on another table.
    pub fn is_matching(&self) -> bool {
        matches!(
            self,
            FormatDescriptor::Table {
                length: TableLength::Matching { .. },
                ..
            }
        )
    }
}

/// Display/edit description of one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellFormat {
    /// No interpretation.
    None,
    /// Part of a stored pointer at `source`.
    Pointer {
        /// Address of the pointer's first byte.
        source: usize,
        /// What the pointer resolves to.
        target: PointerTarget,
    },
    /// Part of a text cell.
    Text(Glyph),
    /// Part of an integer table field.
    Integer {
        /// Element index.
        element: usize,
        /// Field name.
        field: String,
        /// Field value.
        value: u32,
    },
    /// Part of an enum table field.
    Enum {
        /// Element index.
        element: usize,
        /// Field name.
        field: String,
        /// Field value.
        value: u32,
        /// Label from the named list, when the list has one at this index.
        label: Option<String>,
    },
    /// Part of a compressed stream.
    Compressed {
        /// Offset from the start of the stream.
        offset: usize,
    },
    /// Part of a named constant.
    Word {
        /// Shared name.
        name: String,
        /// Current value.
        value: u32,
    },
}

/// A contiguous byte write, described by where it started and what was there before.
///
/// The new bytes are read from the model, which already holds them.
#[derive(Debug, Clone, Copy)]
pub struct ByteChange<'a> {
    /// First changed address.
    pub start: usize,
    /// Previous content of `start..start + old.len()`.
    pub old: &'a [u8],
}

impl ByteChange<'_> {
    /// Exclusive end of the change.
    pub fn end(&self) -> usize {
        self.start + self.old.len()
    }

    /// Whether the change touches `address..address + width`.
    pub fn overlaps(&self, address: usize, width: usize) -> bool {
        address < self.end() && self.start < address + width
    }

    /// Value of `address..address + width` before the change.
    fn previous_value(&self, current: &[u8], address: usize, width: usize) -> Option<u32> {
        let mut value = 0u32;
        for i in (0..width).rev() {
            let at = address + i;
            let byte = if (self.start..self.end()).contains(&at) {
                self.old[at - self.start]
            } else {
                *current.get(at)?
            };
            value = (value << 8) | u32::from(byte);
        }
        Some(value)
    }
}

/// Work a write to one run implies for other locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependent {
    /// The pointer stored at `source` changed target.
    Repoint {
        /// Address of the pointer.
        source: usize,
        /// Target before the write.
        previous: PointerTarget,
        /// Target after the write.
        current: PointerTarget,
    },
    /// Store `value` in the other copy of a named constant at `to`.
    Mirror {
        /// Address of the other copy.
        to: usize,
        /// Width of the copy.
        width: usize,
        /// Value with the copy's own offset applied.
        value: u32,
    },
}

/// Interpretation of one contiguous byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    start: usize,
    length: usize,
    sources: BTreeSet<usize>,
    kind: RunKind,
    in_error: bool,
}

impl Keyed for Run {
    fn key(&self) -> usize {
        self.start
    }
}

impl Run {
    pub(crate) fn new(start: usize, length: usize, kind: RunKind) -> Self {
        Self {
            start,
            length,
            sources: BTreeSet::new(),
            kind,
            in_error: false,
        }
    }

    /// First address of the run.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Allocated length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Exclusive end address.
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    /// Whether `address` lies inside the run.
    pub fn contains(&self, address: usize) -> bool {
        (self.start..self.end()).contains(&address)
    }

    /// Variant and variant data.
    pub fn kind(&self) -> &RunKind {
        &self.kind
    }

    /// Addresses storing a pointer to [`Run::start`].
    pub fn pointer_sources(&self) -> &BTreeSet<usize> {
        &self.sources
    }

    /// Set when a pointer slot of this run resolves outside the buffer or into the middle of
    /// another run, or when the content no longer matches its format.
    pub fn in_error(&self) -> bool {
        self.in_error
    }

    /// Whether the run is an anonymous placeholder.
    pub fn is_no_info(&self) -> bool {
        matches!(self.kind, RunKind::NoInfo)
    }

    pub(crate) fn set_in_error(&mut self, in_error: bool) {
        self.in_error = in_error;
    }

    pub(crate) fn add_source(&mut self, source: usize) -> bool {
        self.sources.insert(source)
    }

    pub(crate) fn remove_source(&mut self, source: usize) -> bool {
        self.sources.remove(&source)
    }

    pub(crate) fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub(crate) fn with_sources(mut self, sources: BTreeSet<usize>) -> Self {
        self.sources = sources;
        self
    }

    pub(crate) fn with_kind(mut self, kind: RunKind) -> Self {
        self.kind = kind;
        self
    }

    /// Copy of this run's metadata anchored at `new_start` with the given pointer sources.
    pub fn duplicate(&self, new_start: usize, sources: BTreeSet<usize>) -> Run {
        Run {
            start: new_start,
            length: self.length,
            sources,
            kind: self.kind.clone(),
            in_error: self.in_error,
        }
    }

    /// Bytes the content needs right now.
    ///
    /// Never fails on malformed bytes: returns `None` when the content cannot be measured
    /// (missing terminator, undecodable stream, unresolvable matching table).
    pub fn declared_length(&self, model: &RomModel) -> Option<usize> {
        let tail = model.bytes().get(self.start..)?;
        match &self.kind {
            RunKind::NoInfo => Some(1),
            RunKind::Pointer => Some(POINTER_WIDTH),
            RunKind::Text => text::measure(tail),
            RunKind::Compressed { .. } => model.codec()?.decompress(tail).map(|d| d.consumed),
            RunKind::Word { width, .. } => Some(usize::from(*width)),
            RunKind::Table(table) => Some(table.resolve_count(model)? * table.element_width()),
        }
    }

    /// Addresses of every pointer stored inside this run.
    pub fn pointer_slots(&self) -> Vec<usize> {
        match &self.kind {
            RunKind::Pointer => vec![self.start],
            RunKind::Table(table) => {
                let width = table.element_width();
                let offsets: Vec<usize> = table
                    .field_offsets()
                    .filter(|(_, field)| field.kind == FieldKind::Pointer)
                    .map(|(offset, _)| offset)
                    .collect();
                (0..table.element_count)
                    .flat_map(|element| {
                        offsets
                            .iter()
                            .map(move |offset| self.start + element * width + offset)
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// The descriptor that re-creates this run; `None` for no-info runs.
    pub fn format_descriptor(&self) -> Option<FormatDescriptor> {
        let descriptor = match &self.kind {
            RunKind::NoInfo => return None,
            RunKind::Pointer => FormatDescriptor::Pointer,
            RunKind::Text => FormatDescriptor::Text,
            RunKind::Compressed { .. } => FormatDescriptor::Compressed,
            RunKind::Word {
                name,
                width,
                offset,
            } => FormatDescriptor::Word {
                name: name.clone(),
                width: *width,
                offset: *offset,
            },
            RunKind::Table(table) => FormatDescriptor::Table {
                fields: table.fields.clone(),
                length: match &table.length {
                    TableLength::Fixed(_) => TableLength::Fixed(table.element_count),
                    matching => matching.clone(),
                },
            },
        };
        Some(descriptor)
    }

    /// Describe the byte at `address`.
    pub fn format_at(&self, model: &RomModel, address: usize) -> CellFormat {
        if !self.contains(address) {
            return CellFormat::None;
        }
        let bytes = model.bytes();
        let offset = address - self.start;

        match &self.kind {
            RunKind::NoInfo => CellFormat::None,
            RunKind::Pointer => CellFormat::Pointer {
                source: self.start,
                target: model.read_pointer(self.start),
            },
            RunKind::Text => bytes
                .get(self.start..self.end())
                .and_then(|run| text::glyph_at(run, offset))
                .map_or(CellFormat::None, CellFormat::Text),
            RunKind::Compressed { .. } => CellFormat::Compressed { offset },
            RunKind::Word { name, width, .. } => CellFormat::Word {
                name: name.clone(),
                value: read_le(bytes, self.start, usize::from(*width)).unwrap_or_default(),
            },
            RunKind::Table(table) => {
                let width = table.element_width();
                if width == 0 {
                    return CellFormat::None;
                }
                let element = offset / width;
                let within = offset % width;
                let element_start = self.start + element * width;
                let Some((field_offset, field)) = table
                    .field_offsets()
                    .find(|(at, field)| within < at + field.width())
                else {
                    return CellFormat::None;
                };
                let field_start = element_start + field_offset;

                match &field.kind {
                    FieldKind::Pointer => CellFormat::Pointer {
                        source: field_start,
                        target: model.read_pointer(field_start),
                    },
                    FieldKind::Integer { width } => CellFormat::Integer {
                        element,
                        field: field.name.clone(),
                        value: read_le(bytes, field_start, usize::from(*width)).unwrap_or_default(),
                    },
                    FieldKind::Enum { list, width } => {
                        let value =
                            read_le(bytes, field_start, usize::from(*width)).unwrap_or_default();
                        let label = model
                            .list(list)
                            .and_then(|entries| entries.get(value as usize))
                            .cloned();
                        CellFormat::Enum {
                            element,
                            field: field.name.clone(),
                            value,
                            label,
                        }
                    }
                    FieldKind::Text { width } => bytes
                        .get(field_start..field_start + width)
                        .and_then(|cell| text::glyph_at(cell, within - field_offset))
                        .map_or(CellFormat::None, CellFormat::Text),
                }
            }
        }
    }

    /// Locations that must follow a write that overlapped this run.
    ///
    /// The model has already applied the write; `change.old` holds what was there before.
    pub fn on_write(&self, model: &RomModel, change: &ByteChange<'_>) -> Vec<Dependent> {
        let bytes = model.bytes();
        let mut dependents = Vec::new();

        for slot in self.pointer_slots() {
            if !change.overlaps(slot, POINTER_WIDTH) {
                continue;
            }
            let Some(before) = change.previous_value(bytes, slot, POINTER_WIDTH) else {
                continue;
            };
            let Some(after) = read_le(bytes, slot, POINTER_WIDTH) else {
                continue;
            };
            if before != after {
                let base = model.config().pointer_base;
                dependents.push(Dependent::Repoint {
                    source: slot,
                    previous: PointerTarget::decode(before, base, bytes.len()),
                    current: PointerTarget::decode(after, base, bytes.len()),
                });
            }
        }

        if let RunKind::Word {
            name,
            width,
            offset,
        } = &self.kind
            && change.overlaps(self.start, usize::from(*width))
            && let Some(value) = read_le(bytes, self.start, usize::from(*width))
        {
            let shared = shift(value, -i64::from(*offset));
            for other in model.word_copies(name) {
                let RunKind::Word {
                    width: other_width,
                    offset: other_offset,
                    ..
                } = &other.kind
                else {
                    continue;
                };
                if other.start != self.start {
                    dependents.push(Dependent::Mirror {
                        to: other.start,
                        width: usize::from(*width.min(other_width)),
                        value: shift(shared, i64::from(*other_offset)),
                    });
                }
            }
        }

        dependents
    }
}

/// `value + delta`, wrapping like the fixed-width integers words are stored as.
pub(crate) fn shift(value: u32, delta: i64) -> u32 {
    (i64::from(value).wrapping_add(delta)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_table(count: usize) -> Table {
        Table {
            fields: vec![
                Field::new("hp", FieldKind::Integer { width: 1 }),
                Field::new("name", FieldKind::Pointer),
                Field::new("type", FieldKind::Enum {
                    list: "types".into(),
                    width: 2,
                }),
            ],
            length: TableLength::Fixed(count),
            element_count: count,
        }
    }

    #[test]
    fn test_pointer_target_decode() {
        let base = 0x0800_0000;
        assert_eq!(PointerTarget::decode(0, base, 0x100), PointerTarget::Null);
        assert_eq!(
            PointerTarget::decode(0x0800_0010, base, 0x100),
            PointerTarget::Address(0x10)
        );
        assert_eq!(
            PointerTarget::decode(0x0800_0100, base, 0x100),
            PointerTarget::Invalid(0x0800_0100)
        );
        assert_eq!(
            PointerTarget::decode(0x10, base, 0x100),
            PointerTarget::Invalid(0x10)
        );
    }

    #[test]
    fn test_table_layout() {
        let table = stats_table(3);
        assert_eq!(table.element_width(), 7);
        let offsets: Vec<usize> = table.field_offsets().map(|(at, _)| at).collect();
        assert_eq!(offsets, vec![0, 1, 5]);

        let run = Run::new(0x40, 21, RunKind::Table(table));
        assert_eq!(run.pointer_slots(), vec![0x41, 0x48, 0x4F]);
    }

    #[test]
    fn test_duplicate_keeps_kind_and_replaces_sources() {
        let mut run = Run::new(0x10, 4, RunKind::Text);
        run.add_source(0x00);
        run.set_in_error(true);

        let moved = run.duplicate(0x80, BTreeSet::from([0x00, 0x04]));
        assert_eq!(moved.start(), 0x80);
        assert_eq!(moved.length(), 4);
        assert_eq!(moved.kind(), &RunKind::Text);
        assert!(moved.in_error());
        assert_eq!(moved.pointer_sources().len(), 2);
        assert_eq!(run.pointer_sources().len(), 1);
    }

    #[test]
    fn test_format_descriptor_reflects_current_count() {
        let run = Run::new(0, 14, RunKind::Table(stats_table(2)));
        let Some(FormatDescriptor::Table { length, fields }) = run.format_descriptor() else {
            panic!("expected a table descriptor");
        };
        assert_eq!(length, TableLength::Fixed(2));
        assert_eq!(fields.len(), 3);
        assert_eq!(Run::new(0, 1, RunKind::NoInfo).format_descriptor(), None);
    }

    #[test]
    fn test_offset_count_saturates() {
        assert_eq!(TableLength::offset_count(3, -1), 2);
        assert_eq!(TableLength::offset_count(3, -10), 0);
        assert_eq!(TableLength::offset_count(3, i64::MIN), 0);
        assert_eq!(TableLength::offset_count(usize::MAX, i64::MAX), i64::MAX as usize);
    }

    #[test]
    fn test_shift_wraps() {
        assert_eq!(shift(5, -1), 4);
        assert_eq!(shift(0, -1), u32::MAX);
        assert_eq!(shift(u32::MAX, 1), 0);
    }

    #[test]
    fn test_byte_change_previous_value() {
        let current = [0x11, 0x22, 0x33, 0x44, 0x55];
        let change = ByteChange {
            start: 2,
            old: &[0xAA],
        };
        assert!(change.overlaps(0, 4));
        assert!(!change.overlaps(3, 2));
        assert_eq!(change.previous_value(&current, 0, 4), Some(0x44AA2211));
        assert_eq!(change.previous_value(&current, 3, 4), None);
    }
}
