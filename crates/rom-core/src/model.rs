//! The ROM model: a byte buffer with runs, anchors and named lists layered on top.
//!
//! # Overview
//!
//! [`RomModel`] owns the buffer exclusively. Queries borrow it; every mutation takes the open
//! transaction (`&mut ModelDelta`) explicitly and records reversible primitives into it, so a
//! failed or undone operation never needs special-case cleanup.
//!
//! Public mutations are atomic: if one fails part-way (for example a cascading table growth
//! that runs out of space), everything it recorded is rolled back before the error is returned.
//!
//! # Example
//!
//! ```rust
//! use rom_core::{FormatDescriptor, ModelDelta, RomModel};
//!
//! let mut model = RomModel::new(vec![0xFF; 0x100]);
//! let mut tx = ModelDelta::new();
//!
//! model.write_pointer(0x00, Some(0x40), &mut tx).unwrap();
//! model.declare_run(0x00, FormatDescriptor::Pointer, &mut tx).unwrap();
//!
//! let target = model.run_exactly_at(0x40).unwrap();
//! assert!(target.pointer_sources().contains(&0x00));
//! ```

use crate::anchors::{AnchorOutcome, AnchorTable, is_valid_name};
use crate::codec::{Codec, CodecError};
use crate::config::ModelConfig;
use crate::delta::{ModelDelta, Primitive};
use crate::error::{Conflict, ModelError, Result};
use crate::intervals::{IntervalIndex, Iter};
use crate::runs::{
    ByteChange, CellFormat, Dependent, FormatDescriptor, POINTER_WIDTH, PointerTarget, Run,
    RunKind, Table, TableLength, shift,
};
use crate::text;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Read a little-endian value of up to four bytes.
pub(crate) fn read_le(bytes: &[u8], address: usize, width: usize) -> Option<u32> {
    if width > 4 {
        return None;
    }
    let slice = bytes.get(address..address.checked_add(width)?)?;
    Some(
        slice
            .iter()
            .rev()
            .fold(0u32, |value, &byte| (value << 8) | u32::from(byte)),
    )
}

/// Low `width` bytes of `value`.
fn mask(value: u32, width: u8) -> u32 {
    match width {
        0..=3 => value & ((1u32 << (8 * u32::from(width))) - 1),
        _ => value,
    }
}

/// A completed move of a run, reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Start address before the move.
    pub old_start: usize,
    /// Start address after the move.
    pub new_start: usize,
    /// Allocated length after the move.
    pub length: usize,
}

/// Relocation subscriber.
pub type RelocationCallback = Box<dyn FnMut(&Relocation) + Send>;

/// Byte buffer plus its structural metadata.
pub struct RomModel {
    data: Vec<u8>,
    runs: IntervalIndex<Run>,
    anchors: AnchorTable,
    lists: BTreeMap<String, Vec<String>>,
    config: ModelConfig,
    codec: Option<Arc<dyn Codec>>,
    reverting: bool,
    listeners: Vec<RelocationCallback>,
    pending_reports: Vec<Relocation>,
    depth: usize,
}

impl fmt::Debug for RomModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RomModel")
            .field("len", &self.data.len())
            .field("run_count", &self.runs.len())
            .field("anchor_count", &self.anchors.len())
            .field("list_count", &self.lists.len())
            .field("codec", &self.codec.as_ref().map(|codec| codec.name().to_string()))
            .finish()
    }
}

impl RomModel {
    /// Create a model over `data` with the default configuration.
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_config(data, ModelConfig::default())
    }

    /// Create a model over `data`.
    pub fn with_config(data: Vec<u8>, config: ModelConfig) -> Self {
        Self {
            data,
            runs: IntervalIndex::new(),
            anchors: AnchorTable::new(),
            lists: BTreeMap::new(),
            config,
            codec: None,
            reverting: false,
            listeners: Vec::new(),
            pending_reports: Vec::new(),
            depth: 0,
        }
    }

    /// Attach the codec used by compressed runs.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    // ---------------------------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------------------------

    /// The buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Buffer length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Active configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Codec used by compressed runs.
    pub fn codec(&self) -> Option<&dyn Codec> {
        self.codec.as_deref()
    }

    /// Whether a delta is currently being reverted against this model.
    pub fn is_reverting(&self) -> bool {
        self.reverting
    }

    /// All runs in address order.
    pub fn runs(&self) -> Iter<'_, Run> {
        self.runs.iter()
    }

    /// Runs starting at or after `address`, in address order.
    pub fn runs_from(&self, address: usize) -> Iter<'_, Run> {
        self.runs.iter_from(address)
    }

    /// Number of runs.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Run starting exactly at `address`.
    pub fn run_exactly_at(&self, address: usize) -> Option<&Run> {
        self.runs.get(address)
    }

    /// Run with the greatest start `<= address`.
    pub fn run_at_or_before(&self, address: usize) -> Option<&Run> {
        self.runs.at_or_before(address)
    }

    /// Run with the least start `>= address`.
    pub fn run_at_or_after(&self, address: usize) -> Option<&Run> {
        self.runs.at_or_after(address)
    }

    /// Run that owns the byte at `address`.
    pub fn run_containing(&self, address: usize) -> Option<&Run> {
        self.runs
            .at_or_before(address)
            .filter(|run| run.contains(address))
    }

    /// Anchor table.
    pub fn anchors(&self) -> &AnchorTable {
        &self.anchors
    }

    /// Address bound to `name` (case-insensitive).
    pub fn anchor_address(&self, name: &str) -> Option<usize> {
        self.anchors.address(name)
    }

    /// Name bound to `address`.
    pub fn address_anchor_name(&self, address: usize) -> Option<&str> {
        self.anchors.name_at(address)
    }

    /// Entries of the named list.
    pub fn list(&self, name: &str) -> Option<&[String]> {
        self.lists.get(name).map(Vec::as_slice)
    }

    /// All named lists, ordered by name.
    pub fn lists(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.lists
            .iter()
            .map(|(name, entries)| (name.as_str(), entries.as_slice()))
    }

    /// Little-endian value of `width` (1..=4) bytes at `address`.
    pub fn read_value(&self, address: usize, width: usize) -> Result<u32> {
        if !(1..=4).contains(&width) {
            return Err(ModelError::InvalidData {
                address,
                format: "integer",
            });
        }
        read_le(&self.data, address, width).ok_or(ModelError::OutOfBounds {
            address: address.saturating_add(width),
            len: self.data.len(),
        })
    }

    /// Interpret the four bytes at `address` as a pointer.
    ///
    /// A pointer that does not fit in the buffer reads as `Invalid(0)`.
    pub fn read_pointer(&self, address: usize) -> PointerTarget {
        match read_le(&self.data, address, POINTER_WIDTH) {
            Some(raw) => PointerTarget::decode(raw, self.config.pointer_base, self.data.len()),
            None => PointerTarget::Invalid(0),
        }
    }

    /// Decoded content of the text run at `start`.
    ///
    /// Fails when the terminator is not inside the run's allocated bytes.
    pub fn read_text(&self, start: usize) -> Result<String> {
        let run = self.run_of_kind(start, "text", |kind| matches!(kind, RunKind::Text))?;
        text::decode(&self.data[start..run.end()]).ok_or(ModelError::InvalidData {
            address: start,
            format: "text",
        })
    }

    /// Decompressed content of the compressed run at `start`.
    pub fn read_compressed(&self, start: usize) -> Result<Vec<u8>> {
        let run = self.run_of_kind(start, "compressed", |kind| {
            matches!(kind, RunKind::Compressed { .. })
        })?;
        let codec = self.codec().ok_or(CodecError::Unavailable)?;
        codec
            .decompress(&self.data[start..run.end()])
            .map(|decompressed| decompressed.data)
            .ok_or(ModelError::InvalidData {
                address: start,
                format: "compressed",
            })
    }

    /// Display/edit description of the byte at `address`.
    pub fn format_at(&self, address: usize) -> CellFormat {
        self.run_containing(address)
            .map_or(CellFormat::None, |run| run.format_at(self, address))
    }

    /// Every word run sharing `name`.
    pub(crate) fn word_copies<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Run> + 'a {
        self.runs.iter().filter(move |run| {
            matches!(run.kind(), RunKind::Word { name: other, .. } if other == name)
        })
    }

    fn run_of_kind(
        &self,
        start: usize,
        expected: &'static str,
        accepts: impl Fn(&RunKind) -> bool,
    ) -> Result<&Run> {
        let run = self.runs.get(start).ok_or(ModelError::NoRun(start))?;
        if !accepts(run.kind()) {
            return Err(ModelError::WrongKind {
                address: start,
                expected,
            });
        }
        Ok(run)
    }

    /// Verify the structural invariants: balanced index, no overlapping runs, and pointer
    /// sources in agreement with the stored pointers.
    ///
    /// Returns a description of the first violation found.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        self.runs.check_invariants()?;

        let mut previous: Option<&Run> = None;
        for run in self.runs.iter() {
            if let Some(previous) = previous
                && run.start() < previous.end()
            {
                return Err(format!(
                    "runs at {:06X} and {:06X} overlap",
                    previous.start(),
                    run.start()
                ));
            }
            if run.end() > self.data.len() {
                return Err(format!("run at {:06X} extends past the buffer", run.start()));
            }
            for &source in run.pointer_sources() {
                if self.read_pointer(source) != PointerTarget::Address(run.start()) {
                    return Err(format!(
                        "source {:06X} of run {:06X} does not point at it",
                        source,
                        run.start()
                    ));
                }
            }
            for slot in run.pointer_slots() {
                let Some(target) = self.read_pointer(slot).address() else {
                    continue;
                };
                if self.slot_in_error(slot) {
                    continue;
                }
                let recorded = self
                    .runs
                    .get(target)
                    .is_some_and(|destination| destination.pointer_sources().contains(&slot));
                if !recorded {
                    return Err(format!(
                        "pointer at {:06X} to {:06X} is not recorded as a source",
                        slot, target
                    ));
                }
            }
            previous = Some(run);
        }

        let mut words: BTreeMap<&str, (usize, u8, u32)> = BTreeMap::new();
        for run in self.runs.iter() {
            let RunKind::Word {
                name,
                width,
                offset,
            } = run.kind()
            else {
                continue;
            };
            let value = read_le(&self.data, run.start(), usize::from(*width)).unwrap_or_default();
            let shared = mask(shift(value, -i64::from(*offset)), *width);
            match words.get(name.as_str()) {
                Some(&(first, first_width, expected)) if first_width != *width || expected != shared => {
                    return Err(format!(
                        "word '{}' at {:06X} disagrees with the copy at {:06X}",
                        name,
                        run.start(),
                        first
                    ));
                }
                Some(_) => {}
                None => {
                    words.insert(name, (run.start(), *width, shared));
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------------------------

    /// Register a callback for relocation reports.
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: FnMut(&Relocation) + Send + 'static,
    {
        self.listeners.push(Box::new(callback));
    }

    /// Write one byte.
    pub fn write_byte(&mut self, address: usize, value: u8, tx: &mut ModelDelta) -> Result<()> {
        self.write_bytes(address, &[value], tx)
    }

    /// Write a contiguous byte range and propagate the change to dependent locations
    /// (pointer sources, mirrored words).
    pub fn write_bytes(&mut self, address: usize, bytes: &[u8], tx: &mut ModelDelta) -> Result<()> {
        self.atomic(tx, "write bytes", |model, tx| {
            model.write_bytes_inner(address, bytes, tx)
        })
    }

    /// Write a little-endian value of `width` (1..=4) bytes.
    pub fn write_value(
        &mut self,
        address: usize,
        width: usize,
        value: u32,
        tx: &mut ModelDelta,
    ) -> Result<()> {
        if !(1..=4).contains(&width) {
            return Err(ModelError::InvalidData {
                address,
                format: "integer",
            });
        }
        self.write_bytes(address, &value.to_le_bytes()[..width], tx)
    }

    /// Store a pointer to `target` (or `NULL`) at `source`.
    pub fn write_pointer(
        &mut self,
        source: usize,
        target: Option<usize>,
        tx: &mut ModelDelta,
    ) -> Result<()> {
        if let Some(target) = target
            && target >= self.data.len()
        {
            return Err(ModelError::OutOfBounds {
                address: target,
                len: self.data.len(),
            });
        }
        let raw = self.pointer_value(target);
        self.write_bytes(source, &raw.to_le_bytes(), tx)
    }

    /// Interpret the bytes at `address` with `format`.
    ///
    /// An existing run starting at `address` is replaced and its pointer sources carry over to
    /// the new run. Fails with [`ModelError::StructuralConflict`] if the region overlaps any
    /// other run or an anchor bound strictly inside it.
    pub fn declare_run(
        &mut self,
        address: usize,
        format: FormatDescriptor,
        tx: &mut ModelDelta,
    ) -> Result<()> {
        self.atomic(tx, "declare a run", |model, tx| {
            model.declare_run_inner(address, &format, tx)
        })
    }

    /// Forget the format of the run owning `address`. The bytes are left untouched.
    ///
    /// If anything still points at the run, a no-info run keeps those sources.
    pub fn clear_run(&mut self, address: usize, tx: &mut ModelDelta) -> Result<()> {
        self.atomic(tx, "clear a run", |model, tx| model.clear_run_inner(address, tx))
    }

    /// Bind `name` to `address`, replacing any name the address already had.
    ///
    /// A name already used elsewhere is made unique (`name_copy`, `name_copy2`, ...).
    pub fn set_anchor(
        &mut self,
        address: usize,
        name: &str,
        tx: &mut ModelDelta,
    ) -> Result<AnchorOutcome> {
        self.atomic(tx, "set an anchor", |model, tx| {
            model.set_anchor_inner(address, name, tx)
        })
    }

    /// Remove the anchor named `name`, returning the address it was bound to.
    pub fn remove_anchor(&mut self, name: &str, tx: &mut ModelDelta) -> Result<usize> {
        self.atomic(tx, "remove an anchor", |model, tx| {
            let address = model
                .anchor_address(name)
                .ok_or_else(|| ModelError::UnknownAnchor(name.to_string()))?;
            model.unbind_anchor(address, tx);
            if let Some(run) = model.runs.get(address)
                && run.is_no_info()
                && run.pointer_sources().is_empty()
            {
                model.remove_run(address, tx);
            }
            Ok(address)
        })
    }

    /// Store a named list, replacing a list with the same name.
    pub fn set_list(&mut self, name: &str, entries: Vec<String>, tx: &mut ModelDelta) -> Result<()> {
        self.atomic(tx, "set a list", |model, tx| {
            if !is_valid_name(name) {
                return Err(ModelError::InvalidName(name.to_string()));
            }
            if let Some(previous) = model.lists.remove(name) {
                tx.record(Primitive::ListRemoved {
                    name: name.to_string(),
                    entries: previous,
                });
            }
            model.lists.insert(name.to_string(), entries.clone());
            tx.record(Primitive::ListAdded {
                name: name.to_string(),
                entries,
            });
            Ok(())
        })
    }

    /// Remove a named list, returning its entries.
    pub fn remove_list(&mut self, name: &str, tx: &mut ModelDelta) -> Result<Vec<String>> {
        self.atomic(tx, "remove a list", |model, tx| {
            let entries = model
                .lists
                .remove(name)
                .ok_or_else(|| ModelError::UnknownList(name.to_string()))?;
            tx.record(Primitive::ListRemoved {
                name: name.to_string(),
                entries: entries.clone(),
            });
            Ok(entries)
        })
    }

    /// Replace the content of the text run at `start`.
    ///
    /// Relocates the run when the new text does not fit, and shrinks it (clearing the excess to
    /// the fill byte) when it is shorter. Returns the run's start after the write.
    pub fn write_text(&mut self, start: usize, text: &str, tx: &mut ModelDelta) -> Result<usize> {
        self.atomic(tx, "write text", |model, tx| {
            model.run_of_kind(start, "text", |kind| matches!(kind, RunKind::Text))?;
            let encoded = text::encode(text)?;
            model.rewrite_content(start, &encoded, tx).map(|run| run.start())
        })
    }

    /// Compress `content` into the compressed run at `start`.
    ///
    /// Relocates or shrinks the run like [`RomModel::write_text`]. Returns the run's start after
    /// the write.
    pub fn write_compressed(
        &mut self,
        start: usize,
        content: &[u8],
        tx: &mut ModelDelta,
    ) -> Result<usize> {
        self.atomic(tx, "write compressed data", |model, tx| {
            model.run_of_kind(start, "compressed", |kind| {
                matches!(kind, RunKind::Compressed { .. })
            })?;
            let codec = model.codec.clone().ok_or(CodecError::Unavailable)?;
            let stream = codec.compress(content)?;
            let run = model.rewrite_content(start, &stream, tx)?;
            let updated = run.clone().with_kind(RunKind::Compressed {
                decompressed_len: content.len(),
            });
            if updated != run {
                model.replace_run(updated, tx)?;
            }
            Ok(run.start())
        })
    }

    /// Add `count` zero-filled elements to the fixed-length table at `start`.
    ///
    /// Tables whose length matches this one grow with it. Returns the table's start after the
    /// operation, which differs from `start` when the table had to move.
    pub fn append_table_elements(
        &mut self,
        start: usize,
        count: usize,
        tx: &mut ModelDelta,
    ) -> Result<usize> {
        self.atomic(tx, "append table elements", |model, tx| {
            let run = model.run_of_kind(start, "table", |kind| matches!(kind, RunKind::Table(_)))?;
            let RunKind::Table(table) = run.kind() else {
                return Err(ModelError::WrongKind {
                    address: start,
                    expected: "table",
                });
            };
            if !matches!(table.length, TableLength::Fixed(_)) {
                return Err(ModelError::WrongKind {
                    address: start,
                    expected: "fixed-length table",
                });
            }
            let target = table.element_count + count;
            model.grow_table(start, target, tx)
        })
    }

    // ---------------------------------------------------------------------------------------
    // Operation bodies
    // ---------------------------------------------------------------------------------------

    /// Run `body` as one atomic public operation.
    ///
    /// Rejects the call while a delta is being reverted. On failure, primitives recorded by
    /// `body` are rolled back. Relocation reports are delivered once the outermost operation
    /// succeeds.
    pub(crate) fn atomic<R>(
        &mut self,
        tx: &mut ModelDelta,
        operation: &'static str,
        body: impl FnOnce(&mut Self, &mut ModelDelta) -> Result<R>,
    ) -> Result<R> {
        if self.reverting {
            return Err(ModelError::Reentrancy { operation });
        }

        let checkpoint = tx.len();
        let reports = self.pending_reports.len();
        self.depth += 1;
        let result = body(self, tx);
        self.depth -= 1;

        if let Err(err) = &result {
            debug!(operation, error = %err, "operation rolled back");
            tx.rollback(checkpoint, self);
            self.pending_reports.truncate(reports);
        }

        if self.depth == 0 {
            let reports = std::mem::take(&mut self.pending_reports);
            for report in &reports {
                for listener in &mut self.listeners {
                    listener(report);
                }
            }
        }

        result
    }

    pub(crate) fn write_bytes_inner(
        &mut self,
        address: usize,
        bytes: &[u8],
        tx: &mut ModelDelta,
    ) -> Result<()> {
        let len = self.data.len();
        let end = address
            .checked_add(bytes.len())
            .filter(|&end| end <= len)
            .ok_or(ModelError::OutOfBounds {
                address: address.saturating_add(bytes.len()),
                len,
            })?;

        let old = self.data[address..end].to_vec();
        if old == bytes {
            return Ok(());
        }
        for (offset, &value) in bytes.iter().enumerate() {
            self.set_byte(address + offset, value, tx);
        }

        let change = ByteChange {
            start: address,
            old: &old,
        };
        let affected = self.runs_overlapping(address, end);
        for &start in &affected {
            let Some(run) = self.runs.get(start) else {
                continue;
            };
            let dependents = run.on_write(self, &change);
            for dependent in dependents {
                self.apply_dependent(dependent, tx)?;
            }
        }
        for start in affected {
            self.refresh_error(start, tx)?;
        }
        Ok(())
    }

    fn apply_dependent(&mut self, dependent: Dependent, tx: &mut ModelDelta) -> Result<()> {
        match dependent {
            Dependent::Repoint {
                source,
                previous,
                current,
            } => {
                trace!(source, ?previous, ?current, "pointer retargeted");
                if let Some(target) = previous.address() {
                    self.detach_source(target, source, tx)?;
                }
                if let Some(target) = current.address() {
                    self.attach_source(target, source, tx)?;
                }
            }
            Dependent::Mirror { to, width, value } => {
                // Copies already holding the value stop the propagation.
                self.write_bytes_inner(to, &value.to_le_bytes()[..width.min(4)], tx)?;
            }
        }
        Ok(())
    }

    /// Materialize a run from a descriptor against the current bytes, without inserting it.
    pub(crate) fn build_run(&self, address: usize, format: &FormatDescriptor) -> Result<Run> {
        let len = self.data.len();
        let Some(tail) = self.data.get(address..).filter(|tail| !tail.is_empty()) else {
            return Err(ModelError::OutOfBounds { address, len });
        };

        let (kind, length) = match format {
            FormatDescriptor::Pointer => (RunKind::Pointer, POINTER_WIDTH),
            FormatDescriptor::Text => {
                let length = text::measure(tail).ok_or(ModelError::InvalidData {
                    address,
                    format: "text",
                })?;
                (RunKind::Text, length)
            }
            FormatDescriptor::Compressed => {
                let codec = self.codec().ok_or(CodecError::Unavailable)?;
                let decompressed = codec.decompress(tail).ok_or(ModelError::InvalidData {
                    address,
                    format: "compressed",
                })?;
                (
                    RunKind::Compressed {
                        decompressed_len: decompressed.data.len(),
                    },
                    decompressed.consumed,
                )
            }
            FormatDescriptor::Word {
                name,
                width,
                offset,
            } => {
                if !matches!(*width, 1 | 2 | 4) {
                    return Err(ModelError::InvalidData {
                        address,
                        format: "word",
                    });
                }
                if !is_valid_name(name) {
                    return Err(ModelError::InvalidName(name.clone()));
                }
                (
                    RunKind::Word {
                        name: name.clone(),
                        width: *width,
                        offset: *offset,
                    },
                    usize::from(*width),
                )
            }
            FormatDescriptor::Table { fields, length } => {
                let mut table = Table {
                    fields: fields.clone(),
                    length: length.clone(),
                    element_count: 0,
                };
                let width = table.element_width();
                if width == 0 {
                    return Err(ModelError::InvalidData {
                        address,
                        format: "table",
                    });
                }
                table.element_count = match length {
                    TableLength::Fixed(count) => *count,
                    TableLength::Matching { anchor, offset } => {
                        let followed = self
                            .anchor_address(anchor)
                            .ok_or_else(|| ModelError::UnknownAnchor(anchor.clone()))?;
                        let Some(RunKind::Table(parent)) =
                            self.run_exactly_at(followed).map(Run::kind)
                        else {
                            return Err(ModelError::WrongKind {
                                address: followed,
                                expected: "table",
                            });
                        };
                        TableLength::offset_count(parent.element_count, *offset)
                    }
                };
                let length = table
                    .element_count
                    .checked_mul(width)
                    .ok_or(ModelError::OutOfBounds { address, len })?;
                (RunKind::Table(table), length)
            }
        };

        let end = address.saturating_add(length);
        if end > len {
            return Err(ModelError::OutOfBounds { address: end, len });
        }
        Ok(Run::new(address, length, kind))
    }

    pub(crate) fn declare_run_inner(
        &mut self,
        address: usize,
        format: &FormatDescriptor,
        tx: &mut ModelDelta,
    ) -> Result<()> {
        let run = self.build_run(address, format)?;
        self.check_region(address, run.end(), Some(address))?;

        let mut sources = BTreeSet::new();
        if let Some(existing) = self.remove_run(address, tx) {
            sources = existing.pointer_sources().clone();
            self.detach_slots(&existing, tx)?;
        }

        if let RunKind::Word {
            name,
            width,
            offset,
        } = run.kind()
        {
            let copy = self.word_copies(name).find_map(|other| match other.kind() {
                RunKind::Word {
                    width: other_width,
                    offset: other_offset,
                    ..
                } if other.start() != address => Some((other.start(), *other_width, *other_offset)),
                _ => None,
            });
            if let Some((from, other_width, other_offset)) = copy {
                if other_width != *width {
                    return Err(ModelError::WordWidth {
                        name: name.clone(),
                        expected: other_width,
                        found: *width,
                    });
                }
                let width = usize::from(*width);
                let shared = shift(self.read_value(from, width)?, -i64::from(other_offset));
                let value = shift(shared, i64::from(*offset));
                self.write_bytes_inner(address, &value.to_le_bytes()[..width], tx)?;
            }
        }

        let run = run.with_sources(sources);
        let kind = run.kind().name();
        let length = run.length();
        let slots = run.pointer_slots();
        self.add_run(run, tx)?;
        for slot in slots {
            if let Some(target) = self.read_pointer(slot).address() {
                self.attach_source(target, slot, tx)?;
            }
        }
        self.refresh_error(address, tx)?;

        debug!(address, kind, length, "run declared");
        Ok(())
    }

    fn clear_run_inner(&mut self, address: usize, tx: &mut ModelDelta) -> Result<()> {
        let run = self
            .run_containing(address)
            .or_else(|| self.runs.get(address))
            .ok_or(ModelError::NoRun(address))?;
        if run.is_no_info() {
            return Ok(());
        }
        let start = run.start();
        let Some(run) = self.remove_run(start, tx) else {
            return Err(ModelError::NoRun(address));
        };
        self.detach_slots(&run, tx)?;
        if !run.pointer_sources().is_empty() {
            let placeholder =
                Run::new(start, 1, RunKind::NoInfo).with_sources(run.pointer_sources().clone());
            self.add_run(placeholder, tx)?;
        }
        debug!(address = start, kind = run.kind().name(), "run cleared");
        Ok(())
    }

    fn set_anchor_inner(
        &mut self,
        address: usize,
        name: &str,
        tx: &mut ModelDelta,
    ) -> Result<AnchorOutcome> {
        if address >= self.data.len() {
            return Err(ModelError::OutOfBounds {
                address,
                len: self.data.len(),
            });
        }
        if !is_valid_name(name) {
            return Err(ModelError::InvalidName(name.to_string()));
        }
        if let Some(owner) = self.run_containing(address)
            && owner.start() != address
        {
            return Err(ModelError::StructuralConflict {
                start: address,
                end: address + 1,
                conflict: Conflict::Run {
                    start: owner.start(),
                    length: owner.length(),
                },
            });
        }
        if self.anchors.name_at(address) == Some(name) {
            return Ok(AnchorOutcome {
                name: name.to_string(),
                renamed: false,
            });
        }

        self.unbind_anchor(address, tx);
        let unique = self.anchors.uniquify(name);
        let renamed = unique != name;
        if renamed {
            debug!(requested = name, bound = %unique, address, "anchor name in use, renamed");
        }
        self.bind_anchor(address, unique.clone(), tx);
        Ok(AnchorOutcome {
            name: unique,
            renamed,
        })
    }

    /// Rewrite the content of the run at `start` with `bytes`, growing or shrinking the run.
    fn rewrite_content(&mut self, start: usize, bytes: &[u8], tx: &mut ModelDelta) -> Result<Run> {
        let run = self
            .run_exactly_at(start)
            .cloned()
            .ok_or(ModelError::NoRun(start))?;
        let run = if bytes.len() > run.length() {
            self.relocate_inner(start, bytes.len(), tx)?
        } else {
            run
        };

        let start = run.start();
        self.write_bytes_inner(start, bytes, tx)?;

        let run = self
            .run_exactly_at(start)
            .cloned()
            .ok_or(ModelError::NoRun(start))?;
        if bytes.len() >= run.length() {
            return Ok(run);
        }

        let fill = self.config.fill_byte;
        for address in start + bytes.len()..run.end() {
            self.set_byte(address, fill, tx);
        }
        let shrunk = run.with_length(bytes.len());
        self.replace_run(shrunk.clone(), tx)?;
        Ok(shrunk)
    }

    fn grow_table(&mut self, start: usize, count: usize, tx: &mut ModelDelta) -> Result<usize> {
        let new_start = self.resize_table(start, count, tx)?;

        let mut visited = BTreeSet::from([start, new_start]);
        let mut queue = vec![new_start];
        while let Some(parent) = queue.pop() {
            for (follower, wanted) in self.followers_needing_growth(parent) {
                if !visited.insert(follower) {
                    continue;
                }
                let moved = self.resize_table(follower, wanted, tx)?;
                visited.insert(moved);
                queue.push(moved);
            }
        }

        Ok(new_start)
    }

    /// Matching-length tables following the table at `parent` that are now too short.
    fn followers_needing_growth(&self, parent: usize) -> Vec<(usize, usize)> {
        let Some(name) = self.anchors.name_at(parent) else {
            return Vec::new();
        };
        self.runs
            .iter()
            .filter_map(|run| {
                let RunKind::Table(table) = run.kind() else {
                    return None;
                };
                let TableLength::Matching { anchor, .. } = &table.length else {
                    return None;
                };
                if !anchor.eq_ignore_ascii_case(name) {
                    return None;
                }
                let wanted = table.resolve_count(self)?;
                (wanted > table.element_count).then_some((run.start(), wanted))
            })
            .collect()
    }

    /// Grow the table at `start` to `count` elements, zero-filling new elements.
    fn resize_table(&mut self, start: usize, count: usize, tx: &mut ModelDelta) -> Result<usize> {
        let run = self.run_of_kind(start, "table", |kind| matches!(kind, RunKind::Table(_)))?;
        let RunKind::Table(table) = run.kind() else {
            return Ok(start);
        };
        if count <= table.element_count {
            return Ok(start);
        }
        let width = table.element_width();
        let old_len = table.element_count * width;
        let new_len = count.checked_mul(width).ok_or(ModelError::InsufficientSpace {
            needed: usize::MAX,
            buffer_len: self.data.len(),
        })?;

        let moved = self.relocate_inner(start, new_len, tx)?;
        let start = moved.start();
        for address in start + old_len..start + new_len {
            self.set_byte(address, 0, tx);
        }

        let current = self
            .run_exactly_at(start)
            .cloned()
            .ok_or(ModelError::NoRun(start))?;
        let RunKind::Table(table) = current.kind() else {
            return Err(ModelError::WrongKind {
                address: start,
                expected: "table",
            });
        };
        let grown_table = Table {
            fields: table.fields.clone(),
            length: match &table.length {
                TableLength::Fixed(_) => TableLength::Fixed(count),
                matching => matching.clone(),
            },
            element_count: count,
        };
        let grown = current
            .with_kind(RunKind::Table(grown_table))
            .with_length(new_len);
        self.replace_run(grown, tx)?;
        self.refresh_error(start, tx)?;

        debug!(address = start, elements = count, "table grown");
        Ok(start)
    }

    // ---------------------------------------------------------------------------------------
    // Region checks and pointer bookkeeping
    // ---------------------------------------------------------------------------------------

    /// Starts of runs overlapping `start..end`.
    pub(crate) fn runs_overlapping(&self, start: usize, end: usize) -> Vec<usize> {
        if start >= end {
            return Vec::new();
        }
        let mut starts = Vec::new();
        if let Some(run) = self.runs.at_or_before(start)
            && run.start() < start
            && run.end() > start
        {
            starts.push(run.start());
        }
        starts.extend(
            self.runs
                .iter_from(start)
                .take_while(|run| run.start() < end)
                .map(Run::start),
        );
        starts
    }

    /// First run or anchor claiming part of `start..end`, ignoring whatever sits at `owner`.
    pub(crate) fn find_conflict(
        &self,
        start: usize,
        end: usize,
        owner: Option<usize>,
    ) -> Option<Conflict> {
        // An empty region still sits at a point; it may not split another run.
        if start == end
            && let Some(run) = self.run_containing(start)
            && run.start() != start
        {
            return Some(Conflict::Run {
                start: run.start(),
                length: run.length(),
            });
        }
        let run = self
            .runs_overlapping(start, end)
            .into_iter()
            .filter(|&run_start| Some(run_start) != owner)
            .find_map(|run_start| self.runs.get(run_start))
            .map(|run| Conflict::Run {
                start: run.start(),
                length: run.length(),
            });
        if run.is_some() {
            return run;
        }
        self.anchors
            .in_range(start, end)
            .find(|(address, _)| Some(*address) != owner)
            .map(|(address, name)| Conflict::Anchor {
                name: name.to_string(),
                address,
            })
    }

    pub(crate) fn check_region(&self, start: usize, end: usize, owner: Option<usize>) -> Result<()> {
        match self.find_conflict(start, end, owner) {
            Some(conflict) => Err(ModelError::StructuralConflict {
                start,
                end,
                conflict,
            }),
            None => Ok(()),
        }
    }

    fn slot_in_error(&self, slot: usize) -> bool {
        match self.read_pointer(slot) {
            PointerTarget::Null => false,
            PointerTarget::Invalid(_) => true,
            PointerTarget::Address(target) => self
                .run_containing(target)
                .is_some_and(|run| run.start() != target),
        }
    }

    fn compute_error(&self, run: &Run) -> bool {
        let content_invalid = match run.kind() {
            RunKind::Text | RunKind::Compressed { .. } | RunKind::Table(_) => run
                .declared_length(self)
                .is_none_or(|needed| needed > run.length()),
            _ => false,
        };
        content_invalid
            || run
                .pointer_slots()
                .into_iter()
                .any(|slot| self.slot_in_error(slot))
    }

    pub(crate) fn refresh_error(&mut self, start: usize, tx: &mut ModelDelta) -> Result<()> {
        let Some(run) = self.runs.get(start) else {
            return Ok(());
        };
        let in_error = self.compute_error(run);
        if in_error != run.in_error() {
            let mut updated = run.clone();
            updated.set_in_error(in_error);
            self.replace_run(updated, tx)?;
        }
        Ok(())
    }

    /// Record `source` as pointing at `target`, creating a no-info run there when needed.
    ///
    /// A target inside another run is left unrecorded; the owner of `source` reports it through
    /// its error flag.
    pub(crate) fn attach_source(
        &mut self,
        target: usize,
        source: usize,
        tx: &mut ModelDelta,
    ) -> Result<()> {
        if let Some(run) = self.runs.get(target) {
            if run.pointer_sources().contains(&source) {
                return Ok(());
            }
            let mut updated = run.clone();
            updated.add_source(source);
            return self.replace_run(updated, tx);
        }
        if self.run_containing(target).is_some() {
            return Ok(());
        }
        let placeholder = Run::new(target, 1, RunKind::NoInfo).with_sources(BTreeSet::from([source]));
        self.add_run(placeholder, tx)
    }

    /// Forget that `source` points at `target`, dropping an anonymous no-info run left with no
    /// sources.
    pub(crate) fn detach_source(
        &mut self,
        target: usize,
        source: usize,
        tx: &mut ModelDelta,
    ) -> Result<()> {
        let Some(run) = self.runs.get(target) else {
            return Ok(());
        };
        if !run.pointer_sources().contains(&source) {
            return Ok(());
        }
        let mut updated = run.clone();
        updated.remove_source(source);
        if updated.is_no_info()
            && updated.pointer_sources().is_empty()
            && self.anchors.name_at(target).is_none()
        {
            self.remove_run(target, tx);
            return Ok(());
        }
        self.replace_run(updated, tx)
    }

    fn detach_slots(&mut self, run: &Run, tx: &mut ModelDelta) -> Result<()> {
        for slot in run.pointer_slots() {
            if let Some(target) = self.read_pointer(slot).address() {
                self.detach_source(target, slot, tx)?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // Recorded primitives
    // ---------------------------------------------------------------------------------------

    pub(crate) fn set_byte(&mut self, address: usize, value: u8, tx: &mut ModelDelta) {
        if let Some(byte) = self.data.get_mut(address)
            && *byte != value
        {
            tx.record(Primitive::Byte {
                address,
                old: *byte,
                new: value,
            });
            *byte = value;
        }
    }

    pub(crate) fn resize(&mut self, new_len: usize, tx: &mut ModelDelta) {
        let fill = self.config.fill_byte;
        tx.record(Primitive::Resize {
            old_len: self.data.len(),
            new_len,
            fill,
        });
        self.data.resize(new_len, fill);
    }

    pub(crate) fn add_run(&mut self, run: Run, tx: &mut ModelDelta) -> Result<()> {
        let start = run.start();
        let end = run.end();
        if let Err(run) = self.runs.insert(run.clone()) {
            let length = self.runs.get(start).map_or(run.length(), Run::length);
            return Err(ModelError::StructuralConflict {
                start,
                end,
                conflict: Conflict::Run { start, length },
            });
        }
        tx.record(Primitive::RunAdded(run));
        Ok(())
    }

    pub(crate) fn remove_run(&mut self, start: usize, tx: &mut ModelDelta) -> Option<Run> {
        let removed = self.runs.remove(start)?;
        tx.record(Primitive::RunRemoved(removed.item.clone()));
        Some(removed.item)
    }

    pub(crate) fn replace_run(&mut self, run: Run, tx: &mut ModelDelta) -> Result<()> {
        self.remove_run(run.start(), tx);
        self.add_run(run, tx)
    }

    pub(crate) fn bind_anchor(&mut self, address: usize, name: String, tx: &mut ModelDelta) {
        tx.record(Primitive::AnchorAdded {
            address,
            name: name.clone(),
        });
        self.anchors.bind(address, name);
    }

    pub(crate) fn unbind_anchor(&mut self, address: usize, tx: &mut ModelDelta) -> Option<String> {
        let name = self.anchors.unbind(address)?;
        tx.record(Primitive::AnchorRemoved {
            address,
            name: name.clone(),
        });
        Some(name)
    }

    /// Write the raw pointer bytes without touching pointer sources.
    pub(crate) fn store_pointer(&mut self, source: usize, target: Option<usize>, tx: &mut ModelDelta) {
        let raw = self.pointer_value(target).to_le_bytes();
        for (offset, value) in raw.into_iter().enumerate() {
            self.set_byte(source + offset, value, tx);
        }
    }

    fn pointer_value(&self, target: Option<usize>) -> u32 {
        target.map_or(0, |address| {
            self.config.pointer_base.wrapping_add(address as u32)
        })
    }

    pub(crate) fn report_relocation(&mut self, relocation: Relocation) {
        self.pending_reports.push(relocation);
    }

    pub(crate) fn set_reverting(&mut self, reverting: bool) {
        self.reverting = reverting;
    }

    /// Drop all runs, anchors and lists without recording anything.
    pub(crate) fn reset_metadata(&mut self) {
        self.runs.clear();
        self.anchors.clear();
        self.lists.clear();
    }

    /// Apply a primitive without recording it. Inconsistencies are logged and skipped.
    pub(crate) fn apply_primitive(&mut self, primitive: &Primitive) {
        match primitive {
            Primitive::Byte { address, old, new } => match self.data.get_mut(*address) {
                Some(byte) => {
                    if *byte != *old {
                        warn!(address, expected = old, found = *byte, "byte differs from recorded value");
                    }
                    *byte = *new;
                }
                None => warn!(address, "recorded byte lies outside the buffer"),
            },
            Primitive::Resize {
                old_len,
                new_len,
                fill,
            } => {
                if self.data.len() != *old_len {
                    warn!(expected = old_len, found = self.data.len(), "buffer length differs from recorded value");
                }
                self.data.resize(*new_len, *fill);
            }
            Primitive::RunAdded(run) => {
                if self.runs.insert(run.clone()).is_err() {
                    warn!(start = run.start(), "recorded run already present");
                }
            }
            Primitive::RunRemoved(run) => {
                if self.runs.remove(run.start()).is_none() {
                    warn!(start = run.start(), "recorded run missing");
                }
            }
            Primitive::AnchorAdded { address, name } => {
                if self.anchors.name_at(*address).is_some() || self.anchors.contains(name) {
                    warn!(address, name = %name, "recorded anchor collides");
                } else {
                    self.anchors.bind(*address, name.clone());
                }
            }
            Primitive::AnchorRemoved { address, name } => {
                if self.anchors.unbind(*address).is_none() {
                    warn!(address, name = %name, "recorded anchor missing");
                }
            }
            Primitive::ListAdded { name, entries } => {
                self.lists.insert(name.clone(), entries.clone());
            }
            Primitive::ListRemoved { name, .. } => {
                if self.lists.remove(name).is_none() {
                    warn!(name = %name, "recorded list missing");
                }
            }
        }
    }
}
