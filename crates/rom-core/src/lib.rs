#![warn(missing_docs)]
//! ROM Core - Headless Data Model for ROM Hacking Tools
//!
//! # Overview
//!
//! `rom-core` models a binary image (typically a GBA cartridge) as a flat byte buffer with typed
//! structure layered on top. It does not render anything and does not know about files; hosts
//! load bytes, hand them to a [`RomModel`], and drive it through transactions.
//!
//! # Core Features
//!
//! - **Runs**: non-overlapping formatted regions (pointers, text, compressed streams, named
//!   constants, tables) kept in a balanced interval index, O(log n) lookup
//! - **Pointer Tracking**: every run knows which addresses point at it
//! - **Relocation**: runs that outgrow their space move to free space, and every pointer to them
//!   is rewritten
//! - **Anchors and Lists**: case-insensitive names for addresses, named value lists for enum
//!   fields
//! - **Transactions**: every mutation records reversible primitives; undo/redo restores buffer
//!   and metadata bit-for-bit
//!
//! # Architecture Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  RomSession (model + ChangeHistory)         │  ← Public API, undo/redo
//! ├─────────────────────────────────────────────┤
//! │  Metadata Snapshot / Pointer Discovery      │  ← Import, export, search
//! ├─────────────────────────────────────────────┤
//! │  Relocation Engine (free space, growth)     │  ← Growing runs
//! ├─────────────────────────────────────────────┤
//! │  RomModel (runs, anchors, lists)            │  ← Queries and mutations
//! ├─────────────────────────────────────────────┤
//! │  ModelDelta (reversible primitives)         │  ← Change records
//! ├─────────────────────────────────────────────┤
//! │  Interval Index (red-black tree)            │  ← Run storage
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use rom_core::{FormatDescriptor, RomModel, RomSession};
//!
//! let mut bytes = vec![0xFF; 0x100];
//! // A pointer at 0x00 to the text at 0x10 ("Hi" followed by the terminator).
//! bytes[0x00..0x04].copy_from_slice(&0x0800_0010u32.to_le_bytes());
//! bytes[0x10..0x13].copy_from_slice(&[0xC2, 0xDD, 0xFF]);
//! // Something right after the text, so it cannot grow in place.
//! bytes[0x13] = 0x00;
//!
//! let mut session = RomSession::new(RomModel::new(bytes));
//! session
//!     .edit(|model, tx| {
//!         model.declare_run(0x00, FormatDescriptor::Pointer, tx)?;
//!         model.declare_run(0x10, FormatDescriptor::Text, tx)
//!     })
//!     .unwrap();
//!
//! let moved_to = session
//!     .edit(|model, tx| model.write_text(0x10, "Hello there", tx))
//!     .unwrap();
//! session.change_completed().unwrap();
//!
//! assert_ne!(moved_to, 0x10);
//! assert_eq!(session.model().read_pointer(0x00).address(), Some(moved_to));
//! assert_eq!(session.model().read_text(moved_to).unwrap(), "Hello there");
//!
//! session.undo().unwrap();
//! assert_eq!(session.model().read_text(0x10).unwrap(), "Hi");
//! ```
//!
//! # Module Description
//!
//! - [`intervals`] - Red-black interval index keyed by start address
//! - [`runs`] - Run variants, format descriptors, cell formats
//! - [`text`] - Character set and text-run encoding
//! - [`anchors`] - Anchor name table
//! - [`delta`] - Reversible primitives and `ModelDelta`
//! - [`history`] - Undo/redo state machine
//! - [`model`] - `RomModel` query and mutation surface
//! - [`relocation`] - Free-space search and run relocation
//! - [`search`] - Pointer search and discovery
//! - [`metadata`] - Metadata export and import
//! - [`session`] - `RomSession`
//! - [`codec`] - Compression contract
//!
//! # Logging
//!
//! The crate emits `tracing` events (relocations at `info`, declarations at `debug`, revert
//! inconsistencies at `warn`) and never installs a subscriber.

pub mod anchors;
pub mod codec;
pub mod config;
pub mod delta;
pub mod error;
pub mod history;
pub mod intervals;
pub mod metadata;
pub mod model;
pub mod relocation;
pub mod runs;
pub mod search;
pub mod session;
pub mod text;

pub use anchors::{AnchorOutcome, AnchorTable};
pub use codec::{Codec, CodecError, Decompressed};
pub use config::{GrowthPolicy, ModelConfig};
pub use delta::{ModelDelta, Primitive};
pub use error::{Conflict, HistoryError, ModelError, Result};
pub use history::{ChangeHistory, ChangeToken, HistoryState};
pub use intervals::{IntervalIndex, Keyed};
pub use metadata::{LoadReport, MetadataSnapshot, Rejected, StoredAnchor, StoredList, StoredRun};
pub use model::{Relocation, RelocationCallback, RomModel};
pub use runs::{
    ByteChange, CellFormat, Dependent, Field, FieldKind, FormatDescriptor, PointerTarget, Run,
    RunKind, Table, TableLength,
};
pub use search::Discovery;
pub use session::RomSession;
pub use text::Glyph;
