//! Relocation engine: growing a run beyond its allocation.
//!
//! Growth is planned before anything is written:
//!
//! 1. If the bytes right after the run are unowned, unnamed, and hold the fill byte, the run
//!    grows in place.
//! 2. Otherwise the buffer is scanned from the configured origin for the first aligned region
//!    of unowned fill bytes that is large enough.
//! 3. Otherwise the [`GrowthPolicy`] decides: append space at the end of the buffer, or fail
//!    with [`ModelError::InsufficientSpace`].
//!
//! A move copies the bytes, clears the vacated region to the fill byte, re-keys the run in the
//! index, moves its anchor, and rewrites every pointer source. Each step is an ordinary
//! recorded primitive, so undoing the transaction restores the original layout.

use crate::config::GrowthPolicy;
use crate::delta::ModelDelta;
use crate::error::{Conflict, ModelError, Result};
use crate::model::{Relocation, RomModel};
use crate::runs::Run;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    InPlace,
    Move {
        to: usize,
        /// New buffer length when the destination lies past the current end.
        grow_to: Option<usize>,
    },
}

impl RomModel {
    /// First free region of `length` bytes at or after the configured origin.
    ///
    /// A region is free when no run or anchor claims any of its bytes and every byte equals the
    /// fill byte. The configured padding must also be free after the region.
    pub fn find_free_space(&self, length: usize) -> Option<usize> {
        self.find_free_space_from(self.config().free_space_origin, length)
    }

    /// Like [`RomModel::find_free_space`] but scanning from `origin`.
    pub fn find_free_space_from(&self, origin: usize, length: usize) -> Option<usize> {
        let config = self.config();
        let fill = config.fill_byte;
        let needed = length.checked_add(config.free_space_padding)?.max(1);
        let bytes = self.bytes();

        let mut candidate = config.align_up(origin);
        while candidate.checked_add(needed)? <= bytes.len() {
            let end = candidate + needed;

            if let Some(conflict) = self.find_conflict(candidate, end, None) {
                let next = match conflict {
                    Conflict::Run { start, length } => start + length,
                    Conflict::Anchor { address, .. } => address + 1,
                };
                candidate = config.align_up(next.max(candidate + 1));
                continue;
            }

            if let Some(offset) = bytes[candidate..end].iter().rposition(|&byte| byte != fill) {
                candidate = config.align_up(candidate + offset + 1);
                continue;
            }

            return Some(candidate);
        }

        None
    }

    /// Give the run at `start` at least `new_length` bytes, moving it if it cannot grow in place.
    ///
    /// Returns the run after the operation. When `new_length` already fits, nothing changes.
    /// Pointer sources are rewritten and the anchor moves with the run. Subscribers receive a
    /// [`Relocation`] report once the operation completes.
    pub fn relocate_for_growth(
        &mut self,
        start: usize,
        new_length: usize,
        tx: &mut ModelDelta,
    ) -> Result<Run> {
        self.atomic(tx, "relocate a run", |model, tx| {
            model.relocate_inner(start, new_length, tx)
        })
    }

    pub(crate) fn relocate_inner(
        &mut self,
        start: usize,
        new_length: usize,
        tx: &mut ModelDelta,
    ) -> Result<Run> {
        let run = self
            .run_exactly_at(start)
            .cloned()
            .ok_or(ModelError::NoRun(start))?;
        if new_length <= run.length() {
            return Ok(run);
        }

        match self.plan_destination(&run, new_length)? {
            Destination::InPlace => {
                let grown = run.with_length(new_length);
                self.replace_run(grown.clone(), tx)?;
                debug!(address = start, length = new_length, "run grown in place");
                Ok(grown)
            }
            Destination::Move { to, grow_to } => self.move_run(run, to, new_length, grow_to, tx),
        }
    }

    fn plan_destination(&self, run: &Run, new_length: usize) -> Result<Destination> {
        let config = self.config();
        let fill = config.fill_byte;
        let len = self.len();

        let grown_end = run.start() + new_length;
        if grown_end <= len
            && self
                .find_conflict(run.start(), grown_end, Some(run.start()))
                .is_none()
            && self.bytes()[run.end()..grown_end].iter().all(|&byte| byte == fill)
        {
            return Ok(Destination::InPlace);
        }

        if let Some(to) = self.find_free_space(new_length) {
            return Ok(Destination::Move { to, grow_to: None });
        }

        match config.growth {
            GrowthPolicy::Fail => {
                info!(needed = new_length, buffer_len = len, "no free space and growth is disabled");
                Err(ModelError::InsufficientSpace {
                    needed: new_length,
                    buffer_len: len,
                })
            }
            GrowthPolicy::Expand { max_len } => {
                let to = config.align_up(len);
                let grow_to = to + new_length + config.free_space_padding;
                if max_len.is_some_and(|max_len| grow_to > max_len) {
                    warn!(needed = new_length, buffer_len = len, ?max_len, "buffer cannot grow any further");
                    return Err(ModelError::InsufficientSpace {
                        needed: new_length,
                        buffer_len: len,
                    });
                }
                info!(from = len, to = grow_to, "growing buffer");
                Ok(Destination::Move {
                    to,
                    grow_to: Some(grow_to),
                })
            }
        }
    }

    fn move_run(
        &mut self,
        run: Run,
        to: usize,
        new_length: usize,
        grow_to: Option<usize>,
        tx: &mut ModelDelta,
    ) -> Result<Run> {
        if grow_to.is_none() {
            self.check_region(to, to + new_length, None)?;
        }
        if let Some(grow_to) = grow_to {
            self.resize(grow_to, tx);
        }

        let old_start = run.start();
        let old_end = run.end();
        let fill = self.config().fill_byte;

        let content = self.bytes()[old_start..old_end].to_vec();
        for (offset, value) in content.into_iter().enumerate() {
            self.set_byte(to + offset, value, tx);
        }
        for address in old_start..old_end {
            self.set_byte(address, fill, tx);
        }

        // Sources stored inside the run moved along with it.
        let sources: BTreeSet<usize> = run
            .pointer_sources()
            .iter()
            .map(|&source| {
                if (old_start..old_end).contains(&source) {
                    source - old_start + to
                } else {
                    source
                }
            })
            .collect();

        self.remove_run(old_start, tx);
        self.add_run(run.duplicate(to, sources.clone()).with_length(new_length), tx)?;

        for old_slot in run.pointer_slots() {
            let new_slot = old_slot - old_start + to;
            let Some(target) = self.read_pointer(new_slot).address() else {
                continue;
            };
            if target == old_start {
                continue;
            }
            if let Some(destination) = self.run_exactly_at(target)
                && destination.pointer_sources().contains(&old_slot)
            {
                let mut updated = destination.clone();
                updated.remove_source(old_slot);
                updated.add_source(new_slot);
                self.replace_run(updated, tx)?;
            }
        }

        if let Some(name) = self.unbind_anchor(old_start, tx) {
            self.bind_anchor(to, name, tx);
        }

        for &source in &sources {
            self.store_pointer(source, Some(to), tx);
        }
        self.refresh_error(to, tx)?;

        info!(
            old_start,
            new_start = to,
            length = new_length,
            sources = sources.len(),
            "run relocated"
        );
        self.report_relocation(Relocation {
            old_start,
            new_start: to,
            length: new_length,
        });

        self.run_exactly_at(to).cloned().ok_or(ModelError::NoRun(to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::runs::FormatDescriptor;
    use crate::text;

    fn model_with_text(len: usize, at: usize, content: &str) -> (RomModel, ModelDelta) {
        let mut model = RomModel::new(vec![0xFF; len]);
        let mut tx = ModelDelta::new();
        model
            .write_bytes(at, &text::encode(content).unwrap(), &mut tx)
            .unwrap();
        model.declare_run(at, FormatDescriptor::Text, &mut tx).unwrap();
        (model, tx)
    }

    #[test]
    fn test_free_space_skips_runs_and_dirty_bytes() {
        let (mut model, mut tx) = model_with_text(0x40, 0x00, "abcdef");
        model.write_byte(0x09, 0x00, &mut tx).unwrap();
        // Text occupies 0x00..0x07, 0x09 is dirty: first aligned free block of 8 is 0x0C.
        assert_eq!(model.find_free_space(8), Some(0x0C));
        assert_eq!(model.find_free_space(0x40), None);
    }

    #[test]
    fn test_free_space_skips_anchors() {
        let mut model = RomModel::new(vec![0xFF; 0x40]);
        let mut tx = ModelDelta::new();
        model.set_anchor(0x04, "reserved", &mut tx).unwrap();
        assert_eq!(model.find_free_space(8), Some(0x08));
    }

    #[test]
    fn test_free_space_honors_padding() {
        let config = ModelConfig {
            free_space_padding: 4,
            ..ModelConfig::default()
        };
        let mut model = RomModel::with_config(vec![0xFF; 0x10], config);
        let mut tx = ModelDelta::new();
        model.write_byte(0x05, 0x00, &mut tx).unwrap();
        assert_eq!(model.find_free_space(4), Some(0x08));
        assert_eq!(model.find_free_space(8), None);
    }

    #[test]
    fn test_grows_in_place_when_followed_by_fill() {
        let (mut model, mut tx) = model_with_text(0x40, 0x10, "abc");
        let run = model.relocate_for_growth(0x10, 8, &mut tx).unwrap();
        assert_eq!(run.start(), 0x10);
        assert_eq!(run.length(), 8);
        model.check_consistency().unwrap();
    }

    #[test]
    fn test_no_change_when_length_fits() {
        let (mut model, mut tx) = model_with_text(0x40, 0x10, "abc");
        let before = tx.len();
        let run = model.relocate_for_growth(0x10, 2, &mut tx).unwrap();
        assert_eq!(run.length(), 4);
        assert_eq!(tx.len(), before);
    }
}
