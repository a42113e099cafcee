//! Pointer search and discovery.
//!
//! Pointers are stored 4-byte aligned as `pointer_base + address`, so a search is a strided
//! comparison over the buffer. Found pointers can be adopted one destination at a time
//! ([`RomModel::adopt_pointers_to`]) or across the whole buffer
//! ([`RomModel::discover_pointers`]), which also recognizes text at the destinations.

use crate::delta::ModelDelta;
use crate::error::Result;
use crate::model::RomModel;
use crate::runs::{FormatDescriptor, POINTER_WIDTH, Run};
use crate::text;
use tracing::{debug, info, trace};

/// Runs created by [`RomModel::discover_pointers`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Addresses of new pointer runs.
    pub pointers: Vec<usize>,
    /// Addresses of new text runs.
    pub text: Vec<usize>,
}

impl RomModel {
    /// Aligned addresses whose stored value points at `destination`.
    pub fn search_for_pointers_to(&self, destination: usize) -> Vec<usize> {
        if destination >= self.len() {
            return Vec::new();
        }
        let needle = self
            .config()
            .pointer_base
            .wrapping_add(destination as u32)
            .to_le_bytes();
        self.bytes()
            .chunks_exact(POINTER_WIDTH)
            .enumerate()
            .filter(|(_, chunk)| *chunk == needle)
            .map(|(index, _)| index * POINTER_WIDTH)
            .collect()
    }

    /// Declare a pointer run at every found source of `destination` that is not already part of
    /// a run. Returns the addresses of the new pointer runs.
    pub fn adopt_pointers_to(&mut self, destination: usize, tx: &mut ModelDelta) -> Result<Vec<usize>> {
        self.atomic(tx, "adopt pointers", |model, tx| {
            let mut adopted = Vec::new();
            for source in model.search_for_pointers_to(destination) {
                if model.declare_found_pointer(source, tx) {
                    adopted.push(source);
                }
            }
            debug!(destination, adopted = adopted.len(), "pointers adopted");
            Ok(adopted)
        })
    }

    /// Scan the whole buffer for pointers and text.
    ///
    /// Every aligned value pointing into the buffer, but not into the middle of a run, becomes a
    /// pointer run. No-info destinations whose bytes look like text then become text runs.
    pub fn discover_pointers(&mut self, tx: &mut ModelDelta) -> Result<Discovery> {
        self.atomic(tx, "discover pointers", |model, tx| {
            let mut discovery = Discovery::default();

            let candidates: Vec<usize> = (0..model.len() / POINTER_WIDTH)
                .map(|index| index * POINTER_WIDTH)
                .filter(|&source| {
                    model.read_pointer(source).address().is_some_and(|target| {
                        !(source..source + POINTER_WIDTH).contains(&target)
                            && model
                                .run_containing(target)
                                .is_none_or(|run| run.start() == target)
                    })
                })
                .collect();

            for source in candidates {
                if model.declare_found_pointer(source, tx) {
                    discovery.pointers.push(source);
                }
            }

            let placeholders: Vec<usize> = model
                .runs()
                .filter(|run| run.is_no_info())
                .map(Run::start)
                .collect();
            for start in placeholders {
                let Some(length) = text::looks_like_text(&model.bytes()[start..]) else {
                    continue;
                };
                if model.find_conflict(start, start + length, Some(start)).is_some() {
                    continue;
                }
                match model.declare_run_inner(start, &FormatDescriptor::Text, tx) {
                    Ok(_) => discovery.text.push(start),
                    Err(err) => trace!(address = start, error = %err, "text candidate skipped"),
                }
            }

            info!(
                pointers = discovery.pointers.len(),
                text = discovery.text.len(),
                "discovery finished"
            );
            Ok(discovery)
        })
    }

    /// Declare a pointer run at `source` unless something other than a no-info run is in the way.
    fn declare_found_pointer(&mut self, source: usize, tx: &mut ModelDelta) -> bool {
        let owner = self
            .run_exactly_at(source)
            .filter(|run| run.is_no_info())
            .map(Run::start);
        if self
            .find_conflict(source, source + POINTER_WIDTH, owner)
            .is_some()
        {
            return false;
        }
        match self.declare_run_inner(source, &FormatDescriptor::Pointer, tx) {
            Ok(_) => true,
            Err(err) => {
                trace!(address = source, error = %err, "pointer candidate skipped");
                false
            }
        }
    }
}
