//! Session: a model paired with its change history.
//!
//! [`RomSession`] is the only place where [`RomModel`] and [`ChangeHistory`] meet. Edits run
//! against the history's open transaction; undo and redo revert sealed transactions against
//! the model.
//!
//! # Example
//!
//! ```rust
//! use rom_core::{RomModel, RomSession};
//!
//! let mut session = RomSession::new(RomModel::new(vec![0xFF; 0x40]));
//!
//! session.edit(|model, tx| model.write_byte(0x10, 0x2A, tx)).unwrap();
//! session.change_completed().unwrap();
//! assert_eq!(session.model().bytes()[0x10], 0x2A);
//!
//! assert!(session.undo().unwrap());
//! assert_eq!(session.model().bytes()[0x10], 0xFF);
//!
//! assert!(session.redo().unwrap());
//! assert_eq!(session.model().bytes()[0x10], 0x2A);
//! ```

use crate::delta::ModelDelta;
use crate::error::Result;
use crate::history::ChangeHistory;
use crate::metadata::{LoadReport, MetadataSnapshot};
use crate::model::{Relocation, RomModel};

/// A [`RomModel`] with undo/redo.
#[derive(Debug)]
pub struct RomSession {
    model: RomModel,
    history: ChangeHistory<ModelDelta>,
}

impl RomSession {
    /// Wrap `model`, using its configured undo depth.
    pub fn new(model: RomModel) -> Self {
        let depth = model.config().max_undo;
        Self {
            model,
            history: ChangeHistory::new(depth),
        }
    }

    /// The model.
    pub fn model(&self) -> &RomModel {
        &self.model
    }

    /// The change history.
    pub fn history(&self) -> &ChangeHistory<ModelDelta> {
        &self.history
    }

    /// Give the model back, dropping the history.
    pub fn into_model(self) -> RomModel {
        self.model
    }

    /// Run `edit` against the model inside the open transaction.
    ///
    /// Several edits share one transaction until [`RomSession::change_completed`] seals it.
    /// The closure is atomic: when it fails, everything it recorded is rolled back.
    pub fn edit<R>(
        &mut self,
        edit: impl FnOnce(&mut RomModel, &mut ModelDelta) -> Result<R>,
    ) -> Result<R> {
        let tx = self.history.current_change()?;
        self.model.atomic(tx, "edit", edit)
    }

    /// Seal the open transaction. Returns whether it held any change.
    pub fn change_completed(&mut self) -> Result<bool> {
        Ok(self.history.change_completed()?)
    }

    /// Undo the newest transaction. Returns whether anything was undone.
    pub fn undo(&mut self) -> Result<bool> {
        let model = &mut self.model;
        Ok(self.history.undo(|delta| delta.revert(model))?)
    }

    /// Redo the newest undone transaction. Returns whether anything was redone.
    pub fn redo(&mut self) -> Result<bool> {
        let model = &mut self.model;
        Ok(self.history.redo(|delta| delta.revert(model))?)
    }

    /// Whether [`RomSession::undo`] would do anything.
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    /// Whether [`RomSession::redo`] would do anything.
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Mark the current state as saved.
    pub fn tag_as_saved(&mut self) -> Result<()> {
        Ok(self.history.tag_as_saved()?)
    }

    /// Whether the model matches the last saved state.
    pub fn is_saved(&self) -> bool {
        self.history.is_saved()
    }

    /// Register a callback for relocation reports.
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: FnMut(&Relocation) + Send + 'static,
    {
        self.model.subscribe(callback);
    }

    /// Capture the model's metadata.
    pub fn export_metadata(&self) -> MetadataSnapshot {
        self.model.export_metadata()
    }

    /// Replace the model's metadata with `snapshot` and start a fresh history.
    ///
    /// Earlier transactions refer to runs that no longer exist after a load, so they are
    /// dropped.
    pub fn load_metadata(&mut self, snapshot: &MetadataSnapshot) -> Result<LoadReport> {
        self.history.change_completed()?;
        let report = self.model.load_metadata(snapshot)?;
        self.history = ChangeHistory::new(self.model.config().max_undo);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::FormatDescriptor;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_edits_share_a_transaction_until_sealed() {
        let mut session = RomSession::new(RomModel::new(vec![0xFF; 0x20]));
        session.edit(|model, tx| model.write_byte(0, 1, tx)).unwrap();
        session.edit(|model, tx| model.write_byte(1, 2, tx)).unwrap();
        assert!(session.change_completed().unwrap());
        assert_eq!(session.history().undo_depth(), 1);

        session.undo().unwrap();
        assert_eq!(&session.model().bytes()[..2], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_failed_edit_leaves_no_trace() {
        let mut session = RomSession::new(RomModel::new(vec![0xFF; 0x20]));
        session.edit(|model, tx| model.write_byte(0, 1, tx)).unwrap();
        let result = session.edit(|model, tx| {
            model.write_byte(1, 2, tx)?;
            model.declare_run(1, FormatDescriptor::Text, tx)
        });
        assert!(result.is_err());
        assert_eq!(&session.model().bytes()[..2], &[1, 0xFF]);
        assert!(session.change_completed().unwrap());
    }

    #[test]
    fn test_undo_seals_open_edits() {
        let mut session = RomSession::new(RomModel::new(vec![0xFF; 0x20]));
        session.edit(|model, tx| model.write_byte(4, 9, tx)).unwrap();
        assert!(session.can_undo());
        assert!(session.undo().unwrap());
        assert_eq!(session.model().bytes()[4], 0xFF);
        assert!(session.can_redo());
    }

    #[test]
    fn test_saved_state_follows_undo() {
        let mut session = RomSession::new(RomModel::new(vec![0xFF; 0x20]));
        assert!(session.is_saved());
        session.edit(|model, tx| model.write_byte(0, 1, tx)).unwrap();
        assert!(!session.is_saved());
        session.tag_as_saved().unwrap();
        assert!(session.is_saved());
        session.undo().unwrap();
        assert!(!session.is_saved());
        session.redo().unwrap();
        assert!(session.is_saved());
    }

    #[test]
    fn test_subscribers_see_relocations() {
        let mut session = RomSession::new(RomModel::new(vec![0xFF; 0x40]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.subscribe(move |relocation| sink.lock().unwrap().push(*relocation));

        session
            .edit(|model, tx| {
                model.write_pointer(0x00, Some(0x10), tx)?;
                model.declare_run(0x00, FormatDescriptor::Pointer, tx)?;
                model.write_bytes(0x10, &[0xBB, 0xFF], tx)?;
                model.declare_run(0x10, FormatDescriptor::Text, tx)?;
                model.set_anchor(0x12, "blocker", tx)?;
                model.write_text(0x10, "ABCDEF", tx)
            })
            .unwrap();
        session.change_completed().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old_start, 0x10);
        assert_eq!(session.model().read_pointer(0x00).address(), Some(seen[0].new_start));
    }

    #[test]
    fn test_load_metadata_resets_history() {
        let mut session = RomSession::new(RomModel::new(vec![0xFF; 0x20]));
        session
            .edit(|model, tx| model.set_anchor(0x08, "start", tx))
            .unwrap();
        let snapshot = session.export_metadata();
        session.change_completed().unwrap();

        let report = session.load_metadata(&snapshot).unwrap();
        assert!(report.is_clean());
        assert!(!session.can_undo());
        assert_eq!(session.model().anchor_address("start"), Some(0x08));
    }
}
