//! Change history: transactions, undo/redo, and saved-state tracking.
//!
//! `ChangeHistory` is generic over the change record so it can be exercised on its own; the
//! model uses it with [`ModelDelta`](crate::ModelDelta).
//!
//! States:
//!
//! - **Idle**: no open transaction.
//! - **Accumulating**: [`ChangeHistory::current_change`] opened a transaction.
//! - **Reverting**: between [`ChangeHistory::begin_undo`]/[`ChangeHistory::begin_redo`] and
//!   [`ChangeHistory::finish_revert`]. Opening or sealing a transaction, or starting another
//!   revert, fails with [`HistoryError::RevertInProgress`].
//!
//! Saved-state tracking uses frame identity: each sealed transaction gets an id that follows it
//! between the undo and redo stacks, so a save followed by undo then redo is still saved.

use crate::error::HistoryError;
use tracing::{debug, trace};

/// A change record the history can store.
pub trait ChangeToken: Default {
    /// Whether the record contains anything worth keeping.
    fn has_any_change(&self) -> bool;
}

/// Observable state of a [`ChangeHistory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    /// No open transaction.
    Idle,
    /// A transaction is open.
    Accumulating,
    /// An undo or redo is being applied.
    Reverting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SavePoint {
    /// Saved with an empty undo stack.
    Empty,
    /// Saved right after the frame with this id.
    Frame(u64),
    /// The saved position was discarded.
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

#[derive(Debug)]
struct Frame<T> {
    id: u64,
    change: T,
}

/// Undo/redo stacks plus the open transaction.
#[derive(Debug)]
pub struct ChangeHistory<T> {
    undo_stack: Vec<Frame<T>>,
    redo_stack: Vec<Frame<T>>,
    current: Option<T>,
    reverting: Option<(Direction, u64)>,
    max_depth: usize,
    next_id: u64,
    saved: SavePoint,
}

impl<T: ChangeToken> Default for ChangeHistory<T> {
    fn default() -> Self {
        Self::new(100)
    }
}

impl<T: ChangeToken> ChangeHistory<T> {
    /// Create a history keeping at most `max_depth` sealed transactions.
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            current: None,
            reverting: None,
            max_depth: max_depth.max(1),
            next_id: 0,
            saved: SavePoint::Empty,
        }
    }

    /// Current state.
    pub fn state(&self) -> HistoryState {
        if self.reverting.is_some() {
            HistoryState::Reverting
        } else if self.current.is_some() {
            HistoryState::Accumulating
        } else {
            HistoryState::Idle
        }
    }

    /// Whether an undo or redo is in progress.
    pub fn is_reverting(&self) -> bool {
        self.reverting.is_some()
    }

    /// Number of sealed transactions available to undo.
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of undone transactions available to redo.
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Whether undo would do something (including sealing and undoing the open transaction).
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty() || self.has_open_change()
    }

    /// Whether redo would do something.
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty() && !self.has_open_change()
    }

    fn has_open_change(&self) -> bool {
        self.current.as_ref().is_some_and(ChangeToken::has_any_change)
    }

    fn guard(&self, operation: &'static str) -> Result<(), HistoryError> {
        if self.reverting.is_some() {
            return Err(HistoryError::RevertInProgress { operation });
        }
        Ok(())
    }

    /// The open transaction, opening one if needed.
    pub fn current_change(&mut self) -> Result<&mut T, HistoryError> {
        self.guard("open a transaction")?;
        Ok(self.current.get_or_insert_with(T::default))
    }

    /// Seal the open transaction.
    ///
    /// Empty transactions are discarded. Returns whether a transaction was pushed; pushing one
    /// discards the redo stack.
    pub fn change_completed(&mut self) -> Result<bool, HistoryError> {
        self.guard("seal a transaction")?;
        let Some(change) = self.current.take() else {
            return Ok(false);
        };
        if !change.has_any_change() {
            return Ok(false);
        }

        self.clear_redo();

        let id = self.next_id;
        self.next_id += 1;
        self.undo_stack.push(Frame { id, change });
        trace!(id, depth = self.undo_stack.len(), "transaction sealed");

        while self.undo_stack.len() > self.max_depth {
            let dropped = self.undo_stack.remove(0);
            self.saved = match self.saved {
                SavePoint::Frame(saved) if saved == dropped.id => SavePoint::Empty,
                SavePoint::Empty => SavePoint::Unreachable,
                other => other,
            };
        }

        Ok(true)
    }

    fn clear_redo(&mut self) {
        if self.redo_stack.is_empty() {
            return;
        }
        if let SavePoint::Frame(saved) = self.saved
            && self.redo_stack.iter().any(|frame| frame.id == saved)
        {
            self.saved = SavePoint::Unreachable;
        }
        self.redo_stack.clear();
    }

    /// Seal the open transaction and take the newest one for reverting.
    ///
    /// Returns `None` when there is nothing to undo. Otherwise the history is Reverting until
    /// [`ChangeHistory::finish_revert`] hands back the reverse change.
    pub fn begin_undo(&mut self) -> Result<Option<T>, HistoryError> {
        self.guard("undo")?;
        self.change_completed()?;
        let Some(frame) = self.undo_stack.pop() else {
            return Ok(None);
        };
        debug!(id = frame.id, "undo");
        self.reverting = Some((Direction::Undo, frame.id));
        Ok(Some(frame.change))
    }

    /// Take the newest undone transaction for re-applying.
    ///
    /// An open non-empty transaction is sealed first, which discards the redo stack.
    pub fn begin_redo(&mut self) -> Result<Option<T>, HistoryError> {
        self.guard("redo")?;
        self.change_completed()?;
        let Some(frame) = self.redo_stack.pop() else {
            return Ok(None);
        };
        debug!(id = frame.id, "redo");
        self.reverting = Some((Direction::Redo, frame.id));
        Ok(Some(frame.change))
    }

    /// Complete the revert started by `begin_undo`/`begin_redo`.
    ///
    /// `reverse` is the change that undoes what the revert just did.
    pub fn finish_revert(&mut self, reverse: T) -> Result<(), HistoryError> {
        let (direction, id) = self
            .reverting
            .take()
            .ok_or(HistoryError::NoRevertInProgress)?;
        let frame = Frame { id, change: reverse };
        match direction {
            Direction::Undo => self.redo_stack.push(frame),
            Direction::Redo => self.undo_stack.push(frame),
        }
        Ok(())
    }

    /// Undo the newest transaction through `revert`. Returns whether anything was undone.
    pub fn undo(&mut self, revert: impl FnOnce(T) -> T) -> Result<bool, HistoryError> {
        let Some(change) = self.begin_undo()? else {
            return Ok(false);
        };
        self.finish_revert(revert(change))?;
        Ok(true)
    }

    /// Redo the newest undone transaction through `revert`. Returns whether anything was redone.
    pub fn redo(&mut self, revert: impl FnOnce(T) -> T) -> Result<bool, HistoryError> {
        let Some(change) = self.begin_redo()? else {
            return Ok(false);
        };
        self.finish_revert(revert(change))?;
        Ok(true)
    }

    fn position(&self) -> SavePoint {
        self.undo_stack
            .last()
            .map_or(SavePoint::Empty, |frame| SavePoint::Frame(frame.id))
    }

    /// Mark the current position as saved, sealing the open transaction first.
    pub fn tag_as_saved(&mut self) -> Result<(), HistoryError> {
        self.change_completed()?;
        self.saved = self.position();
        Ok(())
    }

    /// Whether the model matches the last saved position.
    pub fn is_saved(&self) -> bool {
        !self.has_open_change() && self.reverting.is_none() && self.position() == self.saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    struct Log(Vec<i32>);

    impl ChangeToken for Log {
        fn has_any_change(&self) -> bool {
            !self.0.is_empty()
        }
    }

    fn push(history: &mut ChangeHistory<Log>, value: i32) {
        history.current_change().unwrap().0.push(value);
        history.change_completed().unwrap();
    }

    fn reversed(log: Log) -> Log {
        Log(log.0.into_iter().rev().map(|v| -v).collect())
    }

    #[test]
    fn test_empty_transaction_is_discarded() {
        let mut history = ChangeHistory::<Log>::new(10);
        history.current_change().unwrap();
        assert_eq!(history.state(), HistoryState::Accumulating);
        assert!(!history.change_completed().unwrap());
        assert_eq!(history.undo_depth(), 0);
        assert_eq!(history.state(), HistoryState::Idle);
    }

    #[test]
    fn test_undo_redo_moves_frames() {
        let mut history = ChangeHistory::<Log>::new(10);
        push(&mut history, 1);
        push(&mut history, 2);

        let mut seen = Vec::new();
        assert!(history.undo(|log| {
            seen.push(log.clone());
            reversed(log)
        })
        .unwrap());
        assert_eq!(seen, vec![Log(vec![2])]);
        assert_eq!(history.undo_depth(), 1);
        assert_eq!(history.redo_depth(), 1);

        assert!(history.redo(|log| {
            assert_eq!(log, Log(vec![-2]));
            reversed(log)
        })
        .unwrap());
        assert_eq!(history.undo_depth(), 2);
        assert_eq!(history.redo_depth(), 0);
    }

    #[test]
    fn test_reentrancy_is_rejected() {
        let mut history = ChangeHistory::<Log>::new(10);
        push(&mut history, 1);

        let change = history.begin_undo().unwrap().unwrap();
        assert_eq!(history.state(), HistoryState::Reverting);
        assert_eq!(
            history.current_change().unwrap_err(),
            HistoryError::RevertInProgress {
                operation: "open a transaction"
            }
        );
        assert!(history.change_completed().is_err());
        assert!(history.begin_redo().is_err());

        history.finish_revert(reversed(change)).unwrap();
        assert_eq!(
            history.finish_revert(Log::default()),
            Err(HistoryError::NoRevertInProgress)
        );
    }

    #[test]
    fn test_new_transaction_discards_redo() {
        let mut history = ChangeHistory::<Log>::new(10);
        push(&mut history, 1);
        history.undo(reversed).unwrap();
        assert!(history.can_redo());

        // Opening alone keeps redo available.
        history.current_change().unwrap();
        history.change_completed().unwrap();
        assert!(history.can_redo());

        push(&mut history, 2);
        assert!(!history.can_redo());
    }

    #[test]
    fn test_saved_state_follows_frame_identity() {
        let mut history = ChangeHistory::<Log>::new(10);
        assert!(history.is_saved());
        push(&mut history, 1);
        push(&mut history, 2);
        assert!(!history.is_saved());

        history.tag_as_saved().unwrap();
        assert!(history.is_saved());

        history.undo(reversed).unwrap();
        assert!(!history.is_saved());
        history.redo(reversed).unwrap();
        assert!(history.is_saved());

        history.current_change().unwrap().0.push(3);
        assert!(!history.is_saved());
    }

    #[test]
    fn test_saved_point_lost_when_redo_cleared() {
        let mut history = ChangeHistory::<Log>::new(10);
        push(&mut history, 1);
        history.tag_as_saved().unwrap();
        history.undo(reversed).unwrap();
        push(&mut history, 2);
        history.undo(reversed).unwrap();
        assert!(!history.is_saved());
    }

    #[test]
    fn test_depth_limit_adjusts_saved_point() {
        let mut history = ChangeHistory::<Log>::new(2);
        push(&mut history, 1);
        history.tag_as_saved().unwrap();
        push(&mut history, 2);
        push(&mut history, 3);
        assert_eq!(history.undo_depth(), 2);

        // Frame 1 was dropped; undoing everything lands on the saved state.
        history.undo(reversed).unwrap();
        history.undo(reversed).unwrap();
        assert!(!history.can_undo());
        assert!(history.is_saved());

        push(&mut history, 4);
        push(&mut history, 5);
        push(&mut history, 6);
        while history.undo(reversed).unwrap() {}
        assert!(!history.is_saved());
    }
}
