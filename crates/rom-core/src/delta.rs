//! Reversible change records.
//!
//! Every mutation of a [`RomModel`] is expressed as a sequence of [`Primitive`] operations
//! recorded into the open [`ModelDelta`]. A delta is reverted by applying the inverse of each
//! primitive in reverse order; the inverses, in the order they were applied, form the delta
//! that redoes the change.
//!
//! Structural edits to a run (new pointer source, new length, error flag) are recorded as the
//! removal of the old run followed by the addition of the new one.

use crate::history::ChangeToken;
use crate::model::RomModel;
use crate::runs::Run;
use tracing::trace;

/// One reversible operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    /// A single byte changed from `old` to `new`.
    Byte {
        /// Address of the byte.
        address: usize,
        /// Value before the write.
        old: u8,
        /// Value after the write.
        new: u8,
    },
    /// The buffer length changed; bytes added by growth hold `fill`.
    Resize {
        /// Length before.
        old_len: usize,
        /// Length after.
        new_len: usize,
        /// Value of bytes added when growing.
        fill: u8,
    },
    /// A run was inserted into the index.
    RunAdded(Run),
    /// A run was removed from the index.
    RunRemoved(Run),
    /// A name was bound to an address.
    AnchorAdded {
        /// Bound address.
        address: usize,
        /// Bound name.
        name: String,
    },
    /// A name was unbound from an address.
    AnchorRemoved {
        /// Previously bound address.
        address: usize,
        /// Previously bound name.
        name: String,
    },
    /// A named list was stored.
    ListAdded {
        /// List name.
        name: String,
        /// List entries.
        entries: Vec<String>,
    },
    /// A named list was removed.
    ListRemoved {
        /// List name.
        name: String,
        /// Entries the list had.
        entries: Vec<String>,
    },
}

impl Primitive {
    /// The operation that undoes this one.
    pub fn inverse(&self) -> Primitive {
        match self {
            Primitive::Byte { address, old, new } => Primitive::Byte {
                address: *address,
                old: *new,
                new: *old,
            },
            Primitive::Resize {
                old_len,
                new_len,
                fill,
            } => Primitive::Resize {
                old_len: *new_len,
                new_len: *old_len,
                fill: *fill,
            },
            Primitive::RunAdded(run) => Primitive::RunRemoved(run.clone()),
            Primitive::RunRemoved(run) => Primitive::RunAdded(run.clone()),
            Primitive::AnchorAdded { address, name } => Primitive::AnchorRemoved {
                address: *address,
                name: name.clone(),
            },
            Primitive::AnchorRemoved { address, name } => Primitive::AnchorAdded {
                address: *address,
                name: name.clone(),
            },
            Primitive::ListAdded { name, entries } => Primitive::ListRemoved {
                name: name.clone(),
                entries: entries.clone(),
            },
            Primitive::ListRemoved { name, entries } => Primitive::ListAdded {
                name: name.clone(),
                entries: entries.clone(),
            },
        }
    }

    fn touches_data(&self) -> bool {
        matches!(self, Primitive::Byte { .. } | Primitive::Resize { .. })
    }
}

/// An ordered group of primitives forming one user-visible change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDelta {
    primitives: Vec<Primitive>,
}

impl ModelDelta {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded primitives.
    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// Recorded primitives in application order.
    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    /// Whether any recorded primitive changed buffer bytes or length.
    pub fn has_data_change(&self) -> bool {
        self.primitives.iter().any(Primitive::touches_data)
    }

    pub(crate) fn record(&mut self, primitive: Primitive) {
        self.primitives.push(primitive);
    }

    /// Undo and drop everything recorded after the first `len` primitives.
    pub(crate) fn rollback(&mut self, len: usize, model: &mut RomModel) {
        while self.primitives.len() > len {
            let Some(primitive) = self.primitives.pop() else {
                break;
            };
            model.apply_primitive(&primitive.inverse());
        }
    }

    /// Undo this delta against `model`, returning the delta that re-applies it.
    pub fn revert(self, model: &mut RomModel) -> ModelDelta {
        trace!(primitives = self.primitives.len(), "reverting delta");
        let mut reverse = ModelDelta {
            primitives: Vec::with_capacity(self.primitives.len()),
        };

        model.set_reverting(true);
        for primitive in self.primitives.iter().rev() {
            let inverse = primitive.inverse();
            model.apply_primitive(&inverse);
            reverse.record(inverse);
        }
        model.set_reverting(false);

        reverse
    }
}

impl ChangeToken for ModelDelta {
    fn has_any_change(&self) -> bool {
        !self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunKind;

    #[test]
    fn test_inverse_is_involution() {
        let primitives = vec![
            Primitive::Byte {
                address: 3,
                old: 0xFF,
                new: 0x01,
            },
            Primitive::Resize {
                old_len: 0x10,
                new_len: 0x20,
                fill: 0xFF,
            },
            Primitive::RunAdded(Run::new(0, 4, RunKind::Pointer)),
            Primitive::AnchorRemoved {
                address: 8,
                name: "table".into(),
            },
            Primitive::ListAdded {
                name: "types".into(),
                entries: vec!["Normal".into()],
            },
        ];
        for primitive in primitives {
            assert_ne!(primitive.inverse(), primitive);
            assert_eq!(primitive.inverse().inverse(), primitive);
        }
    }

    #[test]
    fn test_has_data_change() {
        let mut delta = ModelDelta::new();
        assert!(!delta.has_any_change());
        delta.record(Primitive::AnchorAdded {
            address: 0,
            name: "start".into(),
        });
        assert!(delta.has_any_change());
        assert!(!delta.has_data_change());
        delta.record(Primitive::Byte {
            address: 0,
            old: 0,
            new: 1,
        });
        assert!(delta.has_data_change());
    }
}
