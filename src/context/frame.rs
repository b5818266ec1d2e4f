//! Per-logical-execution storage backing [`ContextLocal`] values.
//!
//! [`ContextLocal`]: crate::context::ContextLocal

use crate::context::local::{AnyLocal, LocalId};
use crate::context::snapshot::{Snapshot, SnapshotEntry};

use std::any::Any;
use std::sync::Arc;

/// Type-erased context value.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
struct Slot {
    local: &'static dyn AnyLocal,
    // Push order; the last element is the active value.
    values: Vec<Value>,
}

/// Active values of every context local for one logical execution.
///
/// Slots are kept in first-activation order so snapshots list locals in the
/// order they were bound and unwinding removes them in reverse.
#[derive(Clone, Default)]
pub(crate) struct FrameStack {
    slots: Vec<Slot>,
}

impl FrameStack {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn slot(&self, id: LocalId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.local.id() == id)
    }

    pub(crate) fn top(&self, id: LocalId) -> Option<&Value> {
        self.slot(id).and_then(|s| s.values.last())
    }

    /// Values for `id`, most recent first.
    pub(crate) fn stack(&self, id: LocalId) -> impl Iterator<Item = &Value> {
        self.slot(id).into_iter().flat_map(|s| s.values.iter().rev())
    }

    pub(crate) fn push(&mut self, local: &'static dyn AnyLocal, value: Value) {
        let id = local.id();
        match self.slots.iter_mut().find(|s| s.local.id() == id) {
            Some(slot) => slot.values.push(value),
            None => self.slots.push(Slot {
                local,
                values: vec![value],
            }),
        }
    }

    pub(crate) fn pop(&mut self, id: LocalId) {
        if let Some(pos) = self.slots.iter().position(|s| s.local.id() == id) {
            let slot = &mut self.slots[pos];
            slot.values.pop();
            if slot.values.is_empty() {
                self.slots.remove(pos);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot::from_entries(
            self.slots
                .iter()
                .map(|slot| SnapshotEntry {
                    local: slot.local,
                    values: slot.values.iter().rev().cloned().collect(),
                })
                .collect(),
        )
    }

    pub(crate) fn restore(snapshot: &Snapshot) -> Self {
        Self {
            slots: snapshot
                .entries()
                .iter()
                .map(|entry| Slot {
                    local: entry.local,
                    values: entry.values.iter().rev().cloned().collect(),
                })
                .collect(),
        }
    }
}
