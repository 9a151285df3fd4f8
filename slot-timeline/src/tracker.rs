//! Before/after change capture for entities that feed incremental aggregates.
//!
//! A [`UnitOfWork`] is handed by reference through a reconciliation step. Mutations are wrapped
//! in [`ChangeTracker::track`], which snapshots the entity before the outermost scope and records
//! one change at its exit. Nothing reaches the aggregates until [`UnitOfWork::flush`] runs after
//! the step commits; a rolled-back step calls [`UnitOfWork::discard`] instead.

use std::{collections::HashMap, hash::Hash};

use crate::{
    aggregates::Accumulator,
    cycle::{CycleId, OperationCycle},
    slot::{Slot, SlotId},
};

pub trait Tracked: Clone {
    type Id: Copy + Eq + Hash;

    /// `None` for transient entities, which have no prior state.
    fn tracked_id(&self) -> Option<Self::Id>;
}

impl<D: Clone> Tracked for Slot<D> {
    type Id = SlotId;

    fn tracked_id(&self) -> Option<SlotId> {
        self.id
    }
}

impl Tracked for OperationCycle {
    type Id = CycleId;

    fn tracked_id(&self) -> Option<CycleId> {
        self.id
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Change<T> {
    pub before: Option<T>,
    pub after: Option<T>,
}

#[derive(Debug)]
pub struct ChangeTracker<T: Tracked> {
    changes: Vec<Change<T>>,
    by_id: HashMap<T::Id, usize>,
    // Address of each entity with an open scope. The outer `&mut` borrow pins it.
    active: Vec<usize>,
    deleted: Vec<usize>,
}

impl<T: Tracked> Default for ChangeTracker<T> {
    fn default() -> Self {
        Self {
            changes: Vec::new(),
            by_id: HashMap::new(),
            active: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T: Tracked> ChangeTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `mutate` on `entity`. Nested calls on the same entity join the outermost scope.
    pub fn track<R>(&mut self, entity: &mut T, mutate: impl FnOnce(&mut T, &mut Self) -> R) -> R {
        let key = entity as *const T as usize;
        if self.active.contains(&key) {
            return mutate(entity, self);
        }
        let before = entity.tracked_id().map(|_| entity.clone());
        // Another copy of the same entity may be tracked inside this scope and record first.
        let outermost = entity
            .tracked_id()
            .is_some_and(|id| !self.by_id.contains_key(&id));
        self.active.push(key);
        let result = mutate(entity, self);
        self.active.retain(|k| *k != key);
        let deleted = if let Some(pos) = self.deleted.iter().position(|k| *k == key) {
            self.deleted.swap_remove(pos);
            true
        } else {
            false
        };
        let after = if deleted { None } else { Some(entity.clone()) };
        self.record(before, after, outermost);
        result
    }

    /// Inside a [`track`](Self::track) scope: the entity is removed when the scope exits.
    pub fn mark_deleted(&mut self, entity: &T) {
        let key = entity as *const T as usize;
        if self.active.contains(&key) && !self.deleted.contains(&key) {
            self.deleted.push(key);
        }
    }

    pub fn track_new(&mut self, entity: &T) {
        self.record(None, Some(entity.clone()), false);
    }

    pub fn track_removal(&mut self, entity: &T) {
        self.record(Some(entity.clone()), None, false);
    }

    /// Coalesces repeated edits of one persistent entity into a single change. With
    /// `replaces_before`, an entry recorded by a nested scope takes this scope's `before`.
    fn record(&mut self, before: Option<T>, after: Option<T>, replaces_before: bool) {
        let id = before
            .as_ref()
            .and_then(Tracked::tracked_id)
            .or_else(|| after.as_ref().and_then(Tracked::tracked_id));
        if let Some(id) = id {
            if let Some(&idx) = self.by_id.get(&id) {
                let change = &mut self.changes[idx];
                if replaces_before {
                    change.before = before;
                }
                change.after = after;
                return;
            }
            self.by_id.insert(id, self.changes.len());
        } else if before.is_none() && after.is_none() {
            return;
        }
        self.changes.push(Change { before, after });
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[Change<T>] {
        &self.changes
    }

    fn drain(&mut self) -> Vec<Change<T>> {
        self.by_id.clear();
        self.active.clear();
        self.deleted.clear();
        std::mem::take(&mut self.changes)
    }
}

/// Slot and cycle edits of one atomic step.
pub struct UnitOfWork<D: Clone> {
    pub slots: ChangeTracker<Slot<D>>,
    pub cycles: ChangeTracker<OperationCycle>,
}

impl<D: Clone> Default for UnitOfWork<D> {
    fn default() -> Self {
        Self {
            slots: ChangeTracker::new(),
            cycles: ChangeTracker::new(),
        }
    }
}

impl<D: Clone> UnitOfWork<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.cycles.is_empty()
    }

    /// Hands every recorded change to `accumulator` once. Returns the number of callbacks.
    pub fn flush(&mut self, accumulator: &dyn Accumulator<D>) -> usize {
        let slots = self.slots.drain();
        let cycles = self.cycles.drain();
        for change in &slots {
            accumulator.slot_updated(change.before.as_ref(), change.after.as_ref());
        }
        for change in &cycles {
            accumulator.cycle_updated(change.before.as_ref(), change.after.as_ref());
        }
        slots.len() + cycles.len()
    }

    pub fn discard(&mut self) {
        self.slots.drain();
        self.cycles.drain();
    }
}
