//! Applies one association range to an owner's slot timeline.
//!
//! The existing slots overlapping the range (plus the touching neighbors unless merging is
//! suppressed) are cut into pieces: untouched remainders keep their data, covered parts get the
//! merge contract's data and gaps get the association's data. Touching pieces with equal data
//! are then fused and the result is diffed against the fetched slots, so a slot keeps its id
//! whenever some piece can reuse it.

use log::debug;

use crate::{
    association::Association,
    checker::StepContext,
    error::ReconcileError,
    merge::MergeContract,
    range::UtcRange,
    slot::{Slot, SlotPolicy},
    store::SlotStore,
    tracker::UnitOfWork,
};

/// Slot edits of one step, persisted together.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotChanges<D> {
    pub inserts: Vec<Slot<D>>,
    pub updates: Vec<Slot<D>>,
    pub deletes: Vec<Slot<D>>,
}

impl<D> Default for SlotChanges<D> {
    fn default() -> Self {
        Self {
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

impl<D> SlotChanges<D> {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

struct Piece<D> {
    range: UtcRange,
    data: D,
    /// Indices of the fetched slots this piece was cut from.
    origins: Vec<usize>,
}

pub struct Reconciler<'a, D: Clone> {
    policy: &'a dyn SlotPolicy<D>,
    contract: &'a dyn MergeContract<D>,
}

impl<'a, D: Clone> Reconciler<'a, D> {
    pub fn new(policy: &'a dyn SlotPolicy<D>, contract: &'a dyn MergeContract<D>) -> Self {
        Self { policy, contract }
    }

    /// Reconciles the whole association range and saves the result.
    pub fn insert(
        &self,
        association: &Association<D>,
        store: &dyn SlotStore<D>,
        ctx: &StepContext<'_>,
        uow: &mut UnitOfWork<D>,
    ) -> Result<SlotChanges<D>, ReconcileError> {
        let changes = self.plan(association, &association.range, store, ctx, uow)?;
        if !changes.is_empty() {
            store.save(&changes)?;
        }
        Ok(changes)
    }

    /// Computes the slot edits for `range`, a part of the association range, without saving.
    pub fn plan(
        &self,
        association: &Association<D>,
        range: &UtcRange,
        store: &dyn SlotStore<D>,
        ctx: &StepContext<'_>,
        uow: &mut UnitOfWork<D>,
    ) -> Result<SlotChanges<D>, ReconcileError> {
        if range.is_empty() {
            return Ok(SlotChanges::default());
        }
        validate(association, range)?;

        let originals = self.fetch(association, range, store)?;
        let mut pieces = Vec::with_capacity(originals.len() + 2);
        for (idx, slot) in originals.iter().enumerate() {
            ctx.checkpoint()?;
            self.cut(association, range, idx, slot, &mut pieces)?;
        }
        self.fill_gaps(association, range, &originals, &mut pieces);
        pieces.sort_by(|a, b| a.range.cmp(&b.range));

        let pieces = self.fuse(pieces);
        let gap_free = association.kind.is_gap_free();
        let pieces: Vec<Piece<D>> = pieces
            .into_iter()
            .filter(|p| gap_free || !self.policy.is_empty_data(&p.data))
            .collect();

        let changes = self.diff(association, &originals, pieces, uow);
        debug!(
            "[reconcile] {} {} {range}: {} inserts, {} updates, {} deletes",
            association.owner,
            association.kind,
            changes.inserts.len(),
            changes.updates.len(),
            changes.deletes.len()
        );
        Ok(changes)
    }

    fn fetch(
        &self,
        association: &Association<D>,
        range: &UtcRange,
        store: &dyn SlotStore<D>,
    ) -> Result<Vec<Slot<D>>, ReconcileError> {
        let (owner, kind) = (&association.owner, association.kind);
        let mut slots = store.find_overlapping(owner, kind, range)?;
        if let (false, Some(lower)) = (association.options.no_left_merge, range.lower_value()) {
            slots.extend(store.find_ending_at(owner, kind, lower)?);
        }
        if let (false, Some(upper)) = (association.options.no_right_merge, range.upper_value()) {
            slots.extend(store.find_starting_at(owner, kind, upper)?);
        }
        slots.sort_by(|a, b| a.range.cmp(&b.range));
        slots.dedup_by(|a, b| a.id.is_some() && a.id == b.id);
        Ok(slots)
    }

    fn cut(
        &self,
        association: &Association<D>,
        range: &UtcRange,
        idx: usize,
        slot: &Slot<D>,
        pieces: &mut Vec<Piece<D>>,
    ) -> Result<(), ReconcileError> {
        let covered = slot.range.intersect(range);
        if covered.is_empty() {
            pieces.push(Piece {
                range: slot.range,
                data: slot.data.clone(),
                origins: vec![idx],
            });
            return Ok(());
        }
        if let Some(lower) = range.lower_value() {
            let left = slot.range.intersect(&UtcRange::new(None, Some(lower)));
            if !left.is_empty() {
                pieces.push(Piece {
                    range: left,
                    data: slot.data.clone(),
                    origins: vec![idx],
                });
            }
        }
        let data = self
            .contract
            .merge_data_with_old_slot(association, slot, &covered)?;
        pieces.push(Piece {
            range: covered,
            data,
            origins: vec![idx],
        });
        if let Some(upper) = range.upper_value() {
            let right = slot.range.intersect(&UtcRange::new(Some(upper), None));
            if !right.is_empty() {
                pieces.push(Piece {
                    range: right,
                    data: slot.data.clone(),
                    origins: vec![idx],
                });
            }
        }
        Ok(())
    }

    fn fill_gaps(
        &self,
        association: &Association<D>,
        range: &UtcRange,
        originals: &[Slot<D>],
        pieces: &mut Vec<Piece<D>>,
    ) {
        let mut gaps = Vec::new();
        let mut cursor = range.lower();
        for slot in originals {
            let covered = slot.range.intersect(range);
            if covered.is_empty() {
                continue;
            }
            if covered.lower() > cursor {
                gaps.push(UtcRange::new(cursor.get(), covered.lower_value()));
            }
            if covered.upper() > cursor {
                cursor = covered.upper();
            }
        }
        if cursor < range.upper() {
            gaps.push(UtcRange::new(cursor.get(), range.upper_value()));
        }
        for gap in gaps {
            if let Some(data) = self.contract.gap_data(association, &gap) {
                pieces.push(Piece {
                    range: gap,
                    data,
                    origins: Vec::new(),
                });
            }
        }
    }

    fn fuse(&self, pieces: Vec<Piece<D>>) -> Vec<Piece<D>> {
        let mut fused: Vec<Piece<D>> = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if let Some(last) = fused.last_mut() {
                let touching = last.range.upper_value().is_some()
                    && last.range.upper_value() == piece.range.lower_value();
                if touching && self.policy.reference_data_equals(&last.data, &piece.data) {
                    if let Some(joined) = last.range.union(&piece.range) {
                        last.range = joined;
                        last.origins.extend(piece.origins);
                        continue;
                    }
                }
            }
            fused.push(piece);
        }
        fused
    }

    fn diff(
        &self,
        association: &Association<D>,
        originals: &[Slot<D>],
        pieces: Vec<Piece<D>>,
        uow: &mut UnitOfWork<D>,
    ) -> SlotChanges<D> {
        let mut changes = SlotChanges::default();
        let mut claimed = vec![false; originals.len()];
        for piece in pieces {
            let origin = piece.origins.iter().copied().find(|idx| !claimed[*idx]);
            let Some(idx) = origin else {
                let slot = Slot::new(
                    association.owner.clone(),
                    association.kind,
                    piece.range,
                    piece.data,
                );
                uow.slots.track_new(&slot);
                changes.inserts.push(slot);
                continue;
            };
            claimed[idx] = true;
            let old = &originals[idx];
            if old.range == piece.range && self.policy.reference_data_equals(&old.data, &piece.data) {
                continue;
            }
            let mut updated = old.clone();
            uow.slots.track(&mut updated, |slot, _| {
                slot.range = piece.range;
                slot.data = piece.data;
            });
            changes.updates.push(updated);
        }
        for (idx, old) in originals.iter().enumerate() {
            if !claimed[idx] {
                uow.slots.track_removal(old);
                changes.deletes.push(old.clone());
            }
        }
        changes
    }
}

fn validate<D>(association: &Association<D>, range: &UtcRange) -> Result<(), ReconcileError> {
    if !association.range.contains(range) {
        return Err(ReconcileError::InvalidRange {
            range: range.to_string(),
            reason: "outside the association range",
        });
    }
    let lower_ok = range.lower_value().is_none() || range.lower_inclusive();
    if !lower_ok || range.upper_inclusive() {
        return Err(ReconcileError::InvalidRange {
            range: range.to_string(),
            reason: "slot ranges must be half-open [lower, upper)",
        });
    }
    Ok(())
}
