use std::{fmt, sync::Arc};

use crate::{
    association::Association,
    error::ReconcileError,
    range::UtcRange,
    slot::{Slot, SlotKind, SlotPolicy},
};

/// Computes the data of the part of an existing slot that an association covers.
pub trait MergeContract<D: Clone>: Send + Sync {
    fn merge_data_with_old_slot(
        &self,
        association: &Association<D>,
        old: &Slot<D>,
        range: &UtcRange,
    ) -> Result<D, ReconcileError>;

    /// Data for a new slot over a gap inside the association range; `None` leaves the gap open.
    fn gap_data(&self, association: &Association<D>, _range: &UtcRange) -> Option<D> {
        Some(association.data.clone())
    }
}

/// The association's data replaces whatever the slot carried.
#[derive(Clone, Copy, Debug, Default)]
pub struct Overwrite;

impl<D: Clone> MergeContract<D> for Overwrite {
    fn merge_data_with_old_slot(
        &self,
        association: &Association<D>,
        _old: &Slot<D>,
        _range: &UtcRange,
    ) -> Result<D, ReconcileError> {
        Ok(association.data.clone())
    }
}

/// Existing slots win; the association only fills gaps.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepExisting;

impl<D: Clone> MergeContract<D> for KeepExisting {
    fn merge_data_with_old_slot(
        &self,
        _association: &Association<D>,
        old: &Slot<D>,
        _range: &UtcRange,
    ) -> Result<D, ReconcileError> {
        Ok(old.data.clone())
    }
}

/// Rejects an association that disagrees with non-empty existing data.
pub struct FailOnConflict<P> {
    policy: P,
}

impl<P> FailOnConflict<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }
}

impl<D, P> MergeContract<D> for FailOnConflict<P>
where
    D: Clone + fmt::Debug,
    P: SlotPolicy<D>,
{
    fn merge_data_with_old_slot(
        &self,
        association: &Association<D>,
        old: &Slot<D>,
        range: &UtcRange,
    ) -> Result<D, ReconcileError> {
        if self.policy.is_empty_data(&old.data)
            || self.policy.reference_data_equals(&old.data, &association.data)
        {
            return Ok(association.data.clone());
        }
        Err(ReconcileError::MergeConflict {
            slot: old.id,
            range: range.to_string(),
            detail: format!("existing {:?}, asserted {:?}", old.data, association.data),
        })
    }
}

/// Adapts a closure into a contract.
pub struct MergeFn<F> {
    merge: F,
}

impl<F> MergeFn<F> {
    pub fn new(merge: F) -> Self {
        Self { merge }
    }
}

impl<D, F> MergeContract<D> for MergeFn<F>
where
    D: Clone,
    F: Fn(&Association<D>, &Slot<D>, &UtcRange) -> Result<D, ReconcileError> + Send + Sync,
{
    fn merge_data_with_old_slot(
        &self,
        association: &Association<D>,
        old: &Slot<D>,
        range: &UtcRange,
    ) -> Result<D, ReconcileError> {
        (self.merge)(association, old, range)
    }
}

/// Contract per slot kind, resolved by value. Kinds without an entry use the fallback.
pub struct MergeContracts<D: Clone> {
    by_kind: [Option<Arc<dyn MergeContract<D>>>; SlotKind::COUNT],
    fallback: Arc<dyn MergeContract<D>>,
}

impl<D: Clone + 'static> Default for MergeContracts<D> {
    fn default() -> Self {
        Self::new(Arc::new(Overwrite))
    }
}

impl<D: Clone> MergeContracts<D> {
    pub fn new(fallback: Arc<dyn MergeContract<D>>) -> Self {
        Self {
            by_kind: Default::default(),
            fallback,
        }
    }

    pub fn with(mut self, kind: SlotKind, contract: Arc<dyn MergeContract<D>>) -> Self {
        self.by_kind[kind.index()] = Some(contract);
        self
    }

    pub fn get(&self, kind: SlotKind) -> &dyn MergeContract<D> {
        self.by_kind[kind.index()]
            .as_deref()
            .unwrap_or(self.fallback.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        range::Timestamp,
        slot::{EqualityPolicy, OwnerKey},
    };
    use chrono::{TimeZone, Utc};

    fn at(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn association(data: &'static str) -> Association<&'static str> {
        Association::new(
            OwnerKey::from("M1"),
            SlotKind::Operation,
            UtcRange::between(at(2), at(4)),
            data,
            at(1),
        )
    }

    fn old(data: &'static str) -> Slot<&'static str> {
        Slot::new(OwnerKey::from("M1"), SlotKind::Operation, UtcRange::between(at(1), at(5)), data)
    }

    #[test]
    fn fail_on_conflict_accepts_equal_data_only() {
        let contract = FailOnConflict::new(EqualityPolicy);
        let range = UtcRange::between(at(2), at(4));
        assert_eq!(
            contract
                .merge_data_with_old_slot(&association("OpA"), &old("OpA"), &range)
                .unwrap(),
            "OpA"
        );
        let err = contract
            .merge_data_with_old_slot(&association("OpB"), &old("OpA"), &range)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MergeConflict { .. }));
    }

    #[test]
    fn contracts_resolve_per_kind() {
        let contracts = MergeContracts::default().with(SlotKind::Reason, Arc::new(KeepExisting));
        let range = UtcRange::between(at(2), at(4));
        let reason = contracts
            .get(SlotKind::Reason)
            .merge_data_with_old_slot(&association("new"), &old("old"), &range)
            .unwrap();
        assert_eq!(reason, "old");
        let operation = contracts
            .get(SlotKind::Operation)
            .merge_data_with_old_slot(&association("new"), &old("old"), &range)
            .unwrap();
        assert_eq!(operation, "new");
    }
}
