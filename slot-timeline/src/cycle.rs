//! Machining cycles and their compatibility with operation slots.
//!
//! [`classify`] is the pure decision table. [`CycleAttacher`] runs it over the candidate slots
//! of one owner, picks the slot to attach to and records the cycle edits in a [`UnitOfWork`].

use chrono::TimeDelta;
use core_types::config::CycleConfig;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::CycleError,
    range::{Timestamp, UtcRange},
    slot::{OwnerKey, Slot, SlotId, SlotPolicy},
    tracker::UnitOfWork,
};

pub type CycleId = u64;

/// One begin/end occurrence of an activity. Either end may be an estimate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationCycle {
    pub id: Option<CycleId>,
    pub owner: OwnerKey,
    begin: Option<Timestamp>,
    end: Option<Timestamp>,
    begin_estimated: bool,
    end_estimated: bool,
    /// Both ends were observed in the same slot (or continuous slots).
    pub full: bool,
    pub slot: Option<SlotId>,
    pub quantity: Option<u32>,
}

impl OperationCycle {
    pub fn new(owner: OwnerKey) -> Self {
        Self {
            id: None,
            owner,
            begin: None,
            end: None,
            begin_estimated: false,
            end_estimated: false,
            full: false,
            slot: None,
            quantity: None,
        }
    }

    pub fn begin(&self) -> Option<Timestamp> {
        self.begin
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    pub fn is_begin_estimated(&self) -> bool {
        self.begin_estimated
    }

    pub fn is_end_estimated(&self) -> bool {
        self.end_estimated
    }

    pub fn real_begin(&self) -> Option<Timestamp> {
        self.begin.filter(|_| !self.begin_estimated)
    }

    pub fn real_end(&self) -> Option<Timestamp> {
        self.end.filter(|_| !self.end_estimated)
    }

    /// Real end when known, otherwise the begin.
    pub fn sort_key(&self) -> Option<Timestamp> {
        self.real_end().or(self.begin)
    }

    pub fn set_real_begin(&mut self, begin: Timestamp) -> Result<(), CycleError> {
        self.set_begin(Some(begin), false)
    }

    pub fn set_real_end(&mut self, end: Timestamp) -> Result<(), CycleError> {
        self.set_end(Some(end), false)
    }

    pub fn set_estimated_begin(&mut self, begin: Option<Timestamp>) -> Result<(), CycleError> {
        self.set_begin(begin, true)
    }

    pub fn set_estimated_end(&mut self, end: Option<Timestamp>) -> Result<(), CycleError> {
        self.set_end(end, true)
    }

    fn set_begin(&mut self, begin: Option<Timestamp>, estimated: bool) -> Result<(), CycleError> {
        check_order(begin, self.end)?;
        self.begin = begin;
        self.begin_estimated = estimated && begin.is_some();
        Ok(())
    }

    fn set_end(&mut self, end: Option<Timestamp>, estimated: bool) -> Result<(), CycleError> {
        check_order(self.begin, end)?;
        self.end = end;
        self.end_estimated = estimated && end.is_some();
        Ok(())
    }
}

fn check_order(begin: Option<Timestamp>, end: Option<Timestamp>) -> Result<(), CycleError> {
    match (begin, end) {
        (Some(begin), Some(end)) if begin > end => Err(CycleError::BeginAfterEnd { begin, end }),
        _ => Ok(()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compatibility {
    None,
    Full,
    /// The cycle begins in this slot but must be split: its end belongs elsewhere.
    BeginOnly,
    EndOnly,
    AdjustEstimatedBegin,
    AdjustEstimatedEnd,
}

impl Compatibility {
    pub fn is_compatible(self) -> bool {
        matches!(
            self,
            Compatibility::Full
                | Compatibility::AdjustEstimatedBegin
                | Compatibility::AdjustEstimatedEnd
        )
    }

    pub fn requires_split(self) -> bool {
        matches!(self, Compatibility::BeginOnly | Compatibility::EndOnly)
    }

    pub fn begin_matches(self) -> bool {
        matches!(
            self,
            Compatibility::Full | Compatibility::BeginOnly | Compatibility::AdjustEstimatedEnd
        )
    }

    pub fn end_matches(self) -> bool {
        matches!(
            self,
            Compatibility::Full | Compatibility::EndOnly | Compatibility::AdjustEstimatedBegin
        )
    }
}

/// Decides how `cycle` relates to `slot`.
///
/// `margin` tolerates a real begin slightly before the slot, and ignores a real begin in the
/// last moments of the slot. A slot no longer than `margin` has no such last moments: a cycle
/// starting anywhere in it is at least `BeginOnly`. `continuity` answers whether the given range is covered by the
/// same activity as `slot`, in which case a cycle crossing the slot edge still counts as full.
pub fn classify<D: Clone>(
    cycle: &OperationCycle,
    slot: &Slot<D>,
    margin: TimeDelta,
    continuity: impl Fn(&UtcRange) -> bool,
) -> Result<Compatibility, CycleError> {
    if cycle.owner != slot.owner {
        return Ok(Compatibility::None);
    }
    let range = &slot.range;
    let ends_here = |end: Timestamp| range.contains_value(end) || range.upper_value() == Some(end);

    match (cycle.real_begin(), cycle.real_end()) {
        (Some(begin), Some(end)) => {
            let cycle_range = if begin == end {
                UtcRange::point(begin)
            } else {
                UtcRange::between(begin, end)
            };
            if range.contains(&cycle_range) {
                return Ok(Compatibility::Full);
            }
            if ends_here(end) {
                let Some(lower) = range.lower_value() else {
                    return Ok(Compatibility::Full);
                };
                let extended = match lower.checked_sub_signed(margin) {
                    Some(early) => range.with_lower(Some(early), true),
                    None => range.with_lower(None, false),
                };
                if extended.contains_value(begin) || continuity(&UtcRange::between(begin, lower)) {
                    return Ok(Compatibility::Full);
                }
                return Ok(Compatibility::EndOnly);
            }
            if range.contains_value(begin) {
                let Some(upper) = range.upper_value() else {
                    return Ok(Compatibility::Full);
                };
                let cut = upper
                    .checked_sub_signed(margin)
                    .filter(|cut| range.lower_value().is_none_or(|lower| *cut > lower));
                if cut.is_some_and(|cut| begin >= cut) {
                    return Ok(Compatibility::None);
                }
                if continuity(&UtcRange::between(upper, end)) {
                    return Ok(Compatibility::Full);
                }
                return Ok(Compatibility::BeginOnly);
            }
            Ok(Compatibility::None)
        }
        (None, Some(end)) if ends_here(end) => Ok(Compatibility::AdjustEstimatedBegin),
        (Some(begin), None) if range.contains_value(begin) => Ok(Compatibility::AdjustEstimatedEnd),
        (None, None) => Err(CycleError::NoRealBound),
        _ => Ok(Compatibility::None),
    }
}

/// Where a cycle ended up.
#[derive(Clone, Debug, PartialEq)]
pub enum Attachment {
    Attach {
        slot: SlotId,
        compatibility: Compatibility,
    },
    /// The cycle now ends in `end_slot`; `partial` is the new begin part in `begin_slot`.
    Split {
        begin_slot: SlotId,
        end_slot: SlotId,
        partial: OperationCycle,
    },
    /// Several slots qualify with different reference data at the same boundary.
    Unattachable,
    /// No candidate slot fits.
    Detached,
}

enum Choice {
    One(usize, Compatibility),
    Split { begin: usize, end: usize },
    Ambiguous,
    Nothing,
}

#[derive(Clone, Copy, Debug)]
pub struct CycleAttacher {
    margin: TimeDelta,
}

impl CycleAttacher {
    pub fn new(margin: TimeDelta) -> Self {
        Self { margin }
    }

    pub fn from_config(config: &CycleConfig) -> Self {
        Self::new(config.association_margin())
    }

    pub fn classify_all<D: Clone>(
        &self,
        cycle: &OperationCycle,
        candidates: &[Slot<D>],
        policy: &dyn SlotPolicy<D>,
    ) -> Result<Vec<Compatibility>, CycleError> {
        candidates
            .iter()
            .map(|slot| {
                classify(cycle, slot, self.margin, |gap| {
                    is_continuous(slot, gap, candidates, policy)
                })
            })
            .collect()
    }

    /// Attaches `cycle` to one of `candidates` (persisted slots of the cycle's owner, ascending)
    /// and records the cycle edits in `uow`.
    pub fn attach<D: Clone>(
        &self,
        cycle: &mut OperationCycle,
        candidates: &[Slot<D>],
        policy: &dyn SlotPolicy<D>,
        uow: &mut UnitOfWork<D>,
    ) -> Result<Attachment, CycleError> {
        let compat = self.classify_all(cycle, candidates, policy)?;
        let choice = choose(&compat, candidates, policy);
        match choice {
            Choice::One(idx, compatibility) => {
                let slot = &candidates[idx];
                let Some(slot_id) = slot.id else {
                    return Ok(Attachment::Detached);
                };
                uow.cycles.track(cycle, |c, _| -> Result<(), CycleError> {
                    match compatibility {
                        Compatibility::AdjustEstimatedBegin => {
                            if let Some(lower) = slot.begin() {
                                c.set_estimated_begin(Some(lower))?;
                            }
                            c.full = true;
                        }
                        Compatibility::AdjustEstimatedEnd => {
                            c.set_estimated_end(slot.end())?;
                            c.full = false;
                        }
                        Compatibility::Full => c.full = true,
                        _ => c.full = false,
                    }
                    c.slot = Some(slot_id);
                    Ok(())
                })?;
                debug!("[cycle] {} attached to slot {slot_id} as {compatibility:?}", cycle.owner);
                Ok(Attachment::Attach {
                    slot: slot_id,
                    compatibility,
                })
            }
            Choice::Split { begin, end } => {
                let (begin_slot, end_slot) = (&candidates[begin], &candidates[end]);
                let (Some(begin_id), Some(end_id)) = (begin_slot.id, end_slot.id) else {
                    return Ok(Attachment::Detached);
                };
                let mut partial = OperationCycle::new(cycle.owner.clone());
                if let Some(real_begin) = cycle.real_begin() {
                    partial.set_real_begin(real_begin)?;
                }
                partial.set_estimated_end(begin_slot.end())?;
                partial.quantity = cycle.quantity;
                partial.slot = Some(begin_id);
                uow.cycles.track(cycle, |c, _| -> Result<(), CycleError> {
                    c.set_estimated_begin(end_slot.begin())?;
                    c.full = true;
                    c.slot = Some(end_id);
                    Ok(())
                })?;
                uow.cycles.track_new(&partial);
                debug!(
                    "[cycle] {} split between slots {begin_id} and {end_id}",
                    cycle.owner
                );
                Ok(Attachment::Split {
                    begin_slot: begin_id,
                    end_slot: end_id,
                    partial,
                })
            }
            Choice::Ambiguous => {
                self.detach(cycle, uow);
                debug!("[cycle] {} is unattachable: ambiguous candidates", cycle.owner);
                Ok(Attachment::Unattachable)
            }
            Choice::Nothing => {
                self.detach(cycle, uow);
                Ok(Attachment::Detached)
            }
        }
    }

    fn detach<D: Clone>(&self, cycle: &mut OperationCycle, uow: &mut UnitOfWork<D>) {
        if cycle.slot.is_some() {
            uow.cycles.track(cycle, |c, _| {
                c.slot = None;
                c.full = false;
            });
        }
    }
}

fn choose<D>(compat: &[Compatibility], candidates: &[Slot<D>], policy: &dyn SlotPolicy<D>) -> Choice {
    let pick = |wanted: &dyn Fn(Compatibility) -> bool| -> Option<Choice> {
        let matching: Vec<usize> = (0..compat.len()).filter(|i| wanted(compat[*i])).collect();
        let first = *matching.first()?;
        let same_data = matching
            .iter()
            .all(|i| policy.reference_data_equals(&candidates[first].data, &candidates[*i].data));
        Some(if same_data {
            Choice::One(first, compat[first])
        } else {
            Choice::Ambiguous
        })
    };

    if let Some(choice) = pick(&|c: Compatibility| c == Compatibility::Full) {
        return choice;
    }
    let begin = compat.iter().position(|c| *c == Compatibility::BeginOnly);
    let end = compat.iter().position(|c| *c == Compatibility::EndOnly);
    if let (Some(begin), Some(end)) = (begin, end) {
        return Choice::Split { begin, end };
    }
    if let Some(choice) = pick(&Compatibility::is_compatible) {
        return choice;
    }
    if let Some(choice) = pick(&Compatibility::requires_split) {
        return choice;
    }
    Choice::Nothing
}

/// `gap` is covered without holes by candidate slots carrying the same data as `slot`.
fn is_continuous<D>(
    slot: &Slot<D>,
    gap: &UtcRange,
    candidates: &[Slot<D>],
    policy: &dyn SlotPolicy<D>,
) -> bool {
    if gap.is_empty() {
        return true;
    }
    let mut covered = gap.lower();
    for other in candidates {
        if !other.range.overlaps(gap) || !policy.reference_data_equals(&slot.data, &other.data) {
            continue;
        }
        if other.range.lower() > covered {
            return false;
        }
        if other.range.upper() > covered {
            covered = other.range.upper();
        }
        if covered >= gap.upper() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{EqualityPolicy, SlotKind};
    use chrono::{TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
    }

    fn slot(id: SlotId, from: Timestamp, to: Timestamp, data: &'static str) -> Slot<&'static str> {
        let range = UtcRange::between(from, to);
        let mut slot = Slot::new(OwnerKey::from("M1"), SlotKind::Operation, range, data);
        slot.id = Some(id);
        slot
    }

    fn cycle(begin: Option<Timestamp>, end: Option<Timestamp>) -> OperationCycle {
        let mut cycle = OperationCycle::new(OwnerKey::from("M1"));
        if let Some(begin) = begin {
            cycle.set_real_begin(begin).unwrap();
        }
        if let Some(end) = end {
            cycle.set_real_end(end).unwrap();
        }
        cycle
    }

    fn margin() -> TimeDelta {
        TimeDelta::seconds(20)
    }

    #[test]
    fn classification_table() {
        let full = cycle(Some(at(10, 0)), Some(at(10, 30)));
        let s = slot(1, at(9, 0), at(11, 0), "OpA");
        assert_eq!(classify(&full, &s, margin(), |_| false).unwrap(), Compatibility::Full);

        let end_only = cycle(None, Some(at(10, 30)));
        let s = slot(1, at(10, 0), at(11, 0), "OpA");
        assert_eq!(
            classify(&end_only, &s, margin(), |_| false).unwrap(),
            Compatibility::AdjustEstimatedBegin
        );

        let crossing = cycle(Some(at(10, 0)), Some(at(12, 30)));
        let s = slot(1, at(9, 0), at(10, 15), "OpA");
        assert_eq!(
            classify(&crossing, &s, margin(), |_| false).unwrap(),
            Compatibility::BeginOnly
        );
        assert_eq!(classify(&crossing, &s, margin(), |_| true).unwrap(), Compatibility::Full);
    }

    #[test]
    fn end_touching_upper_edge_counts_as_inside() {
        let c = cycle(None, Some(at(11, 0)));
        let s = slot(1, at(10, 0), at(11, 0), "OpA");
        assert_eq!(classify(&c, &s, margin(), |_| false).unwrap(), Compatibility::AdjustEstimatedBegin);

        let c = cycle(Some(at(10, 59)), Some(at(11, 0)));
        assert_eq!(classify(&c, &s, margin(), |_| false).unwrap(), Compatibility::Full);
    }

    #[test]
    fn margin_tolerates_early_begin_and_ignores_late_begin() {
        let s = slot(1, at(10, 0), at(11, 0), "OpA");
        let early = cycle(Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 59, 50).unwrap()), Some(at(10, 30)));
        assert_eq!(classify(&early, &s, margin(), |_| false).unwrap(), Compatibility::Full);

        let late = cycle(Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 59, 50).unwrap()), Some(at(11, 30)));
        assert_eq!(classify(&late, &s, margin(), |_| true).unwrap(), Compatibility::None);
    }

    #[test]
    fn slot_shorter_than_margin_keeps_its_begin() {
        let begin = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 5).unwrap();
        let s = slot(1, at(10, 0), begin + TimeDelta::seconds(10), "OpA");
        let c = cycle(Some(begin), Some(at(10, 30)));
        assert_eq!(classify(&c, &s, margin(), |_| false).unwrap(), Compatibility::BeginOnly);
        assert_eq!(classify(&c, &s, margin(), |_| true).unwrap(), Compatibility::Full);
    }

    #[test]
    fn no_real_bound_is_an_error() {
        let mut c = OperationCycle::new(OwnerKey::from("M1"));
        c.set_estimated_begin(Some(at(10, 0))).unwrap();
        let s = slot(1, at(9, 0), at(11, 0), "OpA");
        assert!(matches!(classify(&c, &s, margin(), |_| false), Err(CycleError::NoRealBound)));
        assert_eq!(c.sort_key(), Some(at(10, 0)));
    }

    #[test]
    fn begin_after_end_is_rejected() {
        let mut c = cycle(Some(at(10, 0)), None);
        assert!(matches!(c.set_real_end(at(9, 0)), Err(CycleError::BeginAfterEnd { .. })));
        assert_eq!(c.end(), None);
    }

    #[test]
    fn attacher_splits_across_distinct_operations() {
        let candidates = vec![
            slot(1, at(9, 0), at(10, 15), "OpA"),
            slot(2, at(10, 15), at(13, 0), "OpB"),
        ];
        let mut c = cycle(Some(at(10, 0)), Some(at(12, 30)));
        c.id = Some(40);
        let mut uow = UnitOfWork::<&'static str>::new();
        let attachment = CycleAttacher::new(margin())
            .attach(&mut c, &candidates, &EqualityPolicy, &mut uow)
            .unwrap();
        let (begin_slot, end_slot, partial) = match attachment {
            Attachment::Split { begin_slot, end_slot, partial } => (begin_slot, end_slot, partial),
            other => panic!("expected split, got {other:?}"),
        };
        assert_eq!((begin_slot, end_slot), (1, 2));
        assert_eq!(partial.real_begin(), Some(at(10, 0)));
        assert_eq!(partial.end(), Some(at(10, 15)));
        assert!(partial.is_end_estimated());
        assert_eq!(c.slot, Some(2));
        assert_eq!(c.begin(), Some(at(10, 15)));
        assert!(c.is_begin_estimated() && c.full);
        assert_eq!(uow.cycles.len(), 2);
    }

    #[test]
    fn attacher_keeps_full_cycle_over_continuous_operation() {
        let candidates = vec![
            slot(1, at(9, 0), at(10, 15), "OpA"),
            slot(2, at(10, 15), at(13, 0), "OpA"),
        ];
        let mut c = cycle(Some(at(10, 0)), Some(at(12, 30)));
        let mut uow = UnitOfWork::<&'static str>::new();
        let attachment = CycleAttacher::new(margin())
            .attach(&mut c, &candidates, &EqualityPolicy, &mut uow)
            .unwrap();
        assert_eq!(
            attachment,
            Attachment::Attach { slot: 1, compatibility: Compatibility::Full }
        );
        assert!(c.full);
    }

    #[test]
    fn attacher_reports_ambiguous_boundary() {
        // Both slots share 11:00 and the cycle's only real bound sits exactly there.
        let candidates = vec![
            slot(1, at(10, 0), at(11, 0), "OpA"),
            slot(2, at(11, 0), at(12, 0), "OpB"),
        ];
        let c = cycle(None, Some(at(11, 0)));
        let compat = CycleAttacher::new(margin())
            .classify_all(&c, &candidates, &EqualityPolicy)
            .unwrap();
        assert_eq!(compat[0], Compatibility::AdjustEstimatedBegin);
        assert_eq!(compat[1], Compatibility::AdjustEstimatedBegin);

        let mut c = c;
        c.slot = Some(9);
        let mut uow = UnitOfWork::<&'static str>::new();
        let attachment = CycleAttacher::new(margin())
            .attach(&mut c, &candidates, &EqualityPolicy, &mut uow)
            .unwrap();
        assert_eq!(attachment, Attachment::Unattachable);
        assert_eq!(c.slot, None);
    }
}
