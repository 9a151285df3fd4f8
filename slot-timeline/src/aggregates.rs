//! Incremental aggregates fed with `(before, after)` pairs from a flushed unit of work.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use chrono::TimeDelta;
use parking_lot::Mutex;

use crate::{
    cycle::OperationCycle,
    slot::{OwnerKey, Slot, SlotId, SlotKind},
};

/// Receives one call per logical edit. `before` is `None` for a new entity and `after` is
/// `None` for a removed one.
pub trait Accumulator<D>: Send + Sync {
    fn slot_updated(&self, _before: Option<&Slot<D>>, _after: Option<&Slot<D>>) {}

    fn cycle_updated(&self, _before: Option<&OperationCycle>, _after: Option<&OperationCycle>) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAccumulator;

impl<D> Accumulator<D> for NoopAccumulator {}

/// Fans every callback out to the registered accumulators in order.
pub struct AccumulatorSet<D> {
    members: Vec<Arc<dyn Accumulator<D>>>,
}

impl<D> Default for AccumulatorSet<D> {
    fn default() -> Self {
        Self {
            members: Vec::new(),
        }
    }
}

impl<D> AccumulatorSet<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, accumulator: Arc<dyn Accumulator<D>>) -> Self {
        self.members.push(accumulator);
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<D> Accumulator<D> for AccumulatorSet<D> {
    fn slot_updated(&self, before: Option<&Slot<D>>, after: Option<&Slot<D>>) {
        for member in &self.members {
            member.slot_updated(before, after);
        }
    }

    fn cycle_updated(&self, before: Option<&OperationCycle>, after: Option<&OperationCycle>) {
        for member in &self.members {
            member.cycle_updated(before, after);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub runs: i64,
    pub duration: TimeDelta,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            runs: 0,
            duration: TimeDelta::zero(),
        }
    }
}

type RunKey<D> = (OwnerKey, SlotKind, D);

/// Number of slots and total bounded duration per owner, kind and reference data.
pub struct RunDurationAccumulator<D> {
    totals: Mutex<HashMap<RunKey<D>, RunSummary>>,
}

impl<D> Default for RunDurationAccumulator<D> {
    fn default() -> Self {
        Self {
            totals: Mutex::new(HashMap::new()),
        }
    }
}

impl<D: Clone + Eq + Hash> RunDurationAccumulator<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self, owner: &OwnerKey, kind: SlotKind, data: &D) -> RunSummary {
        self.totals
            .lock()
            .get(&(owner.clone(), kind, data.clone()))
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<(RunKey<D>, RunSummary)> {
        self.totals
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn apply(&self, slot: &Slot<D>, sign: i64) {
        let mut totals = self.totals.lock();
        let key = (slot.owner.clone(), slot.kind, slot.data.clone());
        let entry = totals.entry(key.clone()).or_default();
        entry.runs += sign;
        // Open-ended slots only count as runs until they get an end.
        if let Some(duration) = slot.duration() {
            entry.duration += duration * sign as i32;
        }
        if entry.runs == 0 && entry.duration.is_zero() {
            totals.remove(&key);
        }
    }
}

impl<D> Accumulator<D> for RunDurationAccumulator<D>
where
    D: Clone + Eq + Hash + Send + Sync,
{
    fn slot_updated(&self, before: Option<&Slot<D>>, after: Option<&Slot<D>>) {
        if let Some(before) = before {
            self.apply(before, -1);
        }
        if let Some(after) = after {
            self.apply(after, 1);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotCycleCounts {
    pub total_cycles: i64,
    pub adjusted_cycles: i64,
    pub adjusted_quantity: i64,
    pub partial_cycles: i64,
}

impl SlotCycleCounts {
    fn add(&mut self, cycle: &OperationCycle, increment: i64) {
        if cycle.full {
            self.total_cycles += increment;
            if let Some(quantity) = cycle.quantity {
                self.adjusted_cycles += increment;
                self.adjusted_quantity += increment * i64::from(quantity);
            }
        } else {
            self.partial_cycles += increment;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_cycles == 0 && self.adjusted_cycles == 0 && self.partial_cycles == 0
    }
}

/// Full and partial cycle counts per slot.
#[derive(Default)]
pub struct SlotCyclesAccumulator {
    counts: Mutex<HashMap<SlotId, SlotCycleCounts>>,
}

impl SlotCyclesAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self, slot: SlotId) -> SlotCycleCounts {
        self.counts.lock().get(&slot).copied().unwrap_or_default()
    }

    fn update(&self, cycle: &OperationCycle, increment: i64) {
        let Some(slot) = cycle.slot else {
            return;
        };
        let mut counts = self.counts.lock();
        let entry = counts.entry(slot).or_default();
        entry.add(cycle, increment);
        if entry.is_empty() {
            counts.remove(&slot);
        }
    }
}

impl<D> Accumulator<D> for SlotCyclesAccumulator {
    fn slot_updated(&self, before: Option<&Slot<D>>, after: Option<&Slot<D>>) {
        if let (Some(before), None) = (before, after) {
            if let Some(id) = before.id {
                self.counts.lock().remove(&id);
            }
        }
    }

    fn cycle_updated(&self, before: Option<&OperationCycle>, after: Option<&OperationCycle>) {
        let changed = match (before, after) {
            (Some(b), Some(a)) => {
                b.slot.is_none()
                    || a.slot.is_none()
                    || b.full != a.full
                    || b.slot != a.slot
                    || b.quantity != a.quantity
                    || b.end() != a.end()
            }
            _ => true,
        };
        if !changed {
            return;
        }
        if let Some(before) = before {
            self.update(before, -1);
        }
        if let Some(after) = after {
            self.update(after, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{Timestamp, UtcRange};
    use chrono::{TimeZone, Utc};

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn slot(id: SlotId, from: u32, to: u32, data: u32) -> Slot<u32> {
        let range = UtcRange::between(at(from), at(to));
        let mut slot = Slot::new(OwnerKey::from("M1"), SlotKind::Operation, range, data);
        slot.id = Some(id);
        slot
    }

    #[test]
    fn run_durations_follow_edits() {
        let acc = RunDurationAccumulator::new();
        let owner = OwnerKey::from("M1");
        acc.slot_updated(None, Some(&slot(1, 0, 10, 7)));
        assert_eq!(
            acc.summary(&owner, SlotKind::Operation, &7),
            RunSummary { runs: 1, duration: TimeDelta::hours(10) }
        );

        acc.slot_updated(Some(&slot(1, 0, 10, 7)), Some(&slot(1, 0, 4, 7)));
        acc.slot_updated(None, Some(&slot(2, 4, 6, 8)));
        acc.slot_updated(None, Some(&slot(3, 6, 10, 7)));
        assert_eq!(
            acc.summary(&owner, SlotKind::Operation, &7),
            RunSummary { runs: 2, duration: TimeDelta::hours(8) }
        );
        assert_eq!(acc.summary(&owner, SlotKind::Operation, &8).duration, TimeDelta::hours(2));

        acc.slot_updated(Some(&slot(2, 4, 6, 8)), None);
        assert_eq!(acc.summary(&owner, SlotKind::Operation, &8), RunSummary::default());
    }

    #[test]
    fn cycle_counts_move_between_slots() {
        let acc = SlotCyclesAccumulator::new();
        let mut cycle = OperationCycle::new(OwnerKey::from("M1"));
        cycle.id = Some(1);
        cycle.set_real_begin(at(1)).unwrap();
        cycle.set_real_end(at(2)).unwrap();
        cycle.full = true;
        cycle.quantity = Some(3);
        cycle.slot = Some(10);
        Accumulator::<u32>::cycle_updated(&acc, None, Some(&cycle));
        assert_eq!(acc.counts(10).total_cycles, 1);
        assert_eq!(acc.counts(10).adjusted_quantity, 3);

        let mut moved = cycle.clone();
        moved.slot = Some(11);
        moved.full = false;
        Accumulator::<u32>::cycle_updated(&acc, Some(&cycle), Some(&moved));
        assert_eq!(acc.counts(10), SlotCycleCounts::default());
        assert_eq!(acc.counts(11).partial_cycles, 1);

        // Unchanged relevant fields: no double counting.
        Accumulator::<u32>::cycle_updated(&acc, Some(&moved), Some(&moved));
        assert_eq!(acc.counts(11).partial_cycles, 1);
    }

    #[test]
    fn set_fans_out_to_members() {
        let runs = Arc::new(RunDurationAccumulator::new());
        let set = AccumulatorSet::new()
            .with(runs.clone())
            .with(Arc::new(SlotCyclesAccumulator::new()));
        assert_eq!(set.len(), 2);
        set.slot_updated(None, Some(&slot(5, 0, 1, 4)));
        assert_eq!(
            runs.summary(&OwnerKey::from("M1"), SlotKind::Operation, &4).runs,
            1
        );
    }
}
