use std::fmt;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::range::{Timestamp, UtcRange};

pub type SlotId = u64;

/// Bounds every reference-data payload carried by slots and associations.
pub trait ReferenceData: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> ReferenceData for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Entity whose timeline a slot belongs to, typically a machine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OwnerKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Timelines kept per owner. Each kind is an independent partition.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotKind {
    Operation = 0,
    Reason = 1,
    MachineMode = 2,
    WorkOrder = 3,
    Day = 4,
}

impl SlotKind {
    pub const COUNT: usize = 5;

    pub const ALL: [SlotKind; Self::COUNT] = [
        SlotKind::Operation,
        SlotKind::Reason,
        SlotKind::MachineMode,
        SlotKind::WorkOrder,
        SlotKind::Day,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn label(self) -> &'static str {
        match self {
            SlotKind::Operation => "operation",
            SlotKind::Reason => "reason",
            SlotKind::MachineMode => "machine_mode",
            SlotKind::WorkOrder => "work_order",
            SlotKind::Day => "day",
        }
    }

    /// Gap-free kinds must cover all time; their slots are never dropped as empty.
    pub const fn is_gap_free(self) -> bool {
        matches!(self, SlotKind::Day)
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A stored interval of an owner's timeline carrying reference data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slot<D> {
    /// `None` until the store persists the slot.
    pub id: Option<SlotId>,
    pub owner: OwnerKey,
    pub kind: SlotKind,
    pub range: UtcRange,
    pub data: D,
    pub version: u32,
}

impl<D: Clone> Slot<D> {
    pub fn new(owner: OwnerKey, kind: SlotKind, range: UtcRange, data: D) -> Self {
        Self {
            id: None,
            owner,
            kind,
            range,
            data,
            version: 0,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.id.is_none()
    }

    pub fn begin(&self) -> Option<Timestamp> {
        self.range.lower_value()
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.range.upper_value()
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        self.range.duration()
    }

    /// Copy of this slot restricted to `range`, keeping identity and version.
    pub fn with_range(&self, range: UtcRange) -> Self {
        Self {
            range,
            ..self.clone()
        }
    }

    /// `next` starts exactly where this slot ends on the same timeline and carries equal data.
    pub fn is_mergeable_with(&self, next: &Self, policy: &dyn SlotPolicy<D>) -> bool {
        self.owner == next.owner
            && self.kind == next.kind
            && self.range.upper_value().is_some()
            && self.range.upper_value() == next.range.lower_value()
            && policy.reference_data_equals(&self.data, &next.data)
    }
}

/// Per-kind rules the reconciliation engine consults instead of inspecting data types.
pub trait SlotPolicy<D>: Send + Sync {
    fn reference_data_equals(&self, a: &D, b: &D) -> bool;

    /// A slot left with empty data after a merge is deleted.
    fn is_empty_data(&self, _data: &D) -> bool {
        false
    }
}

/// Plain equality, never empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct EqualityPolicy;

impl<D: PartialEq> SlotPolicy<D> for EqualityPolicy {
    fn reference_data_equals(&self, a: &D, b: &D) -> bool {
        a == b
    }
}

/// For `Option` payloads: `None` means no assertion holds, so such slots are removed.
#[derive(Clone, Copy, Debug, Default)]
pub struct OptionalDataPolicy;

impl<T: PartialEq> SlotPolicy<Option<T>> for OptionalDataPolicy {
    fn reference_data_equals(&self, a: &Option<T>, b: &Option<T>) -> bool {
        a == b
    }

    fn is_empty_data(&self, data: &Option<T>) -> bool {
        data.is_none()
    }
}
