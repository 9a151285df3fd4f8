// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Slot timelines per owner and the machinery that keeps them a partition.
//!
//! Associations assert reference data over a time range. The [`step::StepController`] applies
//! them in bounded, resumable steps through the [`reconcile::Reconciler`], which splits, merges
//! and fills slots so an owner's timeline never overlaps. Slot and cycle edits are captured in a
//! [`tracker::UnitOfWork`] and fed to [`aggregates`] once a step commits.

pub mod aggregates;
pub mod association;
pub mod checker;
pub mod clock;
pub mod cycle;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod range;
pub mod reconcile;
pub mod slot;
pub mod step;
pub mod store;
pub mod tracker;

pub use aggregates::{
    Accumulator, AccumulatorSet, NoopAccumulator, RunDurationAccumulator, SlotCyclesAccumulator,
};
pub use association::{
    AnalysisStatus, Association, AssociationId, AssociationOptions, DEFAULT_PRIORITY,
};
pub use checker::{CancellationToken, LivenessCheck, LivenessChecker, NoopLiveness, StepContext};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cycle::{Attachment, Compatibility, CycleAttacher, CycleId, OperationCycle, classify};
pub use error::{
    AnalysisError, CycleError, Disposition, Interrupt, RangeParseError, ReconcileError, Result,
    StoreError,
};
pub use merge::{FailOnConflict, KeepExisting, MergeContract, MergeContracts, MergeFn, Overwrite};
pub use metrics::{AnalysisMetrics, AnalysisMetricsSnapshot};
pub use range::{Bound, Range, Side, Timestamp, UtcRange};
pub use reconcile::{Reconciler, SlotChanges};
pub use slot::{
    EqualityPolicy, OptionalDataPolicy, OwnerKey, ReferenceData, Slot, SlotId, SlotKind,
    SlotPolicy,
};
pub use step::{StepController, StepReport, TimelineTip};
pub use store::{
    AssociationStore, MemoryAssociationStore, MemorySlotStore, OwnerGuard, OwnerLocks, SlotStore,
};
pub use tracker::{Change, ChangeTracker, Tracked, UnitOfWork};
