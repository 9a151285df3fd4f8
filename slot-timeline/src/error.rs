use thiserror::Error;

use crate::{
    association::{AnalysisStatus, AssociationId},
    range::Timestamp,
    slot::{OwnerKey, SlotId, SlotKind},
};

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("malformed range literal {0:?}")]
    Syntax(String),
    #[error("invalid range end {value:?}")]
    Value { value: String },
}

/// Cooperative stop requested at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
    #[error("step timeout reached")]
    StepTimeout,
    #[error("processing cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict for {entity} {id}: expected {expected}, actual {actual}")]
    VersionConflict {
        entity: &'static str,
        id: u64,
        expected: u32,
        actual: u32,
    },
    #[error("{entity} {id} not found")]
    Missing { entity: &'static str, id: u64 },
    #[error("overlapping {kind} slots for owner {owner}: {left} and {right}")]
    Overlap {
        owner: OwnerKey,
        kind: SlotKind,
        left: String,
        right: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("merge conflict on slot {slot:?} over {range}: {detail}")]
    MergeConflict {
        slot: Option<SlotId>,
        range: String,
        detail: String,
    },
    #[error("invalid range {range}: {reason}")]
    InvalidRange { range: String, reason: &'static str },
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("cycle has neither a real begin nor a real end")]
    NoRealBound,
    #[error("cycle begin {begin} is after its end {end}")]
    BeginAfterEnd { begin: Timestamp, end: Timestamp },
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("association {id} is already {status:?}")]
    AlreadyCompleted {
        id: AssociationId,
        status: AnalysisStatus,
    },
    #[error("association {id}: {reason}")]
    Validation { id: AssociationId, reason: String },
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How the step controller reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Shrink the step and retry on a later tick.
    StepTimeout,
    /// Mark the association `Error` and surface it to operators.
    Validation,
    /// Retry the whole step from the last committed progress.
    Conflict,
    /// Leave state untouched; the worker is stopping.
    Interrupted,
    /// Propagate to the caller.
    Fatal,
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    fn disposition(&self) -> Disposition {
        match self {
            StoreError::VersionConflict { .. } => Disposition::Conflict,
            StoreError::Overlap { .. } => Disposition::Validation,
            StoreError::Missing { .. } | StoreError::Io(_) | StoreError::Encoding(_) => {
                Disposition::Fatal
            }
        }
    }
}

impl ReconcileError {
    pub fn disposition(&self) -> Disposition {
        match self {
            ReconcileError::MergeConflict { .. } | ReconcileError::InvalidRange { .. } => {
                Disposition::Validation
            }
            ReconcileError::Interrupted(Interrupt::StepTimeout) => Disposition::StepTimeout,
            ReconcileError::Interrupted(Interrupt::Cancelled) => Disposition::Interrupted,
            ReconcileError::Store(err) => err.disposition(),
        }
    }
}

impl AnalysisError {
    pub fn disposition(&self) -> Disposition {
        match self {
            AnalysisError::AlreadyCompleted { .. } => Disposition::Fatal,
            AnalysisError::Validation { .. } => Disposition::Validation,
            AnalysisError::Reconcile(err) => err.disposition(),
            AnalysisError::Store(err) => err.disposition(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.disposition() == Disposition::Conflict
    }
}
