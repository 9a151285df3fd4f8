use std::fmt;

use chrono::TimeDelta;
use core_types::config::{MergeDefaults, PriorityConfig};
use serde::{Deserialize, Serialize};

use crate::{
    error::AnalysisError,
    range::{Timestamp, UtcRange},
    slot::{OwnerKey, SlotKind},
};

pub type AssociationId = u64;

pub const DEFAULT_PRIORITY: i32 = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationOptions {
    /// Do not fetch the slot ending at the association's lower bound for merging.
    pub no_left_merge: bool,
    pub no_right_merge: bool,
    /// The assertion comes from automatic detection rather than an operator.
    pub detected: bool,
}

impl From<MergeDefaults> for AssociationOptions {
    fn from(value: MergeDefaults) -> Self {
        Self {
            no_left_merge: value.no_left_merge,
            no_right_merge: value.no_right_merge,
            detected: false,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisStatus {
    #[default]
    New = 0,
    Pending = 1,
    InProgress = 2,
    StepTimeout = 3,
    PendingSubModifications = 4,
    Completed = 5,
    Error = 6,
    AncestorError = 7,
    NotApplicable = 8,
}

impl AnalysisStatus {
    pub const ALL: [AnalysisStatus; 9] = [
        AnalysisStatus::New,
        AnalysisStatus::Pending,
        AnalysisStatus::InProgress,
        AnalysisStatus::StepTimeout,
        AnalysisStatus::PendingSubModifications,
        AnalysisStatus::Completed,
        AnalysisStatus::Error,
        AnalysisStatus::AncestorError,
        AnalysisStatus::NotApplicable,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn label(self) -> &'static str {
        match self {
            AnalysisStatus::New => "new",
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::InProgress => "in_progress",
            AnalysisStatus::StepTimeout => "step_timeout",
            AnalysisStatus::PendingSubModifications => "pending_sub_modifications",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Error => "error",
            AnalysisStatus::AncestorError => "ancestor_error",
            AnalysisStatus::NotApplicable => "not_applicable",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed
                | AnalysisStatus::Error
                | AnalysisStatus::AncestorError
                | AnalysisStatus::NotApplicable
        )
    }

    pub const fn is_failure(self) -> bool {
        matches!(self, AnalysisStatus::Error | AnalysisStatus::AncestorError)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A pending assertion that `data` held over `range` on one owner's `kind` timeline.
///
/// Progress fields are only written by the step controller; everything else is set when the
/// association is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Association<D> {
    /// Assigned by the store on insert; `0` before that.
    pub id: AssociationId,
    pub owner: OwnerKey,
    pub kind: SlotKind,
    pub range: UtcRange,
    pub data: D,
    pub options: AssociationOptions,
    pub priority: i32,
    pub parent: Option<AssociationId>,
    pub created_at: Timestamp,
    pub version: u32,
    status: AnalysisStatus,
    status_priority: i32,
    next_status: Option<AnalysisStatus>,
    step_span_ms: Option<i64>,
    applied_up_to: Option<Timestamp>,
    last_attempt_start: Option<Timestamp>,
    resume_after: Option<Timestamp>,
    iterations: u32,
    total_duration_ms: i64,
    last_duration_ms: Option<i64>,
    completed_at: Option<Timestamp>,
}

impl<D> Association<D> {
    pub fn new(
        owner: OwnerKey,
        kind: SlotKind,
        range: UtcRange,
        data: D,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: 0,
            owner,
            kind,
            range,
            data,
            options: AssociationOptions::default(),
            priority: DEFAULT_PRIORITY,
            parent: None,
            created_at,
            version: 0,
            status: AnalysisStatus::New,
            status_priority: DEFAULT_PRIORITY,
            next_status: None,
            step_span_ms: None,
            applied_up_to: None,
            last_attempt_start: None,
            resume_after: None,
            iterations: 0,
            total_duration_ms: 0,
            last_duration_ms: None,
            completed_at: None,
        }
    }

    pub fn with_options(mut self, options: AssociationOptions) -> Self {
        self.options = options;
        self
    }

    /// Takes merge suppression from `defaults`, keeping the `detected` flag.
    pub fn with_merge_defaults(mut self, defaults: MergeDefaults) -> Self {
        self.options = AssociationOptions {
            detected: self.options.detected,
            ..defaults.into()
        };
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self.status_priority = priority;
        self
    }

    pub fn with_parent(mut self, parent: AssociationId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn status(&self) -> AnalysisStatus {
        self.status
    }

    /// Scheduling priority; differs from `priority` while pending or in progress.
    pub fn status_priority(&self) -> i32 {
        self.status_priority
    }

    pub fn step_span(&self) -> Option<TimeDelta> {
        self.step_span_ms.map(TimeDelta::milliseconds)
    }

    pub fn applied_up_to(&self) -> Option<Timestamp> {
        self.applied_up_to
    }

    pub fn last_attempt_start(&self) -> Option<Timestamp> {
        self.last_attempt_start
    }

    pub fn resume_after(&self) -> Option<Timestamp> {
        self.resume_after
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn total_duration(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.total_duration_ms)
    }

    pub fn last_duration(&self) -> Option<TimeDelta> {
        self.last_duration_ms.map(TimeDelta::milliseconds)
    }

    pub fn completed_at(&self) -> Option<Timestamp> {
        self.completed_at
    }

    /// Status the association moves to once its sub-associations are done.
    pub fn next_status(&self) -> Option<AnalysisStatus> {
        self.next_status
    }

    /// Part of the range not applied yet.
    pub fn remaining_range(&self) -> UtcRange {
        match self.applied_up_to {
            Some(applied) => self.range.with_lower(Some(applied), true),
            None => self.range,
        }
    }

    pub fn is_ready(&self, now: Timestamp) -> bool {
        self.resume_after.is_none_or(|resume| resume <= now)
    }

    fn check_not_terminal(&self) -> Result<(), AnalysisError> {
        if self.status.is_terminal() {
            return Err(AnalysisError::AlreadyCompleted {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    pub(crate) fn set_step_span(&mut self, span: TimeDelta) {
        self.step_span_ms = Some(span.num_milliseconds());
    }

    pub(crate) fn begin_attempt(&mut self, start: Timestamp) {
        self.last_attempt_start = Some(start);
    }

    pub(crate) fn record_attempt(&mut self, start: Timestamp, end: Timestamp) {
        let elapsed = (end - start).num_milliseconds().max(0);
        self.iterations = self.iterations.saturating_add(1);
        self.total_duration_ms = self.total_duration_ms.saturating_add(elapsed);
        self.last_duration_ms = Some(elapsed);
    }

    pub(crate) fn mark_pending(
        &mut self,
        resume_after: Timestamp,
        priorities: &PriorityConfig,
    ) -> Result<(), AnalysisError> {
        self.check_not_terminal()?;
        self.status = AnalysisStatus::Pending;
        self.status_priority = priorities.pending_priority(self.priority);
        self.resume_after = Some(resume_after);
        Ok(())
    }

    pub(crate) fn mark_in_progress(
        &mut self,
        applied_up_to: Timestamp,
        priorities: &PriorityConfig,
    ) -> Result<(), AnalysisError> {
        self.check_not_terminal()?;
        self.status = AnalysisStatus::InProgress;
        self.status_priority = priorities.in_progress_priority(self.priority);
        self.applied_up_to = Some(applied_up_to);
        self.resume_after = None;
        Ok(())
    }

    pub(crate) fn mark_step_timeout(&mut self) -> Result<(), AnalysisError> {
        self.check_not_terminal()?;
        self.status = AnalysisStatus::StepTimeout;
        Ok(())
    }

    /// Completes, or waits for open sub-associations first.
    pub(crate) fn mark_completed(
        &mut self,
        open_children: bool,
        now: Timestamp,
    ) -> Result<(), AnalysisError> {
        self.check_not_terminal()?;
        self.applied_up_to = None;
        self.resume_after = None;
        if open_children {
            self.next_status = Some(AnalysisStatus::Completed);
            self.status = AnalysisStatus::PendingSubModifications;
        } else {
            self.finish(AnalysisStatus::Completed, now);
        }
        Ok(())
    }

    pub(crate) fn mark_error(&mut self, now: Timestamp) -> Result<(), AnalysisError> {
        self.check_not_terminal()?;
        self.finish(AnalysisStatus::Error, now);
        Ok(())
    }

    pub(crate) fn mark_ancestor_error(&mut self, now: Timestamp) -> Result<(), AnalysisError> {
        self.check_not_terminal()?;
        self.finish(AnalysisStatus::AncestorError, now);
        Ok(())
    }

    /// Business rules decided the assertion does not apply; no slot is touched.
    pub fn mark_not_applicable(&mut self, now: Timestamp) -> Result<(), AnalysisError> {
        self.check_not_terminal()?;
        self.finish(AnalysisStatus::NotApplicable, now);
        Ok(())
    }

    /// Leaves `PendingSubModifications` once every child is terminal. Returns whether it moved.
    pub(crate) fn resolve_sub_modifications(
        &mut self,
        child_statuses: &[AnalysisStatus],
        now: Timestamp,
    ) -> bool {
        if self.status != AnalysisStatus::PendingSubModifications
            || child_statuses.iter().any(|s| !s.is_terminal())
        {
            return false;
        }
        let next = self.next_status.take().unwrap_or(AnalysisStatus::Completed);
        self.finish(next, now);
        true
    }

    fn finish(&mut self, status: AnalysisStatus, now: Timestamp) {
        self.status = status;
        self.status_priority = self.priority;
        self.next_status = None;
        self.completed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn sample() -> Association<&'static str> {
        Association::new(
            OwnerKey::from("M1"),
            SlotKind::Operation,
            UtcRange::between(at(1), at(10)),
            "OpA",
            at(1),
        )
    }

    #[test]
    fn remaining_range_starts_at_applied_progress() {
        let mut association = sample();
        assert_eq!(association.remaining_range(), UtcRange::between(at(1), at(10)));
        association
            .mark_in_progress(at(4), &PriorityConfig::default())
            .unwrap();
        assert_eq!(association.remaining_range(), UtcRange::between(at(4), at(10)));
        assert_eq!(association.status_priority(), DEFAULT_PRIORITY - 1);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut association = sample();
        association.mark_error(at(2)).unwrap();
        assert_eq!(association.status(), AnalysisStatus::Error);
        assert!(association.mark_step_timeout().is_err());
        assert!(matches!(
            association.mark_in_progress(at(3), &PriorityConfig::default()),
            Err(AnalysisError::AlreadyCompleted { .. })
        ));
    }

    #[test]
    fn completion_waits_for_children() {
        let mut association = sample();
        association.mark_completed(true, at(2)).unwrap();
        assert_eq!(association.status(), AnalysisStatus::PendingSubModifications);
        assert_eq!(association.next_status(), Some(AnalysisStatus::Completed));
        assert!(!association.resolve_sub_modifications(&[AnalysisStatus::InProgress], at(3)));
        assert!(association.resolve_sub_modifications(
            &[AnalysisStatus::Completed, AnalysisStatus::NotApplicable],
            at(4)
        ));
        assert_eq!(association.status(), AnalysisStatus::Completed);
        assert_eq!(association.completed_at(), Some(at(4)));
    }

    #[test]
    fn pending_sets_resume_time_and_priority() {
        let mut association = sample().with_priority(50);
        association.mark_pending(at(3), &PriorityConfig::default()).unwrap();
        assert_eq!(association.status(), AnalysisStatus::Pending);
        assert!(!association.is_ready(at(2)));
        assert!(association.is_ready(at(3)));
        assert_eq!(association.status_priority(), 49);
    }

    #[test]
    fn attempts_accumulate_durations() {
        let mut association = sample();
        association.record_attempt(at(1), at(1) + TimeDelta::seconds(3));
        association.record_attempt(at(1), at(1) + TimeDelta::seconds(2));
        assert_eq!(association.iterations(), 2);
        assert_eq!(association.total_duration(), TimeDelta::seconds(5));
        assert_eq!(association.last_duration(), Some(TimeDelta::seconds(2)));
    }
}
