// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Bounded, resumable processing of one association.
//!
//! Each call to [`StepController::process`] reconciles one step of the association's remaining
//! range under the owner lock, commits the slot edits, and records progress on the association.
//! A step that outruns its budget is abandoned and the next call uses a smaller span; a fast
//! step lets the span grow again. Progress only moves at committed step boundaries, so any
//! failure resumes from a consistent point.

use std::sync::Arc;

use chrono::TimeDelta;
use core_types::{
    config::{AnalysisConfig, MergeDefaults, PendingConfig, PriorityConfig, StepConfig},
    retry::RetryPolicy,
};
use log::{debug, error, info, warn};

use crate::{
    aggregates::{Accumulator, NoopAccumulator},
    association::{AnalysisStatus, Association, AssociationId},
    checker::{CancellationToken, LivenessCheck, StepContext},
    clock::{Clock, SystemClock},
    error::{AnalysisError, Disposition, ReconcileError, Result},
    merge::MergeContracts,
    metrics::AnalysisMetrics,
    range::{Bound, Timestamp, UtcRange},
    reconcile::{Reconciler, SlotChanges},
    slot::{OwnerKey, ReferenceData, SlotKind, SlotPolicy},
    store::{AssociationStore, OwnerGuard, SlotStore},
    tracker::UnitOfWork,
};

/// Latest instant up to which an owner's input data is known.
pub trait TimelineTip: Send + Sync {
    fn tip(&self, owner: &OwnerKey, kind: SlotKind) -> Option<Timestamp>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub association: AssociationId,
    pub status: AnalysisStatus,
    /// Range reconciled by this call; empty when nothing was applied.
    pub step_range: UtcRange,
    pub applied_up_to: Option<Timestamp>,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub elapsed: TimeDelta,
}

impl StepReport {
    fn idle(association: &Association<impl Clone>) -> Self {
        Self {
            association: association.id,
            status: association.status(),
            step_range: UtcRange::empty(),
            applied_up_to: association.applied_up_to(),
            inserted: 0,
            updated: 0,
            deleted: 0,
            elapsed: TimeDelta::zero(),
        }
    }
}

pub struct StepController<D: Clone> {
    slots: Arc<dyn SlotStore<D>>,
    associations: Arc<dyn AssociationStore<D>>,
    policy: Arc<dyn SlotPolicy<D>>,
    contracts: MergeContracts<D>,
    accumulator: Arc<dyn Accumulator<D>>,
    clock: Arc<dyn Clock>,
    tip: Option<Arc<dyn TimelineTip>>,
    metrics: Arc<AnalysisMetrics>,
    retry: RetryPolicy,
    step: StepConfig,
    priority: PriorityConfig,
    pending: PendingConfig,
    merge: MergeDefaults,
}

impl<D: ReferenceData> StepController<D> {
    pub fn new(
        slots: Arc<dyn SlotStore<D>>,
        associations: Arc<dyn AssociationStore<D>>,
        policy: Arc<dyn SlotPolicy<D>>,
        config: &AnalysisConfig,
    ) -> Self {
        Self {
            slots,
            associations,
            policy,
            contracts: MergeContracts::default(),
            accumulator: Arc::new(NoopAccumulator),
            clock: Arc::new(SystemClock),
            tip: None,
            metrics: AnalysisMetrics::new(),
            retry: RetryPolicy::from_config(&config.conflict),
            step: config.step.clone(),
            priority: config.priority.clone(),
            pending: config.pending.clone(),
            merge: config.merge,
        }
    }

    pub fn with_contracts(mut self, contracts: MergeContracts<D>) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn with_accumulator(mut self, accumulator: Arc<dyn Accumulator<D>>) -> Self {
        self.accumulator = accumulator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tip(mut self, tip: Arc<dyn TimelineTip>) -> Self {
        self.tip = Some(tip);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AnalysisMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn metrics(&self) -> &Arc<AnalysisMetrics> {
        &self.metrics
    }

    pub fn slots(&self) -> &Arc<dyn SlotStore<D>> {
        &self.slots
    }

    pub fn associations(&self) -> &Arc<dyn AssociationStore<D>> {
        &self.associations
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// A new association created now, with the configured merge suppression.
    pub fn new_association(
        &self,
        owner: OwnerKey,
        kind: SlotKind,
        range: UtcRange,
        data: D,
    ) -> Association<D> {
        Association::new(owner, kind, range, data, self.clock.now()).with_merge_defaults(self.merge)
    }

    /// Runs one step of association `id`, waiting for its owner's lock.
    pub fn process(
        &self,
        id: AssociationId,
        liveness: &dyn LivenessCheck,
        cancel: &CancellationToken,
    ) -> Result<StepReport> {
        let owner = self.associations.load(id)?.owner;
        liveness.pause_check();
        let guard = self.slots.lock(&owner);
        liveness.resume_check();
        self.process_guarded(id, &guard, liveness, cancel)
    }

    /// Runs one step while the caller already holds the owner lock. Version conflicts restart
    /// the step from the last committed progress.
    pub fn process_guarded(
        &self,
        id: AssociationId,
        guard: &OwnerGuard<'_>,
        liveness: &dyn LivenessCheck,
        cancel: &CancellationToken,
    ) -> Result<StepReport> {
        self.retry.retry(
            |attempt| {
                if attempt > 0 {
                    self.metrics.record_conflict();
                    debug!("[step] association {id}: retrying after version conflict");
                }
                self.attempt(id, guard, liveness, cancel)
            },
            AnalysisError::is_conflict,
        )
    }

    fn attempt(
        &self,
        id: AssociationId,
        guard: &OwnerGuard<'_>,
        liveness: &dyn LivenessCheck,
        cancel: &CancellationToken,
    ) -> Result<StepReport> {
        let started = self.clock.now();
        let mut association = self.associations.load(id)?;
        if guard.owner() != &association.owner {
            return Err(AnalysisError::Validation {
                id,
                reason: format!("owner lock held for {}, not {}", guard.owner(), association.owner),
            });
        }
        let before = association.status();
        if before.is_terminal() {
            return Ok(StepReport::idle(&association));
        }
        if let Some(parent) = association.parent {
            if self.associations.load(parent)?.status().is_failure() {
                association.mark_ancestor_error(started)?;
                self.commit_status(&mut association, before)?;
                self.cascade_ancestor_error(id, started)?;
                warn!("[step] association {id}: ancestor {parent} failed");
                return Ok(StepReport::idle(&association));
            }
        }
        if before == AnalysisStatus::PendingSubModifications {
            self.resolve_sub_modifications(&mut association, started)?;
            return Ok(StepReport::idle(&association));
        }
        if !association.is_ready(started) {
            return Ok(StepReport::idle(&association));
        }

        association.begin_attempt(started);
        let default_range = association.remaining_range();
        if default_range.is_empty() {
            return self.finish(association, before, default_range, SlotChanges::default(), started);
        }

        let lower_step_possible = self.adjust_step_span(&mut association, before, &default_range);
        let active = default_range.lower_value().is_some_and(|lower| lower < started);
        if active && association.step_span().is_none() && default_range.upper_value().is_none() {
            association.set_step_span(self.step.no_end_span());
        }
        let mut step_range = default_range;
        if let (true, Some(span), Some(lower)) =
            (active, association.step_span(), default_range.lower_value())
        {
            // Past the representable range the step runs to the association's own upper bound.
            if let Some(limit) = lower.checked_add_signed(span) {
                if step_range.upper() > Bound::upper(Some(limit)) {
                    step_range = step_range.with_upper(Some(limit), false);
                }
            }
        }

        if let Some(tip) = self.tip.as_ref().and_then(|t| t.tip(&association.owner, association.kind)) {
            if step_range.lower() >= Bound::lower(Some(tip)) {
                let resume_after = started
                    .checked_add_signed(self.pending.retry_delay())
                    .unwrap_or(Timestamp::MAX_UTC);
                association.mark_pending(resume_after, &self.priority)?;
                self.commit_status(&mut association, before)?;
                self.metrics.record_deferred();
                debug!("[step] association {id}: waiting for data beyond {tip} until {resume_after}");
                return Ok(StepReport::idle(&association));
            }
            if step_range.upper() > Bound::upper(Some(tip)) {
                step_range = step_range.with_upper(Some(tip), false);
            }
        }

        let ctx = StepContext::new(self.clock.as_ref(), liveness, cancel);
        let ctx = if active && lower_step_possible {
            ctx.with_budget(started, self.step.timeout())
        } else {
            ctx
        };
        let mut uow = UnitOfWork::new();
        let committed = self.reconcile(&association, &step_range, &ctx, &mut uow);
        match committed {
            Ok(changes) => {
                uow.flush(self.accumulator.as_ref());
                self.finish(association, before, step_range, changes, started)
            }
            Err(err) => {
                uow.discard();
                self.handle_failure(association, before, step_range, err, started)
            }
        }
    }

    /// Halves the span after a timeout. Returns whether an even smaller step is possible.
    fn adjust_step_span(
        &self,
        association: &mut Association<D>,
        before: AnalysisStatus,
        default_range: &UtcRange,
    ) -> bool {
        let min_span = self.step.min_span();
        if before == AnalysisStatus::StepTimeout {
            let reduced = match (association.step_span(), default_range.duration()) {
                (Some(span), _) => span / 2,
                (None, Some(duration)) => duration / 2,
                (None, None) => self.step.no_end_span(),
            };
            let span = reduced.max(min_span);
            association.set_step_span(span);
            debug!(
                "[step] association {}: step span reduced to {}s",
                association.id,
                span.num_seconds()
            );
        }
        match association.step_span().or_else(|| default_range.duration()) {
            Some(span) => span > min_span,
            None => true,
        }
    }

    fn reconcile(
        &self,
        association: &Association<D>,
        step_range: &UtcRange,
        ctx: &StepContext<'_>,
        uow: &mut UnitOfWork<D>,
    ) -> std::result::Result<SlotChanges<D>, ReconcileError> {
        let reconciler = Reconciler::new(self.policy.as_ref(), self.contracts.get(association.kind));
        let changes = reconciler.plan(association, step_range, self.slots.as_ref(), ctx, uow)?;
        ctx.check_deadline()?;
        if !changes.is_empty() {
            self.slots.save(&changes)?;
        }
        Ok(changes)
    }

    fn finish(
        &self,
        mut association: Association<D>,
        before: AnalysisStatus,
        step_range: UtcRange,
        changes: SlotChanges<D>,
        started: Timestamp,
    ) -> Result<StepReport> {
        let id = association.id;
        let finished = self.clock.now();
        let elapsed = finished - started;
        association.record_attempt(started, finished);
        if step_range.is_empty() || step_range.upper() == association.range.upper() {
            let open_children = self
                .associations
                .children(id)?
                .iter()
                .any(|child| !child.status().is_terminal());
            association.mark_completed(open_children, finished)?;
        } else {
            let applied = step_range.upper_value().ok_or_else(|| AnalysisError::Validation {
                id,
                reason: format!("step {step_range} ends unbounded inside {}", association.range),
            })?;
            association.mark_in_progress(applied, &self.priority)?;
            self.grow_step_span(&mut association, elapsed);
        }
        self.commit_status(&mut association, before)?;
        self.metrics
            .record_commit(changes.inserts.len(), changes.updates.len(), changes.deletes.len());

        match association.status() {
            AnalysisStatus::Completed => info!(
                "[step] association {id} on {} {} completed after {} steps",
                association.owner,
                association.kind,
                association.iterations()
            ),
            status => debug!(
                "[step] association {id}: {status}, applied up to {:?}",
                association.applied_up_to()
            ),
        }
        if association.status().is_terminal() {
            self.resolve_parent(&association, finished)?;
        }
        Ok(StepReport {
            association: id,
            status: association.status(),
            step_range,
            applied_up_to: association.applied_up_to(),
            inserted: changes.inserts.len(),
            updated: changes.updates.len(),
            deleted: changes.deletes.len(),
            elapsed,
        })
    }

    fn grow_step_span(&self, association: &mut Association<D>, elapsed: TimeDelta) {
        let Some(span) = association.step_span() else {
            return;
        };
        let threshold_ms = self.step.timeout().num_milliseconds() as f64 * self.step.increase_threshold;
        if (elapsed.num_milliseconds() as f64) >= threshold_ms {
            return;
        }
        let grown_ms = (span.num_milliseconds() as f64 * self.step.increase_rate) as i64;
        let grown = TimeDelta::try_milliseconds(grown_ms)
            .unwrap_or(TimeDelta::MAX)
            .min(self.step.max_span());
        if grown > span {
            association.set_step_span(grown);
        }
    }

    fn handle_failure(
        &self,
        mut association: Association<D>,
        before: AnalysisStatus,
        step_range: UtcRange,
        err: ReconcileError,
        started: Timestamp,
    ) -> Result<StepReport> {
        let id = association.id;
        match err.disposition() {
            Disposition::StepTimeout => {
                let now = self.clock.now();
                association.record_attempt(started, now);
                association.mark_step_timeout()?;
                self.commit_status(&mut association, before)?;
                self.metrics.record_step_timeout();
                warn!(
                    "[step] association {id}: step {step_range} exceeded {}ms",
                    self.step.timeout_ms
                );
                let mut report = StepReport::idle(&association);
                report.elapsed = now - started;
                Ok(report)
            }
            Disposition::Validation => {
                let now = self.clock.now();
                error!(
                    "[step] association {id} on {} {} range {} data {:?} failed at {step_range}: {err}",
                    association.owner, association.kind, association.range, association.data
                );
                association.record_attempt(started, now);
                association.mark_error(now)?;
                self.commit_status(&mut association, before)?;
                self.cascade_ancestor_error(id, now)?;
                Ok(StepReport::idle(&association))
            }
            Disposition::Interrupted | Disposition::Conflict | Disposition::Fatal => Err(err.into()),
        }
    }

    fn commit_status(&self, association: &mut Association<D>, before: AnalysisStatus) -> Result<()> {
        self.associations.save(association)?;
        self.metrics.record_transition(before, association.status());
        Ok(())
    }

    fn cascade_ancestor_error(&self, root: AssociationId, now: Timestamp) -> Result<()> {
        let mut pending = vec![root];
        while let Some(parent) = pending.pop() {
            for mut child in self.associations.children(parent)? {
                pending.push(child.id);
                let before = child.status();
                if before.is_terminal() {
                    continue;
                }
                child.mark_ancestor_error(now)?;
                self.commit_status(&mut child, before)?;
                debug!("[step] association {}: ancestor {root} failed", child.id);
            }
        }
        Ok(())
    }

    fn resolve_sub_modifications(&self, association: &mut Association<D>, now: Timestamp) -> Result<()> {
        let statuses: Vec<AnalysisStatus> = self
            .associations
            .children(association.id)?
            .iter()
            .map(Association::status)
            .collect();
        let before = association.status();
        if association.resolve_sub_modifications(&statuses, now) {
            self.commit_status(association, before)?;
            self.resolve_parent(association, now)?;
        }
        Ok(())
    }

    fn resolve_parent(&self, child: &Association<D>, now: Timestamp) -> Result<()> {
        let Some(parent) = child.parent else {
            return Ok(());
        };
        let mut parent = self.associations.load(parent)?;
        if parent.status() == AnalysisStatus::PendingSubModifications {
            self.resolve_sub_modifications(&mut parent, now)?;
        }
        Ok(())
    }
}
