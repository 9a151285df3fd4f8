//! Worker pool that drives associations to completion through a [`StepController`].
//!
//! Each worker repeatedly asks the association store for the next ready association per owner,
//! claims the owner without blocking, and runs one step. Owners already claimed by another
//! worker are skipped for this pass.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use core_types::{
    config::EngineConfig,
    status::{MetricSample, OverallStatus, ServiceMetricsReporter, ServiceStatusHandle, StatusGauge},
};
use engine_api::{Engine, EngineError, EngineHealth, EngineResult, HealthStatus};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use slot_timeline::{
    AnalysisError, AnalysisMetrics, AnalysisStatus, Association, CancellationToken, Clock,
    Disposition, LivenessCheck, LivenessChecker, ReferenceData, StepController, StepReport,
    StoreError,
};
use thiserror::Error;

pub const SERVICE_NAME: &str = "analysis";

#[derive(Clone, Debug)]
pub struct AnalysisEngineConfig {
    pub label: String,
    pub workers: usize,
    pub idle_backoff: Duration,
    /// A worker silent for longer than this marks the engine degraded.
    pub liveness_timeout: Duration,
}

impl Default for AnalysisEngineConfig {
    fn default() -> Self {
        Self::from_engine_config("dev", &EngineConfig::default())
    }
}

impl AnalysisEngineConfig {
    pub fn from_engine_config(label: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            label: label.into(),
            workers: config.workers.max(1),
            idle_backoff: Duration::from_millis(config.idle_backoff_ms),
            liveness_timeout: Duration::from_secs(config.liveness_timeout_secs),
        }
    }
}

pub struct AnalysisEngine<D: ReferenceData> {
    inner: Arc<EngineInner<D>>,
}

impl<D: ReferenceData> AnalysisEngine<D> {
    pub fn new(config: AnalysisEngineConfig, controller: Arc<StepController<D>>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                controller,
                status: ServiceStatusHandle::new(SERVICE_NAME),
                paused: AtomicBool::new(false),
                state: Mutex::new(EngineRuntimeState::Stopped),
                health: Mutex::new(EngineHealth::new(HealthStatus::Stopped, None)),
            }),
        }
    }

    /// Operator-facing status, including an alert per association that ended in `Error`.
    pub fn status(&self) -> ServiceStatusHandle {
        self.inner.status.clone()
    }

    pub fn metrics_reporter(&self) -> AnalysisMetricsReporter {
        AnalysisMetricsReporter::new(self.inner.controller.metrics().clone())
    }

    /// Runs a single pass on the calling thread. Returns the number of steps that did work.
    pub fn run_pass(&self) -> EngineResult<usize> {
        let liveness = LivenessChecker::new();
        let cancel = CancellationToken::new();
        Ok(self.inner.process_pass(&liveness, &cancel)?)
    }
}

impl<D: ReferenceData> Engine for AnalysisEngine<D> {
    fn start(&self) -> EngineResult<()> {
        EngineInner::start(&self.inner)
    }

    fn stop(&self) -> EngineResult<()> {
        self.inner.stop()
    }

    fn pause(&self) -> EngineResult<()> {
        self.inner.set_paused(true)
    }

    fn resume(&self) -> EngineResult<()> {
        self.inner.set_paused(false)
    }

    fn health(&self) -> EngineHealth {
        self.inner.health()
    }
}

struct EngineInner<D: ReferenceData> {
    config: AnalysisEngineConfig,
    controller: Arc<StepController<D>>,
    status: ServiceStatusHandle,
    paused: AtomicBool,
    state: Mutex<EngineRuntimeState>,
    health: Mutex<EngineHealth>,
}

impl<D: ReferenceData> EngineInner<D> {
    fn start(this: &Arc<Self>) -> EngineResult<()> {
        let mut guard = this.state.lock();
        if matches!(*guard, EngineRuntimeState::Running(_)) {
            return Err(EngineError::AlreadyRunning);
        }
        this.set_health(HealthStatus::Starting, None);
        let cancel = CancellationToken::new();
        let mut workers = Vec::with_capacity(this.config.workers);
        for idx in 0..this.config.workers {
            let liveness = Arc::new(LivenessChecker::new());
            let runner = Arc::clone(this);
            let worker_cancel = cancel.clone();
            let worker_liveness = Arc::clone(&liveness);
            let spawned = thread::Builder::new()
                .name(format!("{}-analysis-{idx}", this.config.label))
                .spawn(move || runner.run(idx, worker_liveness, worker_cancel));
            match spawned {
                Ok(handle) => workers.push(Worker { liveness, handle }),
                Err(err) => {
                    cancel.cancel();
                    for worker in workers {
                        let _ = worker.handle.join();
                    }
                    this.set_health(HealthStatus::Failed, Some(err.to_string()));
                    return Err(EngineFailure::Spawn(err).into());
                }
            }
        }
        info!(
            "[{}] analysis engine starting with {} workers",
            this.config.label, this.config.workers
        );
        if this.status.snapshot().alerts.is_empty() {
            this.status.set_overall(OverallStatus::Ok);
        }
        *guard = EngineRuntimeState::Running(WorkerPool { cancel, workers });
        if this.paused.load(Ordering::Relaxed) {
            this.set_health(HealthStatus::Paused, None);
        } else {
            this.set_health(HealthStatus::Ready, None);
        }
        Ok(())
    }

    fn stop(&self) -> EngineResult<()> {
        let mut guard = self.state.lock();
        let Some(pool) = guard.take_running() else {
            return Err(EngineError::NotRunning);
        };
        pool.cancel.cancel();
        for worker in pool.workers {
            if let Err(err) = worker.handle.join() {
                error!("[{}] analysis worker join error: {:?}", self.config.label, err);
            }
        }
        self.set_health(HealthStatus::Stopped, None);
        info!("[{}] analysis engine stopped", self.config.label);
        Ok(())
    }

    fn set_paused(&self, paused: bool) -> EngineResult<()> {
        if !matches!(*self.state.lock(), EngineRuntimeState::Running(_)) {
            return Err(EngineError::NotRunning);
        }
        self.paused.store(paused, Ordering::Relaxed);
        if paused {
            self.set_health(HealthStatus::Paused, None);
            info!("[{}] analysis engine paused", self.config.label);
        } else {
            self.set_health(HealthStatus::Ready, None);
            info!("[{}] analysis engine resumed", self.config.label);
        }
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        let health = self.health.lock().clone();
        if health.status != HealthStatus::Ready {
            return health;
        }
        let state = self.state.lock();
        let EngineRuntimeState::Running(pool) = &*state else {
            return health;
        };
        let stalled: Vec<String> = pool
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.liveness.is_stale(self.config.liveness_timeout))
            .map(|(idx, w)| format!("worker {idx} idle for {}s", w.liveness.idle_for().as_secs()))
            .collect();
        if stalled.is_empty() {
            health
        } else {
            EngineHealth::new(HealthStatus::Degraded, Some(stalled.join(", ")))
        }
    }

    fn run(self: Arc<Self>, idx: usize, liveness: Arc<LivenessChecker>, cancel: CancellationToken) {
        debug!("[{}] analysis worker {idx} running", self.config.label);
        while !cancel.is_cancelled() {
            if self.paused.load(Ordering::Relaxed) {
                liveness.pause_check();
                thread::sleep(self.config.idle_backoff);
                continue;
            }
            if liveness.is_paused() {
                liveness.resume_check();
            }
            liveness.set_active();
            match self.process_pass(liveness.as_ref(), &cancel) {
                Ok(0) => {
                    liveness.pause_check();
                    thread::sleep(self.config.idle_backoff);
                }
                Ok(_) => continue,
                Err(err) => {
                    self.set_health(HealthStatus::Degraded, Some(err.to_string()));
                    error!("[{}] analysis pass failed: {}", self.config.label, err);
                    thread::sleep(self.config.idle_backoff);
                }
            }
        }
        debug!("[{}] analysis worker {idx} exiting", self.config.label);
    }

    fn process_pass(
        &self,
        liveness: &LivenessChecker,
        cancel: &CancellationToken,
    ) -> Result<usize, EngineFailure> {
        let now = self.controller.clock().now();
        let candidates = self.controller.associations().eligible(now)?;
        let mut worked = 0usize;
        for candidate in &candidates {
            if cancel.is_cancelled() || self.paused.load(Ordering::Relaxed) {
                break;
            }
            let Some(guard) = self.controller.slots().try_lock(&candidate.owner) else {
                continue;
            };
            let outcome = self
                .controller
                .process_guarded(candidate.id, &guard, liveness, cancel);
            drop(guard);
            match outcome {
                Ok(report) => {
                    if did_work(candidate, &report) {
                        worked += 1;
                    }
                    self.observe(candidate, &report);
                }
                Err(err) if err.disposition() == Disposition::Interrupted => break,
                Err(err) => return Err(err.into()),
            }
        }
        self.publish_gauges(candidates.len());
        Ok(worked)
    }

    fn observe(&self, before: &Association<D>, report: &StepReport) {
        if report.status == before.status() {
            return;
        }
        match report.status {
            AnalysisStatus::Error => {
                self.status.raise_alert(
                    format!("association {}", report.association),
                    format!(
                        "{} {} over {} failed and needs review",
                        before.owner, before.kind, before.range
                    ),
                );
            }
            AnalysisStatus::AncestorError => warn!(
                "[{}] association {} abandoned after an ancestor failed",
                self.config.label, report.association
            ),
            _ => {}
        }
    }

    fn publish_gauges(&self, ready: usize) {
        let snapshot = self.controller.metrics().snapshot();
        self.status.set_gauges(vec![
            StatusGauge {
                label: "ready owners".to_string(),
                value: ready as f64,
                unit: None,
            },
            StatusGauge {
                label: "steps committed".to_string(),
                value: snapshot.steps_committed as f64,
                unit: None,
            },
            StatusGauge {
                label: "step timeouts".to_string(),
                value: snapshot.step_timeouts as f64,
                unit: None,
            },
        ]);
    }

    fn set_health(&self, status: HealthStatus, detail: Option<String>) {
        let mut guard = self.health.lock();
        guard.status = status;
        guard.detail = detail;
    }
}

fn did_work<D>(before: &Association<D>, report: &StepReport) -> bool {
    report.status != before.status() || !report.step_range.is_empty()
}

/// Publishes [`AnalysisMetrics`] counters as samples.
#[derive(Clone)]
pub struct AnalysisMetricsReporter {
    metrics: Arc<AnalysisMetrics>,
}

impl AnalysisMetricsReporter {
    pub fn new(metrics: Arc<AnalysisMetrics>) -> Self {
        Self { metrics }
    }
}

impl ServiceMetricsReporter for AnalysisMetricsReporter {
    fn service_name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn collect_metrics(&self) -> Vec<MetricSample> {
        let snapshot = self.metrics.snapshot();
        let mut samples: Vec<MetricSample> = snapshot
            .entered
            .iter()
            .map(|(status, count)| {
                MetricSample::gauge("analysis_status_entered_total", *count as f64)
                    .with_label("status", status.to_string())
            })
            .collect();
        let counters = [
            ("analysis_steps_committed_total", snapshot.steps_committed),
            ("analysis_step_timeouts_total", snapshot.step_timeouts),
            ("analysis_version_conflicts_total", snapshot.conflicts),
            ("analysis_deferred_total", snapshot.deferred),
        ];
        samples.extend(
            counters
                .into_iter()
                .map(|(metric, value)| MetricSample::gauge(metric, value as f64)),
        );
        for (change, value) in [
            ("inserted", snapshot.slots_inserted),
            ("updated", snapshot.slots_updated),
            ("deleted", snapshot.slots_deleted),
        ] {
            samples.push(
                MetricSample::gauge("analysis_slot_changes_total", value as f64)
                    .with_label("change", change),
            );
        }
        samples
    }
}

enum EngineRuntimeState {
    Stopped,
    Running(WorkerPool),
}

impl EngineRuntimeState {
    fn take_running(&mut self) -> Option<WorkerPool> {
        match std::mem::replace(self, EngineRuntimeState::Stopped) {
            EngineRuntimeState::Running(pool) => Some(pool),
            other => {
                *self = other;
                None
            }
        }
    }
}

struct WorkerPool {
    cancel: CancellationToken,
    workers: Vec<Worker>,
}

struct Worker {
    liveness: Arc<LivenessChecker>,
    handle: thread::JoinHandle<()>,
}

#[derive(Debug, Error)]
enum EngineFailure {
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("association store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),
}

impl From<EngineFailure> for EngineError {
    fn from(value: EngineFailure) -> Self {
        EngineError::Failure {
            source: Box::new(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_labels_counters() {
        let metrics = AnalysisMetrics::new();
        metrics.record_transition(AnalysisStatus::New, AnalysisStatus::Completed);
        metrics.record_commit(2, 0, 1);
        let samples = AnalysisMetricsReporter::new(metrics).collect_metrics();

        let completed = samples
            .iter()
            .find(|s| {
                s.metric == "analysis_status_entered_total"
                    && s.labels == vec![("status".to_string(), "completed".to_string())]
            })
            .unwrap();
        assert_eq!(completed.value, 1.0);
        let deleted = samples
            .iter()
            .find(|s| s.labels == vec![("change".to_string(), "deleted".to_string())])
            .unwrap();
        assert_eq!(deleted.value, 1.0);
        assert!(samples.iter().any(|s| s.metric == "analysis_steps_committed_total" && s.value == 1.0));
    }

    #[test]
    fn config_keeps_at_least_one_worker() {
        let mut engine = EngineConfig::default();
        engine.workers = 0;
        let config = AnalysisEngineConfig::from_engine_config("test", &engine);
        assert_eq!(config.workers, 1);
        assert_eq!(config.idle_backoff, Duration::from_millis(engine.idle_backoff_ms));
    }
}
