// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use analysis_engine::{AnalysisEngine, AnalysisEngineConfig};
use chrono::{TimeZone, Utc};
use core_types::{config::AnalysisConfig, status::ServiceMetricsReporter};
use engine_api::{Engine, EngineError, HealthStatus};
use slot_timeline::{
    AnalysisStatus, Association, AssociationId, AssociationStore, EqualityPolicy, FailOnConflict,
    MemoryAssociationStore, MemorySlotStore, MergeContracts, OwnerKey, SlotKind, StepController,
    Timestamp, UtcRange,
};

fn day(d: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

struct Fixture {
    slots: Arc<MemorySlotStore<&'static str>>,
    associations: Arc<MemoryAssociationStore<&'static str>>,
    engine: AnalysisEngine<&'static str>,
}

fn fixture(contracts: MergeContracts<&'static str>) -> Fixture {
    let slots: Arc<MemorySlotStore<&'static str>> = Arc::new(MemorySlotStore::new());
    let associations: Arc<MemoryAssociationStore<&'static str>> =
        Arc::new(MemoryAssociationStore::new());
    let controller = StepController::new(
        slots.clone(),
        associations.clone(),
        Arc::new(EqualityPolicy),
        &AnalysisConfig::default(),
    )
    .with_contracts(contracts);
    let config = AnalysisEngineConfig {
        label: "test".to_string(),
        workers: 2,
        idle_backoff: Duration::from_millis(10),
        liveness_timeout: Duration::from_secs(30),
    };
    Fixture {
        slots,
        associations,
        engine: AnalysisEngine::new(config, Arc::new(controller)),
    }
}

fn assert_op(fx: &Fixture, owner: &str, from: u32, to: u32, data: &'static str) -> AssociationId {
    fx.associations
        .insert(Association::new(
            OwnerKey::from(owner),
            SlotKind::Operation,
            UtcRange::between(day(from), day(to)),
            data,
            day(1),
        ))
        .unwrap()
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn workers_drain_every_owner() {
    let fx = fixture(MergeContracts::default());
    let owners = ["M1", "M2", "M3", "M4"];
    for owner in owners {
        assert_op(&fx, owner, 1, 10, "OpA");
        assert_op(&fx, owner, 5, 7, "OpB");
        assert_op(&fx, owner, 6, 8, "OpC");
    }

    fx.engine.start().unwrap();
    wait_until("associations to complete", || fx.associations.pending_count() == 0);
    fx.engine.stop().unwrap();
    assert_eq!(fx.engine.health().status, HealthStatus::Stopped);

    assert_eq!(
        fx.associations.with_status(AnalysisStatus::Completed).len(),
        owners.len() * 3
    );
    for owner in owners {
        let layout: Vec<_> = fx
            .slots
            .timeline(&OwnerKey::from(owner), SlotKind::Operation)
            .into_iter()
            .map(|s| (s.range, s.data))
            .collect();
        assert_eq!(
            layout,
            vec![
                (UtcRange::between(day(1), day(5)), "OpA"),
                (UtcRange::between(day(5), day(6)), "OpB"),
                (UtcRange::between(day(6), day(8)), "OpC"),
                (UtcRange::between(day(8), day(10)), "OpA"),
            ],
            "timeline of {owner}"
        );
    }
}

#[test]
fn lifecycle_rejects_invalid_transitions() {
    let fx = fixture(MergeContracts::default());
    assert!(matches!(fx.engine.stop(), Err(EngineError::NotRunning)));
    assert!(matches!(fx.engine.pause(), Err(EngineError::NotRunning)));

    fx.engine.start().unwrap();
    assert!(matches!(fx.engine.start(), Err(EngineError::AlreadyRunning)));
    assert_eq!(fx.engine.health().status, HealthStatus::Ready);
    fx.engine.stop().unwrap();
    assert!(matches!(fx.engine.resume(), Err(EngineError::NotRunning)));
}

#[test]
fn paused_engine_holds_new_work() {
    let fx = fixture(MergeContracts::default());
    fx.engine.start().unwrap();
    fx.engine.pause().unwrap();
    assert_eq!(fx.engine.health().status, HealthStatus::Paused);

    let id = assert_op(&fx, "M1", 1, 3, "OpA");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fx.associations.load(id).unwrap().status(), AnalysisStatus::New);

    fx.engine.resume().unwrap();
    wait_until("association to complete", || {
        fx.associations.load(id).unwrap().status() == AnalysisStatus::Completed
    });
    fx.engine.stop().unwrap();
}

#[test]
fn failed_association_raises_operator_alert() {
    let contracts = MergeContracts::<&'static str>::default()
        .with(SlotKind::Operation, Arc::new(FailOnConflict::new(EqualityPolicy)));
    let fx = fixture(contracts);
    assert_op(&fx, "M1", 1, 3, "OpA");
    let conflicting = assert_op(&fx, "M1", 2, 4, "OpB");

    let mut passes = 0;
    while fx.engine.run_pass().unwrap() > 0 {
        passes += 1;
        assert!(passes < 10);
    }

    assert_eq!(
        fx.associations.load(conflicting).unwrap().status(),
        AnalysisStatus::Error
    );
    let status = fx.engine.status().snapshot();
    assert_eq!(status.alerts.len(), 1);
    assert_eq!(status.alerts[0].subject, format!("association {conflicting}"));

    let samples = fx.engine.metrics_reporter().collect_metrics();
    let committed = samples
        .iter()
        .find(|s| s.metric == "analysis_steps_committed_total")
        .unwrap();
    assert_eq!(committed.value, 1.0);
}
