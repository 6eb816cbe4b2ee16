//! Integration tests for the pipeline orchestrator: stage order, failure
//! handling, auxiliary pipelines, and profile synthesis.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{Value, json};

use loopkeeper::adapters::memory::MemoryBlobStore;
use loopkeeper::adapters::neutral_stages::neutral_stages;
use loopkeeper::app::commands::LoopCommand;
use loopkeeper::app::events::LoopEvent;
use loopkeeper::app::ports::BlobStore;
use loopkeeper::config::LoopConfig;
use loopkeeper::error::{PipelineError, StageError};
use loopkeeper::pipeline::Pipeline;
use loopkeeper::pipeline::keys::ArtifactKey;
use loopkeeper::pipeline::stage::{StageInputs, StageName, StageRegistry};
use loopkeeper::pipeline::suggestion::TempBasalState;
use loopkeeper::scheduler::AuxJob;

use super::mocks::{Harness, at};

fn pipeline(stages: StageRegistry) -> Pipeline {
    Pipeline::new(stages, &LoopConfig::default())
}

fn position(log: &[String], key: ArtifactKey) -> usize {
    log.iter()
        .position(|k| k == key.as_str())
        .unwrap_or_else(|| panic!("{key} never written"))
}

// ── Decision cycle ────────────────────────────────────────────

#[test]
fn cold_start_cycle_produces_a_suggestion() {
    let mut blobs = MemoryBlobStore::new();
    let suggestion = pipeline(neutral_stages())
        .run_decision_cycle(&mut blobs, at(0), &TempBasalState::none())
        .unwrap();

    assert_eq!(suggestion.timestamp, at(0));
    assert!(!suggestion.is_actionable());
    let stored = blobs.retrieve(ArtifactKey::Suggestion.as_str()).unwrap();
    assert_eq!(stored["reason"], "neutral decision: no change");
}

#[test]
fn artifacts_are_written_in_stage_order() {
    let mut blobs = MemoryBlobStore::new();
    pipeline(neutral_stages())
        .run_decision_cycle(&mut blobs, at(0), &TempBasalState::none())
        .unwrap();

    let log = blobs.write_log();
    let order = [
        ArtifactKey::Clock,
        ArtifactKey::TempBasalState,
        ArtifactKey::AutosensResult,
        ArtifactKey::MealResult,
        ArtifactKey::IobResult,
        ArtifactKey::Suggestion,
    ];
    for pair in order.windows(2) {
        assert!(
            position(log, pair[0]) < position(log, pair[1]),
            "{} written after {}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn failing_stage_aborts_and_keeps_earlier_artifacts() {
    let mut stages = neutral_stages();
    stages.register(
        StageName::Iob,
        |_: &StageInputs| -> Result<Value, StageError> {
            Err(StageError::Failed("no insulin model".into()))
        },
    );
    let mut blobs = MemoryBlobStore::new();
    let err = pipeline(stages)
        .run_decision_cycle(&mut blobs, at(0), &TempBasalState::none())
        .unwrap_err();

    assert_eq!(err.stage(), Some(StageName::Iob));
    assert!(blobs.retrieve(ArtifactKey::MealResult.as_str()).is_some());
    assert!(blobs.retrieve(ArtifactKey::IobResult.as_str()).is_none());
    assert!(blobs.retrieve(ArtifactKey::Suggestion.as_str()).is_none());
}

#[test]
fn error_object_from_stage_counts_as_failure() {
    let mut stages = neutral_stages();
    stages.register(
        StageName::Meal,
        |_: &StageInputs| -> Result<Value, StageError> { Ok(json!({ "error": "bad carbs" })) },
    );
    let mut blobs = MemoryBlobStore::new();
    let err = pipeline(stages)
        .run_decision_cycle(&mut blobs, at(0), &TempBasalState::none())
        .unwrap_err();

    assert_eq!(
        err,
        PipelineError::StageFailed {
            stage: StageName::Meal,
            reason: "bad carbs".into()
        }
    );
}

#[test]
fn missing_stage_fails_only_its_pipeline() {
    let mut stages = StageRegistry::new();
    stages.register(
        StageName::Autosense,
        |_: &StageInputs| -> Result<Value, StageError> { Ok(json!({ "ratio": 1.1 })) },
    );
    let p = pipeline(stages);
    let mut blobs = MemoryBlobStore::new();

    assert!(p.run_autosense(&mut blobs).is_ok());
    let err = p
        .run_decision_cycle(&mut blobs, at(0), &TempBasalState::none())
        .unwrap_err();
    assert_eq!(err.stage(), Some(StageName::Meal));
}

#[test]
fn store_write_failure_is_reported_with_its_key() {
    let mut blobs = MemoryBlobStore::new();
    blobs.fail_on(ArtifactKey::MealResult.as_str());
    let err = pipeline(neutral_stages())
        .run_decision_cycle(&mut blobs, at(0), &TempBasalState::none())
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::StoreWriteFailed {
            key: ArtifactKey::MealResult,
            ..
        }
    ));
}

// ── Autosense ─────────────────────────────────────────────────

#[test]
fn autosense_result_feeds_later_cycles() {
    let captured = Rc::new(RefCell::new(Value::Null));
    let slot = Rc::clone(&captured);
    let mut stages = neutral_stages();
    stages.register(
        StageName::Autosense,
        |_: &StageInputs| -> Result<Value, StageError> { Ok(json!({ "ratio": 0.9 })) },
    );
    stages.register(
        StageName::Determine,
        move |inputs: &StageInputs| -> Result<Value, StageError> {
            *slot.borrow_mut() = inputs["autosens"].clone();
            Ok(json!({ "reason": "captured" }))
        },
    );
    let p = pipeline(stages);
    let mut blobs = MemoryBlobStore::new();

    p.run_decision_cycle(&mut blobs, at(0), &TempBasalState::none())
        .unwrap();
    assert!(captured.borrow().is_null());

    p.run_autosense(&mut blobs).unwrap();
    p.run_decision_cycle(&mut blobs, at(5), &TempBasalState::none())
        .unwrap();
    assert_eq!(*captured.borrow(), json!({ "ratio": 0.9 }));
}

#[test]
fn autosense_runs_on_its_schedule() {
    let mut h = Harness::without_pump();
    h.handle(LoopCommand::Tick(at(0)));
    h.handle(LoopCommand::Tick(at(29)));
    assert!(h.blobs.retrieve(ArtifactKey::AutosensResult.as_str()).is_none());

    h.handle(LoopCommand::Tick(at(30)));
    assert!(h
        .sink
        .any(|e| matches!(e, LoopEvent::AuxCompleted(AuxJob::Autosens))));
    assert_eq!(
        h.blobs.retrieve(ArtifactKey::AutosensResult.as_str()),
        Some(json!({ "ratio": 1.0 }))
    );
}

#[test]
fn autotune_is_not_scheduled_unless_enabled() {
    let mut h = Harness::without_pump();
    h.handle(LoopCommand::Tick(at(0)));
    h.handle(LoopCommand::Tick(at(24 * 60)));
    assert!(!h
        .sink
        .any(|e| matches!(e, LoopEvent::AuxCompleted(AuxJob::Autotune))));
}

// ── Autotune ──────────────────────────────────────────────────

#[test]
fn autotune_seeds_from_profile_then_from_its_last_result() {
    let previous = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&previous);
    let mut stages = neutral_stages();
    stages.register(
        StageName::AutotuneCore,
        move |inputs: &StageInputs| -> Result<Value, StageError> {
            seen.borrow_mut().push(inputs["previous"].clone());
            Ok(json!({ "isf": 45, "round": seen.borrow().len() }))
        },
    );
    let p = pipeline(stages);
    let mut blobs = MemoryBlobStore::new();
    blobs
        .save(ArtifactKey::Profile.as_str(), &json!({ "isf": 50 }))
        .unwrap();

    p.run_autotune(&mut blobs).unwrap();
    p.run_autotune(&mut blobs).unwrap();

    let previous = previous.borrow();
    assert_eq!(previous[0], json!({ "isf": 50 }));
    assert_eq!(previous[1], json!({ "isf": 45, "round": 1 }));
    assert!(blobs.retrieve(ArtifactKey::AutotunePrepared.as_str()).is_some());
}

#[test]
fn autotune_command_rebuilds_the_active_profile() {
    let mut h = Harness::without_pump();
    h.blobs
        .save(ArtifactKey::BasalProfile.as_str(), &json!([{ "rate": 1.0 }]))
        .unwrap();
    h.blobs
        .save(ArtifactKey::Profile.as_str(), &json!({ "basalprofile": [{ "rate": 1.1 }] }))
        .unwrap();

    h.handle(LoopCommand::RunAutotune);

    assert!(h
        .sink
        .any(|e| matches!(e, LoopEvent::AuxCompleted(AuxJob::Autotune))));
    assert!(h.sink.any(|e| matches!(e, LoopEvent::ProfilesRebuilt)));
    let active = h.blobs.retrieve(ArtifactKey::Profile.as_str()).unwrap();
    let native = h.blobs.retrieve(ArtifactKey::PumpProfile.as_str()).unwrap();
    assert_eq!(active["autotuned"], json!(true));
    assert_eq!(active["basalprofile"], json!([{ "rate": 1.1 }]));
    assert_eq!(native["basalprofile"], json!([{ "rate": 1.0 }]));
}

#[test]
fn failed_autotune_leaves_profiles_alone() {
    let mut stages = neutral_stages();
    stages.register(
        StageName::AutotunePrep,
        |_: &StageInputs| -> Result<Value, StageError> { Err(StageError::Failed("no data".into())) },
    );
    let mut h = Harness::build(LoopConfig::default(), stages, None);
    h.handle(LoopCommand::RunAutotune);

    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::AuxFailed {
            job: AuxJob::Autotune,
            ..
        }
    )));
    assert!(!h.sink.any(|e| matches!(e, LoopEvent::ProfilesRebuilt)));
    assert!(h.blobs.retrieve(ArtifactKey::AutotuneResult.as_str()).is_none());
}

// ── Profile synthesis ─────────────────────────────────────────

fn seed_settings(blobs: &mut MemoryBlobStore) {
    for (key, value) in [
        (ArtifactKey::Preferences, json!({ "max_iob": 3 })),
        (ArtifactKey::PumpSettings, json!({ "maxBasal": 3.0 })),
        (ArtifactKey::BgTargets, json!({ "targets": [{ "low": 100, "high": 110 }] })),
        (ArtifactKey::BasalProfile, json!([{ "minutes": 0, "rate": 0.9 }])),
        (ArtifactKey::InsulinSensitivities, json!({ "sensitivities": [{ "sensitivity": 50 }] })),
        (ArtifactKey::CarbRatios, json!({ "schedule": [{ "ratio": 10 }] })),
    ] {
        blobs.save(key.as_str(), &value).unwrap();
    }
}

#[test]
fn profile_synthesis_is_byte_identical_for_equal_inputs() {
    let p = pipeline(neutral_stages());
    let mut blobs = MemoryBlobStore::new();
    seed_settings(&mut blobs);

    let first = p.synthesize_profiles(&mut blobs).unwrap();
    let second = p.synthesize_profiles(&mut blobs).unwrap();

    assert_eq!(
        serde_json::to_vec(&first.active).unwrap(),
        serde_json::to_vec(&second.active).unwrap()
    );
    assert_eq!(
        serde_json::to_vec(&first.pump_native).unwrap(),
        serde_json::to_vec(&second.pump_native).unwrap()
    );
}

#[test]
fn pump_native_profile_excludes_tuning() {
    let p = pipeline(neutral_stages());
    let mut blobs = MemoryBlobStore::new();
    seed_settings(&mut blobs);
    blobs
        .save(ArtifactKey::AutotuneResult.as_str(), &json!({ "isf": [{ "sensitivity": 48 }] }))
        .unwrap();

    let set = p.synthesize_profiles(&mut blobs).unwrap();

    assert!(set.pump_native.get("autotuned").is_none());
    assert_eq!(set.active["autotuned"], json!(true));
    assert_eq!(set.active["isf"], json!([{ "sensitivity": 48 }]));
    assert_eq!(
        blobs.retrieve(ArtifactKey::PumpProfile.as_str()),
        Some(set.pump_native)
    );
}

#[test]
fn settings_change_rebuilds_profiles() {
    let mut h = Harness::without_pump();
    seed_settings(&mut h.blobs);
    h.handle(LoopCommand::SettingsChanged);

    assert!(h.sink.any(|e| matches!(e, LoopEvent::ProfilesRebuilt)));
    let active = h.blobs.retrieve(ArtifactKey::Profile.as_str()).unwrap();
    assert_eq!(active["preferences"], json!({ "max_iob": 3 }));
}

#[test]
fn heartbeats_do_not_rebuild_profiles() {
    let mut h = Harness::without_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    assert!(h.blobs.retrieve(ArtifactKey::Profile.as_str()).is_none());
    assert!(!h.sink.any(|e| matches!(e, LoopEvent::ProfilesRebuilt)));
}
