//! Integration tests for the device sync state machine driven through
//! `LoopService::handle`.

use serde_json::{Value, json};

use loopkeeper::adapters::memory::MemoryStorage;
use loopkeeper::adapters::neutral_stages::neutral_stages;
use loopkeeper::app::commands::LoopCommand;
use loopkeeper::app::events::{LoopEvent, PollOutcome};
use loopkeeper::app::ports::{BlobStore, EventStore};
use loopkeeper::app::signals::Signal;
use loopkeeper::config::LoopConfig;
use loopkeeper::error::{DriverError, StageError};
use loopkeeper::fsm::StateId;
use loopkeeper::pipeline::keys::ArtifactKey;
use loopkeeper::pipeline::stage::{StageInputs, StageName, StageRegistry};

use super::mocks::{Harness, MockPump, at, stored_history, temp_basal};

/// Neutral stages, but the decision always asks for a new temp basal.
fn actionable_stages() -> StageRegistry {
    let mut stages = neutral_stages();
    stages.register(
        StageName::Determine,
        |_: &StageInputs| -> Result<Value, StageError> {
            Ok(json!({ "rate": 1.2, "duration": 30, "reason": "raise" }))
        },
    );
    stages
}

// ── Heartbeat single-flight ───────────────────────────────────

#[test]
fn heartbeat_starts_exactly_one_refresh() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));

    assert_eq!(h.service.state(), StateId::Polling);
    assert_eq!(h.pump().refresh_calls, 1);
    assert!(h.service.sync_state().poll_in_flight);
    assert!(h
        .sink
        .any(|e| matches!(e, LoopEvent::PollStarted { poll_id: 1 })));
}

#[test]
fn second_heartbeat_during_poll_is_ignored() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.handle(LoopCommand::Heartbeat(at(1)));

    assert_eq!(h.pump().refresh_calls, 1);
    assert_eq!(h.service.metrics().heartbeats, 2);
    assert_eq!(h.service.metrics().heartbeats_ignored, 1);
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::HeartbeatIgnored {
            reason: "poll in flight"
        }
    )));
}

#[test]
fn completion_returns_to_idle_and_runs_one_cycle() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.complete_refresh(Ok(()));

    assert_eq!(h.service.state(), StateId::Idle);
    assert!(!h.service.sync_state().poll_in_flight);
    assert_eq!(h.service.metrics().cycles_ok, 1);
    assert!(h.blobs.retrieve(ArtifactKey::Suggestion.as_str()).is_some());
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::PollFinished {
            poll_id: 1,
            outcome: PollOutcome::Completed
        }
    )));
    assert_eq!(
        h.sink.count(|e| matches!(e, LoopEvent::CycleCompleted { .. })),
        1
    );
}

#[test]
fn heartbeat_after_completion_starts_a_new_poll() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.complete_refresh(Ok(()));
    h.handle(LoopCommand::Heartbeat(at(5)));

    assert_eq!(h.pump().refresh_calls, 2);
    assert_eq!(h.service.current_poll(), Some(2));
}

#[test]
fn driver_failure_still_runs_the_cycle() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.complete_refresh(Err(DriverError::Communication("link lost".into())));

    assert_eq!(h.service.state(), StateId::Idle);
    assert_eq!(h.service.metrics().poll_failures, 1);
    assert_eq!(h.service.metrics().cycles_ok, 1);
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::Signal(Signal::DriverError(DriverError::Communication(_)))
    )));
}

// ── Timeout and stale completions ─────────────────────────────

#[test]
fn poll_times_out_and_cycle_proceeds() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));

    h.handle(LoopCommand::Tick(at(2)));
    assert_eq!(h.service.state(), StateId::Polling);

    // 180 s after the poll began.
    h.handle(LoopCommand::Tick(at(3)));
    assert_eq!(h.service.state(), StateId::Idle);
    assert_eq!(h.service.metrics().poll_timeouts, 1);
    assert_eq!(h.service.metrics().cycles_ok, 1);
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::PollFinished {
            outcome: PollOutcome::TimedOut,
            ..
        }
    )));
}

#[test]
fn late_completion_after_timeout_is_discarded() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.handle(LoopCommand::Tick(at(3)));
    h.complete_refresh(Ok(()));

    assert_eq!(h.service.metrics().stale_completions, 1);
    assert_eq!(h.service.metrics().cycles_ok, 1);
    assert_eq!(h.service.state(), StateId::Idle);
}

#[test]
fn completion_for_an_older_poll_does_not_end_the_current_one() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.handle(LoopCommand::Tick(at(3)));
    h.handle(LoopCommand::Heartbeat(at(5)));
    assert_eq!(h.service.current_poll(), Some(2));

    // Poll 1's callback finally arrives.
    h.complete_refresh(Ok(()));
    assert_eq!(h.service.state(), StateId::Polling);
    assert_eq!(h.service.current_poll(), Some(2));

    h.complete_refresh(Ok(()));
    assert_eq!(h.service.state(), StateId::Idle);
    assert_eq!(h.service.metrics().cycles_ok, 2);
}

#[test]
fn heartbeats_alone_time_out_a_hung_poll() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.handle(LoopCommand::Heartbeat(at(2)));
    assert_eq!(h.service.metrics().heartbeats_ignored, 1);
    assert_eq!(h.service.metrics().poll_timeouts, 0);

    // No tick and no callback: the next beat finds poll 1 overdue.
    h.handle(LoopCommand::Heartbeat(at(5)));

    assert_eq!(h.service.metrics().poll_timeouts, 1);
    assert_eq!(h.service.metrics().cycles_ok, 1);
    assert_eq!(h.service.metrics().heartbeats_ignored, 1);
    assert_eq!(h.pump().refresh_calls, 2);
    assert_eq!(h.service.current_poll(), Some(2));
    assert_eq!(h.service.state(), StateId::Polling);
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::CycleCompleted { clock } if *clock == at(0)
    )));
}

// ── Dosing gate ───────────────────────────────────────────────

#[test]
fn dosing_in_progress_blocks_polling() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::DosingStarted(at(0)));
    h.handle(LoopCommand::Heartbeat(at(1)));

    assert_eq!(h.pump().refresh_calls, 0);
    assert_eq!(h.service.state(), StateId::Idle);
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::HeartbeatIgnored {
            reason: "dosing in progress"
        }
    )));

    h.handle(LoopCommand::DosingFinished(at(2)));
    h.handle(LoopCommand::Heartbeat(at(3)));
    assert_eq!(h.pump().refresh_calls, 1);
}

#[test]
fn actionable_suggestion_holds_dosing_flag_until_finished() {
    let mut h = Harness::build(
        LoopConfig::default(),
        actionable_stages(),
        Some(MockPump::new()),
    );
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.complete_refresh(Ok(()));
    assert!(h.service.sync_state().dosing_in_progress);

    h.handle(LoopCommand::Heartbeat(at(5)));
    assert_eq!(h.pump().refresh_calls, 1);

    h.handle(LoopCommand::DosingFinished(at(6)));
    assert!(!h.service.sync_state().dosing_in_progress);
    h.handle(LoopCommand::Heartbeat(at(7)));
    assert_eq!(h.pump().refresh_calls, 2);
}

#[test]
fn unacknowledged_dosing_flag_expires_on_tick() {
    let mut h = Harness::build(
        LoopConfig::default(),
        actionable_stages(),
        Some(MockPump::new()),
    );
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.complete_refresh(Ok(()));
    assert!(h.service.sync_state().dosing_in_progress);

    h.handle(LoopCommand::Tick(at(9)));
    assert!(h.service.sync_state().dosing_in_progress);
    h.handle(LoopCommand::Tick(at(10)));
    assert!(!h.service.sync_state().dosing_in_progress);
}

#[test]
fn unacknowledged_dosing_flag_expires_on_heartbeat() {
    let mut h = Harness::build(
        LoopConfig::default(),
        actionable_stages(),
        Some(MockPump::new()),
    );
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.complete_refresh(Ok(()));

    h.handle(LoopCommand::Heartbeat(at(5)));
    assert!(h.service.sync_state().dosing_in_progress);
    assert_eq!(h.pump().refresh_calls, 1);

    h.handle(LoopCommand::Heartbeat(at(10)));
    assert!(!h.service.sync_state().dosing_in_progress);
    assert_eq!(h.pump().refresh_calls, 2);
}

#[test]
fn neutral_suggestion_releases_dosing_flag() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.complete_refresh(Ok(()));
    assert!(!h.service.sync_state().dosing_in_progress);
}

// ── No pump configured ────────────────────────────────────────

#[test]
fn without_pump_the_poll_ends_immediately_and_cycle_runs() {
    let mut h = Harness::without_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));

    assert_eq!(h.service.state(), StateId::Idle);
    assert_eq!(h.service.metrics().cycles_ok, 1);
    assert!(h.blobs.retrieve(ArtifactKey::Suggestion.as_str()).is_some());
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::PollFinished {
            outcome: PollOutcome::NoPump,
            ..
        }
    )));
}

// ── Event reconciliation ──────────────────────────────────────

#[test]
fn events_pushed_during_poll_are_filtered_and_reconciled() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.handle(LoopCommand::EventsPushed(vec![
        temp_basal("a", 1, 1.0),
        temp_basal("b", 2, 3.5),
        temp_basal("c", 3, 3.0),
    ]));
    assert_eq!(h.service.state(), StateId::Polling);

    h.complete_refresh(Ok(()));

    assert_eq!(h.service.state(), StateId::Idle);
    assert_eq!(h.events.len(), 2);
    assert_eq!(h.service.sync_state().last_event_watermark, Some(at(3)));
    assert_eq!(h.service.metrics().events_rejected, 1);

    let history = stored_history(&h.blobs);
    let ids: Vec<&str> = history.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["c", "a"]);
    assert_eq!(h.service.metrics().cycles_ok, 1);
}

#[test]
fn events_pushed_while_idle_reconcile_without_a_cycle() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::EventsPushed(vec![temp_basal("a", 1, 1.0)]));

    assert_eq!(h.service.state(), StateId::Idle);
    assert_eq!(h.events.query_events(at(0)).len(), 1);
    assert_eq!(h.service.metrics().cycles_ok, 0);
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::StateChanged {
            from: StateId::Idle,
            to: StateId::Reconciling
        }
    )));
}

#[test]
fn failed_append_holds_the_watermark() {
    let mut h = Harness::with_pump();
    h.events.fail_appends(true);
    h.handle(LoopCommand::EventsPushed(vec![temp_basal("a", 1, 1.0)]));

    assert_eq!(h.service.sync_state().last_event_watermark, None);
    assert_eq!(h.service.metrics().reconcile_failures, 1);
    assert!(h
        .sink
        .any(|e| matches!(e, LoopEvent::ReconcileFailed { .. })));

    h.events.fail_appends(false);
    h.handle(LoopCommand::EventsPushed(vec![temp_basal("a", 1, 1.0)]));
    assert_eq!(h.service.sync_state().last_event_watermark, Some(at(1)));
}

#[test]
fn watermark_never_moves_backwards() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::EventsPushed(vec![temp_basal("new", 10, 1.0)]));
    h.handle(LoopCommand::EventsPushed(vec![temp_basal("old", 2, 1.0)]));

    assert_eq!(h.service.sync_state().last_event_watermark, Some(at(10)));
    assert_eq!(h.events.len(), 2);
}

#[test]
fn events_without_pump_are_dropped() {
    let mut h = Harness::without_pump();
    h.handle(LoopCommand::EventsPushed(vec![temp_basal("a", 1, 1.0)]));

    assert!(h.events.is_empty());
    assert_eq!(h.service.state(), StateId::Idle);
}

// ── Persistence ───────────────────────────────────────────────

#[test]
fn sync_state_survives_restart_without_in_flight_flags() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::EventsPushed(vec![temp_basal("a", 4, 1.0)]));
    h.handle(LoopCommand::Heartbeat(at(5)));
    assert!(h.service.sync_state().poll_in_flight);

    let storage: MemoryStorage = std::mem::take(&mut h.storage);
    let restored = Harness::restore(
        LoopConfig::default(),
        neutral_stages(),
        Some(MockPump::new()),
        storage,
    );

    let sync = restored.service.sync_state();
    assert_eq!(sync.last_event_watermark, Some(at(4)));
    assert_eq!(sync.last_heartbeat, Some(at(5)));
    assert!(!sync.poll_in_flight);
    assert!(!sync.dosing_in_progress);
}

#[test]
fn cycle_outcomes_are_recorded_in_the_diagnostics_ring() {
    let mut h = Harness::without_pump();
    h.handle(LoopCommand::Heartbeat(at(0)));
    h.handle(LoopCommand::Heartbeat(at(5)));

    let records = h.service.cycle_records(&h.storage);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.ok));
    assert_eq!(records[1].clock_secs, at(5).timestamp());
}
