//! Integration tests for status pushes, normalized signals, and the
//! glucose history merge.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use loopkeeper::app::commands::LoopCommand;
use loopkeeper::app::events::LoopEvent;
use loopkeeper::app::ports::BlobStore;
use loopkeeper::app::signals::Signal;
use loopkeeper::glucose::{Direction, GlucoseReading};
use loopkeeper::pipeline::keys::ArtifactKey;
use loopkeeper::pump::{PumpStatus, ReservoirLevel, TempBasalStatus};
use loopkeeper::safety::PumpFault;

use super::mocks::{Harness, at};

fn status_at(min: i64, reservoir: Option<f64>) -> PumpStatus {
    let mut s = PumpStatus::nominal(at(min));
    s.reservoir_units = reservoir;
    s.battery_percent = Some(80);
    s
}

fn temp_running(started: DateTime<Utc>, rate: f64, automatic: bool) -> TempBasalStatus {
    TempBasalStatus {
        rate,
        started_at: started,
        duration_mins: 30,
        automatic,
    }
}

fn signals(h: &Harness) -> Vec<Signal> {
    h.sink
        .events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::Signal(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

fn reading(id: &str, min: i64, value: f64) -> GlucoseReading {
    GlucoseReading {
        id: id.into(),
        value,
        timestamp: at(min),
        trend_direction: None,
    }
}

// ── Reservoir ─────────────────────────────────────────────────

#[test]
fn reservoir_is_published_and_mirrored() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::StatusPushed(status_at(0, Some(42.0))));

    assert!(signals(&h).contains(&Signal::Reservoir(ReservoirLevel::Units(42.0))));
    assert_eq!(
        h.blobs.retrieve(ArtifactKey::ReservoirLevel.as_str()),
        Some(Value::from(42.0))
    );
    assert_eq!(
        h.service.sync_state().reservoir_level,
        ReservoirLevel::Units(42.0)
    );
}

#[test]
fn implausible_reservoir_becomes_unknown() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::StatusPushed(status_at(0, Some(51.0))));

    assert!(signals(&h).contains(&Signal::Reservoir(ReservoirLevel::Unknown)));
    assert_eq!(
        h.blobs.retrieve(ArtifactKey::ReservoirLevel.as_str()),
        Some(Value::Null)
    );
    assert_eq!(h.service.sync_state().reservoir_level, ReservoirLevel::Unknown);
}

#[test]
fn reservoir_at_ceiling_is_plausible() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::StatusPushed(status_at(0, Some(50.0))));
    assert_eq!(
        h.service.sync_state().reservoir_level,
        ReservoirLevel::Units(50.0)
    );
}

#[test]
fn unchanged_status_publishes_nothing() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::StatusPushed(status_at(0, Some(30.0))));
    assert!(!signals(&h).is_empty());

    h.sink.clear();
    h.handle(LoopCommand::StatusPushed(status_at(1, Some(30.0))));
    assert!(signals(&h).is_empty());

    h.handle(LoopCommand::StatusPushed(status_at(2, Some(29.6))));
    assert_eq!(
        signals(&h),
        vec![Signal::Reservoir(ReservoirLevel::Units(29.6))]
    );
}

#[test]
fn reservoir_subscriber_sees_each_change() {
    let mut h = Harness::with_pump();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    h.service
        .signals_mut()
        .reservoir
        .subscribe(move |level| sink.borrow_mut().push(*level));

    h.handle(LoopCommand::StatusPushed(status_at(0, Some(20.0))));
    h.handle(LoopCommand::StatusPushed(status_at(1, Some(20.0))));
    h.handle(LoopCommand::StatusPushed(status_at(2, Some(90.0))));

    assert_eq!(
        *seen.borrow(),
        vec![ReservoirLevel::Units(20.0), ReservoirLevel::Unknown]
    );
}

// ── Manual override, deactivation, faults ─────────────────────

#[test]
fn manual_temp_basal_raises_override_until_it_ends() {
    let mut h = Harness::with_pump();
    let mut s = status_at(1, Some(30.0));
    s.temp_basal = Some(temp_running(at(0), 0.5, false));
    h.handle(LoopCommand::StatusPushed(s.clone()));
    assert!(h.service.sync_state().active_manual_override);

    s.timestamp = at(40);
    h.handle(LoopCommand::StatusPushed(s.clone()));
    assert!(h.service.sync_state().active_manual_override);

    // The pump's own clock does not end the override; host time does.
    h.handle(LoopCommand::Tick(at(40)));
    h.handle(LoopCommand::StatusPushed(s));
    assert!(!h.service.sync_state().active_manual_override);
    assert!(signals(&h).contains(&Signal::ManualOverride(false)));
}

#[test]
fn automatic_temp_basal_is_not_an_override() {
    let mut h = Harness::with_pump();
    let mut s = status_at(1, Some(30.0));
    s.temp_basal = Some(temp_running(at(0), 0.5, true));
    h.handle(LoopCommand::StatusPushed(s));
    assert!(!h.service.sync_state().active_manual_override);
}

#[test]
fn deactivation_is_signalled_once() {
    let mut h = Harness::with_pump();
    let mut s = status_at(0, Some(30.0));
    s.deactivated = true;
    h.handle(LoopCommand::StatusPushed(s.clone()));
    s.timestamp = at(1);
    h.handle(LoopCommand::StatusPushed(s));

    let count = signals(&h)
        .iter()
        .filter(|s| matches!(s, Signal::Deactivated(_)))
        .count();
    assert_eq!(count, 1);
}

#[test]
fn suspension_latches_fault_until_resumed() {
    let mut h = Harness::with_pump();
    let mut s = status_at(0, Some(30.0));
    s.suspended = true;
    h.handle(LoopCommand::StatusPushed(s.clone()));
    assert!(h.service.supervisor().has_fault(PumpFault::Suspended));
    assert!(signals(&h).contains(&Signal::PumpFault(PumpFault::Suspended.mask())));

    s.suspended = false;
    s.timestamp = at(1);
    h.handle(LoopCommand::StatusPushed(s));
    assert_eq!(h.service.supervisor().faults(), 0);
    assert!(signals(&h).contains(&Signal::PumpFaultCleared));
}

#[test]
fn fast_pump_clock_does_not_move_the_host_clock() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::StatusPushed(status_at(600, Some(30.0))));

    h.handle(LoopCommand::Heartbeat(at(5)));
    h.complete_refresh(Ok(()));
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::CycleCompleted { clock } if *clock == at(5)
    )));
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::Signal(Signal::Suggestion(s)) if s.timestamp == at(5)
    )));

    // A later hung poll still times out on host time.
    h.handle(LoopCommand::Heartbeat(at(10)));
    h.handle(LoopCommand::Tick(at(13)));
    assert_eq!(h.service.metrics().poll_timeouts, 1);
}

// ── Temp basal artifact ───────────────────────────────────────

#[test]
fn running_temp_basal_feeds_the_cycle() {
    let mut h = Harness::with_pump();
    let mut s = status_at(0, Some(30.0));
    s.temp_basal = Some(temp_running(at(0), 1.5, true));
    h.pump().status = Some(s);

    h.handle(LoopCommand::Heartbeat(at(10)));
    h.complete_refresh(Ok(()));

    let state = h
        .blobs
        .retrieve(ArtifactKey::TempBasalState.as_str())
        .unwrap();
    assert_eq!(state["duration"].as_i64(), Some(20));
    assert_eq!(state["rate"].as_f64(), Some(1.5));
    assert_eq!(state["temp"], "absolute");
}

#[test]
fn without_pump_the_last_pushed_status_is_used() {
    let mut h = Harness::without_pump();
    let mut s = status_at(0, Some(30.0));
    s.temp_basal = Some(temp_running(at(0), 0.8, true));
    h.handle(LoopCommand::StatusPushed(s));
    h.handle(LoopCommand::Heartbeat(at(5)));

    let state = h
        .blobs
        .retrieve(ArtifactKey::TempBasalState.as_str())
        .unwrap();
    assert_eq!(state["duration"].as_i64(), Some(25));
    assert_eq!(state["rate"].as_f64(), Some(0.8));
}

// ── Glucose ───────────────────────────────────────────────────

#[test]
fn fetched_glucose_is_merged_newest_first() {
    let mut h = Harness::with_pump();
    let mut second = reading("bg-2", 5, 118.0);
    second.trend_direction = Some(Direction::Up);
    h.handle(LoopCommand::GlucoseFetched(vec![reading("bg-1", 0, 110.0), second]));

    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::GlucoseMerged {
            received: 2,
            stored: 2
        }
    )));
    let history = h
        .blobs
        .retrieve(ArtifactKey::GlucoseHistory.as_str())
        .unwrap();
    assert_eq!(history[0]["id"], "bg-2");
    assert_eq!(history[0]["trendDirection"], "up");
    assert_eq!(history[1]["id"], "bg-1");
}

#[test]
fn refetched_readings_replace_rather_than_duplicate() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::GlucoseFetched(vec![reading("bg-1", 0, 110.0)]));
    h.handle(LoopCommand::GlucoseFetched(vec![
        reading("bg-1", 0, 111.0),
        reading("bg-2", 5, 115.0),
    ]));

    let history = h
        .blobs
        .retrieve(ArtifactKey::GlucoseHistory.as_str())
        .unwrap();
    assert_eq!(history.as_array().map(Vec::len), Some(2));
    assert_eq!(history[1]["value"].as_f64(), Some(111.0));
}

#[test]
fn newest_glucose_reaches_the_decision_stage() {
    let mut h = Harness::without_pump();
    h.handle(LoopCommand::GlucoseFetched(vec![
        reading("bg-1", 0, 110.0),
        reading("bg-2", 5, 124.0),
    ]));
    h.handle(LoopCommand::Heartbeat(at(6)));

    let suggestion = h.blobs.retrieve(ArtifactKey::Suggestion.as_str()).unwrap();
    assert_eq!(suggestion["bg"].as_f64(), Some(124.0));
}
