//! Integration tests for alert acknowledgement.

use loopkeeper::app::commands::LoopCommand;
use loopkeeper::app::events::LoopEvent;
use loopkeeper::app::ports::AlertStore;
use loopkeeper::app::signals::Signal;
use loopkeeper::error::DriverError;
use loopkeeper::pump::{AckRecord, AlertId};

use super::mocks::{Harness, at};

fn alert(id: &str) -> AlertId {
    AlertId(id.into())
}

#[test]
fn successful_ack_is_recorded_plainly() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::AlertRaised(alert("occlusion")));
    assert_eq!(h.pump().ack_calls, vec![alert("occlusion")]);

    h.complete_ack(Ok(()));

    let record = h.alerts.ack_record(&alert("occlusion")).unwrap();
    assert!(!record.forced);
    assert_eq!(record.error, None);
    assert_eq!(h.service.metrics().alerts_acknowledged, 1);
}

#[test]
fn timeout_with_no_active_alerts_is_force_acknowledged() {
    let mut h = Harness::with_pump();
    h.handle(LoopCommand::AlertRaised(alert("expiry-warning")));
    h.complete_ack(Err(DriverError::Timeout));

    let record = h.alerts.ack_record(&alert("expiry-warning")).unwrap();
    assert!(record.forced);
    assert_eq!(record.error.as_deref(), Some("timeout"));
    assert_eq!(h.service.metrics().alerts_forced, 1);
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::AlertAcknowledged(AckRecord { forced: true, .. })
    )));
}

#[test]
fn failure_with_alert_still_active_is_reported_not_recorded() {
    let mut h = Harness::with_pump();
    h.pump().active.insert(alert("occlusion"));
    h.handle(LoopCommand::AlertRaised(alert("occlusion")));
    h.complete_ack(Err(DriverError::Rejected("busy".into())));

    assert!(!h.alerts.is_acknowledged(&alert("occlusion")));
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::AlertAckFailed { alert: id, .. } if id.0 == "occlusion"
    )));
    assert!(h.sink.any(|e| matches!(
        e,
        LoopEvent::Signal(Signal::DriverError(DriverError::Rejected(_)))
    )));
}

#[test]
fn already_acknowledged_alert_skips_the_driver() {
    let mut h = Harness::with_pump();
    h.alerts
        .record_ack(AckRecord {
            alert: alert("low-reservoir"),
            acknowledged_at: at(0),
            forced: false,
            error: None,
        })
        .unwrap();

    h.handle(LoopCommand::AlertRaised(alert("low-reservoir")));
    assert!(h.pump().ack_calls.is_empty());
}

#[test]
fn failed_ack_can_be_retried_on_next_raise() {
    let mut h = Harness::with_pump();
    h.pump().active.insert(alert("occlusion"));
    h.handle(LoopCommand::AlertRaised(alert("occlusion")));
    h.complete_ack(Err(DriverError::Timeout));

    h.pump().active.clear();
    h.handle(LoopCommand::AlertRaised(alert("occlusion")));
    h.complete_ack(Ok(()));

    assert_eq!(h.pump().ack_calls.len(), 2);
    assert!(h.alerts.is_acknowledged(&alert("occlusion")));
}

#[test]
fn without_pump_alerts_are_forced_with_reason() {
    let mut h = Harness::without_pump();
    h.handle(LoopCommand::AlertRaised(alert("fault")));

    let record = h.alerts.ack_record(&alert("fault")).unwrap();
    assert!(record.forced);
    assert_eq!(record.error.as_deref(), Some("pump not configured"));
}
