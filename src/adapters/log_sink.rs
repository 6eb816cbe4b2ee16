//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing every [`LoopEvent`] as one
//! structured log line.  An audit-upload or UI-feed adapter would
//! implement the same trait.

use log::{info, warn};

use crate::app::events::{LoopEvent, PollOutcome};
use crate::app::ports::EventSink;
use crate::app::signals::Signal;
use crate::pump::ReservoirLevel;

/// Adapter that logs every [`LoopEvent`].
#[derive(Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::Started(state) => {
                info!("START | initial_state={:?}", state);
            }
            LoopEvent::StateChanged { from, to } => {
                info!("STATE | {:?} -> {:?}", from, to);
            }
            LoopEvent::HeartbeatIgnored { reason } => {
                info!("BEAT  | ignored: {}", reason);
            }
            LoopEvent::PollStarted { poll_id } => {
                info!("POLL  | #{} started", poll_id);
            }
            LoopEvent::PollFinished { poll_id, outcome } => match outcome {
                PollOutcome::Failed(e) => warn!("POLL  | #{} failed: {}", poll_id, e),
                other => info!("POLL  | #{} finished: {:?}", poll_id, other),
            },
            LoopEvent::CycleCompleted { clock } => {
                info!("CYCLE | ok clock={}", clock.to_rfc3339());
            }
            LoopEvent::CycleFailed { stage, reason } => {
                warn!(
                    "CYCLE | failed stage={} reason={}",
                    stage.map_or("-", |s| s.as_str()),
                    reason
                );
            }
            LoopEvent::EventsReconciled {
                accepted,
                rejected,
                watermark,
            } => {
                info!(
                    "EVENT | accepted={} rejected={} watermark={:?}",
                    accepted, rejected, watermark
                );
            }
            LoopEvent::ReconcileFailed { reason } => {
                warn!("EVENT | append failed: {}", reason);
            }
            LoopEvent::AlertAcknowledged(rec) => {
                info!(
                    "ALERT | {} acknowledged forced={} error={:?}",
                    rec.alert, rec.forced, rec.error
                );
            }
            LoopEvent::AlertAckFailed { alert, error } => {
                warn!("ALERT | {} ack failed: {}", alert, error);
            }
            LoopEvent::AuxCompleted(job) => {
                info!("AUX   | {} ok", job);
            }
            LoopEvent::AuxFailed { job, reason } => {
                warn!("AUX   | {} failed: {}", job, reason);
            }
            LoopEvent::GlucoseMerged { received, stored } => {
                info!("BG    | received={} stored={}", received, stored);
            }
            LoopEvent::ProfilesRebuilt => {
                info!("PROF  | rebuilt");
            }
            LoopEvent::ProfileRebuildFailed { reason } => {
                warn!("PROF  | rebuild failed: {}", reason);
            }
            LoopEvent::Signal(signal) => log_signal(signal),
        }
    }
}

fn log_signal(signal: &Signal) {
    match signal {
        Signal::Reservoir(ReservoirLevel::Units(u)) => info!("SIG   | reservoir={:.1}U", u),
        Signal::Reservoir(ReservoirLevel::Unknown) => info!("SIG   | reservoir=unknown"),
        Signal::ManualOverride(on) => info!("SIG   | manual_override={}", on),
        Signal::Expiry(at) => info!("SIG   | expires_at={:?}", at),
        Signal::Battery(pct) => info!("SIG   | battery={:?}", pct),
        Signal::Deactivated(at) => info!("SIG   | deactivated at {}", at),
        Signal::PumpFault(mask) => warn!("SIG   | pump faults=0b{:04b}", mask),
        Signal::PumpFaultCleared => info!("SIG   | pump faults cleared"),
        Signal::DriverError(e) => warn!("SIG   | driver error: {}", e),
        Signal::Suggestion(s) => info!(
            "SIG   | suggestion rate={:?} duration={:?} units={:?} reason={}",
            s.rate, s.duration, s.units, s.reason
        ),
    }
}
