//! Outbound loop events.
//!
//! The [`LoopService`](super::service::LoopService) emits these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them (log line, audit upload, UI feed).

use chrono::{DateTime, Utc};

use super::signals::Signal;
use crate::error::DriverError;
use crate::fsm::StateId;
use crate::pipeline::stage::StageName;
use crate::pump::{AckRecord, AlertId};
use crate::scheduler::AuxJob;

/// How a poll ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Driver called back successfully.
    Completed,
    /// Driver called back with an error.
    Failed(DriverError),
    /// Driver never called back within the poll timeout.
    TimedOut,
    /// No pump is configured: the poll ends immediately.
    NoPump,
}

/// Structured events emitted by the loop core.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// The service has started (carries initial state).
    Started(StateId),

    /// The sync state machine transitioned between states.
    StateChanged { from: StateId, to: StateId },

    /// A heartbeat arrived while polling or dosing and was dropped.
    HeartbeatIgnored { reason: &'static str },

    PollStarted { poll_id: u64 },

    PollFinished { poll_id: u64, outcome: PollOutcome },

    /// A decision cycle produced a suggestion for `clock`.
    CycleCompleted { clock: DateTime<Utc> },

    /// A decision cycle aborted; partial artifacts remain.
    CycleFailed {
        stage: Option<StageName>,
        reason: String,
    },

    /// An event batch was reconciled into the event store.
    EventsReconciled {
        accepted: usize,
        rejected: usize,
        watermark: Option<DateTime<Utc>>,
    },

    /// Event append failed; the watermark did not move.
    ReconcileFailed { reason: String },

    AlertAcknowledged(AckRecord),

    /// Acknowledgement failed and the device still reports the alert.
    AlertAckFailed { alert: AlertId, error: String },

    AuxCompleted(AuxJob),

    AuxFailed { job: AuxJob, reason: String },

    GlucoseMerged { received: usize, stored: usize },

    /// Pump-native and active profiles were rebuilt from settings.
    ProfilesRebuilt,

    ProfileRebuildFailed { reason: String },

    /// A normalized signal was republished to observers.
    Signal(Signal),
}
