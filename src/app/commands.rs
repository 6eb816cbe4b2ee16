//! Inbound commands to the loop service.
//!
//! Everything that happens to the loop arrives as one of these: timer
//! firings, driver completions, pump pushes, actuator acknowledgements.
//! They are processed one at a time by
//! [`LoopService::handle`](super::service::LoopService::handle).

use chrono::{DateTime, Utc};

use crate::error::DriverError;
use crate::glucose::GlucoseReading;
use crate::pump::{AlertId, PumpEvent, PumpStatus};

/// Commands that adapters and timers send into the loop core.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopCommand {
    /// External scheduler's periodic trigger; the sole driver of decision cycles.
    Heartbeat(DateTime<Utc>),

    /// Fine-grained timer used for poll timeouts and auxiliary schedules.
    Tick(DateTime<Utc>),

    /// A pump refresh finished (or failed).
    PollCompleted {
        poll_id: u64,
        result: Result<(), DriverError>,
    },

    /// The pump reported a new status.
    StatusPushed(PumpStatus),

    /// The pump delivered a batch of history events.
    EventsPushed(Vec<PumpEvent>),

    /// The pump raised an alert that has not been acknowledged.
    AlertRaised(AlertId),

    /// The driver finished an acknowledgement attempt.
    AlertAckCompleted {
        alert: AlertId,
        result: Result<(), DriverError>,
    },

    /// The actuation layer began enacting a suggestion.
    DosingStarted(DateTime<Utc>),

    /// The actuation layer finished (or abandoned) enacting.
    DosingFinished(DateTime<Utc>),

    /// New readings from the glucose fetch adapter.
    GlucoseFetched(Vec<GlucoseReading>),

    /// Run sensitivity recalibration now.
    RunAutosens,

    /// Run tuning now.
    RunAutotune,

    /// A clinical setting changed; profiles must be rebuilt.
    SettingsChanged,
}
