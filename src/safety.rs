//! Pump status supervisor.
//!
//! Runs on every status push, independent of the poll cycle.  It diffs
//! the new status against the last one it saw and returns the signals
//! that actually changed, so observers are not woken on every heartbeat.
//!
//! ## Derived signals
//!
//! - **manual override**: an unfinished, non-automatic temp basal is running
//! - **reservoir**: the reported level, or `Unknown` above the plausibility ceiling
//! - **expiry**: the device-reported expiry, or none
//! - **battery** and **deactivation**
//!
//! ## Fault bitmask
//!
//! Independent conditions (suspended, device fault, reservoir empty,
//! expired) latch into a bitmask.  `PumpFault` is published when the mask
//! grows, `PumpFaultCleared` once it returns to zero.

use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::app::signals::Signal;
use crate::pump::{PumpStatus, ReservoirLevel};

/// Device-level fault conditions tracked by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PumpFault {
    Suspended = 0,
    DeviceFault = 1,
    ReservoirEmpty = 2,
    Expired = 3,
}

impl PumpFault {
    pub const fn mask(self) -> u8 {
        1 << (self as u8)
    }
}

impl core::fmt::Display for PumpFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Suspended => write!(f, "delivery suspended"),
            Self::DeviceFault => write!(f, "device fault"),
            Self::ReservoirEmpty => write!(f, "reservoir empty"),
            Self::Expired => write!(f, "device expired"),
        }
    }
}

/// Last published value of every derived signal.
#[derive(Debug, Clone, Default, PartialEq)]
struct Published {
    manual_override: Option<bool>,
    reservoir: Option<ReservoirLevel>,
    expiry: Option<Option<DateTime<Utc>>>,
    battery: Option<Option<u8>>,
    deactivated: bool,
}

/// Status-delta supervisor.
pub struct StatusSupervisor {
    reservoir_ceiling: f64,
    /// Latched fault bitmask.
    faults: u8,
    published: Published,
    last_status: Option<PumpStatus>,
}

impl StatusSupervisor {
    pub fn new(reservoir_ceiling: f64) -> Self {
        Self {
            reservoir_ceiling,
            faults: 0,
            published: Published::default(),
            last_status: None,
        }
    }

    /// Digest one status push.  Returns the signals that changed.
    pub fn observe(&mut self, status: &PumpStatus, now: DateTime<Utc>) -> Vec<Signal> {
        let mut out = Vec::new();

        // ── Manual override ───────────────────────────────────────
        let manual = status
            .temp_basal
            .as_ref()
            .is_some_and(|tb| tb.is_unfinished(now) && !tb.automatic);
        if self.published.manual_override != Some(manual) {
            self.published.manual_override = Some(manual);
            out.push(Signal::ManualOverride(manual));
        }

        // ── Reservoir ─────────────────────────────────────────────
        let reservoir = ReservoirLevel::from_report(status.reservoir_units, self.reservoir_ceiling);
        if let (Some(raw), ReservoirLevel::Unknown) = (status.reservoir_units, reservoir) {
            warn!(
                "implausible reservoir report {} (ceiling {}), using unknown",
                raw, self.reservoir_ceiling
            );
        }
        if self.published.reservoir != Some(reservoir) {
            self.published.reservoir = Some(reservoir);
            out.push(Signal::Reservoir(reservoir));
        }

        // ── Expiry ────────────────────────────────────────────────
        if self.published.expiry != Some(status.expires_at) {
            self.published.expiry = Some(status.expires_at);
            out.push(Signal::Expiry(status.expires_at));
        }

        // ── Battery ───────────────────────────────────────────────
        if self.published.battery != Some(status.battery_percent) {
            self.published.battery = Some(status.battery_percent);
            out.push(Signal::Battery(status.battery_percent));
        }

        // ── Deactivation (edge only) ──────────────────────────────
        if status.deactivated && !self.published.deactivated {
            info!("pump deactivated at {}", status.timestamp);
            out.push(Signal::Deactivated(status.timestamp));
        }
        self.published.deactivated = status.deactivated;

        // ── Faults ────────────────────────────────────────────────
        let before = self.faults;
        self.eval_fault(PumpFault::Suspended, status.suspended);
        self.eval_fault(PumpFault::DeviceFault, status.fault.is_some());
        self.eval_fault(
            PumpFault::ReservoirEmpty,
            reservoir.units().is_some_and(|u| u <= 0.0),
        );
        self.eval_fault(
            PumpFault::Expired,
            status.expires_at.is_some_and(|at| at <= now),
        );
        if self.faults & !before != 0 {
            out.push(Signal::PumpFault(self.faults));
        } else if before != 0 && self.faults == 0 {
            out.push(Signal::PumpFaultCleared);
        }

        self.last_status = Some(status.clone());
        out
    }

    /// Most recent status observed.
    pub fn last_status(&self) -> Option<&PumpStatus> {
        self.last_status.as_ref()
    }

    pub fn faults(&self) -> u8 {
        self.faults
    }

    pub fn has_fault(&self, fault: PumpFault) -> bool {
        self.faults & fault.mask() != 0
    }

    // ── Internal ──────────────────────────────────────────────────

    fn eval_fault(&mut self, fault: PumpFault, condition: bool) {
        if condition {
            if self.faults & fault.mask() == 0 {
                error!("PUMP FAULT SET: {fault}");
            }
            self.faults |= fault.mask();
        } else {
            if self.faults & fault.mask() != 0 {
                info!("PUMP FAULT CLEARED: {fault}");
            }
            self.faults &= !fault.mask();
        }
    }
}
