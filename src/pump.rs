//! Pump-side data model: status pushes, history events, alerts.
//!
//! These are the values a device family hands to the core.  They are
//! immutable once produced; the core derives safety signals from them
//! and never mutates them in place.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// A temporary basal currently running on the pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempBasalStatus {
    /// Delivery rate (U/h).
    pub rate: f64,
    pub started_at: DateTime<Utc>,
    pub duration_mins: u32,
    /// `true` when the loop itself commanded this temp basal.
    pub automatic: bool,
}

impl TempBasalStatus {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.started_at + Duration::minutes(i64::from(self.duration_mins))
    }

    /// True if the temp basal is still running at `now`.
    pub fn is_unfinished(&self, now: DateTime<Utc>) -> bool {
        now < self.ends_at()
    }

    /// Whole minutes left at `now` (0 once finished).
    pub fn remaining_mins(&self, now: DateTime<Utc>) -> i64 {
        (self.ends_at() - now).num_minutes().max(0)
    }
}

/// Snapshot pushed by the pump driver on every status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpStatus {
    /// When the device produced this status.
    pub timestamp: DateTime<Utc>,
    /// Reported reservoir (units).  `None` if the device does not report it.
    pub reservoir_units: Option<f64>,
    pub battery_percent: Option<u8>,
    pub temp_basal: Option<TempBasalStatus>,
    /// Device-reported end of life (pod expiry, cartridge expiry).
    pub expires_at: Option<DateTime<Utc>>,
    pub suspended: bool,
    /// Device has been deactivated (pod discarded, pump unpaired).
    pub deactivated: bool,
    /// Device-reported fault code, if any.
    pub fault: Option<String>,
}

impl PumpStatus {
    /// A plain, healthy status at `timestamp`.
    pub fn nominal(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            reservoir_units: None,
            battery_percent: None,
            temp_basal: None,
            expires_at: None,
            suspended: false,
            deactivated: false,
            fault: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reservoir
// ---------------------------------------------------------------------------

/// Normalized reservoir reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum ReservoirLevel {
    /// Not reported, or reported outside the plausible range.
    #[default]
    Unknown,
    Units(f64),
}

impl ReservoirLevel {
    /// Normalize a raw report against the plausibility ceiling.
    pub fn from_report(raw: Option<f64>, ceiling: f64) -> Self {
        match raw {
            Some(units) if units.is_finite() && units >= 0.0 && units <= ceiling => {
                Self::Units(units)
            }
            _ => Self::Unknown,
        }
    }

    pub fn units(self) -> Option<f64> {
        match self {
            Self::Units(u) => Some(u),
            Self::Unknown => None,
        }
    }
}

// ---------------------------------------------------------------------------
// History events
// ---------------------------------------------------------------------------

/// What happened on the pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PumpEventKind {
    TempBasal {
        rate: f64,
        duration_mins: u32,
        automatic: bool,
    },
    Bolus {
        units: f64,
        automatic: bool,
    },
    Suspend,
    Resume,
    Rewind,
    Prime {
        units: f64,
    },
    Alarm {
        code: String,
    },
}

/// One immutable record from the pump's own history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpEvent {
    /// Device-assigned identity; the event store deduplicates on it.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PumpEventKind,
}

impl PumpEvent {
    /// Temp-basal rate, if this is a temp-basal event.
    pub fn temp_basal_rate(&self) -> Option<f64> {
        match self.kind {
            PumpEventKind::TempBasal { rate, .. } => Some(rate),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Device alert identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AlertId(pub String);

impl core::fmt::Display for AlertId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored acknowledgement of a device alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRecord {
    pub alert: AlertId,
    pub acknowledged_at: DateTime<Utc>,
    /// Set when the driver failed but its active-alert set was empty.
    pub forced: bool,
    /// Error message reported by the driver, kept rather than discarded.
    pub error: Option<String>,
}
