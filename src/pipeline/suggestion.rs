//! Terminal artifact of a decision cycle, and the temp-basal input it reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pump::PumpStatus;

/// A timestamped dosing recommendation.
///
/// Immutable once written: the next cycle supersedes it with a new value
/// under the same key rather than editing this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    /// The cycle clock this suggestion was computed for.
    pub timestamp: DateTime<Utc>,
    /// Recommended temp basal rate (U/h), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    /// Temp basal duration (minutes) paired with `rate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    /// Recommended bolus (U), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<f64>,
    /// Human-readable rationale from the decision stage.
    #[serde(default)]
    pub reason: String,
    /// Every other field the decision stage reported, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Suggestion {
    /// Parse the decision stage's raw output and stamp it with `clock`.
    ///
    /// Any timestamp the stage reported is overwritten by the cycle clock.
    pub fn from_stage_output(raw: Value, clock: DateTime<Utc>) -> Result<Self, String> {
        let Value::Object(mut obj) = raw else {
            return Err("decision output is not an object".into());
        };
        obj.insert("timestamp".into(), Value::String(clock.to_rfc3339()));
        serde_json::from_value(Value::Object(obj)).map_err(|e| e.to_string())
    }

    /// True if acting on this suggestion would change delivery.
    pub fn is_actionable(&self) -> bool {
        self.rate.is_some() || self.units.is_some_and(|u| u > 0.0)
    }
}

/// Current temp basal as the decision stage expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempBasalState {
    /// Remaining minutes.
    pub duration: i64,
    /// Rate (U/h).
    pub rate: f64,
    /// Always `"absolute"`.
    pub temp: String,
}

impl TempBasalState {
    /// No temp basal running.
    pub fn none() -> Self {
        Self {
            duration: 0,
            rate: 0.0,
            temp: "absolute".into(),
        }
    }

    /// Derive from the latest pump status at `now`.
    pub fn from_status(status: Option<&PumpStatus>, now: DateTime<Utc>) -> Self {
        match status.and_then(|s| s.temp_basal.as_ref()) {
            Some(tb) if tb.is_unfinished(now) => Self {
                duration: tb.remaining_mins(now),
                rate: tb.rate,
                temp: "absolute".into(),
            },
            _ => Self::none(),
        }
    }
}
