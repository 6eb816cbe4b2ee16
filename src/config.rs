//! Loop configuration parameters
//!
//! All tunable parameters for the loop core.  Loaded once at startup
//! through a [`ConfigPort`](crate::app::ports::ConfigPort) and validated
//! before use.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Pump device family, selected at configuration load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PumpFamily {
    /// No pump paired; cycles run on cached data.
    None,
    /// In-process simulated pump (bench and demo use).
    #[default]
    Simulated,
}

/// Core loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    // --- Timing ---
    /// Interval between heartbeats (seconds)
    pub heartbeat_interval_secs: u32,
    /// Interval between sync ticks that drive timeouts and scheduling (seconds)
    pub sync_tick_secs: u32,
    /// A pump refresh is forced to completion after this long (seconds)
    pub poll_timeout_secs: u32,
    /// A dosing-in-progress flag older than this is cleared (seconds)
    pub dosing_timeout_secs: u32,

    // --- Glucose ---
    /// Analyte read timeout (seconds); a timeout yields no readings
    pub glucose_fetch_timeout_secs: u32,
    /// Minimum age of the fetch watermark before another read (seconds)
    pub glucose_min_fetch_interval_secs: u32,
    /// Glucose history kept in the blob store (hours)
    pub glucose_history_window_hours: u32,

    // --- Pump ---
    /// Device family driven by the sync state machine
    pub pump_family: PumpFamily,
    /// Reported reservoir above this (units) is treated as unknown
    pub reservoir_plausibility_ceiling: f64,
    /// Pump history rebuilt into the blob store (hours)
    pub pump_history_window_hours: u32,

    // --- Decision ---
    /// Fixed flag handed to the decision stage
    pub micro_bolus_allowed: bool,

    // --- Auxiliary pipelines ---
    /// Sensitivity recalibration cadence (minutes)
    pub autosens_interval_mins: u32,
    /// Tuning cadence (hours)
    pub autotune_interval_hours: u32,
    /// Whether the tuning pipeline is scheduled at all
    pub autotune_enabled: bool,
    /// Tuning flag: categorize unannounced meals as basal
    pub autotune_categorize_uam_as_basal: bool,
    /// Tuning flag: tune the insulin activity curve
    pub autotune_tune_insulin_curve: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            // Timing
            heartbeat_interval_secs: 300, // 5 min
            sync_tick_secs: 5,
            poll_timeout_secs: 180,
            dosing_timeout_secs: 600,

            // Glucose
            glucose_fetch_timeout_secs: 180,
            glucose_min_fetch_interval_secs: 300,
            glucose_history_window_hours: 24,

            // Pump
            pump_family: PumpFamily::Simulated,
            reservoir_plausibility_ceiling: 50.0,
            pump_history_window_hours: 24,

            // Decision
            micro_bolus_allowed: true,

            // Auxiliary
            autosens_interval_mins: 30,
            autotune_interval_hours: 24,
            autotune_enabled: false,
            autotune_categorize_uam_as_basal: false,
            autotune_tune_insulin_curve: false,
        }
    }
}

impl LoopConfig {
    pub fn poll_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.poll_timeout_secs))
    }

    pub fn dosing_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.dosing_timeout_secs))
    }

    pub fn pump_history_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.pump_history_window_hours))
    }

    pub fn glucose_history_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.glucose_history_window_hours))
    }
}

/// Range-check every field.  Invalid values are rejected, never clamped.
pub fn validate_config(cfg: &LoopConfig) -> Result<(), ConfigError> {
    if !(30..=3600).contains(&cfg.heartbeat_interval_secs) {
        return Err(ConfigError::ValidationFailed(
            "heartbeat_interval_secs must be 30–3600",
        ));
    }
    if cfg.sync_tick_secs == 0 || cfg.sync_tick_secs > cfg.heartbeat_interval_secs {
        return Err(ConfigError::ValidationFailed(
            "sync_tick_secs must be 1–heartbeat_interval_secs",
        ));
    }
    if !(10..=900).contains(&cfg.poll_timeout_secs) {
        return Err(ConfigError::ValidationFailed(
            "poll_timeout_secs must be 10–900",
        ));
    }
    if cfg.dosing_timeout_secs < cfg.poll_timeout_secs {
        return Err(ConfigError::ValidationFailed(
            "dosing_timeout_secs must be >= poll_timeout_secs",
        ));
    }
    if !(1..=900).contains(&cfg.glucose_fetch_timeout_secs) {
        return Err(ConfigError::ValidationFailed(
            "glucose_fetch_timeout_secs must be 1–900",
        ));
    }
    if !(1.0..=1000.0).contains(&cfg.reservoir_plausibility_ceiling) {
        return Err(ConfigError::ValidationFailed(
            "reservoir_plausibility_ceiling must be 1–1000 units",
        ));
    }
    if cfg.pump_history_window_hours == 0 || cfg.glucose_history_window_hours == 0 {
        return Err(ConfigError::ValidationFailed(
            "history windows must be at least one hour",
        ));
    }
    if cfg.autosens_interval_mins == 0 || cfg.autotune_interval_hours == 0 {
        return Err(ConfigError::ValidationFailed(
            "auxiliary pipeline intervals must be non-zero",
        ));
    }
    Ok(())
}
