//! Simulated pump family and pump-integrated glucose sensor.
//!
//! Bench and demo use only.  The simulated pump answers every refresh
//! synchronously: it pushes a status and one history event through the
//! command queue, then fires the completion.  Reservoir and battery wind
//! down over time; a low-reservoir alert is raised once.

use std::collections::BTreeSet;
use std::f64::consts::TAU;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::app::commands::LoopCommand;
use crate::app::ports::{AnalyteSource, Clock, CommandQueue, Completion, PumpDriver};
use crate::error::DriverError;
use crate::glucose::AnalyteSample;
use crate::pump::{AlertId, PumpEvent, PumpEventKind, PumpStatus, TempBasalStatus};

const START_RESERVOIR_UNITS: f64 = 48.0;
const UNITS_PER_REFRESH: f64 = 0.4;
const LOW_RESERVOIR_UNITS: f64 = 10.0;
const LOW_RESERVOIR_ALERT: &str = "low-reservoir";
const DEVICE_LIFETIME_HOURS: i64 = 72;

pub struct SimulatedPump {
    queue: Arc<dyn CommandQueue>,
    clock: Box<dyn Clock>,
    activated_at: DateTime<Utc>,
    reservoir: f64,
    battery: u8,
    refreshes: u64,
    alerts: BTreeSet<AlertId>,
    low_alert_raised: bool,
    last_status: Option<PumpStatus>,
    max_basal: f64,
}

impl SimulatedPump {
    pub fn new(queue: Arc<dyn CommandQueue>, clock: Box<dyn Clock>) -> Self {
        let activated_at = clock.now();
        Self {
            queue,
            clock,
            activated_at,
            reservoir: START_RESERVOIR_UNITS,
            battery: 100,
            refreshes: 0,
            alerts: BTreeSet::new(),
            low_alert_raised: false,
            last_status: None,
            max_basal: 4.0,
        }
    }

    fn next_status(&mut self, now: DateTime<Utc>) -> PumpStatus {
        self.refreshes += 1;
        self.reservoir = (self.reservoir - UNITS_PER_REFRESH).max(0.0);
        if self.refreshes % 12 == 0 {
            self.battery = self.battery.saturating_sub(1);
        }
        let expires_at = self.activated_at + Duration::hours(DEVICE_LIFETIME_HOURS);

        PumpStatus {
            timestamp: now,
            reservoir_units: Some(self.reservoir),
            battery_percent: Some(self.battery),
            temp_basal: Some(TempBasalStatus {
                rate: 0.9,
                started_at: now,
                duration_mins: 30,
                automatic: true,
            }),
            expires_at: Some(expires_at),
            suspended: false,
            deactivated: now >= expires_at,
            fault: None,
        }
    }
}

impl PumpDriver for SimulatedPump {
    fn family(&self) -> &'static str {
        "simulated"
    }

    fn refresh_data(&mut self, completion: Completion) {
        let now = self.clock.now();
        let status = self.next_status(now);
        let event = PumpEvent {
            id: format!("sim-{}", self.refreshes),
            timestamp: now,
            kind: PumpEventKind::TempBasal {
                rate: 0.9,
                duration_mins: 30,
                automatic: true,
            },
        };
        debug!(
            "sim pump: refresh {} reservoir={:.1}U battery={}%",
            self.refreshes, self.reservoir, self.battery
        );

        self.last_status = Some(status.clone());
        self.queue.post(LoopCommand::StatusPushed(status));
        self.queue.post(LoopCommand::EventsPushed(vec![event]));

        if self.reservoir < LOW_RESERVOIR_UNITS && !self.low_alert_raised {
            let alert = AlertId(LOW_RESERVOIR_ALERT.into());
            info!("sim pump: raising {}", alert);
            self.low_alert_raised = true;
            self.alerts.insert(alert.clone());
            self.queue.post(LoopCommand::AlertRaised(alert));
        }

        completion(Ok(()));
    }

    fn current_status(&self) -> Option<PumpStatus> {
        self.last_status.clone()
    }

    fn active_alerts(&self) -> BTreeSet<AlertId> {
        self.alerts.clone()
    }

    fn acknowledge_alert(&mut self, alert: &AlertId, completion: Completion) {
        if self.alerts.remove(alert) {
            completion(Ok(()));
        } else {
            completion(Err(DriverError::Rejected(format!("{alert} is not active"))));
        }
    }

    fn max_basal_ceiling(&self) -> f64 {
        self.max_basal
    }
}

// ───────────────────────────────────────────────────────────────
// Analyte source
// ───────────────────────────────────────────────────────────────

/// Produces one sample every five minutes along a slow sine wave.
pub struct SimulatedAnalyteSource {
    clock: Box<dyn Clock>,
    backfill: Duration,
}

impl SimulatedAnalyteSource {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            clock,
            backfill: Duration::minutes(30),
        }
    }

    fn samples_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AnalyteSample> {
        let step = Duration::minutes(5);
        let mut at = align_to_step(from) + step;
        let mut out = Vec::new();
        while at <= to {
            let phase = (at.timestamp() % 10_800) as f64 / 10_800.0;
            out.push(AnalyteSample {
                id: format!("bg-{}", at.timestamp()),
                value: (110.0 + 35.0 * (phase * TAU).sin()).round(),
                timestamp: at,
            });
            at += step;
        }
        out
    }
}

/// Round down to the previous five-minute boundary.
fn align_to_step(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(300), 0).unwrap_or(at)
}

impl AnalyteSource for SimulatedAnalyteSource {
    fn read_samples(
        &mut self,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<AnalyteSample>, DriverError>> {
        let now = self.clock.now();
        let from = since.unwrap_or(now - self.backfill);
        let samples = Self::samples_between(from, now);
        async move { Ok(samples) }
    }
}
