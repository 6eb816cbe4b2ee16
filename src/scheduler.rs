//! Auxiliary-job scheduler.
//!
//! Coexists with the heartbeat-driven decision cycle.  The scheduler
//! notifies a [`SchedulerDelegate`] when an auxiliary pipeline is due;
//! the loop service collects the jobs and runs them on its own context.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               Trigger Sources                │
//! │                                              │
//! │   ┌────────────┐        ┌────────────┐       │
//! │   │ Heartbeat  │        │ Periodic   │       │
//! │   │ (external) │        │ Schedule   │       │
//! │   └─────┬──────┘        └─────┬──────┘       │
//! │         │                     │              │
//! │         ▼                     ▼              │
//! │   decision cycle   ┌──────────────────────┐  │
//! │                    │  SchedulerDelegate   │  │
//! │                    └──────────┬───────────┘  │
//! │                               ▼              │
//! │                    autosense / autotune      │
//! └──────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use log::info;

// ═══════════════════════════════════════════════════════════════
//  Jobs and delegate
// ═══════════════════════════════════════════════════════════════

/// Auxiliary pipeline a schedule triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuxJob {
    Autosens,
    Autotune,
}

impl core::fmt::Display for AuxJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Autosens => f.write_str("autosens"),
            Self::Autotune => f.write_str("autotune"),
        }
    }
}

/// Callback the scheduler invokes when a schedule fires.
pub trait SchedulerDelegate {
    fn on_schedule_fired(&mut self, job: AuxJob);
}

/// Collecting delegate: jobs are run after the scheduler borrow ends.
impl SchedulerDelegate for Vec<AuxJob> {
    fn on_schedule_fired(&mut self, job: AuxJob) {
        if !self.contains(&job) {
            self.push(job);
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Schedule types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Schedule {
    pub label: &'static str,
    pub job: AuxJob,
    /// Fire every `interval`.
    pub interval: Duration,
    pub enabled: bool,
}

// ═══════════════════════════════════════════════════════════════
//  Scheduler engine
// ═══════════════════════════════════════════════════════════════

/// Maximum number of concurrent schedules (stack-allocated).
const MAX_SCHEDULES: usize = 4;

pub struct Scheduler {
    schedules: [Option<ScheduleEntry>; MAX_SCHEDULES],
}

#[derive(Debug, Clone)]
struct ScheduleEntry {
    schedule: Schedule,
    /// Reference point for the next fire; `None` until the first tick.
    anchor: Option<DateTime<Utc>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            schedules: [None, None, None, None],
        }
    }

    /// Build the standard autosense/autotune schedules from config.
    pub fn from_config(config: &crate::config::LoopConfig) -> Self {
        let mut sched = Self::new();
        sched.add(Schedule {
            label: "autosens",
            job: AuxJob::Autosens,
            interval: Duration::minutes(i64::from(config.autosens_interval_mins)),
            enabled: true,
        });
        sched.add(Schedule {
            label: "autotune",
            job: AuxJob::Autotune,
            interval: Duration::hours(i64::from(config.autotune_interval_hours)),
            enabled: config.autotune_enabled,
        });
        info!("scheduler: {} auxiliary schedule(s) active", sched.active_count());
        sched
    }

    /// Add a schedule.  Returns the slot index, or `None` if full.
    pub fn add(&mut self, schedule: Schedule) -> Option<usize> {
        for (i, slot) in self.schedules.iter_mut().enumerate() {
            if slot.is_none() {
                info!("scheduler: added '{}' at slot {}", schedule.label, i);
                *slot = Some(ScheduleEntry {
                    schedule,
                    anchor: None,
                });
                return Some(i);
            }
        }
        None
    }

    /// Evaluate every schedule at `now`.
    ///
    /// The first tick anchors each schedule; a schedule fires once
    /// `interval` has passed since its anchor and re-anchors at `now`.
    pub fn tick(&mut self, now: DateTime<Utc>, delegate: &mut dyn SchedulerDelegate) {
        for slot in &mut self.schedules {
            let entry = match slot {
                Some(e) if e.schedule.enabled => e,
                _ => continue,
            };

            let Some(anchor) = entry.anchor else {
                entry.anchor = Some(now);
                continue;
            };
            let interval = entry.schedule.interval;
            if now - anchor >= interval {
                info!(
                    "scheduler: '{}' fired (every {}s)",
                    entry.schedule.label,
                    interval.num_seconds()
                );
                delegate.on_schedule_fired(entry.schedule.job);
                entry.anchor = Some(now);
            }
        }
    }

    /// Number of enabled schedules.
    pub fn active_count(&self) -> usize {
        self.schedules
            .iter()
            .filter(|s| s.as_ref().is_some_and(|e| e.schedule.enabled))
            .count()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
