//! Loop service: the hexagonal core.
//!
//! [`LoopService`] owns the sync state machine, the status supervisor,
//! the pipeline orchestrator and the auxiliary scheduler.  It is driven
//! one [`LoopCommand`] at a time from the serialized worker; all I/O flows
//! through the [`Ports`] borrowed for that command.
//!
//! ```text
//!  heartbeat / tick ──▶ ┌──────────────────────────────┐ ──▶ EventSink
//!  driver completions ─▶│         LoopService          │ ──▶ SignalBus
//!  status / events    ─▶│ FSM · Supervisor · Pipeline  │ ──▶ BlobStore
//!                       └──────────────────────────────┘
//!                                   │ refresh / ack
//!                                   ▼
//!                              PumpDriver ── completion ──▶ CommandQueue
//! ```
//!
//! Every handler is local-recoverable: failures are logged, counted and
//! emitted, and the service carries on with the next command.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;

use crate::config::LoopConfig;
use crate::diagnostics::{CycleLog, CycleRecord, RuntimeMetrics};
use crate::error::DriverError;
use crate::fsm::context::{PumpSyncState, SyncContext};
use crate::fsm::states::build_state_table;
use crate::fsm::{Fsm, StateId};
use crate::glucose::{GlucoseReading, merge_history};
use crate::pipeline::Pipeline;
use crate::pipeline::keys::ArtifactKey;
use crate::pipeline::stage::StageRegistry;
use crate::pipeline::suggestion::TempBasalState;
use crate::pump::{AckRecord, AlertId, PumpStatus, ReservoirLevel};
use crate::reconcile::{reconcile, refresh_pump_history};
use crate::safety::StatusSupervisor;
use crate::scheduler::{AuxJob, Scheduler};

use super::commands::LoopCommand;
use super::events::{LoopEvent, PollOutcome};
use super::ports::{CommandQueue, Ports, StoragePort};
use super::signals::{Signal, SignalBus};

/// Upper bound on FSM steps per command.  One full pass is
/// Idle → Polling → Reconciling → Idle → Polling.
const MAX_SETTLE_STEPS: usize = 8;

// ───────────────────────────────────────────────────────────────
// LoopService
// ───────────────────────────────────────────────────────────────

pub struct LoopService {
    config: LoopConfig,
    fsm: Fsm,
    ctx: SyncContext,
    supervisor: StatusSupervisor,
    pipeline: Pipeline,
    scheduler: Scheduler,
    signals: SignalBus,
    cycle_log: CycleLog,
    metrics: RuntimeMetrics,
    /// Driver completions re-enter the worker through this queue.
    queue: Arc<dyn CommandQueue>,
}

impl LoopService {
    /// Build the service and restore persisted sync state from `storage`.
    ///
    /// Does **not** start the FSM; call [`start`](Self::start) next.
    pub fn new(
        config: LoopConfig,
        stages: StageRegistry,
        queue: Arc<dyn CommandQueue>,
        storage: &dyn StoragePort,
        now: DateTime<Utc>,
    ) -> Self {
        let sync = PumpSyncState::load(storage);
        let ctx = SyncContext::with_state(&config, now, sync);
        let mut cycle_log = CycleLog::new();
        cycle_log.init(storage);

        Self {
            fsm: Fsm::new(build_state_table(), StateId::Idle),
            ctx,
            supervisor: StatusSupervisor::new(config.reservoir_plausibility_ceiling),
            pipeline: Pipeline::new(stages, &config),
            scheduler: Scheduler::from_config(&config),
            signals: SignalBus::new(),
            cycle_log,
            metrics: RuntimeMetrics::default(),
            queue,
            config,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(&mut self, ports: &mut Ports<'_>) {
        self.ctx.pump_configured = ports.pump.is_some();
        self.fsm.start(&mut self.ctx);
        ports.sink.emit(&LoopEvent::Started(self.fsm.current_state()));
        info!(
            "LoopService started in {:?} (pump: {})",
            self.fsm.current_state(),
            ports.pump.as_deref().map_or("none", |p| p.family())
        );
    }

    // ── Command handling ──────────────────────────────────────

    /// Process one command to completion.
    pub fn handle(&mut self, cmd: LoopCommand, ports: &mut Ports<'_>) {
        self.ctx.pump_configured = ports.pump.is_some();

        match cmd {
            LoopCommand::Heartbeat(at) => self.on_heartbeat(at, ports),
            LoopCommand::Tick(at) => self.on_tick(at, ports),
            LoopCommand::PollCompleted { poll_id, result } => {
                self.on_poll_completed(poll_id, result, ports);
            }
            LoopCommand::StatusPushed(status) => self.on_status(&status, ports),
            LoopCommand::EventsPushed(batch) => {
                debug!("{} event(s) pushed", batch.len());
                self.ctx.pending_events.extend(batch);
                self.run_fsm(ports);
            }
            LoopCommand::AlertRaised(alert) => self.on_alert(alert, ports),
            LoopCommand::AlertAckCompleted { alert, result } => {
                self.finish_ack(alert, result, ports);
            }
            LoopCommand::DosingStarted(at) => {
                self.advance_clock(at);
                self.set_dosing(Some(at), ports);
            }
            LoopCommand::DosingFinished(at) => {
                self.advance_clock(at);
                self.set_dosing(None, ports);
            }
            LoopCommand::GlucoseFetched(readings) => self.on_glucose(&readings, ports),
            LoopCommand::RunAutosens => self.run_aux(AuxJob::Autosens, ports),
            LoopCommand::RunAutotune => self.run_aux(AuxJob::Autotune, ports),
            LoopCommand::SettingsChanged => self.rebuild_profiles(ports),
        }
    }

    // ── Heartbeat and tick ────────────────────────────────────

    fn on_heartbeat(&mut self, at: DateTime<Utc>, ports: &mut Ports<'_>) {
        self.advance_clock(at);
        self.metrics.heartbeats += 1;

        // An overdue poll or a stale dosing flag must not swallow the beat.
        self.run_fsm(ports);
        self.expire_dosing(ports);

        let reason = if self.ctx.sync.poll_in_flight {
            Some("poll in flight")
        } else if self.ctx.sync.dosing_in_progress {
            Some("dosing in progress")
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!("heartbeat {} ignored: {}", at, reason);
            self.metrics.heartbeats_ignored += 1;
            ports.sink.emit(&LoopEvent::HeartbeatIgnored { reason });
            return;
        }

        self.ctx.sync.last_heartbeat = Some(at);
        self.ctx.heartbeat_pending = true;
        self.persist_sync(ports);
        self.run_fsm(ports);
    }

    fn on_tick(&mut self, at: DateTime<Utc>, ports: &mut Ports<'_>) {
        self.advance_clock(at);
        self.run_fsm(ports);
        self.expire_dosing(ports);

        let mut jobs: Vec<AuxJob> = Vec::new();
        self.scheduler.tick(at, &mut jobs);
        for job in jobs {
            self.run_aux(job, ports);
        }
    }

    fn expire_dosing(&mut self, ports: &mut Ports<'_>) {
        let now = self.ctx.now;
        if self.ctx.sync.dosing_in_progress
            && self
                .ctx
                .sync
                .dosing_since
                .is_some_and(|since| now - since >= self.config.dosing_timeout())
        {
            warn!(
                "dosing flag held for over {}s without acknowledgement, clearing",
                self.config.dosing_timeout_secs
            );
            self.set_dosing(None, ports);
        }
    }

    // ── Polling ───────────────────────────────────────────────

    fn on_poll_completed(
        &mut self,
        poll_id: u64,
        result: Result<(), DriverError>,
        ports: &mut Ports<'_>,
    ) {
        if !self.ctx.poll.is_current(poll_id) || self.ctx.poll.outcome.is_some() {
            debug!("stale completion for poll {} ignored", poll_id);
            self.metrics.stale_completions += 1;
            return;
        }

        let outcome = match result {
            Ok(()) => PollOutcome::Completed,
            Err(e) => {
                warn!("poll {} failed: {}", poll_id, e);
                self.publish(Signal::DriverError(e.clone()), ports);
                PollOutcome::Failed(e)
            }
        };
        self.ctx.poll.outcome = Some(outcome);
        self.run_fsm(ports);
    }

    /// Alternate between executing handler requests and ticking until the
    /// machine settles, then run a decision cycle if a poll just ended.
    fn run_fsm(&mut self, ports: &mut Ports<'_>) {
        let mut settled = false;
        for _ in 0..MAX_SETTLE_STEPS {
            self.apply_actions(ports);
            let from = self.fsm.current_state();
            if !self.fsm.tick(&mut self.ctx) {
                settled = true;
                break;
            }
            ports.sink.emit(&LoopEvent::StateChanged {
                from,
                to: self.fsm.current_state(),
            });
        }
        if !settled {
            warn!(
                "sync FSM still moving after {} steps, resuming on next command",
                MAX_SETTLE_STEPS
            );
            self.apply_actions(ports);
        }
        self.persist_sync(ports);

        if std::mem::take(&mut self.ctx.actions.cycle_may_proceed) {
            self.run_cycle(ports);
        }
    }

    fn apply_actions(&mut self, ports: &mut Ports<'_>) {
        if let Some(poll_id) = self.ctx.actions.request_refresh.take() {
            self.metrics.polls += 1;
            ports.sink.emit(&LoopEvent::PollStarted { poll_id });
            match ports.pump.as_deref_mut() {
                Some(pump) => {
                    let queue = Arc::clone(&self.queue);
                    pump.refresh_data(Box::new(move |result| {
                        queue.post(LoopCommand::PollCompleted { poll_id, result });
                    }));
                }
                None => self.ctx.poll.outcome = Some(PollOutcome::NoPump),
            }
        }

        if std::mem::take(&mut self.ctx.actions.reconcile) {
            self.reconcile_pending(ports);
            self.ctx.reconcile_done = true;
        }

        if let Some((poll_id, outcome)) = self.ctx.actions.finished_poll.take() {
            match outcome {
                PollOutcome::TimedOut => self.metrics.poll_timeouts += 1,
                PollOutcome::Failed(_) => self.metrics.poll_failures += 1,
                PollOutcome::Completed | PollOutcome::NoPump => {}
            }
            ports
                .sink
                .emit(&LoopEvent::PollFinished { poll_id, outcome });
        }
    }

    // ── Event reconciliation ──────────────────────────────────

    fn reconcile_pending(&mut self, ports: &mut Ports<'_>) {
        let batch = std::mem::take(&mut self.ctx.pending_events);
        let Some(pump) = ports.pump.as_deref() else {
            warn!("{} event(s) pushed with no pump configured, dropped", batch.len());
            return;
        };
        let ceiling = pump.max_basal_ceiling();

        match reconcile(
            batch,
            ceiling,
            &mut self.ctx.sync.last_event_watermark,
            &mut *ports.events,
        ) {
            Ok(report) => {
                self.metrics.events_reconciled += report.accepted as u64;
                self.metrics.events_rejected += report.rejected as u64;
                if report.accepted > 0 {
                    if let Some(watermark) = report.watermark {
                        if let Err(e) = refresh_pump_history(
                            &*ports.events,
                            &mut *ports.blobs,
                            watermark,
                            self.config.pump_history_window(),
                        ) {
                            warn!("pump history refresh failed: {}", e);
                        }
                    }
                }
                ports.sink.emit(&LoopEvent::EventsReconciled {
                    accepted: report.accepted,
                    rejected: report.rejected,
                    watermark: report.watermark,
                });
            }
            Err(e) => {
                warn!("event append failed, watermark held: {}", e);
                self.metrics.reconcile_failures += 1;
                ports.sink.emit(&LoopEvent::ReconcileFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    // ── Decision cycle ────────────────────────────────────────

    fn run_cycle(&mut self, ports: &mut Ports<'_>) {
        // Stamped with the heartbeat that started the poll.
        let clock = self.ctx.sync.last_heartbeat.unwrap_or(self.ctx.now);
        self.ctx.sync.dosing_in_progress = true;
        self.ctx.sync.dosing_since = Some(self.ctx.now);

        let status = ports
            .pump
            .as_deref()
            .and_then(|p| p.current_status())
            .or_else(|| self.supervisor.last_status().cloned());
        let temp_basal = TempBasalState::from_status(status.as_ref(), clock);

        match self
            .pipeline
            .run_decision_cycle(&mut *ports.blobs, clock, &temp_basal)
        {
            Ok(suggestion) => {
                self.metrics.cycles_ok += 1;
                self.cycle_log
                    .write_entry(&mut *ports.storage, &CycleRecord::success(clock.timestamp()));
                let actionable = suggestion.is_actionable();
                self.publish(Signal::Suggestion(suggestion), ports);
                ports.sink.emit(&LoopEvent::CycleCompleted { clock });
                if actionable {
                    debug!("suggestion actionable, holding dosing flag for actuation");
                } else {
                    self.clear_dosing();
                }
            }
            Err(e) => {
                self.metrics.cycles_failed += 1;
                let stage = e.stage();
                self.cycle_log.write_entry(
                    &mut *ports.storage,
                    &CycleRecord::failure(
                        clock.timestamp(),
                        stage.map(|s| s.as_str()),
                        &e.to_string(),
                    ),
                );
                ports.sink.emit(&LoopEvent::CycleFailed {
                    stage,
                    reason: e.to_string(),
                });
                self.clear_dosing();
            }
        }
        self.persist_sync(ports);
    }

    // ── Status pushes ─────────────────────────────────────────

    fn on_status(&mut self, status: &PumpStatus, ports: &mut Ports<'_>) {
        if status.timestamp > self.ctx.now {
            debug!("pump clock ahead of host: {} > {}", status.timestamp, self.ctx.now);
        }
        let signals = self.supervisor.observe(status, self.ctx.now);
        if signals.is_empty() {
            return;
        }

        for signal in &signals {
            match signal {
                Signal::ManualOverride(on) => self.ctx.sync.active_manual_override = *on,
                Signal::Expiry(at) => self.ctx.sync.expires_at = *at,
                Signal::Reservoir(level) => {
                    self.ctx.sync.reservoir_level = *level;
                    mirror_reservoir(*level, ports);
                }
                _ => {}
            }
        }
        self.persist_sync(ports);

        for signal in signals {
            self.publish(signal, ports);
        }
    }

    // ── Alerts ────────────────────────────────────────────────

    fn on_alert(&mut self, alert: AlertId, ports: &mut Ports<'_>) {
        if ports.alerts.is_acknowledged(&alert) {
            debug!("alert {} already acknowledged", alert);
            return;
        }
        match ports.pump.as_deref_mut() {
            Some(pump) => {
                info!("acknowledging alert {} on {}", alert, pump.family());
                let queue = Arc::clone(&self.queue);
                let id = alert.clone();
                pump.acknowledge_alert(
                    &alert,
                    Box::new(move |result| {
                        queue.post(LoopCommand::AlertAckCompleted { alert: id, result });
                    }),
                );
            }
            None => self.finish_ack(alert, Err(DriverError::NotConfigured), ports),
        }
    }

    fn finish_ack(&mut self, alert: AlertId, result: Result<(), DriverError>, ports: &mut Ports<'_>) {
        let driver_clear = ports
            .pump
            .as_deref()
            .is_none_or(|p| p.active_alerts().is_empty());

        let record = match result {
            Ok(()) => AckRecord {
                alert,
                acknowledged_at: self.ctx.now,
                forced: false,
                error: None,
            },
            Err(e) if driver_clear => {
                warn!(
                    "ack of {} failed ({}) but driver reports no active alerts, forcing",
                    alert, e
                );
                self.metrics.alerts_forced += 1;
                AckRecord {
                    alert,
                    acknowledged_at: self.ctx.now,
                    forced: true,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => {
                warn!("ack of {} failed: {}", alert, e);
                ports.sink.emit(&LoopEvent::AlertAckFailed {
                    alert,
                    error: e.to_string(),
                });
                self.publish(Signal::DriverError(e), ports);
                return;
            }
        };

        match ports.alerts.record_ack(record.clone()) {
            Ok(()) => {
                self.metrics.alerts_acknowledged += 1;
                ports.sink.emit(&LoopEvent::AlertAcknowledged(record));
            }
            Err(e) => warn!("could not store ack for {}: {}", record.alert, e),
        }
    }

    // ── Glucose ───────────────────────────────────────────────

    fn on_glucose(&mut self, readings: &[GlucoseReading], ports: &mut Ports<'_>) {
        match merge_history(
            &mut *ports.blobs,
            readings,
            self.ctx.now,
            self.config.glucose_history_window(),
        ) {
            Ok(stored) => ports.sink.emit(&LoopEvent::GlucoseMerged {
                received: readings.len(),
                stored,
            }),
            Err(e) => warn!("glucose history merge failed: {}", e),
        }
    }

    // ── Auxiliary pipelines ───────────────────────────────────

    fn run_aux(&mut self, job: AuxJob, ports: &mut Ports<'_>) {
        let result = match job {
            AuxJob::Autosens => self.pipeline.run_autosense(&mut *ports.blobs),
            AuxJob::Autotune => self.pipeline.run_autotune(&mut *ports.blobs),
        };
        match result {
            Ok(_) => {
                ports.sink.emit(&LoopEvent::AuxCompleted(job));
                // A new tuning result feeds the active profile.
                if job == AuxJob::Autotune {
                    self.rebuild_profiles(ports);
                }
            }
            Err(e) => ports.sink.emit(&LoopEvent::AuxFailed {
                job,
                reason: e.to_string(),
            }),
        }
    }

    fn rebuild_profiles(&mut self, ports: &mut Ports<'_>) {
        match self.pipeline.synthesize_profiles(&mut *ports.blobs) {
            Ok(_) => ports.sink.emit(&LoopEvent::ProfilesRebuilt),
            Err(e) => ports.sink.emit(&LoopEvent::ProfileRebuildFailed {
                reason: e.to_string(),
            }),
        }
    }

    // ── Helpers ───────────────────────────────────────────────

    /// Commands are not strictly time-ordered; the context clock never
    /// moves backwards.
    fn advance_clock(&mut self, at: DateTime<Utc>) {
        self.ctx.now = self.ctx.now.max(at);
    }

    fn set_dosing(&mut self, since: Option<DateTime<Utc>>, ports: &mut Ports<'_>) {
        match since {
            Some(at) => {
                info!("dosing started at {}", at);
                self.ctx.sync.dosing_in_progress = true;
                self.ctx.sync.dosing_since = Some(at);
            }
            None => {
                info!("dosing finished");
                self.clear_dosing();
            }
        }
        self.persist_sync(ports);
    }

    fn clear_dosing(&mut self) {
        self.ctx.sync.dosing_in_progress = false;
        self.ctx.sync.dosing_since = None;
    }

    fn persist_sync(&self, ports: &mut Ports<'_>) {
        if let Err(e) = self.ctx.sync.persist(&mut *ports.storage) {
            warn!("could not persist sync state: {}", e);
        }
    }

    fn publish(&mut self, signal: Signal, ports: &mut Ports<'_>) {
        self.signals.publish(&signal);
        ports.sink.emit(&LoopEvent::Signal(signal));
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn state(&self) -> StateId {
        self.fsm.current_state()
    }

    pub fn sync_state(&self) -> &PumpSyncState {
        &self.ctx.sync
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &StatusSupervisor {
        &self.supervisor
    }

    /// Register observers here before the worker starts.
    pub fn signals_mut(&mut self) -> &mut SignalBus {
        &mut self.signals
    }

    /// Id of the poll in flight, if any.
    pub fn current_poll(&self) -> Option<u64> {
        self.ctx.poll.current
    }

    /// Stored cycle outcomes, oldest first.
    pub fn cycle_records(&self, storage: &dyn StoragePort) -> Vec<CycleRecord> {
        self.cycle_log.read_all(storage).into_iter().collect()
    }
}

/// Write the reservoir signal to its blob: units, or null when unknown.
fn mirror_reservoir(level: ReservoirLevel, ports: &mut Ports<'_>) {
    let value = level.units().map_or(Value::Null, Value::from);
    if let Err(e) = ports
        .blobs
        .save(ArtifactKey::ReservoirLevel.as_str(), &value)
    {
        warn!("could not mirror reservoir level: {}", e);
    }
}
