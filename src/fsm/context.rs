//! Shared mutable context threaded through every sync state handler.
//!
//! `SyncContext` is the blackboard the handlers read from and write to:
//! the persisted [`PumpSyncState`], the current poll, pushed events
//! awaiting reconciliation, and the action requests the loop service
//! executes after each tick.

use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::app::events::PollOutcome;
use crate::app::ports::StoragePort;
use crate::config::LoopConfig;
use crate::error::StoreError;
use crate::pump::{PumpEvent, ReservoirLevel};

const SYNC_NAMESPACE: &str = "sync";
const SYNC_KEY: &str = "state";
const SYNC_BUF_LEN: usize = 512;

// ---------------------------------------------------------------------------
// Persisted sync state
// ---------------------------------------------------------------------------

/// Per-session pump synchronization state.
///
/// Loaded at startup and persisted after every mutation.  The two
/// in-flight flags are never trusted across a restart.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PumpSyncState {
    pub poll_in_flight: bool,
    pub dosing_in_progress: bool,
    /// When `dosing_in_progress` was last raised.
    pub dosing_since: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Timestamp of the newest durably reconciled pump event.
    pub last_event_watermark: Option<DateTime<Utc>>,
    pub active_manual_override: bool,
    pub reservoir_level: ReservoirLevel,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PumpSyncState {
    /// Load from `storage`, or defaults if absent or unreadable.
    pub fn load(storage: &dyn StoragePort) -> Self {
        let mut buf = [0u8; SYNC_BUF_LEN];
        let mut state = match storage.read(SYNC_NAMESPACE, SYNC_KEY, &mut buf) {
            Ok(len) => match postcard::from_bytes::<Self>(&buf[..len]) {
                Ok(state) => state,
                Err(e) => {
                    warn!("sync state corrupted, starting fresh: {}", e);
                    Self::default()
                }
            },
            Err(StoreError::NotFound) => Self::default(),
            Err(e) => {
                warn!("sync state unreadable, starting fresh: {}", e);
                Self::default()
            }
        };
        state.poll_in_flight = false;
        state.dosing_in_progress = false;
        state.dosing_since = None;
        state
    }

    pub fn persist(&self, storage: &mut dyn StoragePort) -> Result<(), StoreError> {
        let bytes =
            postcard::to_allocvec(self).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        storage.write(SYNC_NAMESPACE, SYNC_KEY, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Poll tracking
// ---------------------------------------------------------------------------

/// Identity and progress of the poll currently in flight.
#[derive(Debug, Clone, Default)]
pub struct PollTracker {
    next_id: u64,
    /// Id of the in-flight poll, if any.
    pub current: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set by a driver completion or a timeout.
    pub outcome: Option<PollOutcome>,
}

impl PollTracker {
    /// Start a new poll at `now` and return its id.
    pub fn begin(&mut self, now: DateTime<Utc>) -> u64 {
        self.next_id += 1;
        self.current = Some(self.next_id);
        self.started_at = Some(now);
        self.outcome = None;
        self.next_id
    }

    /// Close the current poll, returning its id and outcome.
    pub fn finish(&mut self) -> Option<(u64, PollOutcome)> {
        let id = self.current.take()?;
        self.started_at = None;
        let outcome = self.outcome.take().unwrap_or(PollOutcome::TimedOut);
        Some((id, outcome))
    }

    /// True if `poll_id` is the poll in flight.
    pub fn is_current(&self, poll_id: u64) -> bool {
        self.current == Some(poll_id)
    }
}

// ---------------------------------------------------------------------------
// Action requests (written by handlers, executed by the service)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SyncActions {
    /// Invoke the driver's refresh for this poll id.
    pub request_refresh: Option<u64>,
    /// Reconcile `pending_events` into the event store.
    pub reconcile: bool,
    /// A poll ended: a decision cycle may run.
    pub cycle_may_proceed: bool,
    /// The poll that just ended, for reporting.
    pub finished_poll: Option<(u64, PollOutcome)>,
}

// ---------------------------------------------------------------------------
// SyncContext
// ---------------------------------------------------------------------------

pub struct SyncContext {
    // -- Timing --
    /// Host clock: advanced only by heartbeat, tick and dosing commands.
    pub now: DateTime<Utc>,
    pub poll_timeout: Duration,

    // -- Session --
    pub sync: PumpSyncState,
    /// Refreshed from the port bundle before every command.
    pub pump_configured: bool,

    // -- Triggers --
    /// An accepted heartbeat is waiting for `Idle` to act on it.
    pub heartbeat_pending: bool,
    pub poll: PollTracker,
    /// Pushed events not yet reconciled.
    pub pending_events: Vec<PumpEvent>,
    /// Set by the service once the reconcile action has run.
    pub reconcile_done: bool,

    // -- Outputs --
    pub actions: SyncActions,
}

impl SyncContext {
    pub fn new(config: &LoopConfig, now: DateTime<Utc>) -> Self {
        Self::with_state(config, now, PumpSyncState::default())
    }

    pub fn with_state(config: &LoopConfig, now: DateTime<Utc>, sync: PumpSyncState) -> Self {
        Self {
            now,
            poll_timeout: config.poll_timeout(),
            sync,
            pump_configured: false,
            heartbeat_pending: false,
            poll: PollTracker::default(),
            pending_events: Vec::new(),
            reconcile_done: false,
            actions: SyncActions::default(),
        }
    }

    /// True if the in-flight poll has exceeded the timeout at `now`.
    pub fn poll_overdue(&self) -> bool {
        self.poll
            .started_at
            .is_some_and(|started| self.now - started >= self.poll_timeout)
    }
}
