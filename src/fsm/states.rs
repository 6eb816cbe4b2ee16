//! Concrete state handler functions and table builder.
//!
//! ```text
//!  IDLE ──[heartbeat accepted]──▶ POLLING
//!   ▲  ▲                            │
//!   │  └──[outcome, no events]──────┤
//!   │                               │ [outcome, events pending]
//!   │                               ▼
//!   └──────[reconciled]──────── RECONCILING ◀──[events pushed]── IDLE
//! ```
//!
//! A poll ends on driver completion, on timeout, or immediately when no
//! pump is configured.  Leaving `Polling` always lets a decision cycle run.

use super::context::SyncContext;
use super::{StateDescriptor, StateId};
use crate::app::events::PollOutcome;
use log::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

pub fn build_state_table() -> [StateDescriptor; StateId::COUNT] {
    [
        // Index 0 : Idle
        StateDescriptor {
            id: StateId::Idle,
            name: "Idle",
            on_enter: Some(idle_enter),
            on_exit: None,
            on_update: idle_update,
        },
        // Index 1 : Polling
        StateDescriptor {
            id: StateId::Polling,
            name: "Polling",
            on_enter: Some(polling_enter),
            on_exit: Some(polling_exit),
            on_update: polling_update,
        },
        // Index 2 : Reconciling
        StateDescriptor {
            id: StateId::Reconciling,
            name: "Reconciling",
            on_enter: Some(reconciling_enter),
            on_exit: Some(reconciling_exit),
            on_update: reconciling_update,
        },
    ]
}

// ═══════════════════════════════════════════════════════════════════════════
//  IDLE
// ═══════════════════════════════════════════════════════════════════════════

fn idle_enter(ctx: &mut SyncContext) {
    debug!(
        "IDLE: waiting (watermark {:?})",
        ctx.sync.last_event_watermark
    );
}

fn idle_update(ctx: &mut SyncContext) -> Option<StateId> {
    if !ctx.pending_events.is_empty() {
        return Some(StateId::Reconciling);
    }

    // Guard: the dosing flag blocks polling outright.
    if ctx.heartbeat_pending && !ctx.sync.dosing_in_progress && !ctx.sync.poll_in_flight {
        return Some(StateId::Polling);
    }

    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  POLLING : one refresh in flight
// ═══════════════════════════════════════════════════════════════════════════

fn polling_enter(ctx: &mut SyncContext) {
    ctx.heartbeat_pending = false;
    ctx.sync.poll_in_flight = true;
    let poll_id = ctx.poll.begin(ctx.now);

    if ctx.pump_configured {
        info!("POLLING: poll {} requesting pump refresh", poll_id);
        ctx.actions.request_refresh = Some(poll_id);
    } else {
        info!("POLLING: poll {} has no pump configured", poll_id);
        ctx.poll.outcome = Some(PollOutcome::NoPump);
    }
}

fn polling_update(ctx: &mut SyncContext) -> Option<StateId> {
    if ctx.poll.outcome.is_none() && ctx.poll_overdue() {
        warn!(
            "POLLING: poll {:?} timed out after {}s",
            ctx.poll.current,
            ctx.poll_timeout.num_seconds()
        );
        ctx.poll.outcome = Some(PollOutcome::TimedOut);
    }

    ctx.poll.outcome.as_ref()?;

    if ctx.pending_events.is_empty() {
        Some(StateId::Idle)
    } else {
        Some(StateId::Reconciling)
    }
}

fn polling_exit(ctx: &mut SyncContext) {
    ctx.sync.poll_in_flight = false;
    ctx.actions.finished_poll = ctx.poll.finish();
    // Every outcome, failures and timeouts included.
    ctx.actions.cycle_may_proceed = true;
}

// ═══════════════════════════════════════════════════════════════════════════
//  RECONCILING : pushed events are being filtered and appended
// ═══════════════════════════════════════════════════════════════════════════

fn reconciling_enter(ctx: &mut SyncContext) {
    info!(
        "RECONCILING: {} pending event(s)",
        ctx.pending_events.len()
    );
    ctx.reconcile_done = false;
    ctx.actions.reconcile = true;
}

fn reconciling_update(ctx: &mut SyncContext) -> Option<StateId> {
    if ctx.reconcile_done {
        Some(StateId::Idle)
    } else {
        None
    }
}

fn reconciling_exit(ctx: &mut SyncContext) {
    ctx.reconcile_done = false;
}
