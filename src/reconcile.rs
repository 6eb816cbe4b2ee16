//! Pump event reconciliation.
//!
//! ```text
//!  pushed batch ──▶ filter implausible temp basals ──▶ append ──▶ advance watermark
//!                                                        │
//!                                                        └──▶ rebuild pumpHistory blob
//! ```
//!
//! The watermark only moves after the store accepted the batch, and never
//! backwards.  A failed append leaves it where it was so the next push
//! re-offers the overlap; the store deduplicates by event id.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::app::ports::{BlobStore, EventStore};
use crate::error::StoreError;
use crate::pipeline::keys::ArtifactKey;
use crate::pump::PumpEvent;

/// Result of reconciling one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub accepted: usize,
    pub rejected: usize,
    /// Watermark after this batch.
    pub watermark: Option<DateTime<Utc>>,
}

/// Split off temp basals faster than `max_basal` (U/h).
///
/// Returns the surviving events and how many were dropped.  Events at
/// exactly the ceiling survive.
pub fn filter_implausible(batch: Vec<PumpEvent>, max_basal: f64) -> (Vec<PumpEvent>, usize) {
    let before = batch.len();
    let kept: Vec<PumpEvent> = batch
        .into_iter()
        .filter(|event| match event.temp_basal_rate() {
            Some(rate) if rate.is_nan() || rate > max_basal => {
                warn!(
                    "dropping implausible temp basal {} ({} U/h > {} U/h)",
                    event.id, rate, max_basal
                );
                false
            }
            _ => true,
        })
        .collect();
    let rejected = before - kept.len();
    (kept, rejected)
}

/// Filter, append, and advance `watermark`.
///
/// On append failure the watermark is untouched and the error returned.
pub fn reconcile(
    batch: Vec<PumpEvent>,
    max_basal: f64,
    watermark: &mut Option<DateTime<Utc>>,
    events: &mut dyn EventStore,
) -> Result<ReconcileReport, StoreError> {
    let (kept, rejected) = filter_implausible(batch, max_basal);

    if kept.is_empty() {
        return Ok(ReconcileReport {
            accepted: 0,
            rejected,
            watermark: *watermark,
        });
    }

    events.append_events(&kept)?;

    let newest = kept.iter().map(|e| e.timestamp).max();
    // `None` orders below any timestamp.
    *watermark = (*watermark).max(newest);

    info!(
        "reconciled {} event(s), rejected {}, watermark {:?}",
        kept.len(),
        rejected,
        watermark
    );
    Ok(ReconcileReport {
        accepted: kept.len(),
        rejected,
        watermark: *watermark,
    })
}

/// Rebuild the `pumpHistory` blob from events newer than `watermark - window`.
///
/// Newest first.  Returns the number of events written.
pub fn refresh_pump_history(
    events: &dyn EventStore,
    blobs: &mut dyn BlobStore,
    watermark: DateTime<Utc>,
    window: Duration,
) -> Result<usize, StoreError> {
    let mut history = events.query_events(watermark - window);
    history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let count = history.len();
    let value = serde_json::to_value(&history)
        .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
    blobs.save(ArtifactKey::PumpHistory.as_str(), &value)?;
    Ok(count)
}
