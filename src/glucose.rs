//! Glucose fetch adapter for pump-integrated sensors.
//!
//! Converts raw analyte samples into normalized [`GlucoseReading`]s with a
//! trend direction per sample, rate-limited by a fetch watermark.
//!
//! ```text
//!  fetch(now)
//!    ├─ watermark younger than min interval? ──▶ []
//!    ├─ read samples ── races ── timeout ──▶ []
//!    └─ sliding window of 2 ──▶ [None, dir(s0,s1), dir(s1,s2), ...]
//! ```

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures_lite::future;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::ports::{AnalyteSource, BlobStore};
use crate::config::LoopConfig;
use crate::error::StoreError;
use crate::pipeline::keys::ArtifactKey;

/// One raw sample from the sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyteSample {
    pub id: String,
    /// mg/dL.
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Trend between two consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    /// Direction of travel from `prev` to `next`.
    pub fn between(prev: f64, next: f64) -> Self {
        if next > prev {
            Self::Up
        } else if next < prev {
            Self::Down
        } else {
            Self::Flat
        }
    }
}

/// Normalized reading as stored in the glucose history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseReading {
    pub id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// `None` for the first sample of a batch.
    pub trend_direction: Option<Direction>,
}

/// Tag each sample with its direction relative to the previous one.
pub fn normalize(samples: &[AnalyteSample]) -> Vec<GlucoseReading> {
    let mut out = Vec::with_capacity(samples.len());
    if let Some(first) = samples.first() {
        out.push(reading(first, None));
    }
    for pair in samples.windows(2) {
        let dir = Direction::between(pair[0].value, pair[1].value);
        out.push(reading(&pair[1], Some(dir)));
    }
    out
}

fn reading(sample: &AnalyteSample, trend_direction: Option<Direction>) -> GlucoseReading {
    GlucoseReading {
        id: sample.id.clone(),
        value: sample.value,
        timestamp: sample.timestamp,
        trend_direction,
    }
}

// ═══════════════════════════════════════════════════════════════
//  Fetcher
// ═══════════════════════════════════════════════════════════════

/// Rate-limited, timeout-bounded reader over an [`AnalyteSource`].
pub struct GlucoseFetcher<S: AnalyteSource> {
    source: S,
    timeout: StdDuration,
    min_interval: Duration,
    /// Timestamp of the newest sample from the last non-empty fetch.
    watermark: Option<DateTime<Utc>>,
}

impl<S: AnalyteSource> GlucoseFetcher<S> {
    pub fn new(source: S, config: &LoopConfig) -> Self {
        Self {
            source,
            timeout: StdDuration::from_secs(u64::from(config.glucose_fetch_timeout_secs)),
            min_interval: Duration::seconds(i64::from(config.glucose_min_fetch_interval_secs)),
            watermark: None,
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Read new samples.  A timeout or driver error yields an empty vec.
    pub async fn fetch(&mut self, now: DateTime<Utc>) -> Vec<GlucoseReading> {
        if let Some(wm) = self.watermark {
            if now - wm < self.min_interval {
                debug!("glucose: last sample {} is recent, skipping read", wm);
                return Vec::new();
            }
        }

        let since = self.watermark;
        let timeout = self.timeout;
        let source = &mut self.source;
        let read = async move { Some(source.read_samples(since).await) };
        let expire = async {
            async_io_mini::Timer::after(timeout).await;
            None
        };

        let samples = match future::or(read, expire).await {
            Some(Ok(samples)) => samples,
            Some(Err(e)) => {
                warn!("glucose: read failed: {}", e);
                return Vec::new();
            }
            None => {
                warn!("glucose: read timed out after {}s", timeout.as_secs());
                return Vec::new();
            }
        };

        let readings = normalize(&samples);
        if let Some(last) = readings.last() {
            self.watermark = Some(last.timestamp);
            info!("glucose: {} new reading(s), newest {}", readings.len(), last.timestamp);
        }
        readings
    }
}

// ═══════════════════════════════════════════════════════════════
//  History merge
// ═══════════════════════════════════════════════════════════════

/// Merge `incoming` into the `glucoseHistory` blob.
///
/// Deduplicates by id (incoming wins), sorts newest first and drops
/// readings older than `window` before `now`.  Returns the stored count.
pub fn merge_history(
    blobs: &mut dyn BlobStore,
    incoming: &[GlucoseReading],
    now: DateTime<Utc>,
    window: Duration,
) -> Result<usize, StoreError> {
    let mut history: Vec<GlucoseReading> = blobs
        .retrieve(ArtifactKey::GlucoseHistory.as_str())
        .and_then(|v: Value| serde_json::from_value(v).ok())
        .unwrap_or_default();

    history.retain(|old| incoming.iter().all(|new| new.id != old.id));
    history.extend(incoming.iter().cloned());
    let cutoff = now - window;
    history.retain(|r| r.timestamp >= cutoff);
    history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let value =
        serde_json::to_value(&history).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
    blobs.save(ArtifactKey::GlucoseHistory.as_str(), &value)?;
    Ok(history.len())
}
