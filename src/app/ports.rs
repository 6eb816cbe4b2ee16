//! Port traits: the hexagonal boundary between loop logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ LoopService (domain)
//! ```
//!
//! Driven adapters (stores, pump families, stage implementations, event
//! sinks) implement these traits.  The [`LoopService`](super::service::LoopService)
//! receives them at call sites through [`Ports`], so the domain core
//! never owns an I/O handle.
//!
//! ## Contract notes
//!
//! - **BlobStore** writes are last-writer-wins per key.
//! - **EventStore** deduplicates appended events by identity.
//! - **PumpDriver** completions may fire on any thread; they only ever
//!   post a [`LoopCommand`] back into the serialized queue.

use std::collections::BTreeSet;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::commands::LoopCommand;
use crate::config::LoopConfig;
use crate::error::{ConfigError, DriverError, StageError, StoreError};
use crate::glucose::AnalyteSample;
use crate::pipeline::stage::StageInputs;
use crate::pump::{AckRecord, AlertId, PumpEvent, PumpStatus};

// ───────────────────────────────────────────────────────────────
// Blob store (domain ↔ named JSON artifacts)
// ───────────────────────────────────────────────────────────────

/// Key-value store of serialized artifacts and settings.
pub trait BlobStore {
    /// Replace the value under `key`.
    fn save(&mut self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Current value under `key`, or `None` if never written.
    /// Callers apply the per-key default themselves.
    fn retrieve(&self, key: &str) -> Option<Value>;
}

// ───────────────────────────────────────────────────────────────
// Event store (domain ↔ append-only pump history)
// ───────────────────────────────────────────────────────────────

/// Append-only pump history, queryable by time.
pub trait EventStore {
    /// Append a batch.  Events whose id is already stored are skipped.
    fn append_events(&mut self, batch: &[PumpEvent]) -> Result<(), StoreError>;

    /// Every stored event with `timestamp >= since`, oldest first.
    fn query_events(&self, since: DateTime<Utc>) -> Vec<PumpEvent>;
}

// ───────────────────────────────────────────────────────────────
// Alert store
// ───────────────────────────────────────────────────────────────

/// Durable record of which device alerts have been acknowledged.
pub trait AlertStore {
    fn is_acknowledged(&self, alert: &AlertId) -> bool;

    fn record_ack(&mut self, record: AckRecord) -> Result<(), StoreError>;

    fn ack_record(&self, alert: &AlertId) -> Option<AckRecord>;
}

// ───────────────────────────────────────────────────────────────
// Storage port (domain ↔ namespaced bytes)
// ───────────────────────────────────────────────────────────────

/// Persistent key-value storage for small binary records
/// (sync state, diagnostics ring).
///
/// Keys are namespaced to prevent collisions between subsystems.
/// Writes MUST be atomic per key.
pub trait StoragePort {
    /// Read a value.  Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Stage port (domain → opaque numeric core)
// ───────────────────────────────────────────────────────────────

/// One numeric stage: named JSON inputs in, one JSON result out.
///
/// Called synchronously from the serialized worker.
pub trait Stage {
    fn run(&self, inputs: &StageInputs) -> Result<Value, StageError>;
}

impl<F> Stage for F
where
    F: Fn(&StageInputs) -> Result<Value, StageError>,
{
    fn run(&self, inputs: &StageInputs) -> Result<Value, StageError> {
        self(inputs)
    }
}

// ───────────────────────────────────────────────────────────────
// Pump driver (domain ↔ device family)
// ───────────────────────────────────────────────────────────────

/// Completion handler for asynchronous driver operations.
pub type Completion = Box<dyn FnOnce(Result<(), DriverError>) + Send>;

/// Capability every supported device family implements.
///
/// Families are selected at config load; the core never inspects the
/// concrete type.
pub trait PumpDriver {
    /// Family name for logs.
    fn family(&self) -> &'static str;

    /// Start a data refresh.  Status and event pushes arrive through the
    /// command queue; `completion` fires once the exchange ends.
    fn refresh_data(&mut self, completion: Completion);

    /// Last status the device reported.
    fn current_status(&self) -> Option<PumpStatus>;

    /// Alerts the device currently considers active.
    fn active_alerts(&self) -> BTreeSet<AlertId>;

    /// Ask the device to clear `alert`.
    fn acknowledge_alert(&mut self, alert: &AlertId, completion: Completion);

    /// Highest temp-basal rate (U/h) the device can physically deliver.
    fn max_basal_ceiling(&self) -> f64;
}

// ───────────────────────────────────────────────────────────────
// Analyte source (domain ← pump-integrated glucose sensor)
// ───────────────────────────────────────────────────────────────

/// Raw glucose samples from a pump-integrated sensor.
pub trait AnalyteSource {
    /// Read the samples newer than `since`, oldest first.
    fn read_samples(
        &mut self,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<AnalyteSample>, DriverError>>;
}

// ───────────────────────────────────────────────────────────────
// Command queue (any thread → serialized worker)
// ───────────────────────────────────────────────────────────────

/// Entry point into the serialized execution context.
pub trait CommandQueue: Send + Sync {
    /// Enqueue `cmd`.  Never blocks; a full queue drops with a warning.
    fn post(&self, cmd: LoopCommand);
}

// ───────────────────────────────────────────────────────────────
// Event sink (domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`LoopEvent`](super::events::LoopEvent)s
/// through this port.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::LoopEvent);
}

// ───────────────────────────────────────────────────────────────
// Configuration port
// ───────────────────────────────────────────────────────────────

/// Loads and persists loop configuration.
///
/// Implementations MUST validate before persisting and reject invalid
/// ranges with [`ConfigError::ValidationFailed`] instead of clamping.
pub trait ConfigPort {
    /// Returns [`LoopConfig::default()`] if no stored config exists.
    fn load(&self) -> Result<LoopConfig, ConfigError>;

    fn save(&self, config: &LoopConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Clock
// ───────────────────────────────────────────────────────────────

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

// ───────────────────────────────────────────────────────────────
// Port bundle
// ───────────────────────────────────────────────────────────────

/// Every driven port one command may touch, borrowed for that command only.
pub struct Ports<'a> {
    pub blobs: &'a mut dyn BlobStore,
    pub events: &'a mut dyn EventStore,
    pub alerts: &'a mut dyn AlertStore,
    pub storage: &'a mut dyn StoragePort,
    /// `None` when no pump is configured for this session.
    pub pump: Option<&'a mut dyn PumpDriver>,
    pub sink: &'a mut dyn EventSink,
}
