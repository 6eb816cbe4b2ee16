//! Cycle outcome log and runtime counters.
//!
//! Stores up to 8 decision-cycle records in a ring buffer under the
//! "cycles" namespace of the byte storage.  Each entry captures the
//! cycle clock, whether the cycle succeeded, the failing stage and a
//! truncated reason.
//!
//! Runtime metrics are plain in-memory counters, reported on demand.

use serde::{Deserialize, Serialize};

use crate::app::ports::StoragePort;

const CYCLE_RING_SLOTS: usize = 8;
const CYCLE_NAMESPACE: &str = "cycles";
const CYCLE_INDEX_KEY: &str = "cycle_idx";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Cycle clock, seconds since the Unix epoch.
    pub clock_secs: i64,
    pub ok: bool,
    pub stage: heapless::String<16>,
    pub reason: heapless::String<64>,
}

impl CycleRecord {
    pub fn success(clock_secs: i64) -> Self {
        Self {
            clock_secs,
            ok: true,
            stage: heapless::String::new(),
            reason: heapless::String::new(),
        }
    }

    pub fn failure(clock_secs: i64, stage: Option<&str>, reason: &str) -> Self {
        Self {
            clock_secs,
            ok: false,
            stage: truncated(stage.unwrap_or("store")),
            reason: truncated(reason),
        }
    }
}

/// Copy as much of `s` as fits, cut on a char boundary.
fn truncated<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Storage-backed ring buffer of cycle records.
#[derive(Default)]
pub struct CycleLog {
    write_index: usize,
}

impl CycleLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the write index from storage, or default to 0.
    pub fn init(&mut self, storage: &dyn StoragePort) {
        let mut buf = [0u8; 4];
        if let Ok(4) = storage.read(CYCLE_NAMESPACE, CYCLE_INDEX_KEY, &mut buf) {
            self.write_index = u32::from_le_bytes(buf) as usize % CYCLE_RING_SLOTS;
        }
    }

    /// Write a record to the next ring slot and advance the index.
    pub fn write_entry(&mut self, storage: &mut dyn StoragePort, entry: &CycleRecord) {
        let slot_key = Self::slot_key(self.write_index);
        match postcard::to_allocvec(entry) {
            Ok(bytes) => {
                if let Err(e) = storage.write(CYCLE_NAMESPACE, &slot_key, &bytes) {
                    log::warn!("cycle log: write failed: {}", e);
                }
            }
            Err(e) => log::warn!("cycle log: encode failed: {}", e),
        }

        self.write_index = (self.write_index + 1) % CYCLE_RING_SLOTS;
        let idx_bytes = (self.write_index as u32).to_le_bytes();
        if let Err(e) = storage.write(CYCLE_NAMESPACE, CYCLE_INDEX_KEY, &idx_bytes) {
            log::warn!("cycle log: index write failed: {}", e);
        }
    }

    /// Read every stored record, oldest slot first.
    pub fn read_all(&self, storage: &dyn StoragePort) -> heapless::Vec<CycleRecord, CYCLE_RING_SLOTS> {
        let mut entries = heapless::Vec::new();
        for i in 0..CYCLE_RING_SLOTS {
            let slot = (self.write_index + i) % CYCLE_RING_SLOTS;
            let mut buf = [0u8; 128];
            if let Ok(len) = storage.read(CYCLE_NAMESPACE, &Self::slot_key(slot), &mut buf) {
                if let Ok(entry) = postcard::from_bytes::<CycleRecord>(&buf[..len]) {
                    let _ = entries.push(entry);
                }
            }
        }
        entries
    }

    /// Erase every record and reset the index.
    pub fn clear(&mut self, storage: &mut dyn StoragePort) {
        for i in 0..CYCLE_RING_SLOTS {
            let _ = storage.delete(CYCLE_NAMESPACE, &Self::slot_key(i));
        }
        let _ = storage.delete(CYCLE_NAMESPACE, CYCLE_INDEX_KEY);
        self.write_index = 0;
    }

    pub fn count(&self, storage: &dyn StoragePort) -> usize {
        (0..CYCLE_RING_SLOTS)
            .filter(|i| storage.exists(CYCLE_NAMESPACE, &Self::slot_key(*i)))
            .count()
    }

    fn slot_key(index: usize) -> heapless::String<16> {
        let mut s = heapless::String::new();
        let _ = core::fmt::Write::write_fmt(&mut s, format_args!("c{}", index));
        s
    }
}

/// In-memory counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeMetrics {
    pub heartbeats: u64,
    pub heartbeats_ignored: u64,
    pub polls: u64,
    pub poll_timeouts: u64,
    pub poll_failures: u64,
    pub stale_completions: u64,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub events_reconciled: u64,
    pub events_rejected: u64,
    pub reconcile_failures: u64,
    pub alerts_acknowledged: u64,
    pub alerts_forced: u64,
}
