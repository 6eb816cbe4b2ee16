//! In-memory store adapters.
//!
//! Back every storage port with plain collections.  Used by unit tests,
//! integration tests, and the binary when no data directory is given.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::app::ports::{AlertStore, BlobStore, EventStore, StoragePort};
use crate::error::StoreError;
use crate::pump::{AckRecord, AlertId, PumpEvent};

// ───────────────────────────────────────────────────────────────
// Byte storage
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }
}

impl StoragePort for MemoryStorage {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        match self.data.get(&Self::composite_key(namespace, key)) {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.data
            .insert(Self::composite_key(namespace, key), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.data.remove(&Self::composite_key(namespace, key));
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.data.contains_key(&Self::composite_key(namespace, key))
    }
}

// ───────────────────────────────────────────────────────────────
// Blob store
// ───────────────────────────────────────────────────────────────

/// Blob store that also records the order of writes.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: HashMap<String, Value>,
    write_log: Vec<String>,
    fail_on: Option<String>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key written, in write order (repeats included).
    pub fn write_log(&self) -> &[String] {
        &self.write_log
    }

    /// Make every save of `key` fail.
    pub fn fail_on(&mut self, key: &str) {
        self.fail_on = Some(key.to_owned());
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn save(&mut self, key: &str, value: &Value) -> Result<(), StoreError> {
        if self.fail_on.as_deref() == Some(key) {
            return Err(StoreError::WriteFailed(format!("{key}: injected failure")));
        }
        self.blobs.insert(key.to_owned(), value.clone());
        self.write_log.push(key.to_owned());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Option<Value> {
        self.blobs.get(key).cloned()
    }
}

// ───────────────────────────────────────────────────────────────
// Event store
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    /// Keyed by id for dedup; iteration order is irrelevant.
    events: BTreeMap<String, PumpEvent>,
    fail_appends: bool,
    appends: usize,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&mut self, fail: bool) {
        self.fail_appends = fail;
    }

    /// Successful append calls so far.
    pub fn append_count(&self) -> usize {
        self.appends
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventStore for MemoryEventStore {
    fn append_events(&mut self, batch: &[PumpEvent]) -> Result<(), StoreError> {
        if self.fail_appends {
            return Err(StoreError::WriteFailed("event store unavailable".into()));
        }
        for event in batch {
            self.events
                .entry(event.id.clone())
                .or_insert_with(|| event.clone());
        }
        self.appends += 1;
        Ok(())
    }

    fn query_events(&self, since: DateTime<Utc>) -> Vec<PumpEvent> {
        let mut out: Vec<PumpEvent> = self
            .events
            .values()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        out
    }
}

// ───────────────────────────────────────────────────────────────
// Alert store
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    records: BTreeMap<AlertId, AckRecord>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlertStore for MemoryAlertStore {
    fn is_acknowledged(&self, alert: &AlertId) -> bool {
        self.records.contains_key(alert)
    }

    fn record_ack(&mut self, record: AckRecord) -> Result<(), StoreError> {
        self.records.insert(record.alert.clone(), record);
        Ok(())
    }

    fn ack_record(&self, alert: &AlertId) -> Option<AckRecord> {
        self.records.get(alert).cloned()
    }
}
