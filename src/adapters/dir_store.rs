//! Directory-backed store adapters for the binary.
//!
//! ```text
//!  <data-dir>/
//!    blobs/monitor/pumpHistory.json     one file per blob key
//!    bytes/<namespace>/<key>.bin        byte storage
//!    events.json                        pump history, rewritten on append
//! ```
//!
//! Writes go to a temp file and are renamed into place, so a crash never
//! leaves a half-written value.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::Value;

use crate::app::ports::{BlobStore, EventStore, StoragePort};
use crate::error::StoreError;
use crate::pump::PumpEvent;

fn io_err(e: &io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

/// Write `data` to `path` via a sibling temp file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(&e))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::WriteFailed(e.to_string()))
}

/// Reject keys that would escape the store root.
fn checked_relative(key: &str) -> Result<&Path, StoreError> {
    let path = Path::new(key);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if escapes || key.is_empty() {
        Err(StoreError::WriteFailed(format!("invalid key: {key}")))
    } else {
        Ok(path)
    }
}

// ───────────────────────────────────────────────────────────────
// Blob store
// ───────────────────────────────────────────────────────────────

pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&e))?;
        info!("DirBlobStore: {}", root.display());
        Ok(Self { root })
    }
}

impl BlobStore for DirBlobStore {
    fn save(&mut self, key: &str, value: &Value) -> Result<(), StoreError> {
        let path = self.root.join(checked_relative(key)?);
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        write_atomic(&path, &bytes)
    }

    fn retrieve(&self, key: &str) -> Option<Value> {
        let path = self.root.join(checked_relative(key).ok()?);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("DirBlobStore: {} unreadable, treating as absent: {}", key, e);
                None
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Byte storage
// ───────────────────────────────────────────────────────────────

pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&e))?;
        Ok(Self { root })
    }

    fn path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        let ns = checked_relative(namespace)?;
        let k = checked_relative(key)?;
        Ok(self.root.join(ns).join(k).with_extension("bin"))
    }
}

impl StoragePort for DirStorage {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        let path = self.path(namespace, key)?;
        match fs::read(&path) {
            Ok(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(io_err(&e)),
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.path(namespace, key)?, data)
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(namespace, key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&e)),
        }
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.path(namespace, key).is_ok_and(|p| p.exists())
    }
}

// ───────────────────────────────────────────────────────────────
// Event store
// ───────────────────────────────────────────────────────────────

/// Pump history held in memory and mirrored to one JSON file.
pub struct FileEventStore {
    path: PathBuf,
    events: BTreeMap<String, PumpEvent>,
}

impl FileEventStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let events = match fs::read(&path) {
            Ok(bytes) => {
                let list: Vec<PumpEvent> = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupted(e.to_string()))?;
                list.into_iter().map(|e| (e.id.clone(), e)).collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_err(&e)),
        };
        info!("FileEventStore: {} event(s) from {}", events.len(), path.display());
        Ok(Self { path, events })
    }
}

impl EventStore for FileEventStore {
    fn append_events(&mut self, batch: &[PumpEvent]) -> Result<(), StoreError> {
        let mut next = self.events.clone();
        for event in batch {
            next.entry(event.id.clone()).or_insert_with(|| event.clone());
        }
        let list: Vec<&PumpEvent> = next.values().collect();
        let bytes =
            serde_json::to_vec(&list).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        write_atomic(&self.path, &bytes)?;
        // Only commit in memory once the file is durable.
        self.events = next;
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
