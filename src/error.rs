//! Unified error types for the loop core.
//!
//! Every subsystem has its own small error enum; all of them convert into
//! the crate-level [`Error`] so the runtime's error handling stays uniform.
//! None of these terminate the serialized worker: callers log, publish an
//! observable signal, and carry on with the next command.

use thiserror::Error as ThisError;

use crate::pipeline::keys::ArtifactKey;
use crate::pipeline::stage::StageName;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Pump communication failed.
    #[error("driver: {0}")]
    Driver(#[from] DriverError),
    /// A store write or read failed.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// A decision or auxiliary pipeline aborted.
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    /// Configuration is invalid or could not be loaded.
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Driver errors
// ---------------------------------------------------------------------------

/// Pump communication failures.  Surfaced as an observable signal, never
/// allowed to block subsequent heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum DriverError {
    /// No pump is configured for this session.
    #[error("pump not configured")]
    NotConfigured,
    /// The link to the device failed mid-exchange.
    #[error("communication failed: {0}")]
    Communication(String),
    /// The device did not answer in time.
    #[error("timeout")]
    Timeout,
    /// The device refused the command.
    #[error("rejected: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Failures of the blob store, event store, byte storage and alert store.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum StoreError {
    /// Requested key does not exist.
    #[error("key not found")]
    NotFound,
    /// A write could not be committed.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// Stored bytes failed to decode.
    #[error("corrupted: {0}")]
    Corrupted(String),
    /// Generic I/O error from the backend.
    #[error("I/O error: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// Stage / pipeline errors
// ---------------------------------------------------------------------------

/// Raised by a [`Stage`](crate::app::ports::Stage) implementation.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum StageError {
    /// The stage ran and reported a failure.
    #[error("{0}")]
    Failed(String),
    /// No implementation is registered under this name.
    #[error("stage not registered")]
    Missing,
}

/// Aborts a single pipeline run.  Artifacts written before the failure
/// stay in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum PipelineError {
    /// A stage raised or returned a result that could not be used.
    #[error("stage {stage} failed: {reason}")]
    StageFailed { stage: StageName, reason: String },
    /// An artifact could not be persisted, so later stages would read stale input.
    #[error("could not persist {key}: {source}")]
    StoreWriteFailed {
        key: ArtifactKey,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    /// The stage that failed, if the error came from a stage.
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::StageFailed { stage, .. } => Some(*stage),
            Self::StoreWriteFailed { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors from [`ConfigPort`](crate::app::ports::ConfigPort) operations.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ConfigError {
    /// No config found in storage.
    #[error("config not found")]
    NotFound,
    /// Stored config failed to deserialize.
    #[error("config corrupted: {0}")]
    Corrupted(String),
    /// A config field failed range validation.
    /// The `&'static str` describes which field and why.
    #[error("validation failed: {0}")]
    ValidationFailed(&'static str),
    /// Generic I/O error from the storage backend.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
